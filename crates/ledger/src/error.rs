/// Why a submission never produced a transaction on the ledger.
///
/// Returned from every send; a gateway never swallows a failure into a
/// generic message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmissionError {
    /// No usable signing key. Fatal: the account is misconfigured.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The request did not reach the ledger or the reply was lost
    /// (timeout, connection refused, 5xx). Retryable.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The transaction was sent but no usable reply came back, so it may
    /// well be on its way to a block. Carries the locally computed
    /// transaction id so the receipt can still be polled. Retryable, but
    /// only after the receipt says the transaction is gone.
    #[error("no reply for transaction {tx_id}: {message}")]
    Unacknowledged { tx_id: String, message: String },

    /// The ledger refused the nonce (already used, or too far ahead).
    /// Retryable once the sequencer is reconciled with the chain.
    #[error("nonce {nonce} refused: {message}")]
    NonceConflict { nonce: u64, message: String },

    /// The ledger rejected the transaction at submission time (malformed
    /// payload, insufficient balance). Fatal.
    #[error("rejected by ledger: {0}")]
    Rejected(String),
}

impl SubmissionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SubmissionError::Transport(_)
                | SubmissionError::Unacknowledged { .. }
                | SubmissionError::NonceConflict { .. }
        )
    }

    /// Id of a transaction that may have reached the ledger despite the error.
    pub fn possibly_sent(&self) -> Option<&str> {
        match self {
            SubmissionError::Unacknowledged { tx_id, .. } => Some(tx_id),
            _ => None,
        }
    }
}

/// Errors loading or using the signing account.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("error reading signing key '{path}': {message}")]
    Read { path: String, message: String },

    #[error("invalid signing key '{path}': {message}")]
    Invalid { path: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_and_nonce_conflicts_retry() {
        assert!(SubmissionError::Transport("timeout".into()).is_retryable());
        assert!(SubmissionError::NonceConflict {
            nonce: 3,
            message: "nonce too low".into()
        }
        .is_retryable());
        assert!(!SubmissionError::Signing("no key".into()).is_retryable());
        assert!(!SubmissionError::Rejected("insufficient funds".into()).is_retryable());
    }

    #[test]
    fn lost_reply_keeps_the_transaction_id() {
        let err = SubmissionError::Unacknowledged {
            tx_id: "0xfeed".into(),
            message: "read timed out".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.possibly_sent(), Some("0xfeed"));
        assert_eq!(SubmissionError::Transport("refused".into()).possibly_sent(), None);
    }
}
