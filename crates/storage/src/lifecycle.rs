//! Transition rules shared by every `OperationLog` backend.
//!
//! Each function checks that the transition is legal from the operation's
//! current state, applies it in place, and appends an audit entry. Backends
//! call these while holding the per-key lock, so a rejected transition means
//! another writer got there first.

use time::OffsetDateTime;

use crate::error::StorageError;
use crate::record::{LedgerOperation, OperationState, Outcome, SubmissionFailure};

fn reject(op: &LedgerOperation, to: OperationState) -> StorageError {
    StorageError::InvalidTransition {
        key: op.key.clone(),
        from: op.state,
        to,
    }
}

/// Pending -> Submitted, with the nonce and transaction id of the send.
pub fn submitted(
    op: &mut LedgerOperation,
    account: &str,
    nonce: u64,
    tx_id: &str,
    at: OffsetDateTime,
) -> Result<(), StorageError> {
    if op.state != OperationState::Pending {
        return Err(reject(op, OperationState::Submitted));
    }
    op.attempts += 1;
    op.account = Some(account.to_string());
    op.nonce = Some(nonce);
    op.tx_id = Some(tx_id.to_string());
    op.outcome = None;
    op.last_error = None;
    op.submitted_at = Some(at);
    op.resolved_at = None;
    op.next_attempt_at = None;
    op.transition(
        OperationState::Submitted,
        at,
        Some(format!("nonce {} tx {}", nonce, tx_id)),
    );
    Ok(())
}

/// Pending -> Unknown (retryable) or Failed (fatal) when the send itself failed.
///
/// The attempt still counts against the retry budget.
pub fn submission_failed(
    op: &mut LedgerOperation,
    failure: &SubmissionFailure,
    at: OffsetDateTime,
) -> Result<(), StorageError> {
    let to = if failure.retryable {
        OperationState::Unknown
    } else {
        OperationState::Failed
    };
    if op.state != OperationState::Pending {
        return Err(reject(op, to));
    }
    op.attempts += 1;
    op.last_error = Some(failure.message.clone());
    op.resolved_at = Some(at);
    op.next_attempt_at = None;
    op.transition(to, at, Some(failure.message.clone()));
    Ok(())
}

/// Record what the ledger said about a submitted transaction.
///
/// A late `Confirmed` is also accepted from `Unknown`, or from a requeued
/// `Pending`, when the operation carries a transaction id: the transaction
/// given up on was included after all.
pub fn resolved(
    op: &mut LedgerOperation,
    outcome: Outcome,
    at: OffsetDateTime,
) -> Result<(), StorageError> {
    let to = outcome.resulting_state();
    let legal = match (&outcome, op.state) {
        (_, OperationState::Submitted) => true,
        (Outcome::Confirmed { .. }, OperationState::Unknown | OperationState::Pending) => {
            op.tx_id.is_some()
        }
        _ => false,
    };
    if !legal {
        return Err(reject(op, to));
    }
    let note = match &outcome {
        Outcome::Confirmed { block } => format!("block {} {}", block.number, block.hash),
        Outcome::Failed { reason, .. } => reason.clone(),
        Outcome::UnknownTimeout { reason } => reason.clone(),
    };
    if let Outcome::Failed { reason, .. } | Outcome::UnknownTimeout { reason } = &outcome {
        op.last_error = Some(reason.clone());
    }
    op.outcome = Some(outcome);
    op.resolved_at = Some(at);
    op.next_attempt_at = None;
    op.transition(to, at, Some(note));
    Ok(())
}

/// Failed/Unknown -> Pending, eligible again at `next_attempt_at`.
pub fn requeued(
    op: &mut LedgerOperation,
    next_attempt_at: OffsetDateTime,
    at: OffsetDateTime,
) -> Result<(), StorageError> {
    if !op.state.is_retryable() {
        return Err(reject(op, OperationState::Pending));
    }
    op.next_attempt_at = Some(next_attempt_at);
    op.transition(
        OperationState::Pending,
        at,
        Some(format!("retry {} scheduled", op.attempts + 1)),
    );
    Ok(())
}

/// Pending/Failed/Unknown -> Abandoned. Submitted operations must time out first.
pub fn abandoned(
    op: &mut LedgerOperation,
    reason: &str,
    at: OffsetDateTime,
) -> Result<(), StorageError> {
    let legal = matches!(
        op.state,
        OperationState::Pending | OperationState::Failed | OperationState::Unknown
    );
    if !legal {
        return Err(reject(op, OperationState::Abandoned));
    }
    op.last_error = Some(reason.to_string());
    op.resolved_at = Some(at);
    op.next_attempt_at = None;
    op.transition(OperationState::Abandoned, at, Some(reason.to_string()));
    Ok(())
}

/// Abandoned -> Pending with a fresh attempt budget.
pub fn revived(op: &mut LedgerOperation, at: OffsetDateTime) -> Result<(), StorageError> {
    if op.state != OperationState::Abandoned {
        return Err(reject(op, OperationState::Pending));
    }
    op.attempts = 0;
    op.next_attempt_at = None;
    op.transition(OperationState::Pending, at, Some("revived".to_string()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{OperationPayload, VerificationRequest};
    use crate::record::BlockRef;

    fn op() -> LedgerOperation {
        LedgerOperation::new(
            OperationPayload::MarkVerified(VerificationRequest {
                qr_code: "P1".to_string(),
            }),
            OffsetDateTime::UNIX_EPOCH,
        )
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH
    }

    #[test]
    fn confirmed_requires_submitted() {
        let mut op = op();
        let outcome = Outcome::Confirmed {
            block: BlockRef {
                number: 1,
                hash: "0x1".to_string(),
            },
        };
        let err = resolved(&mut op, outcome, now()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { .. }));
    }

    #[test]
    fn submission_counts_attempts() {
        let mut op = op();
        submitted(&mut op, "acct", 1, "0xaa", now()).unwrap();
        assert_eq!(op.attempts, 1);
        assert_eq!(op.nonce, Some(1));
    }

    #[test]
    fn transport_failure_goes_unknown_and_fatal_goes_failed() {
        let mut a = op();
        submission_failed(
            &mut a,
            &SubmissionFailure {
                retryable: true,
                message: "connection refused".to_string(),
            },
            now(),
        )
        .unwrap();
        assert_eq!(a.state, OperationState::Unknown);

        let mut b = op();
        submission_failed(
            &mut b,
            &SubmissionFailure {
                retryable: false,
                message: "insufficient balance".to_string(),
            },
            now(),
        )
        .unwrap();
        assert_eq!(b.state, OperationState::Failed);
    }

    #[test]
    fn late_confirmation_accepted_from_unknown_with_tx() {
        let mut op = op();
        submitted(&mut op, "acct", 1, "0xaa", now()).unwrap();
        resolved(
            &mut op,
            Outcome::UnknownTimeout {
                reason: "receipt not found".to_string(),
            },
            now(),
        )
        .unwrap();
        resolved(
            &mut op,
            Outcome::Confirmed {
                block: BlockRef {
                    number: 9,
                    hash: "0x9".to_string(),
                },
            },
            now(),
        )
        .unwrap();
        assert_eq!(op.state, OperationState::Confirmed);
    }

    #[test]
    fn submitted_cannot_be_abandoned() {
        let mut op = op();
        submitted(&mut op, "acct", 1, "0xaa", now()).unwrap();
        assert!(abandoned(&mut op, "give up", now()).is_err());
    }

    #[test]
    fn revive_resets_attempts_and_keeps_history() {
        let mut op = op();
        abandoned(&mut op, "predecessor abandoned", now()).unwrap();
        let before = op.history.len();
        revived(&mut op, now()).unwrap();
        assert_eq!(op.state, OperationState::Pending);
        assert_eq!(op.attempts, 0);
        assert_eq!(op.history.len(), before + 1);
    }
}
