use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use agritrace_storage::{BlockRef, LedgerOperation, OperationPayload, SubjectKind};

use crate::error::SubmissionError;

/// What the ledger knows about a previously sent transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptStatus {
    /// Included and applied.
    Confirmed(BlockRef),
    /// Included, but the contract refused it. The nonce is consumed.
    Reverted { block: BlockRef, reason: String },
    /// Known to the ledger, not yet included.
    StillPending,
    /// The ledger has no record of the transaction.
    NotFound,
    /// The query itself failed; nothing can be concluded.
    Unreachable(String),
}

/// Result of a read-only ledger query.
///
/// `Unknown` (the ledger could not be asked) is kept apart from `NotFound`
/// (the ledger answered and has nothing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum LedgerRead<T> {
    Found(T),
    NotFound,
    Unknown(String),
}

impl<T> LedgerRead<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> LedgerRead<U> {
        match self {
            LedgerRead::Found(v) => LedgerRead::Found(f(v)),
            LedgerRead::NotFound => LedgerRead::NotFound,
            LedgerRead::Unknown(reason) => LedgerRead::Unknown(reason),
        }
    }

    pub fn found(self) -> Option<T> {
        match self {
            LedgerRead::Found(v) => Some(v),
            _ => None,
        }
    }
}

/// A batch or product as recorded on the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnChainSubject {
    pub code: String,
    pub kind: SubjectKind,
    pub creator: String,
    /// Contract-specific fields (variety, quantity, harvest date, ...).
    pub details: serde_json::Value,
}

/// One supply-chain step as recorded on the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnChainStep {
    pub actor: String,
    pub action: String,
    pub description: String,
    /// Block timestamp, unix seconds.
    pub timestamp: i64,
    pub location: String,
}

/// Connection and account summary for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerInfo {
    pub connected: bool,
    pub network: String,
    pub endpoint: String,
    pub account: Option<String>,
    pub balance: Option<String>,
    pub contract_address: Option<String>,
}

/// Typed single-shot access to the external ledger.
///
/// A gateway builds, signs, and sends transactions and translates query
/// results into local types. It keeps no bookkeeping of its own: nonces come
/// from the caller and outcomes are recorded by the caller.
///
/// Every network call must be bounded by the gateway's submission timeout.
#[async_trait]
pub trait LedgerGateway: Send + Sync + 'static {
    /// Address of the signing account, `None` when no key is configured.
    fn account(&self) -> Option<&str>;

    /// Checks that run before an operation is enqueued. A failure here is
    /// fatal and the operation is never recorded.
    fn preflight(&self, payload: &OperationPayload) -> Result<(), SubmissionError> {
        if self.account().is_none() {
            return Err(SubmissionError::Signing(
                "no signing account configured".to_string(),
            ));
        }
        payload.validate().map_err(SubmissionError::Rejected)
    }

    /// Build, sign, and send `op` with `nonce`. Returns the transaction id
    /// without waiting for inclusion.
    async fn submit(&self, op: &LedgerOperation, nonce: u64) -> Result<String, SubmissionError>;

    /// Look up the receipt of a sent transaction.
    async fn fetch_receipt(&self, tx_id: &str) -> ReceiptStatus;

    /// Highest nonce the ledger has consumed for `account`, `0` for none.
    async fn account_nonce(&self, account: &str) -> LedgerRead<u64>;

    async fn get_subject(&self, code: &str) -> LedgerRead<OnChainSubject>;

    async fn get_step_history(&self, code: &str) -> LedgerRead<Vec<OnChainStep>>;

    async fn is_verified(&self, code: &str) -> LedgerRead<bool>;

    async fn ledger_info(&self) -> LedgerInfo;
}
