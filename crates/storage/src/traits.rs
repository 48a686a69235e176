use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::record::{
    IdempotencyKey, LedgerOperation, LedgerStatus, OperationState, Outcome, SubjectKind,
    SubjectRecord, SubmissionFailure, SupplyChainStep, WriteBackTarget,
};

/// Result of [`OperationLog::enqueue`].
///
/// None of these is an error: a caller retrying the same logical request gets
/// the existing record back instead of a second ledger operation.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// A new record was created, or an abandoned one was revived.
    Accepted(LedgerOperation),
    /// A record with this key is still being worked on.
    AlreadyPending(LedgerOperation),
    /// A record with this key already has a confirmed receipt.
    AlreadyConfirmed(LedgerOperation),
}

impl EnqueueOutcome {
    pub fn operation(&self) -> &LedgerOperation {
        match self {
            EnqueueOutcome::Accepted(op)
            | EnqueueOutcome::AlreadyPending(op)
            | EnqueueOutcome::AlreadyConfirmed(op) => op,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, EnqueueOutcome::Accepted(_))
    }
}

/// The pending operation log: durable record of every ledger operation the
/// engine was asked for, keyed by idempotency key.
///
/// ## Duplicate-submission guard
///
/// At most one record exists per key, so at most one operation per key can be
/// in `Pending` or `Submitted`. Concurrent `enqueue` calls for the same key
/// must serialize so exactly one returns `Accepted`.
///
/// ## Single writer per key
///
/// Every mutating method validates the transition against the record's
/// current state under a per-key lock and returns
/// `StorageError::InvalidTransition` if it is not legal. Operations on
/// different keys must not contend on a shared lock for longer than a map
/// lookup.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` so they can be shared
/// between request handlers and the background poller.
#[async_trait]
pub trait OperationLog: Send + Sync + 'static {
    /// Record a new operation, or report the existing one under the same key.
    ///
    /// An `Abandoned` record is revived to `Pending` and reported as `Accepted`.
    async fn enqueue(&self, op: LedgerOperation) -> Result<EnqueueOutcome, StorageError>;

    /// Read one operation.
    ///
    /// Returns `Err(StorageError::OperationNotFound)` if the key is unknown.
    async fn get(&self, key: &IdempotencyKey) -> Result<LedgerOperation, StorageError>;

    // ── Transitions ──────────────────────────────────────────────────────────

    /// Pending -> Submitted.
    async fn mark_submitted(
        &self,
        key: &IdempotencyKey,
        account: &str,
        nonce: u64,
        tx_id: &str,
        at: OffsetDateTime,
    ) -> Result<LedgerOperation, StorageError>;

    /// Pending -> Unknown/Failed when the send never produced a transaction.
    async fn mark_submission_failed(
        &self,
        key: &IdempotencyKey,
        failure: SubmissionFailure,
        at: OffsetDateTime,
    ) -> Result<LedgerOperation, StorageError>;

    /// Record the ledger's outcome for a submitted transaction.
    async fn mark_resolved(
        &self,
        key: &IdempotencyKey,
        outcome: Outcome,
        at: OffsetDateTime,
    ) -> Result<LedgerOperation, StorageError>;

    /// Failed/Unknown -> Pending, not to be submitted before `next_attempt_at`.
    async fn requeue(
        &self,
        key: &IdempotencyKey,
        next_attempt_at: OffsetDateTime,
        at: OffsetDateTime,
    ) -> Result<LedgerOperation, StorageError>;

    /// Terminal: stop retrying. The record is kept.
    async fn abandon(
        &self,
        key: &IdempotencyKey,
        reason: &str,
        at: OffsetDateTime,
    ) -> Result<LedgerOperation, StorageError>;

    /// Abandoned -> Pending with a fresh attempt budget.
    async fn revive(
        &self,
        key: &IdempotencyKey,
        at: OffsetDateTime,
    ) -> Result<LedgerOperation, StorageError>;

    // ── Queries ──────────────────────────────────────────────────────────────

    /// All operations, optionally filtered by state, oldest first.
    async fn list(
        &self,
        state: Option<OperationState>,
    ) -> Result<Vec<LedgerOperation>, StorageError>;

    /// Operations stuck in `Submitted` since before `older_than`, or sitting
    /// in `Unknown` since before `older_than`.
    async fn list_retryable(
        &self,
        older_than: OffsetDateTime,
    ) -> Result<Vec<LedgerOperation>, StorageError>;

    /// Every abandoned operation, for operator visibility.
    async fn list_abandoned(&self) -> Result<Vec<LedgerOperation>, StorageError>;

    /// Every operation concerning one subject, oldest first.
    async fn list_for_subject(&self, code: &str) -> Result<Vec<LedgerOperation>, StorageError>;
}

/// The slice of the relational store the engine depends on.
///
/// The store owns batches, products, and steps; the engine reads identities,
/// commits step rows it has numbered, and writes back ledger results.
#[async_trait]
pub trait SubjectStore: Send + Sync + 'static {
    /// Look up a batch or product by its external code.
    async fn subject(&self, code: &str) -> Result<Option<SubjectRecord>, StorageError>;

    /// Create a subject. Returns `Err(StorageError::SubjectExists)` on a duplicate code.
    async fn register_subject(
        &self,
        code: &str,
        kind: SubjectKind,
    ) -> Result<SubjectRecord, StorageError>;

    /// Highest committed step number for the subject, `0` when it has none.
    ///
    /// Returns `Err(StorageError::SubjectNotFound)` for an unknown code.
    async fn max_committed_step(&self, code: &str) -> Result<u32, StorageError>;

    /// Commit a step row. The number must be exactly `max_committed_step + 1`.
    async fn commit_step(&self, step: SupplyChainStep) -> Result<(), StorageError>;

    /// Committed steps for the subject in step order.
    async fn steps(&self, code: &str) -> Result<Vec<SupplyChainStep>, StorageError>;

    /// Persist `ledger_status` (and `blockchain_hash` once known) on the row a
    /// ledger operation mirrors.
    async fn write_back(
        &self,
        code: &str,
        target: &WriteBackTarget,
        status: LedgerStatus,
        blockchain_hash: Option<&str>,
    ) -> Result<(), StorageError>;
}
