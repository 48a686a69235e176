use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use rust_decimal::Decimal;

use crate::payload::{ActorType, OperationPayload, StepAction, StepRecord};

/// The five mutations the engine mirrors onto the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    RegisterBatch,
    RegisterProduct,
    RecordTransfer,
    AppendStep,
    MarkVerified,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::RegisterBatch => "register_batch",
            OperationKind::RegisterProduct => "register_product",
            OperationKind::RecordTransfer => "record_transfer",
            OperationKind::AppendStep => "append_step",
            OperationKind::MarkVerified => "mark_verified",
        }
    }

    pub fn is_registration(&self) -> bool {
        matches!(
            self,
            OperationKind::RegisterBatch | OperationKind::RegisterProduct
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic identity of one logical ledger mutation.
///
/// Two requests that mean the same thing produce the same key, which is what
/// lets the operation log refuse a second in-flight copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn for_subject(kind: OperationKind, subject_code: &str) -> Self {
        IdempotencyKey(format!("{}:{}", kind.as_str(), subject_code))
    }

    pub fn for_step(subject_code: &str, step_number: u32) -> Self {
        IdempotencyKey(format!(
            "{}:{}:{}",
            OperationKind::AppendStep.as_str(),
            subject_code,
            step_number
        ))
    }

    pub fn for_transfer(subject_code: &str, transfer_id: &str) -> Self {
        IdempotencyKey(format!(
            "{}:{}:{}",
            OperationKind::RecordTransfer.as_str(),
            subject_code,
            transfer_id
        ))
    }

    /// Wrap an already-formatted key (e.g. one taken from a URL path).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        IdempotencyKey(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a ledger operation.
///
/// ```text
/// Pending -> Submitted -> Confirmed
///    ^           |-----> Failed  --+
///    |           '-----> Unknown --+--> (attempts left) Pending
///    |                             '--> (budget spent)  Abandoned
///    '---------------- revive ------------------------- Abandoned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    Submitted,
    Confirmed,
    Failed,
    Unknown,
    Abandoned,
}

impl OperationState {
    pub const ALL: [OperationState; 6] = [
        OperationState::Pending,
        OperationState::Submitted,
        OperationState::Confirmed,
        OperationState::Failed,
        OperationState::Unknown,
        OperationState::Abandoned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::Submitted => "submitted",
            OperationState::Confirmed => "confirmed",
            OperationState::Failed => "failed",
            OperationState::Unknown => "unknown",
            OperationState::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        OperationState::ALL.iter().copied().find(|st| st.as_str() == s)
    }

    /// States covered by the duplicate-submission guard.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, OperationState::Pending | OperationState::Submitted)
    }

    /// States from which the retry loop may pick the operation back up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OperationState::Failed | OperationState::Unknown)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a transaction landed on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: String,
}

/// What the ledger said about a submitted operation.
///
/// `Confirmed` can only be built from an observed receipt; the confirmation
/// poller is the only component that records outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Confirmed { block: BlockRef },
    Failed {
        block: Option<BlockRef>,
        reason: String,
    },
    UnknownTimeout { reason: String },
}

impl Outcome {
    /// The state an operation moves to when this outcome is recorded.
    pub fn resulting_state(&self) -> OperationState {
        match self {
            Outcome::Confirmed { .. } => OperationState::Confirmed,
            Outcome::Failed { .. } => OperationState::Failed,
            Outcome::UnknownTimeout { .. } => OperationState::Unknown,
        }
    }
}

/// A submission attempt that never produced a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionFailure {
    pub retryable: bool,
    pub message: String,
}

/// One entry of an operation's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: Option<OperationState>,
    pub to: OperationState,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// One attempted mutation of the external ledger.
///
/// Records are never deleted. Every state change appends to `history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerOperation {
    pub key: IdempotencyKey,
    pub kind: OperationKind,
    pub subject_code: String,
    pub payload: OperationPayload,
    pub state: OperationState,
    /// Submission attempts made since creation or the last revival.
    pub attempts: u32,
    pub account: Option<String>,
    pub nonce: Option<u64>,
    pub tx_id: Option<String>,
    pub outcome: Option<Outcome>,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub submitted_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    /// Earliest time the retry loop may submit again.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_attempt_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub history: Vec<Transition>,
}

impl LedgerOperation {
    pub fn new(payload: OperationPayload, now: OffsetDateTime) -> Self {
        let key = payload.idempotency_key();
        let kind = payload.kind();
        let subject_code = payload.subject_code().to_string();
        LedgerOperation {
            key,
            kind,
            subject_code,
            payload,
            state: OperationState::Pending,
            attempts: 0,
            account: None,
            nonce: None,
            tx_id: None,
            outcome: None,
            last_error: None,
            created_at: now,
            submitted_at: None,
            resolved_at: None,
            next_attempt_at: None,
            history: vec![Transition {
                from: None,
                to: OperationState::Pending,
                at: now,
                note: None,
            }],
        }
    }

    /// Step number for `AppendStep` operations.
    pub fn step_number(&self) -> Option<u32> {
        match &self.payload {
            OperationPayload::AppendStep(s) => Some(s.step_number),
            _ => None,
        }
    }

    /// Move to `to`, recording the transition. Callers check legality first.
    pub fn transition(&mut self, to: OperationState, at: OffsetDateTime, note: Option<String>) {
        self.history.push(Transition {
            from: Some(self.state),
            to,
            at,
            note,
        });
        self.state = to;
    }
}

/// Whether the relational copy of a fact is mirrored on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// Enqueued, no receipt yet.
    Pending,
    /// Confirmed with a receipt; `blockchain_hash` is set.
    Synced,
    /// Retry budget spent; the relational record stands alone until a corrective pass.
    Unsynced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Batch,
    Product,
}

/// A batch or product as known to the relational store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub code: String,
    pub kind: SubjectKind,
    pub blockchain_hash: Option<String>,
    pub ledger_status: Option<LedgerStatus>,
}

/// A committed supply-chain step in the relational store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplyChainStep {
    pub subject_code: String,
    pub step_number: u32,
    pub action: StepAction,
    pub actor: String,
    pub actor_type: ActorType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub temperature: Option<Decimal>,
    #[serde(default)]
    pub humidity: Option<Decimal>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub blockchain_hash: Option<String>,
    pub ledger_status: LedgerStatus,
}

impl SupplyChainStep {
    /// The ledger mirror of this row.
    pub fn ledger_record(&self) -> StepRecord {
        StepRecord {
            subject_code: self.subject_code.clone(),
            step_number: self.step_number,
            action: self.action,
            actor: self.actor.clone(),
            actor_type: self.actor_type,
            description: self.description.clone(),
            location: self.location.clone(),
            temperature: self.temperature,
            humidity: self.humidity,
        }
    }
}

/// Which relational row a ledger result is written back to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum WriteBackTarget {
    Subject,
    Step { step_number: u32 },
    Transfer { transfer_id: String },
    Verification,
}

impl WriteBackTarget {
    pub fn for_operation(op: &LedgerOperation) -> Self {
        match &op.payload {
            OperationPayload::AppendStep(s) => WriteBackTarget::Step {
                step_number: s.step_number,
            },
            OperationPayload::RecordTransfer(t) => WriteBackTarget::Transfer {
                transfer_id: t.transfer_id.clone(),
            },
            OperationPayload::MarkVerified(_) => WriteBackTarget::Verification,
            OperationPayload::RegisterBatch(_) | OperationPayload::RegisterProduct(_) => {
                WriteBackTarget::Subject
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::VerificationRequest;

    #[test]
    fn new_operation_starts_pending_with_history() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let op = LedgerOperation::new(
            OperationPayload::MarkVerified(VerificationRequest {
                qr_code: "P1".to_string(),
            }),
            now,
        );
        assert_eq!(op.state, OperationState::Pending);
        assert_eq!(op.kind, OperationKind::MarkVerified);
        assert_eq!(op.history.len(), 1);
        assert_eq!(op.history[0].from, None);
    }

    #[test]
    fn transition_appends_to_history() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let mut op = LedgerOperation::new(
            OperationPayload::MarkVerified(VerificationRequest {
                qr_code: "P1".to_string(),
            }),
            now,
        );
        op.transition(OperationState::Submitted, now, Some("tx 0x1".to_string()));
        assert_eq!(op.state, OperationState::Submitted);
        assert_eq!(op.history.last().unwrap().from, Some(OperationState::Pending));
    }

    #[test]
    fn only_pending_and_submitted_are_in_flight() {
        let in_flight: Vec<_> = OperationState::ALL
            .iter()
            .filter(|s| s.is_in_flight())
            .collect();
        assert_eq!(
            in_flight,
            vec![&OperationState::Pending, &OperationState::Submitted]
        );
    }

    #[test]
    fn state_parse_round_trips_names() {
        assert_eq!(OperationState::parse("abandoned"), Some(OperationState::Abandoned));
        assert_eq!(OperationState::parse("lost"), None);
    }

    #[test]
    fn operation_serializes_timestamps_as_rfc3339() {
        let op = LedgerOperation::new(
            OperationPayload::MarkVerified(VerificationRequest {
                qr_code: "P1".to_string(),
            }),
            OffsetDateTime::UNIX_EPOCH,
        );
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["created_at"], "1970-01-01T00:00:00Z");
        assert_eq!(json["key"], "mark_verified:P1");
    }
}
