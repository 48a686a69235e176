//! In-process backends: the operation log (optionally journaled to disk) and a
//! relational-store stand-in used by the service's dev mode and by tests.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};

use crate::error::StorageError;
use crate::journal::Journal;
use crate::lifecycle;
use crate::record::{
    IdempotencyKey, LedgerOperation, LedgerStatus, OperationState, Outcome, SubjectKind,
    SubjectRecord, SubmissionFailure, SupplyChainStep, WriteBackTarget,
};
use crate::traits::{EnqueueOutcome, OperationLog, SubjectStore};

type Slot = Arc<Mutex<LedgerOperation>>;

/// Operation log held in memory, one lock per idempotency key.
///
/// The outer map lock is only held to find or insert a slot; transitions lock
/// the slot alone, so unrelated keys never wait on each other. With a journal
/// attached every change is appended to disk before the slot lock is released,
/// and never while the map lock is held.
#[derive(Default)]
pub struct MemoryOperationLog {
    slots: RwLock<HashMap<IdempotencyKey, Slot>>,
    journal: Option<Journal>,
}

impl MemoryOperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a journaled log at `path`, replaying any records already there.
    pub fn open_journal(path: &Path) -> Result<Self, StorageError> {
        let (journal, replayed) = Journal::open(path)?;
        let slots = replayed
            .into_iter()
            .map(|(k, op)| (k, Arc::new(Mutex::new(op))))
            .collect();
        Ok(MemoryOperationLog {
            slots: RwLock::new(slots),
            journal: Some(journal),
        })
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_ref().map(|j| j.path())
    }

    async fn persist(&self, op: &LedgerOperation) -> Result<(), StorageError> {
        match &self.journal {
            Some(journal) => journal.append(op).await,
            None => Ok(()),
        }
    }

    async fn slot(&self, key: &IdempotencyKey) -> Result<Slot, StorageError> {
        self.slots
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::OperationNotFound { key: key.clone() })
    }

    /// Apply `f` to the record under its slot lock and persist the result.
    async fn update<F>(&self, key: &IdempotencyKey, f: F) -> Result<LedgerOperation, StorageError>
    where
        F: FnOnce(&mut LedgerOperation) -> Result<(), StorageError> + Send,
    {
        let slot = self.slot(key).await?;
        let mut guard = slot.lock().await;
        let mut next = guard.clone();
        f(&mut next)?;
        self.persist(&next).await?;
        *guard = next.clone();
        Ok(next)
    }

    async fn snapshot<P>(&self, mut keep: P) -> Vec<LedgerOperation>
    where
        P: FnMut(&LedgerOperation) -> bool,
    {
        let slots: Vec<Slot> = self.slots.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for slot in slots {
            let op = slot.lock().await;
            if keep(&op) {
                out.push(op.clone());
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
        out
    }
}

#[async_trait]
impl OperationLog for MemoryOperationLog {
    async fn enqueue(&self, op: LedgerOperation) -> Result<EnqueueOutcome, StorageError> {
        let (existing, fresh) = {
            let mut slots = self.slots.write().await;
            match slots.get(&op.key) {
                Some(slot) => (Arc::clone(slot), None),
                None => {
                    let slot: Slot = Arc::new(Mutex::new(op.clone()));
                    // Locked before it is visible, so nobody reads a record
                    // the journal does not hold yet.
                    let held = Arc::clone(&slot).lock_owned().await;
                    slots.insert(op.key.clone(), Arc::clone(&slot));
                    (slot, Some(held))
                }
            }
        };

        if let Some(_held) = fresh {
            if let Err(e) = self.persist(&op).await {
                self.slots.write().await.remove(&op.key);
                return Err(e);
            }
            tracing::debug!(key = %op.key, "operation enqueued");
            return Ok(EnqueueOutcome::Accepted(op));
        }

        let mut guard = existing.lock().await;
        match guard.state {
            OperationState::Confirmed => Ok(EnqueueOutcome::AlreadyConfirmed(guard.clone())),
            OperationState::Abandoned => {
                let mut next = guard.clone();
                lifecycle::revived(&mut next, op.created_at)?;
                self.persist(&next).await?;
                *guard = next.clone();
                tracing::debug!(key = %next.key, "abandoned operation revived by enqueue");
                Ok(EnqueueOutcome::Accepted(next))
            }
            _ => Ok(EnqueueOutcome::AlreadyPending(guard.clone())),
        }
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<LedgerOperation, StorageError> {
        let slot = self.slot(key).await?;
        let op = slot.lock().await;
        Ok(op.clone())
    }

    async fn mark_submitted(
        &self,
        key: &IdempotencyKey,
        account: &str,
        nonce: u64,
        tx_id: &str,
        at: OffsetDateTime,
    ) -> Result<LedgerOperation, StorageError> {
        self.update(key, |op| lifecycle::submitted(op, account, nonce, tx_id, at))
            .await
    }

    async fn mark_submission_failed(
        &self,
        key: &IdempotencyKey,
        failure: SubmissionFailure,
        at: OffsetDateTime,
    ) -> Result<LedgerOperation, StorageError> {
        self.update(key, |op| lifecycle::submission_failed(op, &failure, at))
            .await
    }

    async fn mark_resolved(
        &self,
        key: &IdempotencyKey,
        outcome: Outcome,
        at: OffsetDateTime,
    ) -> Result<LedgerOperation, StorageError> {
        self.update(key, |op| lifecycle::resolved(op, outcome, at))
            .await
    }

    async fn requeue(
        &self,
        key: &IdempotencyKey,
        next_attempt_at: OffsetDateTime,
        at: OffsetDateTime,
    ) -> Result<LedgerOperation, StorageError> {
        self.update(key, |op| lifecycle::requeued(op, next_attempt_at, at))
            .await
    }

    async fn abandon(
        &self,
        key: &IdempotencyKey,
        reason: &str,
        at: OffsetDateTime,
    ) -> Result<LedgerOperation, StorageError> {
        self.update(key, |op| lifecycle::abandoned(op, reason, at))
            .await
    }

    async fn revive(
        &self,
        key: &IdempotencyKey,
        at: OffsetDateTime,
    ) -> Result<LedgerOperation, StorageError> {
        self.update(key, |op| lifecycle::revived(op, at)).await
    }

    async fn list(
        &self,
        state: Option<OperationState>,
    ) -> Result<Vec<LedgerOperation>, StorageError> {
        Ok(self
            .snapshot(|op| state.map_or(true, |s| op.state == s))
            .await)
    }

    async fn list_retryable(
        &self,
        older_than: OffsetDateTime,
    ) -> Result<Vec<LedgerOperation>, StorageError> {
        Ok(self
            .snapshot(|op| match op.state {
                OperationState::Submitted => op.submitted_at.map_or(false, |t| t <= older_than),
                OperationState::Unknown => op.resolved_at.map_or(false, |t| t <= older_than),
                _ => false,
            })
            .await)
    }

    async fn list_abandoned(&self) -> Result<Vec<LedgerOperation>, StorageError> {
        Ok(self
            .snapshot(|op| op.state == OperationState::Abandoned)
            .await)
    }

    async fn list_for_subject(&self, code: &str) -> Result<Vec<LedgerOperation>, StorageError> {
        Ok(self.snapshot(|op| op.subject_code == code).await)
    }
}

// ── Relational stand-in ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SubjectRow {
    record: SubjectRecord,
    steps: Vec<SupplyChainStep>,
    /// Write-backs for transfers and verification, keyed by target.
    mirrors: BTreeMap<String, (LedgerStatus, Option<String>)>,
}

/// In-memory stand-in for the relational store.
///
/// Enforces the same uniqueness rules the real tables do: one subject per
/// code, one step per (subject, step number), no gaps.
#[derive(Default)]
pub struct MemorySubjectStore {
    rows: RwLock<HashMap<String, SubjectRow>>,
}

impl MemorySubjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger status and hash last written back for a transfer or verification.
    pub async fn mirror_status(
        &self,
        code: &str,
        target: &WriteBackTarget,
    ) -> Option<(LedgerStatus, Option<String>)> {
        let rows = self.rows.read().await;
        let row = rows.get(code)?;
        match target {
            WriteBackTarget::Subject => Some((
                row.record.ledger_status?,
                row.record.blockchain_hash.clone(),
            )),
            WriteBackTarget::Step { step_number } => row
                .steps
                .iter()
                .find(|s| s.step_number == *step_number)
                .map(|s| (s.ledger_status, s.blockchain_hash.clone())),
            other => row.mirrors.get(&mirror_key(other)).cloned(),
        }
    }
}

fn mirror_key(target: &WriteBackTarget) -> String {
    match target {
        WriteBackTarget::Subject => "subject".to_string(),
        WriteBackTarget::Step { step_number } => format!("step:{}", step_number),
        WriteBackTarget::Transfer { transfer_id } => format!("transfer:{}", transfer_id),
        WriteBackTarget::Verification => "verification".to_string(),
    }
}

#[async_trait]
impl SubjectStore for MemorySubjectStore {
    async fn subject(&self, code: &str) -> Result<Option<SubjectRecord>, StorageError> {
        Ok(self.rows.read().await.get(code).map(|r| r.record.clone()))
    }

    async fn register_subject(
        &self,
        code: &str,
        kind: SubjectKind,
    ) -> Result<SubjectRecord, StorageError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(code) {
            return Err(StorageError::SubjectExists {
                code: code.to_string(),
            });
        }
        let record = SubjectRecord {
            code: code.to_string(),
            kind,
            blockchain_hash: None,
            ledger_status: None,
        };
        rows.insert(
            code.to_string(),
            SubjectRow {
                record: record.clone(),
                steps: Vec::new(),
                mirrors: BTreeMap::new(),
            },
        );
        Ok(record)
    }

    async fn max_committed_step(&self, code: &str) -> Result<u32, StorageError> {
        let rows = self.rows.read().await;
        let row = rows.get(code).ok_or_else(|| StorageError::SubjectNotFound {
            code: code.to_string(),
        })?;
        Ok(row.steps.last().map_or(0, |s| s.step_number))
    }

    async fn commit_step(&self, step: SupplyChainStep) -> Result<(), StorageError> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&step.subject_code)
            .ok_or_else(|| StorageError::SubjectNotFound {
                code: step.subject_code.clone(),
            })?;
        let expected = row.steps.last().map_or(0, |s| s.step_number) + 1;
        if step.step_number < expected {
            return Err(StorageError::StepExists {
                code: step.subject_code.clone(),
                step_number: step.step_number,
            });
        }
        if step.step_number > expected {
            return Err(StorageError::StepGap {
                code: step.subject_code.clone(),
                step_number: step.step_number,
                expected,
            });
        }
        row.steps.push(step);
        Ok(())
    }

    async fn steps(&self, code: &str) -> Result<Vec<SupplyChainStep>, StorageError> {
        let rows = self.rows.read().await;
        let row = rows.get(code).ok_or_else(|| StorageError::SubjectNotFound {
            code: code.to_string(),
        })?;
        Ok(row.steps.clone())
    }

    async fn write_back(
        &self,
        code: &str,
        target: &WriteBackTarget,
        status: LedgerStatus,
        blockchain_hash: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(code)
            .ok_or_else(|| StorageError::SubjectNotFound {
                code: code.to_string(),
            })?;
        match target {
            WriteBackTarget::Subject => {
                row.record.ledger_status = Some(status);
                if let Some(h) = blockchain_hash {
                    row.record.blockchain_hash = Some(h.to_string());
                }
            }
            WriteBackTarget::Step { step_number } => {
                let step = row
                    .steps
                    .iter_mut()
                    .find(|s| s.step_number == *step_number)
                    .ok_or_else(|| {
                        StorageError::Backend(format!(
                            "write-back for missing step {} of {}",
                            step_number, code
                        ))
                    })?;
                step.ledger_status = status;
                if let Some(h) = blockchain_hash {
                    step.blockchain_hash = Some(h.to_string());
                }
            }
            other => {
                let entry = row
                    .mirrors
                    .entry(mirror_key(other))
                    .or_insert((status, None));
                entry.0 = status;
                if let Some(h) = blockchain_hash {
                    entry.1 = Some(h.to_string());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{ActorType, StepAction};

    fn step(code: &str, n: u32) -> SupplyChainStep {
        SupplyChainStep {
            subject_code: code.to_string(),
            step_number: n,
            action: StepAction::Harvested,
            actor: "farmer-1".to_string(),
            actor_type: ActorType::Farmer,
            description: String::new(),
            location: Some("Kakamega".to_string()),
            temperature: None,
            humidity: None,
            recorded_at: OffsetDateTime::UNIX_EPOCH,
            blockchain_hash: None,
            ledger_status: LedgerStatus::Pending,
        }
    }

    #[tokio::test]
    async fn commit_step_rejects_duplicates_and_gaps() {
        let store = MemorySubjectStore::new();
        store.register_subject("B1", SubjectKind::Batch).await.unwrap();
        store.commit_step(step("B1", 1)).await.unwrap();

        let dup = store.commit_step(step("B1", 1)).await.unwrap_err();
        assert!(matches!(dup, StorageError::StepExists { step_number: 1, .. }));

        let gap = store.commit_step(step("B1", 3)).await.unwrap_err();
        assert!(matches!(gap, StorageError::StepGap { expected: 2, .. }));

        assert_eq!(store.max_committed_step("B1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn max_step_of_unknown_subject_is_not_found() {
        let store = MemorySubjectStore::new();
        let err = store.max_committed_step("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::SubjectNotFound { .. }));
    }

    #[tokio::test]
    async fn write_back_updates_step_row() {
        let store = MemorySubjectStore::new();
        store.register_subject("B1", SubjectKind::Batch).await.unwrap();
        store.commit_step(step("B1", 1)).await.unwrap();
        let target = WriteBackTarget::Step { step_number: 1 };
        store
            .write_back("B1", &target, LedgerStatus::Synced, Some("0xabc"))
            .await
            .unwrap();
        assert_eq!(
            store.mirror_status("B1", &target).await,
            Some((LedgerStatus::Synced, Some("0xabc".to_string())))
        );
    }

    #[tokio::test]
    async fn write_back_keeps_hash_when_marking_unsynced() {
        let store = MemorySubjectStore::new();
        store.register_subject("P1", SubjectKind::Product).await.unwrap();
        let target = WriteBackTarget::Transfer {
            transfer_id: "t-1".to_string(),
        };
        store
            .write_back("P1", &target, LedgerStatus::Pending, None)
            .await
            .unwrap();
        store
            .write_back("P1", &target, LedgerStatus::Unsynced, None)
            .await
            .unwrap();
        assert_eq!(
            store.mirror_status("P1", &target).await,
            Some((LedgerStatus::Unsynced, None))
        );
    }

    #[tokio::test]
    async fn duplicate_subject_code_is_rejected() {
        let store = MemorySubjectStore::new();
        store.register_subject("B1", SubjectKind::Batch).await.unwrap();
        let err = store
            .register_subject("B1", SubjectKind::Batch)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SubjectExists { .. }));
    }
}
