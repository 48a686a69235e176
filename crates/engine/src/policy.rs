//! Reconciliation policy: what to do next with each ledger operation.
//!
//! The policy allocates step numbers, enqueues operations, and turns the
//! state of an operation into a [`Decision`]. Acting on a decision goes
//! through the other components only: the operation log for transitions, the
//! nonce sequencer for ordering, and the gateway for the actual send.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};

use agritrace_ledger::{
    LedgerGateway, LedgerRead, NonceDrift, NonceRelease, NonceSequencer, ReceiptStatus,
    SubmissionError,
};
use agritrace_storage::{
    ActorType, EnqueueOutcome, IdempotencyKey, LedgerOperation, LedgerStatus, OperationKind,
    OperationLog, OperationPayload, OperationState, Outcome, StepAction, StepRecord, StorageError,
    SubjectStore, SubmissionFailure, SupplyChainStep, WriteBackTarget,
};
use rust_decimal::Decimal;

use crate::clock::Clock;
use crate::config::{RetrySettings, TimeoutSettings};
use crate::error::EngineError;

/// What the policy wants done with an operation right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "detail", rename_all = "snake_case")]
pub enum Decision {
    /// Claim a nonce and send it.
    Submit,
    /// Not yet: backing off, or waiting on a predecessor.
    Defer(String),
    /// Put it back to Pending, eligible at the given time.
    Retry(#[serde(with = "time::serde::rfc3339")] OffsetDateTime),
    /// Stop retrying.
    Abandon(String),
    /// Nothing to do (resolved, in flight, or someone else is on it).
    Skip(String),
}

/// A supply-chain step as submitted by a caller, before it has a number.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, Serialize)]
pub struct NewStep {
    pub subject_code: String,
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
}

impl NewStep {
    fn numbered(self, step_number: u32) -> StepRecord {
        StepRecord {
            subject_code: self.subject_code,
            step_number,
            action: self.action,
            actor: self.actor,
            actor_type: self.actor_type,
            description: self.description,
            location: self.location,
            temperature: self.temperature,
            humidity: self.humidity,
        }
    }
}

type StepLocks = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

/// A subject's step lock. The table entry is dropped with the last lease,
/// so the table only holds subjects with an append in progress.
struct StepLockLease<'a> {
    locks: &'a StepLocks,
    code: String,
    lock: Arc<Mutex<()>>,
}

impl Drop for StepLockLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        // Held by the table and this lease only.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.code);
        }
    }
}

/// Removes a key from the set of keys being driven when dropped.
struct DriveGuard<'a> {
    driving: &'a StdMutex<HashSet<IdempotencyKey>>,
    key: IdempotencyKey,
}

impl Drop for DriveGuard<'_> {
    fn drop(&mut self) {
        self.driving
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.key);
    }
}

pub struct ReconciliationPolicy {
    pub(crate) log: Arc<dyn OperationLog>,
    pub(crate) subjects: Arc<dyn SubjectStore>,
    pub(crate) gateway: Arc<dyn LedgerGateway>,
    pub(crate) nonces: Arc<NonceSequencer>,
    pub(crate) clock: Arc<dyn Clock>,
    retry: RetrySettings,
    timeouts: TimeoutSettings,
    /// One lock per subject, held while a step number is allocated.
    step_locks: StepLocks,
    /// Keys currently being driven; a second driver skips.
    driving: StdMutex<HashSet<IdempotencyKey>>,
    notify: Option<mpsc::UnboundedSender<IdempotencyKey>>,
}

impl ReconciliationPolicy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: Arc<dyn OperationLog>,
        subjects: Arc<dyn SubjectStore>,
        gateway: Arc<dyn LedgerGateway>,
        nonces: Arc<NonceSequencer>,
        clock: Arc<dyn Clock>,
        retry: RetrySettings,
        timeouts: TimeoutSettings,
        notify: Option<mpsc::UnboundedSender<IdempotencyKey>>,
    ) -> Self {
        ReconciliationPolicy {
            log,
            subjects,
            gateway,
            nonces,
            clock,
            retry,
            timeouts,
            step_locks: StdMutex::new(HashMap::new()),
            driving: StdMutex::new(HashSet::new()),
            notify,
        }
    }

    // ── Enqueue ──────────────────────────────────────────────────────────

    /// Preflight `payload`, record it, and hand it to the dispatcher.
    pub async fn enqueue(&self, payload: OperationPayload) -> Result<EnqueueOutcome, EngineError> {
        self.gateway.preflight(&payload)?;
        self.record(payload).await
    }

    async fn record(&self, payload: OperationPayload) -> Result<EnqueueOutcome, EngineError> {
        let op = LedgerOperation::new(payload, self.clock.now());
        let outcome = self.log.enqueue(op).await?;
        let op = outcome.operation();
        match &outcome {
            EnqueueOutcome::Accepted(_) => {
                tracing::info!(key = %op.key, subject = %op.subject_code, "ledger operation enqueued");
                self.write_back(op, LedgerStatus::Pending, None).await;
                self.dispatch(&op.key);
            }
            EnqueueOutcome::AlreadyPending(_) => {
                tracing::info!(key = %op.key, state = %op.state, "ledger operation already pending");
            }
            EnqueueOutcome::AlreadyConfirmed(_) => {
                tracing::debug!(key = %op.key, "ledger operation already confirmed");
            }
        }
        Ok(outcome)
    }

    fn dispatch(&self, key: &IdempotencyKey) {
        if let Some(tx) = &self.notify {
            if tx.send(key.clone()).is_err() {
                tracing::debug!(key = %key, "dispatcher gone, poller will pick the operation up");
            }
        }
    }

    fn step_lock(&self, code: &str) -> StepLockLease<'_> {
        let mut locks = self.step_locks.lock().unwrap_or_else(|p| p.into_inner());
        StepLockLease {
            locks: &self.step_locks,
            code: code.to_string(),
            lock: Arc::clone(locks.entry(code.to_string()).or_default()),
        }
    }

    /// Number the step, commit it locally, and enqueue its ledger mirror.
    ///
    /// Holds the subject's step lock from reading the current maximum until
    /// the new row is committed, so concurrent appends to one subject get
    /// consecutive numbers in lock-arrival order. A row whose mirror cannot
    /// be recorded is marked `Unsynced` before the error is returned.
    pub async fn append_step(
        &self,
        step: NewStep,
    ) -> Result<(SupplyChainStep, EnqueueOutcome), EngineError> {
        let code = step.subject_code.clone();
        let lease = self.step_lock(&code);
        let _held = lease.lock.lock().await;

        let step_number = self.subjects.max_committed_step(&code).await? + 1;
        let record = step.numbered(step_number);
        let payload = OperationPayload::AppendStep(record.clone());
        self.gateway.preflight(&payload)?;

        let committed = SupplyChainStep {
            subject_code: code.clone(),
            step_number,
            action: record.action,
            actor: record.actor.clone(),
            actor_type: record.actor_type,
            description: record.description.clone(),
            location: record.location.clone(),
            temperature: record.temperature,
            humidity: record.humidity,
            recorded_at: self.clock.now(),
            blockchain_hash: None,
            ledger_status: LedgerStatus::Pending,
        };
        self.subjects.commit_step(committed.clone()).await?;
        tracing::info!(subject = %code, step_number, action = %record.action, "step committed");

        match self.record(payload).await {
            Ok(outcome) => Ok((committed, outcome)),
            Err(e) => {
                tracing::error!(subject = %code, step_number, error = %e, "step committed without a ledger mirror");
                let target = WriteBackTarget::Step { step_number };
                if let Err(wb) = self
                    .subjects
                    .write_back(&code, &target, LedgerStatus::Unsynced, None)
                    .await
                {
                    tracing::error!(subject = %code, step_number, error = %wb, "write-back failed");
                }
                Err(e)
            }
        }
    }

    // ── Decide ───────────────────────────────────────────────────────────

    /// Decide what to do with `op` at `now`. Reads the log, never writes.
    pub async fn decide(
        &self,
        op: &LedgerOperation,
        now: OffsetDateTime,
    ) -> Result<Decision, EngineError> {
        match op.state {
            OperationState::Confirmed | OperationState::Abandoned => {
                Ok(Decision::Skip(format!("operation is {}", op.state)))
            }
            OperationState::Submitted => Ok(Decision::Skip("awaiting receipt".to_string())),
            OperationState::Failed | OperationState::Unknown => Ok(self.decide_retry(op, now)),
            OperationState::Pending => {
                // A transaction already sent keeps the window running even
                // while its receipt never settles.
                if op.tx_id.is_some() && budget_start(op) + self.timeouts.unknown_to_abandon() <= now {
                    return Ok(Decision::Abandon(format!(
                        "unresolved after {} ms",
                        self.timeouts.unknown_to_abandon_ms
                    )));
                }
                if let Some(at) = op.next_attempt_at {
                    if at > now {
                        return Ok(Decision::Defer(format!("backing off until {}", at)));
                    }
                }
                if let Some((key, state)) = self.blocker(op).await? {
                    return Ok(if state == OperationState::Abandoned {
                        Decision::Abandon(format!("predecessor {} abandoned", key))
                    } else {
                        Decision::Defer(format!("waiting for {} ({})", key, state))
                    });
                }
                Ok(Decision::Submit)
            }
        }
    }

    fn decide_retry(&self, op: &LedgerOperation, now: OffsetDateTime) -> Decision {
        if op.state == OperationState::Failed && op.outcome.is_none() {
            // Refused at submission time: retrying cannot help.
            return Decision::Abandon(format!(
                "rejected by ledger: {}",
                op.last_error.as_deref().unwrap_or("no reason given")
            ));
        }
        if op.attempts >= self.retry.max_attempts {
            return Decision::Abandon(format!(
                "retry budget of {} attempts spent",
                self.retry.max_attempts
            ));
        }
        if budget_start(op) + self.timeouts.unknown_to_abandon() <= now {
            return Decision::Abandon(format!(
                "unresolved after {} ms",
                self.timeouts.unknown_to_abandon_ms
            ));
        }
        Decision::Retry(now + self.retry.backoff(op.attempts.max(1)))
    }

    /// The first predecessor of `op` that is not yet confirmed.
    ///
    /// Registration precedes everything else for a subject, and step `n - 1`
    /// precedes step `n`. A predecessor with no log record predates the
    /// engine and counts as settled.
    async fn blocker(
        &self,
        op: &LedgerOperation,
    ) -> Result<Option<(IdempotencyKey, OperationState)>, EngineError> {
        if op.kind.is_registration() {
            return Ok(None);
        }
        let mut predecessors = vec![
            IdempotencyKey::for_subject(OperationKind::RegisterBatch, &op.subject_code),
            IdempotencyKey::for_subject(OperationKind::RegisterProduct, &op.subject_code),
        ];
        if let Some(n) = op.step_number() {
            if n > 1 {
                predecessors.push(IdempotencyKey::for_step(&op.subject_code, n - 1));
            }
        }
        for key in predecessors {
            match self.log.get(&key).await {
                Ok(pred) if pred.state != OperationState::Confirmed => {
                    return Ok(Some((key, pred.state)))
                }
                Ok(_) => {}
                Err(StorageError::OperationNotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    // ── Drive ────────────────────────────────────────────────────────────

    /// Decide on the operation under `key` and act on the decision.
    pub async fn drive(&self, key: &IdempotencyKey) -> Result<Decision, EngineError> {
        let Some(_guard) = self.begin_drive(key) else {
            return Ok(Decision::Skip("already being driven".to_string()));
        };
        let op = self.log.get(key).await?;
        let now = self.clock.now();
        let decision = self.decide(&op, now).await?;
        match &decision {
            Decision::Submit => return self.submit(op, now).await,
            Decision::Retry(at) => {
                self.log.requeue(key, *at, now).await?;
                tracing::info!(key = %key, attempts = op.attempts, retry_at = %at, "retry scheduled");
            }
            Decision::Abandon(reason) => self.abandon(&op, reason, now).await?,
            Decision::Defer(why) => tracing::debug!(key = %key, %why, "deferred"),
            Decision::Skip(_) => {}
        }
        Ok(decision)
    }

    fn begin_drive(&self, key: &IdempotencyKey) -> Option<DriveGuard<'_>> {
        let mut driving = self.driving.lock().unwrap_or_else(|p| p.into_inner());
        if !driving.insert(key.clone()) {
            return None;
        }
        Some(DriveGuard {
            driving: &self.driving,
            key: key.clone(),
        })
    }

    async fn submit(
        &self,
        op: LedgerOperation,
        now: OffsetDateTime,
    ) -> Result<Decision, EngineError> {
        let key = op.key.clone();

        // The previous transaction for this operation decides what happens
        // to its nonce, and whether to send at all.
        let mut resend_nonce = None;
        if let Some(tx_id) = &op.tx_id {
            match self.gateway.fetch_receipt(tx_id).await {
                ReceiptStatus::Confirmed(block) => {
                    tracing::info!(key = %key, tx = %tx_id, block = block.number, "late confirmation, not resubmitting");
                    let hash = block.hash.clone();
                    self.log
                        .mark_resolved(&key, Outcome::Confirmed { block }, now)
                        .await?;
                    self.release_held(&op, NonceRelease::Consumed).await;
                    self.write_back(&op, LedgerStatus::Synced, Some(&hash)).await;
                    return Ok(Decision::Skip("confirmed late".to_string()));
                }
                ReceiptStatus::StillPending => {
                    return Ok(Decision::Defer(format!("transaction {} still pending", tx_id)));
                }
                ReceiptStatus::Unreachable(reason) => {
                    return Ok(Decision::Defer(format!(
                        "receipt of {} unobtainable: {}",
                        tx_id, reason
                    )));
                }
                ReceiptStatus::Reverted { .. } => {
                    self.release_held(&op, NonceRelease::Consumed).await;
                }
                ReceiptStatus::NotFound => {
                    // Never included: resend under the same nonce.
                    self.release_held(&op, NonceRelease::Void).await;
                    resend_nonce = op.nonce;
                }
            }
        }

        let Some(account) = self.gateway.account().map(str::to_string) else {
            let failure = SubmissionFailure {
                retryable: false,
                message: "no signing account configured".to_string(),
            };
            self.log.mark_submission_failed(&key, failure, now).await?;
            return self.after_failure(&key).await;
        };

        let nonce = match resend_nonce.filter(|_| op.account.as_deref() == Some(account.as_str())) {
            Some(previous) => self.nonces.reclaim(&account, previous).await,
            None => self.nonces.claim(&account).await,
        };
        // The gateway applies the submission timeout itself; this only
        // catches one that hangs.
        let sent = match tokio::time::timeout(
            self.timeouts.submission() + self.timeouts.confirmation_grace(),
            self.gateway.submit(&op, nonce),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SubmissionError::Transport(format!(
                "submission timed out after {} ms",
                self.timeouts.submission_ms
            ))),
        };

        match sent {
            Ok(tx_id) => {
                let at = self.clock.now();
                self.log
                    .mark_submitted(&key, &account, nonce, &tx_id, at)
                    .await?;
                tracing::info!(key = %key, account = %account, nonce, tx = %tx_id, "submitted");
                Ok(Decision::Submit)
            }
            Err(err) => {
                if let Some(tx_id) = err.possibly_sent() {
                    // The nonce stays claimed; the receipt settles it.
                    let at = self.clock.now();
                    self.log
                        .mark_submitted(&key, &account, nonce, tx_id, at)
                        .await?;
                    tracing::warn!(key = %key, account = %account, nonce, tx = %tx_id, error = %err, "no reply to submission, awaiting its receipt");
                    return Ok(Decision::Submit);
                }
                if let SubmissionError::NonceConflict { .. } = &err {
                    self.reconcile_nonces(&account).await;
                }
                self.nonces.release(&account, nonce, NonceRelease::Void).await;
                tracing::warn!(key = %key, nonce, error = %err, retryable = err.is_retryable(), "submission failed");
                let failure = SubmissionFailure {
                    retryable: err.is_retryable(),
                    message: err.to_string(),
                };
                self.log
                    .mark_submission_failed(&key, failure, self.clock.now())
                    .await?;
                self.after_failure(&key).await
            }
        }
    }

    async fn release_held(&self, op: &LedgerOperation, how: NonceRelease) {
        if let (Some(account), Some(nonce)) = (&op.account, op.nonce) {
            self.nonces.release(account, nonce, how).await;
        }
    }

    /// Immediately turn a failed attempt into a retry or an abandonment.
    async fn after_failure(&self, key: &IdempotencyKey) -> Result<Decision, EngineError> {
        let op = self.log.get(key).await?;
        let now = self.clock.now();
        let decision = self.decide_retry(&op, now);
        match &decision {
            Decision::Retry(at) => {
                self.log.requeue(key, *at, now).await?;
                tracing::info!(key = %key, attempts = op.attempts, retry_at = %at, "retry scheduled");
            }
            Decision::Abandon(reason) => self.abandon(&op, reason, now).await?,
            _ => {}
        }
        Ok(decision)
    }

    /// Read the ledger's nonce for `account` and reconcile the sequencer.
    pub async fn reconcile_nonces(&self, account: &str) -> Option<NonceDrift> {
        match self.gateway.account_nonce(account).await {
            LedgerRead::Found(on_chain) => {
                Some(self.nonces.reconcile_from_chain(account, on_chain).await)
            }
            other => {
                tracing::debug!(account, result = ?other, "nonce reconciliation skipped");
                None
            }
        }
    }

    // ── Abandon and revive ───────────────────────────────────────────────

    async fn abandon(
        &self,
        op: &LedgerOperation,
        reason: &str,
        now: OffsetDateTime,
    ) -> Result<(), EngineError> {
        self.log.abandon(&op.key, reason, now).await?;
        tracing::warn!(key = %op.key, attempts = op.attempts, %reason, "operation abandoned");
        self.write_back(op, LedgerStatus::Unsynced, None).await;

        // Pending successors can never pass the ordering gate now.
        let successors: Vec<LedgerOperation> = self
            .log
            .list_for_subject(&op.subject_code)
            .await?
            .into_iter()
            .filter(|s| s.state == OperationState::Pending && s.key != op.key)
            .filter(|s| is_successor(op, s))
            .collect();
        let note = format!("predecessor {} abandoned", op.key);
        for succ in successors {
            match self.log.abandon(&succ.key, &note, now).await {
                Ok(_) => {
                    tracing::warn!(key = %succ.key, predecessor = %op.key, "successor abandoned");
                    self.write_back(&succ, LedgerStatus::Unsynced, None).await;
                }
                Err(e) => {
                    tracing::debug!(key = %succ.key, error = %e, "successor moved on before abandonment")
                }
            }
        }
        Ok(())
    }

    /// Abandoned -> Pending with a fresh budget, and dispatch it.
    pub async fn revive(&self, key: &IdempotencyKey) -> Result<LedgerOperation, EngineError> {
        let current = self.log.get(key).await?;
        if current.state != OperationState::Abandoned {
            return Err(EngineError::NotAbandoned {
                key: key.clone(),
                state: current.state,
            });
        }
        let op = self.log.revive(key, self.clock.now()).await?;
        tracing::info!(key = %key, "abandoned operation revived");
        self.write_back(&op, LedgerStatus::Pending, None).await;
        self.dispatch(key);
        Ok(op)
    }

    /// Re-record a mirror whose payload is already in the log.
    pub(crate) async fn re_enqueue(&self, op: &LedgerOperation) -> Result<EnqueueOutcome, EngineError> {
        self.record(op.payload.clone()).await
    }

    // ── Write-back ───────────────────────────────────────────────────────

    /// Persist the mirror status on the relational row. Failures are logged;
    /// the operation log already holds the authoritative state.
    pub(crate) async fn write_back(
        &self,
        op: &LedgerOperation,
        status: LedgerStatus,
        hash: Option<&str>,
    ) {
        let target = WriteBackTarget::for_operation(op);
        if let Err(e) = self
            .subjects
            .write_back(&op.subject_code, &target, status, hash)
            .await
        {
            tracing::error!(key = %op.key, error = %e, "write-back failed");
        }
    }
}

/// Where the audit trail's retry window starts: creation, or the last revival.
fn budget_start(op: &LedgerOperation) -> OffsetDateTime {
    op.history
        .iter()
        .rev()
        .find(|t| t.from == Some(OperationState::Abandoned))
        .map_or(op.created_at, |t| t.at)
}

/// Whether `later` is ordered after `earlier` for the same subject.
fn is_successor(earlier: &LedgerOperation, later: &LedgerOperation) -> bool {
    if earlier.kind.is_registration() {
        return !later.kind.is_registration();
    }
    match (earlier.step_number(), later.step_number()) {
        (Some(a), Some(b)) => b > a,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use agritrace_ledger::SimulatedLedger;
    use agritrace_storage::{
        BatchRegistration, MemoryOperationLog, MemorySubjectStore, SubjectKind,
        VerificationRequest,
    };

    fn policy() -> ReconciliationPolicy {
        ReconciliationPolicy::new(
            Arc::new(MemoryOperationLog::new()),
            Arc::new(MemorySubjectStore::new()),
            Arc::new(SimulatedLedger::with_random_account()),
            Arc::new(NonceSequencer::new()),
            Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH)),
            RetrySettings::default(),
            TimeoutSettings::default(),
            None,
        )
    }

    fn new_step(code: &str) -> NewStep {
        NewStep {
            subject_code: code.to_string(),
            action: StepAction::Transported,
            actor: "trader-7".to_string(),
            actor_type: ActorType::Trader,
            description: String::new(),
            location: None,
            temperature: None,
            humidity: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn step_locks_are_dropped_once_appends_finish() {
        let policy = Arc::new(policy());
        let codes = ["B1", "B2", "B3"];
        for code in codes {
            policy
                .subjects
                .register_subject(code, SubjectKind::Batch)
                .await
                .unwrap();
        }
        let mut handles = Vec::new();
        for i in 0..12 {
            let policy = Arc::clone(&policy);
            let code = codes[i % codes.len()];
            handles.push(tokio::spawn(async move { policy.append_step(new_step(code)).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(policy.append_step(new_step("NOPE")).await.is_err());

        assert!(policy.step_locks.lock().unwrap().is_empty());
        for code in codes {
            assert_eq!(policy.subjects.max_committed_step(code).await.unwrap(), 4);
        }
    }

    fn step_op(code: &str, n: u32) -> LedgerOperation {
        LedgerOperation::new(
            OperationPayload::AppendStep(StepRecord {
                subject_code: code.to_string(),
                step_number: n,
                action: StepAction::Sold,
                actor: "retailer-1".to_string(),
                actor_type: ActorType::Retailer,
                description: String::new(),
                location: None,
                temperature: None,
                humidity: None,
            }),
            OffsetDateTime::UNIX_EPOCH,
        )
    }

    #[test]
    fn registration_precedes_everything_on_its_subject() {
        let reg = LedgerOperation::new(
            OperationPayload::RegisterBatch(BatchRegistration {
                batch_number: "B1".to_string(),
                seed_variety: "NUA45".to_string(),
                planting_date: 0,
                total_quantity: Decimal::ONE,
            }),
            OffsetDateTime::UNIX_EPOCH,
        );
        let verify = LedgerOperation::new(
            OperationPayload::MarkVerified(VerificationRequest {
                qr_code: "B1".to_string(),
            }),
            OffsetDateTime::UNIX_EPOCH,
        );
        assert!(is_successor(&reg, &step_op("B1", 1)));
        assert!(is_successor(&reg, &verify));
        assert!(!is_successor(&step_op("B1", 1), &verify));
    }

    #[test]
    fn later_steps_succeed_earlier_ones() {
        assert!(is_successor(&step_op("B1", 2), &step_op("B1", 3)));
        assert!(!is_successor(&step_op("B1", 3), &step_op("B1", 2)));
    }

    #[test]
    fn budget_restarts_at_revival() {
        let mut op = step_op("B1", 1);
        let later = OffsetDateTime::UNIX_EPOCH + std::time::Duration::from_secs(500);
        op.transition(OperationState::Abandoned, later, None);
        let revived_at = later + std::time::Duration::from_secs(10);
        op.transition(OperationState::Pending, revived_at, Some("revived".to_string()));
        assert_eq!(budget_start(&op), revived_at);
        assert_eq!(budget_start(&step_op("B1", 1)), OffsetDateTime::UNIX_EPOCH);
    }
}
