use std::future::Future;

use super::{at, block, make_verify_op, t0, TestResult};
use crate::record::{IdempotencyKey, OperationState, Outcome, SubmissionFailure};
use crate::{OperationLog, StorageError};

pub(super) async fn run_transition_tests<L, F, Fut>(factory: &F) -> Vec<TestResult>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "transition",
        "submit_records_nonce_tx_and_attempt",
        submit_records_nonce_tx_and_attempt(factory).await,
    ));
    results.push(TestResult::from_result(
        "transition",
        "confirm_records_block_and_resolution_time",
        confirm_records_block_and_resolution_time(factory).await,
    ));
    results.push(TestResult::from_result(
        "transition",
        "confirm_without_submit_is_rejected",
        confirm_without_submit_is_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "transition",
        "double_submit_is_rejected",
        double_submit_is_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "transition",
        "unknown_requeues_to_pending",
        unknown_requeues_to_pending(factory).await,
    ));
    results.push(TestResult::from_result(
        "transition",
        "fatal_submission_failure_is_failed",
        fatal_submission_failure_is_failed(factory).await,
    ));
    results.push(TestResult::from_result(
        "transition",
        "abandon_is_terminal_until_revived",
        abandon_is_terminal_until_revived(factory).await,
    ));
    results.push(TestResult::from_result(
        "transition",
        "late_confirmation_after_unknown",
        late_confirmation_after_unknown(factory).await,
    ));
    results.push(TestResult::from_result(
        "transition",
        "transition_on_missing_key_is_not_found",
        transition_on_missing_key_is_not_found(factory).await,
    ));

    results
}

async fn submit_records_nonce_tx_and_attempt<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let op = make_verify_op("P1", t0());
    let key = op.key.clone();
    log.enqueue(op).await.map_err(|e| format!("enqueue: {e}"))?;
    let rec = log
        .mark_submitted(&key, "0xacct", 7, "0xbeef", at(3))
        .await
        .map_err(|e| format!("submit: {e}"))?;

    if rec.state != OperationState::Submitted {
        return Err(format!("expected submitted, got {}", rec.state));
    }
    if rec.nonce != Some(7) || rec.tx_id.as_deref() != Some("0xbeef") {
        return Err(format!("nonce/tx not recorded: {:?}/{:?}", rec.nonce, rec.tx_id));
    }
    if rec.attempts != 1 {
        return Err(format!("expected 1 attempt, got {}", rec.attempts));
    }
    if rec.submitted_at != Some(at(3)) {
        return Err("submitted_at not recorded".to_string());
    }
    let reread = log.get(&key).await.map_err(|e| format!("get: {e}"))?;
    if reread != rec {
        return Err("returned record differs from stored record".to_string());
    }
    Ok(())
}

async fn confirm_records_block_and_resolution_time<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let op = make_verify_op("P1", t0());
    let key = op.key.clone();
    log.enqueue(op).await.map_err(|e| format!("enqueue: {e}"))?;
    log.mark_submitted(&key, "0xacct", 1, "0x01", at(1))
        .await
        .map_err(|e| format!("submit: {e}"))?;
    let rec = log
        .mark_resolved(&key, Outcome::Confirmed { block: block(42) }, at(9))
        .await
        .map_err(|e| format!("resolve: {e}"))?;

    if rec.state != OperationState::Confirmed {
        return Err(format!("expected confirmed, got {}", rec.state));
    }
    match rec.outcome {
        Some(Outcome::Confirmed { block: b }) if b.number == 42 => {}
        other => return Err(format!("unexpected outcome {other:?}")),
    }
    if rec.resolved_at != Some(at(9)) {
        return Err("resolved_at not recorded".to_string());
    }
    Ok(())
}

async fn confirm_without_submit_is_rejected<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let op = make_verify_op("P1", t0());
    let key = op.key.clone();
    log.enqueue(op).await.map_err(|e| format!("enqueue: {e}"))?;
    match log
        .mark_resolved(&key, Outcome::Confirmed { block: block(1) }, at(1))
        .await
    {
        Err(StorageError::InvalidTransition { from, to, .. })
            if from == OperationState::Pending && to == OperationState::Confirmed =>
        {
            Ok(())
        }
        other => Err(format!("expected InvalidTransition, got {other:?}")),
    }
}

async fn double_submit_is_rejected<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let op = make_verify_op("P1", t0());
    let key = op.key.clone();
    log.enqueue(op).await.map_err(|e| format!("enqueue: {e}"))?;
    log.mark_submitted(&key, "0xacct", 1, "0x01", at(1))
        .await
        .map_err(|e| format!("submit: {e}"))?;
    match log.mark_submitted(&key, "0xacct", 2, "0x02", at(2)).await {
        Err(StorageError::InvalidTransition { .. }) => {}
        other => return Err(format!("expected InvalidTransition, got {other:?}")),
    }
    let rec = log.get(&key).await.map_err(|e| format!("get: {e}"))?;
    if rec.nonce != Some(1) {
        return Err("rejected submit must not overwrite the nonce".to_string());
    }
    Ok(())
}

async fn unknown_requeues_to_pending<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let op = make_verify_op("P1", t0());
    let key = op.key.clone();
    log.enqueue(op).await.map_err(|e| format!("enqueue: {e}"))?;
    log.mark_submitted(&key, "0xacct", 1, "0x01", at(1))
        .await
        .map_err(|e| format!("submit: {e}"))?;
    log.mark_resolved(
        &key,
        Outcome::UnknownTimeout {
            reason: "receipt not found".to_string(),
        },
        at(60),
    )
    .await
    .map_err(|e| format!("unknown: {e}"))?;
    let rec = log
        .requeue(&key, at(64), at(61))
        .await
        .map_err(|e| format!("requeue: {e}"))?;

    if rec.state != OperationState::Pending {
        return Err(format!("expected pending, got {}", rec.state));
    }
    if rec.next_attempt_at != Some(at(64)) {
        return Err("next_attempt_at not recorded".to_string());
    }
    if rec.attempts != 1 {
        return Err(format!("requeue must not reset attempts, got {}", rec.attempts));
    }
    Ok(())
}

async fn fatal_submission_failure_is_failed<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let op = make_verify_op("P1", t0());
    let key = op.key.clone();
    log.enqueue(op).await.map_err(|e| format!("enqueue: {e}"))?;
    let rec = log
        .mark_submission_failed(
            &key,
            SubmissionFailure {
                retryable: false,
                message: "insufficient funds".to_string(),
            },
            at(1),
        )
        .await
        .map_err(|e| format!("fail: {e}"))?;
    if rec.state != OperationState::Failed {
        return Err(format!("expected failed, got {}", rec.state));
    }
    if rec.last_error.as_deref() != Some("insufficient funds") {
        return Err("last_error not recorded".to_string());
    }
    if rec.outcome.is_some() {
        return Err("a send failure is not a ledger outcome".to_string());
    }
    Ok(())
}

async fn abandon_is_terminal_until_revived<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let op = make_verify_op("P1", t0());
    let key = op.key.clone();
    log.enqueue(op).await.map_err(|e| format!("enqueue: {e}"))?;
    log.abandon(&key, "retry budget spent", at(1))
        .await
        .map_err(|e| format!("abandon: {e}"))?;

    if log.mark_submitted(&key, "0xacct", 1, "0x01", at(2)).await.is_ok() {
        return Err("abandoned operation must not be submittable".to_string());
    }
    if log.requeue(&key, at(3), at(2)).await.is_ok() {
        return Err("abandoned operation must not be requeued".to_string());
    }
    let rec = log
        .revive(&key, at(4))
        .await
        .map_err(|e| format!("revive: {e}"))?;
    if rec.state != OperationState::Pending || rec.attempts != 0 {
        return Err(format!(
            "revived op should be pending with 0 attempts, got {} / {}",
            rec.state, rec.attempts
        ));
    }
    Ok(())
}

async fn late_confirmation_after_unknown<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let op = make_verify_op("P1", t0());
    let key = op.key.clone();
    log.enqueue(op).await.map_err(|e| format!("enqueue: {e}"))?;
    log.mark_submitted(&key, "0xacct", 1, "0x01", at(1))
        .await
        .map_err(|e| format!("submit: {e}"))?;
    log.mark_resolved(
        &key,
        Outcome::UnknownTimeout {
            reason: "no receipt".to_string(),
        },
        at(60),
    )
    .await
    .map_err(|e| format!("unknown: {e}"))?;
    let rec = log
        .mark_resolved(&key, Outcome::Confirmed { block: block(5) }, at(70))
        .await
        .map_err(|e| format!("late confirm: {e}"))?;
    if rec.state != OperationState::Confirmed {
        return Err(format!("expected confirmed, got {}", rec.state));
    }
    Ok(())
}

async fn transition_on_missing_key_is_not_found<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let key = IdempotencyKey::for_step("ghost", 1);
    match log.abandon(&key, "x", at(0)).await {
        Err(StorageError::OperationNotFound { .. }) => Ok(()),
        other => Err(format!("expected OperationNotFound, got {other:?}")),
    }
}
