use std::future::Future;

use super::{at, make_batch_op, make_step_op, make_verify_op, t0, TestResult};
use crate::record::{OperationState, SubmissionFailure};
use crate::traits::EnqueueOutcome;
use crate::OperationLog;

pub(super) async fn run_enqueue_tests<L, F, Fut>(factory: &F) -> Vec<TestResult>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "enqueue",
        "new_key_is_accepted_as_pending",
        new_key_is_accepted_as_pending(factory).await,
    ));
    results.push(TestResult::from_result(
        "enqueue",
        "duplicate_key_returns_already_pending",
        duplicate_key_returns_already_pending(factory).await,
    ));
    results.push(TestResult::from_result(
        "enqueue",
        "duplicate_while_submitted_returns_already_pending",
        duplicate_while_submitted_returns_already_pending(factory).await,
    ));
    results.push(TestResult::from_result(
        "enqueue",
        "duplicate_while_unknown_returns_already_pending",
        duplicate_while_unknown_returns_already_pending(factory).await,
    ));
    results.push(TestResult::from_result(
        "enqueue",
        "confirmed_key_returns_already_confirmed",
        confirmed_key_returns_already_confirmed(factory).await,
    ));
    results.push(TestResult::from_result(
        "enqueue",
        "abandoned_key_is_revived",
        abandoned_key_is_revived(factory).await,
    ));
    results.push(TestResult::from_result(
        "enqueue",
        "different_steps_are_different_keys",
        different_steps_are_different_keys(factory).await,
    ));
    results.push(TestResult::from_result(
        "enqueue",
        "get_unknown_key_is_not_found",
        get_unknown_key_is_not_found(factory).await,
    ));

    results
}

async fn new_key_is_accepted_as_pending<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let op = make_batch_op("B1", t0());
    let key = op.key.clone();

    match log.enqueue(op).await.map_err(|e| format!("enqueue: {e}"))? {
        EnqueueOutcome::Accepted(_) => {}
        other => return Err(format!("expected Accepted, got {other:?}")),
    }
    let stored = log.get(&key).await.map_err(|e| format!("get: {e}"))?;
    if stored.state != OperationState::Pending {
        return Err(format!("expected pending, got {}", stored.state));
    }
    if stored.attempts != 0 || stored.nonce.is_some() || stored.tx_id.is_some() {
        return Err("fresh operation must have no attempts, nonce or tx".to_string());
    }
    Ok(())
}

async fn duplicate_key_returns_already_pending<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    log.enqueue(make_step_op("B1", 1, t0()))
        .await
        .map_err(|e| format!("first enqueue: {e}"))?;
    let second = log
        .enqueue(make_step_op("B1", 1, at(5)))
        .await
        .map_err(|e| format!("second enqueue: {e}"))?;

    match second {
        EnqueueOutcome::AlreadyPending(existing) => {
            if existing.created_at != t0() {
                return Err("AlreadyPending must return the original record".to_string());
            }
        }
        other => return Err(format!("expected AlreadyPending, got {other:?}")),
    }

    let all = log.list(None).await.map_err(|e| format!("list: {e}"))?;
    if all.len() != 1 {
        return Err(format!("expected 1 record, found {}", all.len()));
    }
    Ok(())
}

async fn duplicate_while_submitted_returns_already_pending<L, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let op = make_verify_op("P1", t0());
    let key = op.key.clone();
    log.enqueue(op).await.map_err(|e| format!("enqueue: {e}"))?;
    log.mark_submitted(&key, "acct", 1, "0x01", at(1))
        .await
        .map_err(|e| format!("submit: {e}"))?;

    let again = log
        .enqueue(make_verify_op("P1", at(2)))
        .await
        .map_err(|e| format!("re-enqueue: {e}"))?;
    match again {
        EnqueueOutcome::AlreadyPending(existing) if existing.state == OperationState::Submitted => {
            Ok(())
        }
        other => Err(format!("expected AlreadyPending(submitted), got {other:?}")),
    }
}

async fn duplicate_while_unknown_returns_already_pending<L, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let op = make_verify_op("P1", t0());
    let key = op.key.clone();
    log.enqueue(op).await.map_err(|e| format!("enqueue: {e}"))?;
    log.mark_submission_failed(
        &key,
        SubmissionFailure {
            retryable: true,
            message: "timed out".to_string(),
        },
        at(1),
    )
    .await
    .map_err(|e| format!("fail: {e}"))?;

    let again = log
        .enqueue(make_verify_op("P1", at(2)))
        .await
        .map_err(|e| format!("re-enqueue: {e}"))?;
    if !matches!(again, EnqueueOutcome::AlreadyPending(_)) {
        return Err(format!("expected AlreadyPending, got {again:?}"));
    }
    Ok(())
}

async fn confirmed_key_returns_already_confirmed<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let op = make_verify_op("P1", t0());
    let key = op.key.clone();
    log.enqueue(op).await.map_err(|e| format!("enqueue: {e}"))?;
    log.mark_submitted(&key, "acct", 1, "0x01", at(1))
        .await
        .map_err(|e| format!("submit: {e}"))?;
    log.mark_resolved(
        &key,
        crate::record::Outcome::Confirmed {
            block: super::block(10),
        },
        at(2),
    )
    .await
    .map_err(|e| format!("resolve: {e}"))?;

    let again = log
        .enqueue(make_verify_op("P1", at(3)))
        .await
        .map_err(|e| format!("re-enqueue: {e}"))?;
    if !matches!(again, EnqueueOutcome::AlreadyConfirmed(_)) {
        return Err(format!("expected AlreadyConfirmed, got {again:?}"));
    }
    Ok(())
}

async fn abandoned_key_is_revived<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let op = make_step_op("B1", 2, t0());
    let key = op.key.clone();
    log.enqueue(op).await.map_err(|e| format!("enqueue: {e}"))?;
    log.abandon(&key, "budget spent", at(1))
        .await
        .map_err(|e| format!("abandon: {e}"))?;

    let again = log
        .enqueue(make_step_op("B1", 2, at(2)))
        .await
        .map_err(|e| format!("re-enqueue: {e}"))?;
    let revived = match again {
        EnqueueOutcome::Accepted(op) => op,
        other => return Err(format!("expected Accepted after abandon, got {other:?}")),
    };
    if revived.state != OperationState::Pending {
        return Err(format!("revived op should be pending, got {}", revived.state));
    }
    let abandoned_in_history = revived
        .history
        .iter()
        .any(|t| t.to == OperationState::Abandoned);
    if !abandoned_in_history {
        return Err("revival must keep the abandonment in history".to_string());
    }
    Ok(())
}

async fn different_steps_are_different_keys<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    for n in 1..=3 {
        let outcome = log
            .enqueue(make_step_op("B1", n, at(n as i64)))
            .await
            .map_err(|e| format!("enqueue step {n}: {e}"))?;
        if !outcome.is_accepted() {
            return Err(format!("step {n} should be accepted, got {outcome:?}"));
        }
    }
    Ok(())
}

async fn get_unknown_key_is_not_found<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let key = crate::record::IdempotencyKey::for_step("nope", 1);
    match log.get(&key).await {
        Err(crate::StorageError::OperationNotFound { key: k }) if k == key => Ok(()),
        other => Err(format!("expected OperationNotFound, got {other:?}")),
    }
}
