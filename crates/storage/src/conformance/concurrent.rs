use std::future::Future;
use std::sync::Arc;

use super::{at, make_step_op, make_verify_op, t0, TestResult};
use crate::record::OperationState;
use crate::traits::EnqueueOutcome;
use crate::{OperationLog, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<L, F, Fut>(factory: &F) -> Vec<TestResult>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_enqueue_exactly_one_accepted",
        concurrent_enqueue_exactly_one_accepted(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_submit_exactly_one_wins",
        concurrent_submit_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_different_keys_all_accepted",
        concurrent_different_keys_all_accepted(factory).await,
    ));

    results
}

// ── Concurrent enqueue: exactly one accepted ────────────────────────────────

/// N tasks enqueue the same logical request. Exactly one is accepted; every
/// other caller gets `AlreadyPending` and only one record exists afterwards.
async fn concurrent_enqueue_exactly_one_accepted<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let l = log.clone();
        handles.push(tokio::spawn(async move {
            l.enqueue(make_verify_op("P1", at(i as i64))).await
        }));
    }

    let mut accepted = 0usize;
    let mut already = 0usize;
    for handle in handles {
        let outcome = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        match outcome {
            EnqueueOutcome::Accepted(_) => accepted += 1,
            EnqueueOutcome::AlreadyPending(_) => already += 1,
            other => return Err(format!("unexpected outcome {other:?}")),
        }
    }

    if accepted != 1 {
        return Err(format!("expected exactly 1 accepted, got {accepted}"));
    }
    if already != N - 1 {
        return Err(format!("expected {} already-pending, got {already}", N - 1));
    }
    let all = log.list(None).await.map_err(|e| format!("list: {e}"))?;
    if all.len() != 1 {
        return Err(format!("expected 1 record, found {}", all.len()));
    }
    Ok(())
}

// ── Concurrent submit: exactly one wins ─────────────────────────────────────

/// N tasks race to mark the same pending operation submitted with different
/// nonces. Exactly one transition succeeds; the rest see InvalidTransition.
async fn concurrent_submit_exactly_one_wins<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = Arc::new(factory().await);
    let op = make_step_op("B1", 1, t0());
    let key = op.key.clone();
    log.enqueue(op).await.map_err(|e| format!("enqueue: {e}"))?;

    let mut handles = Vec::new();
    for i in 0..N {
        let l = log.clone();
        let k = key.clone();
        handles.push(tokio::spawn(async move {
            match l
                .mark_submitted(&k, "0xacct", i as u64 + 1, &format!("0x{i:02x}"), at(1))
                .await
            {
                Ok(_) => Ok(true),
                Err(StorageError::InvalidTransition { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }

    let rec = log.get(&key).await.map_err(|e| format!("get: {e}"))?;
    if rec.state != OperationState::Submitted || rec.attempts != 1 {
        return Err(format!(
            "expected submitted with 1 attempt, got {} / {}",
            rec.state, rec.attempts
        ));
    }
    Ok(())
}

// ── Different keys: all succeed ─────────────────────────────────────────────

/// N tasks each enqueue and submit a different step. No false conflicts.
async fn concurrent_different_keys_all_accepted<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let l = log.clone();
        handles.push(tokio::spawn(async move {
            let op = make_step_op("B1", i as u32 + 1, at(i as i64));
            let key = op.key.clone();
            let outcome = l.enqueue(op).await?;
            if !outcome.is_accepted() {
                return Ok::<bool, StorageError>(false);
            }
            l.mark_submitted(&key, "0xacct", i as u64 + 1, &format!("0x{i:02x}"), at(100))
                .await?;
            Ok(true)
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let ok = handle
            .await
            .map_err(|e| format!("task {i} panic: {e}"))?
            .map_err(|e| format!("task {i} failed: {e}"))?;
        if !ok {
            return Err(format!("task {i} was not accepted"));
        }
    }

    let submitted = log
        .list(Some(OperationState::Submitted))
        .await
        .map_err(|e| format!("list: {e}"))?;
    if submitted.len() != N {
        return Err(format!("expected {N} submitted, got {}", submitted.len()));
    }
    Ok(())
}
