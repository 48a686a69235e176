use std::future::Future;

use super::{at, make_batch_op, make_step_op, make_verify_op, TestResult};
use crate::record::{OperationState, Outcome};
use crate::OperationLog;

pub(super) async fn run_query_tests<L, F, Fut>(factory: &F) -> Vec<TestResult>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "query",
        "list_filters_by_state",
        list_filters_by_state(factory).await,
    ));
    results.push(TestResult::from_result(
        "query",
        "list_is_oldest_first",
        list_is_oldest_first(factory).await,
    ));
    results.push(TestResult::from_result(
        "query",
        "list_retryable_respects_age",
        list_retryable_respects_age(factory).await,
    ));
    results.push(TestResult::from_result(
        "query",
        "list_abandoned_only_abandoned",
        list_abandoned_only_abandoned(factory).await,
    ));
    results.push(TestResult::from_result(
        "query",
        "list_for_subject_scopes_by_code",
        list_for_subject_scopes_by_code(factory).await,
    ));

    results
}

async fn list_filters_by_state<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let a = make_verify_op("P1", at(0));
    let b = make_verify_op("P2", at(1));
    let b_key = b.key.clone();
    log.enqueue(a).await.map_err(|e| format!("enqueue a: {e}"))?;
    log.enqueue(b).await.map_err(|e| format!("enqueue b: {e}"))?;
    log.mark_submitted(&b_key, "0xacct", 1, "0x01", at(2))
        .await
        .map_err(|e| format!("submit b: {e}"))?;

    let pending = log
        .list(Some(OperationState::Pending))
        .await
        .map_err(|e| format!("list pending: {e}"))?;
    let submitted = log
        .list(Some(OperationState::Submitted))
        .await
        .map_err(|e| format!("list submitted: {e}"))?;
    let all = log.list(None).await.map_err(|e| format!("list: {e}"))?;

    if pending.len() != 1 || pending[0].subject_code != "P1" {
        return Err(format!("pending filter wrong: {pending:?}"));
    }
    if submitted.len() != 1 || submitted[0].key != b_key {
        return Err(format!("submitted filter wrong: {submitted:?}"));
    }
    if all.len() != 2 {
        return Err(format!("expected 2 records, got {}", all.len()));
    }
    Ok(())
}

async fn list_is_oldest_first<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    log.enqueue(make_step_op("B1", 2, at(20)))
        .await
        .map_err(|e| format!("enqueue: {e}"))?;
    log.enqueue(make_batch_op("B1", at(10)))
        .await
        .map_err(|e| format!("enqueue: {e}"))?;
    log.enqueue(make_step_op("B1", 1, at(15)))
        .await
        .map_err(|e| format!("enqueue: {e}"))?;

    let all = log.list(None).await.map_err(|e| format!("list: {e}"))?;
    let created: Vec<_> = all.iter().map(|op| op.created_at).collect();
    if created != vec![at(10), at(15), at(20)] {
        return Err(format!("not oldest first: {created:?}"));
    }
    Ok(())
}

async fn list_retryable_respects_age<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let old = make_verify_op("OLD", at(0));
    let fresh = make_verify_op("FRESH", at(0));
    let stale_unknown = make_verify_op("UNK", at(0));
    let (old_key, fresh_key, unk_key) = (old.key.clone(), fresh.key.clone(), stale_unknown.key.clone());
    for op in [old, fresh, stale_unknown] {
        log.enqueue(op).await.map_err(|e| format!("enqueue: {e}"))?;
    }
    log.mark_submitted(&old_key, "0xacct", 1, "0x01", at(10))
        .await
        .map_err(|e| format!("submit old: {e}"))?;
    log.mark_submitted(&fresh_key, "0xacct", 2, "0x02", at(100))
        .await
        .map_err(|e| format!("submit fresh: {e}"))?;
    log.mark_submitted(&unk_key, "0xacct", 3, "0x03", at(5))
        .await
        .map_err(|e| format!("submit unk: {e}"))?;
    log.mark_resolved(
        &unk_key,
        Outcome::UnknownTimeout {
            reason: "dropped".to_string(),
        },
        at(20),
    )
    .await
    .map_err(|e| format!("unknown: {e}"))?;

    let retryable = log
        .list_retryable(at(50))
        .await
        .map_err(|e| format!("list_retryable: {e}"))?;
    let mut keys: Vec<String> = retryable.iter().map(|op| op.key.to_string()).collect();
    keys.sort();
    let mut expected = vec![old_key.to_string(), unk_key.to_string()];
    expected.sort();
    if keys != expected {
        return Err(format!("expected {expected:?}, got {keys:?}"));
    }
    Ok(())
}

async fn list_abandoned_only_abandoned<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    let a = make_verify_op("P1", at(0));
    let a_key = a.key.clone();
    log.enqueue(a).await.map_err(|e| format!("enqueue: {e}"))?;
    log.enqueue(make_verify_op("P2", at(1)))
        .await
        .map_err(|e| format!("enqueue: {e}"))?;
    log.abandon(&a_key, "gave up", at(2))
        .await
        .map_err(|e| format!("abandon: {e}"))?;

    let abandoned = log
        .list_abandoned()
        .await
        .map_err(|e| format!("list_abandoned: {e}"))?;
    if abandoned.len() != 1 || abandoned[0].key != a_key {
        return Err(format!("unexpected abandoned list: {abandoned:?}"));
    }
    Ok(())
}

async fn list_for_subject_scopes_by_code<L, F, Fut>(factory: &F) -> Result<(), String>
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let log = factory().await;
    log.enqueue(make_batch_op("B1", at(0)))
        .await
        .map_err(|e| format!("enqueue: {e}"))?;
    log.enqueue(make_step_op("B1", 1, at(1)))
        .await
        .map_err(|e| format!("enqueue: {e}"))?;
    log.enqueue(make_step_op("B2", 1, at(2)))
        .await
        .map_err(|e| format!("enqueue: {e}"))?;

    let b1 = log
        .list_for_subject("B1")
        .await
        .map_err(|e| format!("list_for_subject: {e}"))?;
    if b1.len() != 2 || b1.iter().any(|op| op.subject_code != "B1") {
        return Err(format!("unexpected B1 operations: {b1:?}"));
    }
    let none = log
        .list_for_subject("B9")
        .await
        .map_err(|e| format!("list_for_subject: {e}"))?;
    if !none.is_empty() {
        return Err("unknown subject should have no operations".to_string());
    }
    Ok(())
}
