//! Runs the operation-log conformance suite against the bundled backends.

use agritrace_storage::conformance::run_conformance_suite;
use agritrace_storage::{
    read_journal, IdempotencyKey, LedgerOperation, MemoryOperationLog, OperationLog,
    OperationPayload, OperationState, VerificationRequest,
};
use time::OffsetDateTime;

#[tokio::test]
async fn memory_log_conformance() {
    let report = run_conformance_suite(|| async { MemoryOperationLog::new() }).await;
    assert!(report.failed == 0, "{report}");
    assert!(report.total > 20);
}

#[tokio::test]
async fn journaled_log_conformance() {
    let dir = tempfile::tempdir().unwrap();
    let counter = std::sync::atomic::AtomicUsize::new(0);
    let report = run_conformance_suite(|| {
        let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let path = dir.path().join(format!("ops-{n}.jsonl"));
        async move { MemoryOperationLog::open_journal(&path).unwrap() }
    })
    .await;
    assert!(report.failed == 0, "{report}");
}

fn verify_op(code: &str) -> LedgerOperation {
    LedgerOperation::new(
        OperationPayload::MarkVerified(VerificationRequest {
            qr_code: code.to_string(),
        }),
        OffsetDateTime::UNIX_EPOCH,
    )
}

#[tokio::test]
async fn journal_replays_latest_state_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ops.jsonl");
    let key = IdempotencyKey::for_subject(agritrace_storage::OperationKind::MarkVerified, "P1");

    {
        let log = MemoryOperationLog::open_journal(&path).unwrap();
        log.enqueue(verify_op("P1")).await.unwrap();
        log.enqueue(verify_op("P2")).await.unwrap();
        log.mark_submitted(&key, "0xacct", 1, "0xfeed", OffsetDateTime::UNIX_EPOCH)
            .await
            .unwrap();
    }

    let reopened = MemoryOperationLog::open_journal(&path).unwrap();
    let op = reopened.get(&key).await.unwrap();
    assert_eq!(op.state, OperationState::Submitted);
    assert_eq!(op.tx_id.as_deref(), Some("0xfeed"));
    assert_eq!(reopened.list(None).await.unwrap().len(), 2);

    // Duplicate guard survives the restart.
    let again = reopened.enqueue(verify_op("P1")).await.unwrap();
    assert!(!again.is_accepted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_journaled_writes_all_replay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ops.jsonl");
    let log = std::sync::Arc::new(MemoryOperationLog::open_journal(&path).unwrap());

    let mut handles = Vec::new();
    for i in 0..32u64 {
        let log = std::sync::Arc::clone(&log);
        handles.push(tokio::spawn(async move {
            let op = verify_op(&format!("P{i}"));
            let key = op.key.clone();
            assert!(log.enqueue(op).await.unwrap().is_accepted());
            // A duplicate racing the journal write still sees one record.
            assert!(!log.enqueue(verify_op(&format!("P{i}"))).await.unwrap().is_accepted());
            log.mark_submitted(&key, "0xacct", i + 1, &format!("0x{i:x}"), OffsetDateTime::UNIX_EPOCH)
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let reopened = MemoryOperationLog::open_journal(&path).unwrap();
    let submitted = reopened.list(Some(OperationState::Submitted)).await.unwrap();
    assert_eq!(submitted.len(), 32);
    assert_eq!(reopened.list(None).await.unwrap().len(), 32);
}

#[tokio::test]
async fn journal_skips_torn_trailing_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ops.jsonl");
    {
        let log = MemoryOperationLog::open_journal(&path).unwrap();
        log.enqueue(verify_op("P1")).await.unwrap();
    }
    let mut contents = std::fs::read_to_string(&path).unwrap();
    contents.push_str("{\"key\":\"mark_verified:P2\",\"ki");
    std::fs::write(&path, contents).unwrap();

    let reopened = MemoryOperationLog::open_journal(&path).unwrap();
    assert_eq!(reopened.list(None).await.unwrap().len(), 1);
    assert_eq!(read_journal(&path).unwrap().len(), 1);
}

#[test]
fn read_journal_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(read_journal(&dir.path().join("missing.jsonl")).is_err());
}
