//! The running engine: background dispatch and polling, journal restarts.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use agritrace_engine::{Disposition, Engine, EngineBuilder, EngineConfig, NewStep};
use agritrace_ledger::SimulatedLedger;
use agritrace_storage::{
    ActorType, BatchRegistration, IdempotencyKey, LedgerOperation, MemoryOperationLog,
    OperationLog, OperationState, StepAction,
};
use rust_decimal::Decimal;

fn fast_config(journal: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.poller.interval_ms = 20;
    config.timeouts.confirmation_grace_ms = 0;
    config.storage.journal_path = Some(journal.to_path_buf());
    config
}

fn batch(code: &str) -> BatchRegistration {
    BatchRegistration {
        batch_number: code.to_string(),
        seed_variety: "NUA45".to_string(),
        planting_date: 1_699_000_000,
        total_quantity: Decimal::new(800, 0),
    }
}

async fn start(journal: &Path) -> (Engine, Arc<SimulatedLedger>) {
    let ledger = Arc::new(SimulatedLedger::with_random_account());
    let engine = EngineBuilder::new(fast_config(journal))
        .gateway(ledger.clone())
        .start()
        .await
        .unwrap();
    (engine, ledger)
}

async fn wait_for(engine: &Engine, key: &IdempotencyKey, state: OperationState) -> LedgerOperation {
    for _ in 0..300 {
        let op = engine.facade().operation(key).await.unwrap();
        if op.state == state {
            return op;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never reached {}", key, state);
}

#[tokio::test]
async fn background_tasks_confirm_without_explicit_polling() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, ledger) = start(&dir.path().join("ops.jsonl")).await;

    let registration = engine.facade().register_batch(batch("B1")).await.unwrap();
    let (_, step) = engine
        .facade()
        .append_step(NewStep {
            subject_code: "B1".to_string(),
            action: StepAction::Harvested,
            actor: "farmer-1".to_string(),
            actor_type: ActorType::Farmer,
            description: "first harvest".to_string(),
            location: None,
            temperature: Some(Decimal::new(245, 1)),
            humidity: None,
        })
        .await
        .unwrap();

    wait_for(&engine, &registration.key, OperationState::Confirmed).await;
    let op = wait_for(&engine, &step.key, OperationState::Confirmed).await;
    assert_eq!(op.attempts, 1);
    assert_eq!(ledger.effects_for(step.key.as_str()), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn journal_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("ops.jsonl");

    let key = {
        let (engine, _ledger) = start(&journal).await;
        let submission = engine.facade().register_batch(batch("B7")).await.unwrap();
        wait_for(&engine, &submission.key, OperationState::Confirmed).await;
        engine.shutdown().await;
        submission.key
    };

    let replayed = MemoryOperationLog::open_journal(&journal).unwrap();
    assert_eq!(
        replayed.get(&key).await.unwrap().state,
        OperationState::Confirmed
    );
    drop(replayed);

    let (engine, ledger) = start(&journal).await;
    let again = engine.facade().register_batch(batch("B7")).await.unwrap();
    assert_eq!(again.disposition, Disposition::AlreadyConfirmed);
    assert_eq!(ledger.total_sends(), 0);
    engine.shutdown().await;
}
