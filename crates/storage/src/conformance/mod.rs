//! Conformance test suite for `OperationLog` implementations.
//!
//! This module provides a backend-agnostic test suite that any `OperationLog`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Enqueue**: acceptance, the duplicate-submission guard, revival
//! - **Transitions**: every legal lifecycle edge, rejection of illegal ones
//! - **Queries**: state filters, retryable/abandoned listings, subject listings
//! - **Concurrency**: racing enqueues on one key, independent keys in parallel
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty log for each test:
//!
//! ```ignore
//! use agritrace_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn memory_conformance() {
//!     let report = run_conformance_suite(|| async { MemoryOperationLog::new() }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod concurrent;
mod enqueue;
mod query;
mod transition;

use std::fmt;
use std::future::Future;

use time::{Duration, OffsetDateTime};

use crate::payload::{
    ActorType, BatchRegistration, OperationPayload, StepAction, StepRecord, VerificationRequest,
};
use crate::record::{BlockRef, LedgerOperation};
use crate::OperationLog;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "enqueue", "transition").
    pub category: String,
    /// Test name (e.g. "duplicate_key_returns_already_pending").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against an operation log backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// log instance, ensuring test isolation.
pub async fn run_conformance_suite<L, F, Fut>(factory: F) -> ConformanceReport
where
    L: OperationLog,
    F: Fn() -> Fut,
    Fut: Future<Output = L>,
{
    let mut results = Vec::new();

    results.extend(enqueue::run_enqueue_tests(&factory).await);
    results.extend(transition::run_transition_tests(&factory).await);
    results.extend(query::run_query_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

fn t0() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::days(20_000)
}

fn at(secs: i64) -> OffsetDateTime {
    t0() + Duration::seconds(secs)
}

fn make_step_op(code: &str, step_number: u32, created: OffsetDateTime) -> LedgerOperation {
    LedgerOperation::new(
        OperationPayload::AppendStep(StepRecord {
            subject_code: code.to_string(),
            step_number,
            action: StepAction::Transported,
            actor: "trader-7".to_string(),
            actor_type: ActorType::Trader,
            description: "truck to Kigali market".to_string(),
            location: Some("Musanze".to_string()),
            temperature: None,
            humidity: None,
        }),
        created,
    )
}

fn make_batch_op(code: &str, created: OffsetDateTime) -> LedgerOperation {
    LedgerOperation::new(
        OperationPayload::RegisterBatch(BatchRegistration {
            batch_number: code.to_string(),
            seed_variety: "RWV 1129".to_string(),
            planting_date: 1_700_000_000,
            total_quantity: rust_decimal::Decimal::new(2500, 1),
        }),
        created,
    )
}

fn make_verify_op(code: &str, created: OffsetDateTime) -> LedgerOperation {
    LedgerOperation::new(
        OperationPayload::MarkVerified(VerificationRequest {
            qr_code: code.to_string(),
        }),
        created,
    )
}

fn block(number: u64) -> BlockRef {
    BlockRef {
        number,
        hash: format!("0x{:064x}", number),
    }
}
