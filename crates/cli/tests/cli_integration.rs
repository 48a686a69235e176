//! CLI integration tests for the offline subcommands.
//!
//! Uses `assert_cmd` to spawn the `agritrace` binary and verify
//! exit codes, stdout content, and stderr content.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use agritrace_ledger::AccountSigner;
use agritrace_storage::{LedgerOperation, OperationPayload, OperationState, VerificationRequest};

/// Helper: the `agritrace` binary, run inside `dir` with no config
/// overrides leaking in from the environment.
fn agritrace(dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("agritrace");
    cmd.current_dir(dir);
    for var in [
        "AGRITRACE_LEDGER_URL",
        "AGRITRACE_SIGNING_KEY",
        "AGRITRACE_JOURNAL",
        "AGRITRACE_API_KEY",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn verification(code: &str) -> LedgerOperation {
    LedgerOperation::new(
        OperationPayload::MarkVerified(VerificationRequest {
            qr_code: code.to_string(),
        }),
        time::OffsetDateTime::now_utc(),
    )
}

/// Write a journal the way the engine does: one full record per line,
/// later lines replacing earlier ones for the same key.
fn write_journal(path: &Path, ops: &[LedgerOperation]) {
    let mut text = String::new();
    for op in ops {
        text.push_str(&serde_json::to_string(op).unwrap());
        text.push('\n');
    }
    fs::write(path, text).unwrap();
}

// ──────────────────────────────────────────────
// 1. Help and version
// ──────────────────────────────────────────────

#[test]
fn help_exits_0_with_description() {
    let tmp = TempDir::new().unwrap();
    agritrace(tmp.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Agritrace provenance ledger synchronization engine",
        ));
}

#[test]
fn version_exits_0() {
    let tmp = TempDir::new().unwrap();
    agritrace(tmp.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("agritrace"));
}

#[test]
fn unknown_subcommand_fails() {
    let tmp = TempDir::new().unwrap();
    agritrace(tmp.path()).arg("frobnicate").assert().failure();
}

// ──────────────────────────────────────────────
// 2. Keygen
// ──────────────────────────────────────────────

#[test]
fn keygen_writes_a_loadable_account() {
    let tmp = TempDir::new().unwrap();
    agritrace(tmp.path())
        .args(["keygen", "--prefix", "acct"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Generated ledger account"));

    let signer = AccountSigner::from_file(&tmp.path().join("acct.secret")).unwrap();
    assert!(tmp.path().join("acct.pub").exists());
    assert!(!signer.address().is_empty());
}

#[test]
fn keygen_json_reports_the_address() {
    let tmp = TempDir::new().unwrap();
    let out = agritrace(tmp.path())
        .args(["--output", "json", "keygen", "--prefix", "acct"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: serde_json::Value = serde_json::from_slice(&out).unwrap();

    let signer = AccountSigner::from_file(&tmp.path().join("acct.secret")).unwrap();
    assert_eq!(report["address"], signer.address());
}

#[test]
fn keygen_rejects_other_algorithms() {
    let tmp = TempDir::new().unwrap();
    agritrace(tmp.path())
        .args(["keygen", "--algorithm", "secp256k1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported algorithm"));
    assert!(!tmp.path().join("agritrace-ledger.secret").exists());
}

// ──────────────────────────────────────────────
// 3. Ops
// ──────────────────────────────────────────────

#[test]
fn ops_lists_the_latest_record_per_key() {
    let tmp = TempDir::new().unwrap();
    let journal = tmp.path().join("ops.jsonl");
    let first = verification("P1");
    let mut abandoned = first.clone();
    abandoned.attempts = 5;
    abandoned.last_error = Some("ledger unreachable".to_string());
    abandoned.transition(
        OperationState::Abandoned,
        time::OffsetDateTime::now_utc(),
        None,
    );
    write_journal(&journal, &[first, abandoned, verification("P2")]);

    agritrace(tmp.path())
        .args(["ops", "--journal", "ops.jsonl"])
        .assert()
        .success()
        .stdout(predicate::str::contains("mark_verified:P1"))
        .stdout(predicate::str::contains("abandoned"))
        .stdout(predicate::str::contains("ledger unreachable"))
        .stdout(predicate::str::contains("mark_verified:P2"));
}

#[test]
fn ops_filters_by_state() {
    let tmp = TempDir::new().unwrap();
    let journal = tmp.path().join("ops.jsonl");
    let mut abandoned = verification("P1");
    abandoned.transition(
        OperationState::Abandoned,
        time::OffsetDateTime::now_utc(),
        None,
    );
    write_journal(&journal, &[abandoned, verification("P2")]);

    let out = agritrace(tmp.path())
        .args([
            "--output", "json", "ops", "--journal", "ops.jsonl", "--state", "abandoned",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let ops: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let ops = ops.as_array().unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0]["key"], "mark_verified:P1");
    assert_eq!(ops[0]["state"], "abandoned");
}

#[test]
fn ops_reads_the_journal_named_in_config() {
    let tmp = TempDir::new().unwrap();
    write_journal(&tmp.path().join("ops.jsonl"), &[verification("P9")]);
    fs::write(
        tmp.path().join("agritrace.toml"),
        "[storage]\njournal_path = \"ops.jsonl\"\n",
    )
    .unwrap();

    agritrace(tmp.path())
        .arg("ops")
        .assert()
        .success()
        .stdout(predicate::str::contains("mark_verified:P9"));
}

#[test]
fn ops_without_a_journal_fails() {
    let tmp = TempDir::new().unwrap();
    agritrace(tmp.path())
        .arg("ops")
        .assert()
        .failure()
        .stderr(predicate::str::contains("storage.journal_path is not configured"));
}

#[test]
fn ops_on_missing_journal_fails() {
    let tmp = TempDir::new().unwrap();
    agritrace(tmp.path())
        .args(["ops", "--journal", "nope.jsonl"])
        .assert()
        .failure();
}

#[test]
fn ops_rejects_unknown_state() {
    let tmp = TempDir::new().unwrap();
    write_journal(&tmp.path().join("ops.jsonl"), &[verification("P1")]);
    agritrace(tmp.path())
        .args(["ops", "--journal", "ops.jsonl", "--state", "lost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown state 'lost'"));
}

// ──────────────────────────────────────────────
// 4. Config
// ──────────────────────────────────────────────

#[test]
fn invalid_config_is_reported() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("agritrace.toml"),
        "[retry]\nmax_attempts = 0\n",
    )
    .unwrap();
    agritrace(tmp.path())
        .args(["verify", "P1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("retry.max_attempts must be at least 1"));
}
