//! `agritrace ops` -- offline view of an operation journal.

use std::path::Path;

use agritrace_storage::{read_journal, LedgerOperation, OperationState, Outcome};

use crate::{report_error, OutputFormat};

pub fn cmd_ops(journal: &Path, state: Option<&str>, output: OutputFormat, quiet: bool) {
    let filter = match state.map(|s| (s, OperationState::parse(s))) {
        None => None,
        Some((_, Some(parsed))) => Some(parsed),
        Some((raw, None)) => {
            report_error(&format!("error: unknown state '{}'", raw), output, quiet);
            std::process::exit(1);
        }
    };

    let ops = match read_journal(journal) {
        Ok(ops) => ops,
        Err(e) => {
            report_error(&format!("error: {}", e), output, quiet);
            std::process::exit(1);
        }
    };
    let ops: Vec<LedgerOperation> = ops
        .into_iter()
        .filter(|op| filter.map_or(true, |s| op.state == s))
        .collect();

    match output {
        OutputFormat::Json => match serde_json::to_string_pretty(&ops) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                report_error(&format!("error: {}", e), output, quiet);
                std::process::exit(1);
            }
        },
        OutputFormat::Text => {
            if ops.is_empty() {
                if !quiet {
                    println!("no operations");
                }
                return;
            }
            println!(
                "{:<40} {:<10} {:>8} {:>8}  {}",
                "KEY", "STATE", "ATTEMPTS", "BLOCK", "DETAIL"
            );
            for op in &ops {
                println!(
                    "{:<40} {:<10} {:>8} {:>8}  {}",
                    op.key.as_str(),
                    op.state.as_str(),
                    op.attempts,
                    block_of(op).map_or("-".to_string(), |b| b.to_string()),
                    op.last_error.as_deref().or(op.tx_id.as_deref()).unwrap_or("")
                );
            }
        }
    }
}

fn block_of(op: &LedgerOperation) -> Option<u64> {
    match &op.outcome {
        Some(Outcome::Confirmed { block }) => Some(block.number),
        Some(Outcome::Failed {
            block: Some(block), ..
        }) => Some(block.number),
        _ => None,
    }
}
