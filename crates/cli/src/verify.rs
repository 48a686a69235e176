//! `agritrace verify` -- direct on-chain verification lookup.

use agritrace_engine::{connect, EngineConfig};
use agritrace_ledger::{LedgerGateway, LedgerRead};

use crate::{report_error, OutputFormat};

/// Query the ledger for `code`. Exit codes: 0 verified, 2 not verified or
/// not on the ledger, 1 the ledger could not be asked.
pub async fn cmd_verify(config: &EngineConfig, code: &str, output: OutputFormat, quiet: bool) {
    let gateway = match connect(config) {
        Ok(g) => g,
        Err(e) => {
            report_error(&format!("error: {}", e), output, quiet);
            std::process::exit(1);
        }
    };

    let (status, verified, reason) = match gateway.is_verified(code).await {
        LedgerRead::Found(true) => ("verified", Some(true), None),
        LedgerRead::Found(false) => ("not_verified", Some(false), None),
        LedgerRead::NotFound => ("not_on_ledger", None, None),
        LedgerRead::Unknown(reason) => ("unknown", None, Some(reason)),
    };

    if !quiet {
        match output {
            OutputFormat::Text => match &reason {
                Some(r) => eprintln!("{}: ledger unreachable ({})", code, r),
                None => println!("{}: {}", code, status.replace('_', " ")),
            },
            OutputFormat::Json => println!(
                "{}",
                serde_json::json!({
                    "code": code,
                    "status": status,
                    "verified": verified,
                    "reason": reason,
                })
            ),
        }
    }

    let exit = match (verified, &reason) {
        (Some(true), _) => 0,
        (_, Some(_)) => 1,
        _ => 2,
    };
    if exit != 0 {
        std::process::exit(exit);
    }
}
