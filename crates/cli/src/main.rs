mod keygen;
mod ops;
mod serve;
mod verify;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use agritrace_engine::EngineConfig;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Agritrace provenance ledger synchronization.
#[derive(Parser)]
#[command(
    name = "agritrace",
    version,
    about = "Agritrace provenance ledger synchronization engine"
)]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    /// Engine configuration file; a missing file means defaults
    #[arg(long, global = true, default_value = "agritrace.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API with the synchronization engine running behind it
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,
        /// Run against an in-process simulated ledger
        #[arg(long)]
        simulate: bool,
    },

    /// Generate a signing key for the ledger account
    Keygen {
        /// Signature algorithm (only ed25519)
        #[arg(long, default_value = "ed25519")]
        algorithm: String,
        /// Output prefix: writes <prefix>.secret and <prefix>.pub
        #[arg(long, default_value = "agritrace-ledger")]
        prefix: String,
    },

    /// List ledger operations recorded in an operation journal
    Ops {
        /// Journal file (defaults to storage.journal_path from the config)
        #[arg(long)]
        journal: Option<PathBuf>,
        /// Only operations in this state (pending, submitted, confirmed, failed, unknown, abandoned)
        #[arg(long)]
        state: Option<String>,
    },

    /// Ask the ledger directly whether a product is verified
    Verify {
        /// Product QR code
        code: String,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Serve { port, simulate } => {
            let config = load_config(&cli.config, cli.output, cli.quiet);
            let rt = runtime(cli.output, cli.quiet);
            if let Err(e) = rt.block_on(serve::start_server(port, config, simulate)) {
                report_error(&format!("server error: {}", e), cli.output, cli.quiet);
                process::exit(1);
            }
        }
        Commands::Keygen { algorithm, prefix } => {
            keygen::cmd_keygen(&algorithm, &prefix, cli.output, cli.quiet);
        }
        Commands::Ops { journal, state } => {
            let path = match journal {
                Some(p) => p,
                None => {
                    let config = load_config(&cli.config, cli.output, cli.quiet);
                    match config.storage.journal_path {
                        Some(p) => p,
                        None => {
                            report_error(
                                "error: no journal given and storage.journal_path is not configured",
                                cli.output,
                                cli.quiet,
                            );
                            process::exit(1);
                        }
                    }
                }
            };
            ops::cmd_ops(&path, state.as_deref(), cli.output, cli.quiet);
        }
        Commands::Verify { code } => {
            let config = load_config(&cli.config, cli.output, cli.quiet);
            let rt = runtime(cli.output, cli.quiet);
            rt.block_on(verify::cmd_verify(&config, &code, cli.output, cli.quiet));
        }
    }
}

/// Log to stderr, filtered by `AGRITRACE_LOG` (default `info`).
fn init_tracing() {
    let filter = EnvFilter::try_from_env("AGRITRACE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn runtime(output: OutputFormat, quiet: bool) -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            report_error(&format!("error: failed to start runtime: {}", e), output, quiet);
            process::exit(1);
        }
    }
}

/// Read the config file, apply `AGRITRACE_*` overrides, validate.
fn load_config(path: &Path, output: OutputFormat, quiet: bool) -> EngineConfig {
    let loaded = EngineConfig::load(path).and_then(|mut config| {
        config.apply_process_env();
        config.validate()?;
        Ok(config)
    });
    match loaded {
        Ok(config) => config,
        Err(e) => {
            report_error(&format!("error: {}", e), output, quiet);
            process::exit(1);
        }
    }
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}
