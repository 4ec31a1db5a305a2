//! Cash bundle ledger replay CLI
//!
//! Replays a ledger script from a CSV file and prints the resulting wallets.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- script.csv > wallets.csv
//! cargo run -- --quarantine-days 0 script.csv > wallets.csv
//! RUST_LOG=debug cargo run -- --max-fee-ratio 0.05 script.csv > wallets.csv
//! ```
//!
//! Logs go to stderr, so stdout only carries the wallet CSV.
//!
//! # Exit Codes
//!
//! - 0: Success
//! - 1: Error (missing arguments, file not found, file not readable, etc.)

use cash_bundle_ledger::cli;
use cash_bundle_ledger::replay::Replayer;
use std::process;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = cli::parse_args();
    let mut replayer = Replayer::new(args.to_ledger_config());

    let mut output = std::io::stdout();
    if let Err(e) = replayer.process(&args.input_file, &mut output) {
        tracing::error!(error = %e, "replay failed");
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
