use crate::core::LedgerConfig;
use clap::Parser;
use rust_decimal::Decimal;
use std::path::PathBuf;

/// Replay a ledger script and print the resulting wallets
#[derive(Parser, Debug)]
#[command(name = "ledger-replay")]
#[command(about = "Replay a cash bundle ledger script and print the resulting wallets", long_about = None)]
pub struct CliArgs {
    /// Input CSV file path containing script steps
    #[arg(value_name = "INPUT", help = "Path to the input CSV script")]
    pub input_file: PathBuf,

    /// Days money must stay in the ledger before it can be paid out
    #[arg(
        long = "quarantine-days",
        value_name = "DAYS",
        help = "Withdrawal quarantine in days for every network (default: 21, 63 for bank wires and direct debits)"
    )]
    pub quarantine_days: Option<i64>,

    /// Largest accepted fee / amount ratio for payins
    #[arg(
        long = "max-fee-ratio",
        value_name = "RATIO",
        help = "Largest accepted payin fee as a fraction of the amount (default: 0.10, range: (0, 1])"
    )]
    pub max_fee_ratio: Option<Decimal>,
}

impl CliArgs {
    /// Create a LedgerConfig from CLI arguments
    ///
    /// Values that aren't provided, or are out of range, fall back to the
    /// defaults. Out-of-range values are reported with a warning.
    pub fn to_ledger_config(&self) -> LedgerConfig {
        if self.quarantine_days.is_some() || self.max_fee_ratio.is_some() {
            LedgerConfig::new(self.quarantine_days, self.max_fee_ratio)
        } else {
            LedgerConfig::default()
        }
    }
}
