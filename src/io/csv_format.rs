//! CSV format handling for replay scripts and wallet output
//!
//! This module centralizes all CSV format concerns, providing:
//! - CsvRecord structure for deserialization
//! - Conversion from CSV records to script steps
//! - Wallet output serialization
//!
//! All functions are pure (no I/O) for easy testing.

use crate::types::{Currency, HolderId, Money, ScriptOp, ScriptStep};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Write;
use std::str::FromStr;

/// CSV record structure for deserialization
///
/// Matches the script format with columns:
/// op, holder, counterparty, currency, amount, fee, reference.
/// Every column but `op` and `holder` is optional; which ones are required
/// depends on the operation.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CsvRecord {
    pub op: String,
    pub holder: HolderId,
    pub counterparty: Option<HolderId>,
    pub currency: Option<String>,
    pub amount: Option<String>,
    pub fee: Option<String>,
    pub reference: Option<String>,
}

/// One line of wallet output
#[derive(Debug, Clone, PartialEq)]
pub struct WalletSummary {
    pub holder: HolderId,
    pub balance: Money,
    /// Number of cash bundles held in the wallet
    pub bundles: usize,
}

fn non_empty(field: Option<String>) -> Option<String> {
    field
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_money(
    field: Option<String>,
    currency: Option<Currency>,
    name: &str,
    op: ScriptOp,
) -> Result<Option<Money>, String> {
    let Some(raw) = non_empty(field) else {
        return Ok(None);
    };
    let currency = currency.ok_or_else(|| format!("{} with an {} requires a currency", op, name))?;
    let amount = Decimal::from_str(&raw).map_err(|_| format!("Invalid {} '{}' for {}", name, raw, op))?;
    if amount < Decimal::ZERO {
        return Err(format!("Negative {} '{}' for {}", name, raw, op));
    }
    Ok(Some(Money::new(amount, currency)))
}

/// Convert a CsvRecord to a ScriptStep
///
/// This function:
/// - Parses the operation name
/// - Parses the currency and the amounts
/// - Validates that each operation has the columns it needs
///
/// # Arguments
///
/// * `csv_record` - The deserialized CSV record
///
/// # Returns
///
/// Result containing either:
/// - Ok(ScriptStep) - Successfully converted record
/// - Err(String) - Error message describing the conversion failure
pub fn convert_csv_record(csv_record: CsvRecord) -> Result<ScriptStep, String> {
    let op = match csv_record.op.trim().to_lowercase().as_str() {
        "payin" => ScriptOp::Payin,
        "payin_failed" => ScriptOp::PayinFailed,
        "payout" => ScriptOp::Payout,
        "payout_succeeded" => ScriptOp::PayoutSucceeded,
        "payout_failed" => ScriptOp::PayoutFailed,
        "transfer" => ScriptOp::Transfer,
        "dispute" => ScriptOp::Dispute,
        _ => {
            return Err(format!(
                "Invalid operation: '{}' for holder {}",
                csv_record.op, csv_record.holder
            ))
        }
    };

    let currency = non_empty(csv_record.currency)
        .map(|code| Currency::from_str(&code).map_err(|e| e.to_string()))
        .transpose()?;
    let amount = parse_money(csv_record.amount, currency, "amount", op)?;
    let fee = parse_money(csv_record.fee, currency, "fee", op)?;
    let reference = non_empty(csv_record.reference);

    let needs_amount = matches!(
        op,
        ScriptOp::Payin | ScriptOp::PayinFailed | ScriptOp::Payout | ScriptOp::Transfer
    );
    if needs_amount && !amount.is_some_and(|a| a.is_positive()) {
        return Err(format!(
            "{} for holder {} requires a positive amount",
            op, csv_record.holder
        ));
    }

    let needs_reference = matches!(
        op,
        ScriptOp::Payout | ScriptOp::PayoutSucceeded | ScriptOp::PayoutFailed | ScriptOp::Dispute
    );
    if needs_reference && reference.is_none() {
        return Err(format!(
            "{} for holder {} requires a reference",
            op, csv_record.holder
        ));
    }

    if op == ScriptOp::Transfer && csv_record.counterparty.is_none() {
        return Err(format!(
            "transfer from holder {} requires a counterparty",
            csv_record.holder
        ));
    }

    Ok(ScriptStep {
        op,
        holder: csv_record.holder,
        counterparty: csv_record.counterparty,
        amount,
        fee,
        reference,
    })
}

/// Write wallet states to CSV format
///
/// Writes wallets in CSV format with columns: holder, currency, balance, bundles.
/// Wallets are sorted by holder then currency for deterministic output, and
/// balances are printed with the currency's number of decimals.
///
/// # Arguments
///
/// * `wallets` - Slice of wallet summaries to write
/// * `output` - Mutable reference to a writer for outputting CSV
///
/// # Returns
///
/// * `Ok(())` if writing succeeded
/// * `Err(String)` if a write error occurred
pub fn write_wallets_csv(wallets: &[WalletSummary], output: &mut dyn Write) -> Result<(), String> {
    use csv::Writer;

    let mut writer = Writer::from_writer(output);

    writer
        .write_record(["holder", "currency", "balance", "bundles"])
        .map_err(|e| format!("Failed to write CSV header: {}", e))?;

    let mut sorted = wallets.to_vec();
    sorted.sort_by_key(|w| (w.holder, w.balance.currency));

    for wallet in sorted {
        let currency = wallet.balance.currency;
        writer
            .write_record(&[
                wallet.holder.to_string(),
                currency.code().to_string(),
                format!("{:.*}", currency.minor_units() as usize, wallet.balance.amount),
                wallet.bundles.to_string(),
            ])
            .map_err(|e| format!("Failed to write wallet record: {}", e))?;
    }

    writer
        .flush()
        .map_err(|e| format!("Failed to flush output: {}", e))?;

    Ok(())
}
