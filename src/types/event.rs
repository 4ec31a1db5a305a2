//! Domain events emitted by the engine
//!
//! Events are published after the store transaction that produced them has
//! committed. Delivery is fire-and-forget from the engine's point of view.

use super::money::Money;
use super::records::{BundleId, Debt, Exchange, ExchangeId, Transfer};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    ExchangeRecorded { exchange: Exchange },
    ExchangeFinalized { exchange: Exchange },
    TransferSucceeded { transfer: Transfer },
    TransferFailed { transfer: Transfer },
    DebtCreated { debt: Debt },
    DebtSettled { debt: Debt },
    FundsDisputed {
        exchange_id: ExchangeId,
        bundles: Vec<BundleId>,
    },
    FundsRecovered {
        exchange_id: ExchangeId,
        recovered: Money,
        repudiation_id: String,
    },
}

impl LedgerEvent {
    /// Short name used as a structured logging field
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::ExchangeRecorded { .. } => "exchange_recorded",
            LedgerEvent::ExchangeFinalized { .. } => "exchange_finalized",
            LedgerEvent::TransferSucceeded { .. } => "transfer_succeeded",
            LedgerEvent::TransferFailed { .. } => "transfer_failed",
            LedgerEvent::DebtCreated { .. } => "debt_created",
            LedgerEvent::DebtSettled { .. } => "debt_settled",
            LedgerEvent::FundsDisputed { .. } => "funds_disputed",
            LedgerEvent::FundsRecovered { .. } => "funds_recovered",
        }
    }
}
