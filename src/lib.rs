//! Cash Bundle Ledger Library
//! # Overview
//!
//! This library tracks money held on behalf of the participants of a
//! crowdfunding platform. Every unit of money lives in a cash bundle that
//! remembers the payin it came from, so a reverted payin can be traced to
//! whoever holds its money now.
//!
//! # Architecture
//!
//! - [`types`] - Money, currencies, ledger records, errors and events
//! - [`core`] - Ledger engine:
//!   - [`core::bundles`] - Cash bundle ledger (split, merge, lock, swap, withdraw)
//!   - [`core::exchanges`] - Payins and payouts
//!   - [`core::transfers`] - Transfers between holders
//!   - [`core::takes`] - Team income allocation
//!   - [`core::disputes`] - Chargeback recovery
//!   - [`core::debts`] - Debts left by chargebacks
//!   - [`core::audit`] - Ledger consistency checks
//! - [`io`] - Replay script parsing and wallet CSV output
//! - [`replay`] - Replays scripts through an in-memory ledger
//! - [`cli`] - CLI arguments parsing
//!
//! # Invariants
//!
//! - A wallet's balance equals the sum of the bundles it holds
//! - A bundle is either held by an owner or out in a payout, never both
//! - Take allocation hands out exactly the team's income, to the cent

pub mod cli;
pub mod core;
pub mod io;
pub mod replay;
pub mod types;

pub use core::{LedgerConfig, LedgerContext, MemoryStore};
pub use io::write_wallets_csv;
pub use replay::{ReplayError, Replayer};
pub use types::{
    CashBundle, Currency, Exchange, ExchangeStatus, HolderId, LedgerError, LedgerEvent, Money,
    Transfer, TransferStatus,
};
