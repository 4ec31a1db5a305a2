//! Types module
//!
//! Contains core data structures used throughout the engine.
//! This module organizes types into logical submodules:
//! - `money`: Money, currencies, baskets and exchange rates
//! - `records`: Row records and identifiers of the ledger tables
//! - `event`: Domain events published by the engine
//! - `script`: Replay script steps
//! - `error`: Error types for the ledger engine

pub mod error;
pub mod event;
pub mod money;
pub mod records;
pub mod script;

pub use error::{ErrorClass, LedgerError};
pub use event::LedgerEvent;
pub use money::{Currency, ExchangeRates, Money, MoneyBasket};
pub use records::{
    BundleId, CashBundle, Debt, DebtId, DebtStatus, Exchange, ExchangeId, ExchangeStatus,
    HolderId, HolderKind, Network, Participant, Route, RouteId, Take, Tip, Transfer,
    TransferContext, TransferId, TransferStatus, Wallet, WalletId,
};
pub use script::{ScriptOp, ScriptStep};
