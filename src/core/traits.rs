//! Core traits: the storage contract and the external collaborators
//!
//! The engine never talks to a database, a payment processor or a notifier
//! directly. It is written against these seams so that an in-memory store and
//! fake collaborators can stand in for the real ones in tests.

use crate::types::{
    HolderId, LedgerError, LedgerEvent, Participant, Transfer, TransferStatus, WalletId,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Logical tables of the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Wallets,
    Exchanges,
    Transfers,
    CashBundles,
    Debts,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Wallets => "wallets",
            Table::Exchanges => "exchanges",
            Table::Transfers => "transfers",
            Table::CashBundles => "cash_bundles",
            Table::Debts => "debts",
        }
    }
}

/// Storage representation of a row
pub type Row = serde_json::Value;

/// Operations available inside one store transaction
///
/// Every write made through a `LedgerTx` becomes visible atomically when the
/// transaction commits, or not at all.
pub trait LedgerTx {
    /// Take an exclusive lock on a whole table until the transaction ends
    ///
    /// Writes to `cash_bundles` are refused unless this lock is held.
    fn lock_exclusive(&mut self, table: Table) -> Result<(), LedgerError>;

    fn holds_lock(&self, table: Table) -> bool;

    /// Allocate the next key of a table
    fn next_id(&mut self, table: Table) -> u64;

    fn get(&self, table: Table, id: u64) -> Result<Option<Row>, LedgerError>;

    /// All rows of a table, ordered by key
    fn scan(&self, table: Table) -> Result<Vec<(u64, Row)>, LedgerError>;

    /// Insert a new row; fails if the key is taken
    fn insert(&mut self, table: Table, id: u64, row: Row) -> Result<(), LedgerError>;

    /// Replace a row only if it still equals `expected`
    ///
    /// Returns `Ok(false)` when the stored row differs.
    fn compare_and_swap(
        &mut self,
        table: Table,
        id: u64,
        expected: &Row,
        new: Row,
    ) -> Result<bool, LedgerError>;

    fn delete(&mut self, table: Table, id: u64) -> Result<(), LedgerError>;

    /// Add `delta` to a wallet's balance only if the result stays `>= 0`
    ///
    /// Returns the new balance, or `None` when the guard refused the update.
    fn add_to_balance(
        &mut self,
        wallet: WalletId,
        delta: Decimal,
    ) -> Result<Option<Decimal>, LedgerError>;
}

/// Transactional storage backing the ledger
pub trait LedgerStore: Send + Sync {
    /// Run `f` as a single all-or-nothing transaction
    ///
    /// Any `Err` returned by `f` discards every write it made.
    fn transaction<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, LedgerError>;
}

/// Resolves holders to the attributes the core needs
pub trait ParticipantRegistry: Send + Sync {
    fn participant(&self, id: HolderId) -> Result<Participant, LedgerError>;

    /// Tell a holder its cached giving/receiving totals are stale
    fn refresh_totals(&self, id: HolderId);
}

/// Receives domain events once they are committed
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LedgerEvent);
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Answer of the payment processor for a transfer
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorOutcome {
    pub remote_id: String,
    pub status: TransferStatus,
    pub error: Option<String>,
}

/// Performs the external side of a prepared transfer
///
/// Connectivity failures are returned as `LedgerError::Processor`; the engine
/// then leaves the transfer in its `pre` status.
pub trait PaymentProcessor: Send + Sync {
    fn execute_transfer(&self, transfer: &Transfer) -> Result<ProcessorOutcome, LedgerError>;
}
