//! Typed mapping between records and store rows
//!
//! Each record type names its table and key; serialization goes through serde
//! so the mapping is explicit and checked at compile time.

use crate::core::traits::{LedgerTx, Row, Table};
use crate::types::{CashBundle, Debt, Exchange, LedgerError, Transfer, Wallet};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A record stored in one of the ledger tables
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: Table;
    const KIND: &'static str;

    fn key(&self) -> u64;
}

impl Record for Wallet {
    const TABLE: Table = Table::Wallets;
    const KIND: &'static str = "wallet";

    fn key(&self) -> u64 {
        self.remote_id
    }
}

impl Record for Exchange {
    const TABLE: Table = Table::Exchanges;
    const KIND: &'static str = "exchange";

    fn key(&self) -> u64 {
        self.id
    }
}

impl Record for Transfer {
    const TABLE: Table = Table::Transfers;
    const KIND: &'static str = "transfer";

    fn key(&self) -> u64 {
        self.id
    }
}

impl Record for CashBundle {
    const TABLE: Table = Table::CashBundles;
    const KIND: &'static str = "cash bundle";

    fn key(&self) -> u64 {
        self.id
    }
}

impl Record for Debt {
    const TABLE: Table = Table::Debts;
    const KIND: &'static str = "debt";

    fn key(&self) -> u64 {
        self.id
    }
}

pub fn to_row<R: Record>(record: &R) -> Result<Row, LedgerError> {
    Ok(serde_json::to_value(record)?)
}

pub fn from_row<R: Record>(row: Row) -> Result<R, LedgerError> {
    Ok(serde_json::from_value(row)?)
}

pub fn fetch<R: Record>(tx: &dyn LedgerTx, id: u64) -> Result<Option<R>, LedgerError> {
    tx.get(R::TABLE, id)?.map(from_row).transpose()
}

/// Fetch a row that must exist
pub fn fetch_required<R: Record>(tx: &dyn LedgerTx, id: u64) -> Result<R, LedgerError> {
    fetch(tx, id)?.ok_or_else(|| LedgerError::not_found(R::KIND, id))
}

pub fn fetch_all<R: Record>(tx: &dyn LedgerTx) -> Result<Vec<R>, LedgerError> {
    tx.scan(R::TABLE)?
        .into_iter()
        .map(|(_, row)| from_row(row))
        .collect()
}

pub fn insert<R: Record>(tx: &mut dyn LedgerTx, record: &R) -> Result<(), LedgerError> {
    tx.insert(R::TABLE, record.key(), to_row(record)?)
}

/// Optimistic update: write `after` only if the stored row still equals `before`
pub fn update<R: Record>(tx: &mut dyn LedgerTx, before: &R, after: &R) -> Result<bool, LedgerError> {
    tx.compare_and_swap(R::TABLE, before.key(), &to_row(before)?, to_row(after)?)
}

/// Overwrite the stored version of `record`
pub fn save<R: Record>(tx: &mut dyn LedgerTx, record: &R) -> Result<(), LedgerError> {
    let current = tx
        .get(R::TABLE, record.key())?
        .ok_or_else(|| LedgerError::not_found(R::KIND, record.key()))?;
    if tx.compare_and_swap(R::TABLE, record.key(), &current, to_row(record)?)? {
        Ok(())
    } else {
        Err(LedgerError::storage(format!(
            "concurrent update of {} {}",
            R::KIND,
            record.key()
        )))
    }
}

pub fn remove<R: Record>(tx: &mut dyn LedgerTx, id: u64) -> Result<(), LedgerError> {
    tx.delete(R::TABLE, id)
}
