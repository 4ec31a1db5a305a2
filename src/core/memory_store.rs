//! In-memory implementation of the storage contract
//!
//! `MemoryStore` keeps every table in ordered maps behind one mutex. The mutex
//! is held for the whole duration of a transaction, so transactions are fully
//! serialized: this is the coarse, table-wide locking of the reference design.
//! A transaction works on a copy of the tables that replaces the shared state
//! only when the closure returns `Ok`.

use crate::core::traits::{LedgerStore, LedgerTx, Row, Table};
use crate::types::{LedgerError, Wallet, WalletId};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: BTreeMap<Table, BTreeMap<u64, Row>>,
    sequences: BTreeMap<Table, u64>,
}

/// Thread-safe in-memory ledger store
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryStore {
    fn transaction<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, LedgerError>,
    {
        // A panic inside a transaction never reaches the shared tables (only the
        // working copy is written), so a poisoned lock still guards consistent data.
        let mut guard = self
            .tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut tx = MemoryTx {
            working: guard.clone(),
            locks: BTreeSet::new(),
        };
        let output = f(&mut tx)?;
        *guard = tx.working;
        Ok(output)
    }
}

struct MemoryTx {
    working: Tables,
    locks: BTreeSet<Table>,
}

impl MemoryTx {
    fn table(&self, table: Table) -> Option<&BTreeMap<u64, Row>> {
        self.working.rows.get(&table)
    }

    fn table_mut(&mut self, table: Table) -> &mut BTreeMap<u64, Row> {
        self.working.rows.entry(table).or_default()
    }

    fn ensure_writable(&self, table: Table) -> Result<(), LedgerError> {
        if table == Table::CashBundles && !self.locks.contains(&table) {
            return Err(LedgerError::invariant(
                "cash_bundles written without holding its exclusive lock",
            ));
        }
        Ok(())
    }
}

impl LedgerTx for MemoryTx {
    fn lock_exclusive(&mut self, table: Table) -> Result<(), LedgerError> {
        self.locks.insert(table);
        Ok(())
    }

    fn holds_lock(&self, table: Table) -> bool {
        self.locks.contains(&table)
    }

    fn next_id(&mut self, table: Table) -> u64 {
        let sequence = self.working.sequences.entry(table).or_insert(0);
        *sequence += 1;
        *sequence
    }

    fn get(&self, table: Table, id: u64) -> Result<Option<Row>, LedgerError> {
        Ok(self.table(table).and_then(|rows| rows.get(&id)).cloned())
    }

    fn scan(&self, table: Table) -> Result<Vec<(u64, Row)>, LedgerError> {
        Ok(self
            .table(table)
            .map(|rows| rows.iter().map(|(id, row)| (*id, row.clone())).collect())
            .unwrap_or_default())
    }

    fn insert(&mut self, table: Table, id: u64, row: Row) -> Result<(), LedgerError> {
        self.ensure_writable(table)?;
        let rows = self.table_mut(table);
        if rows.contains_key(&id) {
            return Err(LedgerError::storage(format!(
                "duplicate key {} in {}",
                id,
                table.name()
            )));
        }
        rows.insert(id, row);
        Ok(())
    }

    fn compare_and_swap(
        &mut self,
        table: Table,
        id: u64,
        expected: &Row,
        new: Row,
    ) -> Result<bool, LedgerError> {
        self.ensure_writable(table)?;
        match self.table_mut(table).get_mut(&id) {
            Some(current) if current == expected => {
                *current = new;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(LedgerError::not_found(table.name(), id)),
        }
    }

    fn delete(&mut self, table: Table, id: u64) -> Result<(), LedgerError> {
        self.ensure_writable(table)?;
        self.table_mut(table)
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| LedgerError::not_found(table.name(), id))
    }

    fn add_to_balance(
        &mut self,
        wallet: WalletId,
        delta: Decimal,
    ) -> Result<Option<Decimal>, LedgerError> {
        let row = self
            .table(Table::Wallets)
            .and_then(|rows| rows.get(&wallet))
            .cloned()
            .ok_or_else(|| LedgerError::not_found("wallet", wallet))?;

        let mut record: Wallet = serde_json::from_value(row)?;
        let new_balance = record
            .balance
            .amount
            .checked_add(delta)
            .ok_or_else(|| LedgerError::arithmetic_overflow("wallet balance"))?;
        if new_balance < Decimal::ZERO {
            return Ok(None);
        }

        record.balance.amount = new_balance;
        let row = serde_json::to_value(&record)?;
        self.table_mut(Table::Wallets).insert(wallet, row);
        Ok(Some(new_balance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Currency, Money};
    use serde_json::json;

    fn wallet_row(id: WalletId, cents: i64) -> Row {
        serde_json::to_value(Wallet {
            remote_id: id,
            balance: Money::new(Decimal::new(cents, 2), Currency::Eur),
            owner: 1,
            is_current: true,
        })
        .unwrap()
    }

    #[test]
    fn test_committed_transaction_is_visible() {
        let store = MemoryStore::new();
        store
            .transaction(|tx| tx.insert(Table::Debts, 1, json!({"a": 1})))
            .unwrap();

        let row = store.transaction(|tx| tx.get(Table::Debts, 1)).unwrap();
        assert_eq!(row, Some(json!({"a": 1})));
    }

    #[test]
    fn test_failed_transaction_rolls_back_every_write() {
        let store = MemoryStore::new();
        let result: Result<(), LedgerError> = store.transaction(|tx| {
            tx.insert(Table::Debts, 1, json!({"a": 1}))?;
            tx.insert(Table::Debts, 2, json!({"a": 2}))?;
            Err(LedgerError::invariant("abort"))
        });
        assert!(result.is_err());

        let rows = store.transaction(|tx| tx.scan(Table::Debts)).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_bundle_writes_require_the_table_lock() {
        let store = MemoryStore::new();
        let result = store.transaction(|tx| tx.insert(Table::CashBundles, 1, json!({})));
        assert!(matches!(
            result,
            Err(LedgerError::InvariantViolation { .. })
        ));

        store
            .transaction(|tx| {
                tx.lock_exclusive(Table::CashBundles)?;
                tx.insert(Table::CashBundles, 1, json!({}))
            })
            .unwrap();
    }

    #[test]
    fn test_compare_and_swap_detects_stale_rows() {
        let store = MemoryStore::new();
        store
            .transaction(|tx| {
                tx.insert(Table::Debts, 1, json!({"v": 1}))?;
                assert!(tx.compare_and_swap(Table::Debts, 1, &json!({"v": 1}), json!({"v": 2}))?);
                assert!(!tx.compare_and_swap(Table::Debts, 1, &json!({"v": 1}), json!({"v": 3}))?);
                Ok(())
            })
            .unwrap();

        let row = store.transaction(|tx| tx.get(Table::Debts, 1)).unwrap();
        assert_eq!(row, Some(json!({"v": 2})));
    }

    #[test]
    fn test_add_to_balance_refuses_negative_results() {
        let store = MemoryStore::new();
        store
            .transaction(|tx| tx.insert(Table::Wallets, 1, wallet_row(1, 1000)))
            .unwrap();

        let balance = store
            .transaction(|tx| tx.add_to_balance(1, Decimal::new(-400, 2)))
            .unwrap();
        assert_eq!(balance, Some(Decimal::new(600, 2)));

        let refused = store
            .transaction(|tx| tx.add_to_balance(1, Decimal::new(-700, 2)))
            .unwrap();
        assert_eq!(refused, None);
    }

    #[test]
    fn test_sequences_are_per_table_and_survive_commits() {
        let store = MemoryStore::new();
        let first = store.transaction(|tx| Ok(tx.next_id(Table::Exchanges))).unwrap();
        let second = store.transaction(|tx| Ok(tx.next_id(Table::Exchanges))).unwrap();
        let other = store.transaction(|tx| Ok(tx.next_id(Table::Transfers))).unwrap();
        assert_eq!((first, second, other), (1, 2, 1));
    }
}
