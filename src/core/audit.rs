//! Ledger consistency checks
//!
//! Compares each wallet's cached balance with the bundles it holds and looks
//! for bundles left locked by transfers that are already final.

use crate::core::context::LedgerContext;
use crate::core::rows::{self, fetch_all};
use crate::core::traits::{LedgerStore, LedgerTx, Table};
use crate::types::{
    BundleId, CashBundle, HolderId, LedgerError, Money, Transfer, TransferId, TransferStatus,
    Wallet, WalletId,
};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Discrepancy {
    /// Wallet balance differs from the sum of the bundles in it
    BalanceMismatch {
        wallet: WalletId,
        owner: HolderId,
        balance: Money,
        bundles: Money,
    },
    /// Bundle locked for a transfer that no longer needs it
    OrphanLock {
        bundle: BundleId,
        transfer: TransferId,
    },
    /// Bundle that is neither owned nor in transit, or both
    Misplaced { bundle: BundleId },
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discrepancy::BalanceMismatch {
                wallet,
                owner,
                balance,
                bundles,
            } => write!(
                f,
                "wallet {} of holder {} has a balance of {} but holds {} of bundles",
                wallet, owner, balance, bundles
            ),
            Discrepancy::OrphanLock { bundle, transfer } => write!(
                f,
                "cash bundle {} is locked for transfer {} which isn't pending",
                bundle, transfer
            ),
            Discrepancy::Misplaced { bundle } => {
                write!(f, "cash bundle {} has an inconsistent location", bundle)
            }
        }
    }
}

/// Run every check inside one transaction
pub fn check_ledger(tx: &mut dyn LedgerTx) -> Result<Vec<Discrepancy>, LedgerError> {
    tx.lock_exclusive(Table::CashBundles)?;
    let bundles = fetch_all::<CashBundle>(tx)?;
    let mut found = Vec::new();

    let mut held: HashMap<WalletId, Vec<Money>> = HashMap::new();
    for bundle in &bundles {
        if bundle.owner.is_some() == bundle.withdrawal.is_some() {
            found.push(Discrepancy::Misplaced { bundle: bundle.id });
        }
        if let (Some(_), Some(wallet)) = (bundle.owner, bundle.wallet_id) {
            held.entry(wallet).or_default().push(bundle.amount);
        }
    }

    for wallet in fetch_all::<Wallet>(tx)? {
        let amounts = held.remove(&wallet.remote_id).unwrap_or_default();
        let total = Money::sum(amounts, wallet.balance.currency)?;
        if total != wallet.balance {
            found.push(Discrepancy::BalanceMismatch {
                wallet: wallet.remote_id,
                owner: wallet.owner,
                balance: wallet.balance,
                bundles: total,
            });
        }
    }

    for bundle in &bundles {
        if let Some(transfer) = bundle.locked_for {
            let pending = rows::fetch::<Transfer>(tx, transfer)?
                .is_some_and(|t| t.status == TransferStatus::Pre);
            if !pending {
                found.push(Discrepancy::OrphanLock {
                    bundle: bundle.id,
                    transfer,
                });
            }
        }
    }
    Ok(found)
}

impl<S: LedgerStore> LedgerContext<S> {
    /// Check the whole ledger and log what doesn't add up
    pub fn audit(&self) -> Result<Vec<Discrepancy>, LedgerError> {
        let found = self.store.transaction(|tx| check_ledger(tx))?;
        for discrepancy in &found {
            tracing::error!(%discrepancy, "ledger discrepancy");
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::{epoch, eur, seed_bundle};
    use crate::core::{LedgerStore, MemoryStore};

    #[test]
    fn test_consistent_ledger_has_no_discrepancies() {
        let store = MemoryStore::new();
        let found = store
            .transaction(|tx| {
                seed_bundle(tx, 1, 1, eur(500), epoch());
                seed_bundle(tx, 2, 2, eur(300), epoch());
                check_ledger(tx)
            })
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_detects_balance_mismatch_and_orphan_locks() {
        let store = MemoryStore::new();
        let found = store
            .transaction(|tx| {
                let bundle = seed_bundle(tx, 1, 1, eur(500), epoch());
                tx.add_to_balance(1, eur(100).amount)?;
                let mut locked = bundle.clone();
                locked.locked_for = Some(77);
                rows::save(tx, &locked)?;
                check_ledger(tx)
            })
            .unwrap();

        assert_eq!(found.len(), 2);
        assert!(matches!(
            found[0],
            Discrepancy::BalanceMismatch { wallet: 1, owner: 1, .. }
        ));
        assert_eq!(
            found[1],
            Discrepancy::OrphanLock {
                bundle: 1,
                transfer: 77
            }
        );
    }
}
