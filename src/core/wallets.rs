//! Wallet lookups
//!
//! Exactly one wallet per (holder, currency) is current. Wallets are created
//! on first use with a zero balance.

use crate::core::rows::{self, fetch_all};
use crate::core::traits::{LedgerTx, Table};
use crate::types::{Currency, HolderId, LedgerError, Money, Wallet, WalletId};
use rust_decimal::Decimal;

/// Current wallet of `owner` in `currency`, if any
pub fn find_current_wallet(
    tx: &dyn LedgerTx,
    owner: HolderId,
    currency: Currency,
) -> Result<Option<Wallet>, LedgerError> {
    Ok(fetch_all::<Wallet>(tx)?
        .into_iter()
        .find(|w| w.owner == owner && w.is_current && w.balance.currency == currency))
}

/// Get or create the current wallet of `owner` in `currency`
pub fn current_wallet(
    tx: &mut dyn LedgerTx,
    owner: HolderId,
    currency: Currency,
) -> Result<Wallet, LedgerError> {
    if let Some(wallet) = find_current_wallet(tx, owner, currency)? {
        return Ok(wallet);
    }

    let wallet = Wallet {
        remote_id: tx.next_id(Table::Wallets),
        balance: Money::zero(currency),
        owner,
        is_current: true,
    };
    rows::insert(tx, &wallet)?;
    tracing::debug!(owner, wallet = wallet.remote_id, %currency, "created wallet");
    Ok(wallet)
}

/// Apply a signed delta to a wallet balance under the `balance >= 0` guard
pub fn adjust_balance(
    tx: &mut dyn LedgerTx,
    wallet: WalletId,
    delta: Money,
) -> Result<Money, LedgerError> {
    let current = rows::fetch_required::<Wallet>(tx, wallet)?;
    if current.balance.currency != delta.currency {
        return Err(LedgerError::currency_mismatch(
            current.balance.currency,
            delta.currency,
        ));
    }
    if delta.amount == Decimal::ZERO {
        return Ok(current.balance);
    }

    let balance = tx
        .add_to_balance(wallet, delta.amount)?
        .ok_or(LedgerError::NegativeBalance { wallet })?;
    Ok(Money::new(balance, delta.currency))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{LedgerStore, MemoryStore};

    #[test]
    fn test_current_wallet_is_created_once() {
        let store = MemoryStore::new();
        let (first, second) = store
            .transaction(|tx| {
                let first = current_wallet(tx, 1, Currency::Eur)?;
                let second = current_wallet(tx, 1, Currency::Eur)?;
                Ok((first, second))
            })
            .unwrap();
        assert_eq!(first, second);

        let usd = store
            .transaction(|tx| current_wallet(tx, 1, Currency::Usd))
            .unwrap();
        assert_ne!(usd.remote_id, first.remote_id);
    }

    #[test]
    fn test_adjust_balance_guards_against_negative_balances() {
        let store = MemoryStore::new();
        let eur = |cents| Money::new(Decimal::new(cents, 2), Currency::Eur);

        let result = store.transaction(|tx| {
            let wallet = current_wallet(tx, 1, Currency::Eur)?;
            assert_eq!(adjust_balance(tx, wallet.remote_id, eur(500))?, eur(500));
            adjust_balance(tx, wallet.remote_id, eur(-600))
        });
        assert!(matches!(result, Err(LedgerError::NegativeBalance { .. })));
    }

    #[test]
    fn test_adjust_balance_refuses_other_currencies() {
        let store = MemoryStore::new();
        let result = store.transaction(|tx| {
            let wallet = current_wallet(tx, 1, Currency::Eur)?;
            adjust_balance(tx, wallet.remote_id, Money::new(Decimal::ONE, Currency::Usd))
        });
        assert!(matches!(result, Err(LedgerError::CurrencyMismatch { .. })));
    }
}
