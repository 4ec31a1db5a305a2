//! Cash bundle ledger
//!
//! Every unit of money a holder possesses belongs to a cash bundle that
//! remembers the exchange it came in through. This module provides the
//! primitives over bundles: split, merge, lock/unlock for a transfer, swap,
//! and marking bundles as withdrawn.
//!
//! All functions run inside a store transaction and take the exclusive lock
//! on the `cash_bundles` table before reading anything, so no two operations
//! ever interleave on the bundle set.

use crate::core::context::QuarantinePolicy;
use crate::core::rows::{self, fetch_all};
use crate::core::traits::{LedgerTx, Table};
use crate::types::{
    BundleId, CashBundle, Currency, Exchange, ExchangeId, HolderId, LedgerError, Money,
    Transfer, TransferId, WalletId,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

fn lock_table(tx: &mut dyn LedgerTx) -> Result<(), LedgerError> {
    tx.lock_exclusive(Table::CashBundles)
}

/// Write `after` over `before`, failing if the stored bundle changed meanwhile
fn write(tx: &mut dyn LedgerTx, before: &CashBundle, after: &CashBundle) -> Result<(), LedgerError> {
    if rows::update(tx, before, after)? {
        Ok(())
    } else {
        Err(LedgerError::invariant(format!(
            "cash bundle {} was modified while being updated",
            before.id
        )))
    }
}

/// Origin exchanges of the given bundles, by id
fn origins(
    tx: &dyn LedgerTx,
    bundles: &[CashBundle],
) -> Result<HashMap<ExchangeId, Exchange>, LedgerError> {
    let mut found = HashMap::new();
    for bundle in bundles {
        if found.contains_key(&bundle.origin) {
            continue;
        }
        if let Some(exchange) = rows::fetch::<Exchange>(tx, bundle.origin)? {
            found.insert(bundle.origin, exchange);
        }
    }
    Ok(found)
}

/// Bundles currently owned by `owner` in `currency`, ordered by id
pub fn bundles_of(
    tx: &mut dyn LedgerTx,
    owner: HolderId,
    currency: Currency,
) -> Result<Vec<CashBundle>, LedgerError> {
    lock_table(tx)?;
    Ok(fetch_all::<CashBundle>(tx)?
        .into_iter()
        .filter(|b| b.owner == Some(owner) && b.amount.currency == currency)
        .collect())
}

/// Bundles locked for a transfer
pub fn locked_for(tx: &mut dyn LedgerTx, transfer: TransferId) -> Result<Vec<CashBundle>, LedgerError> {
    lock_table(tx)?;
    Ok(fetch_all::<CashBundle>(tx)?
        .into_iter()
        .filter(|b| b.locked_for == Some(transfer))
        .collect())
}

/// Bundles originating from an exchange, wherever they are now
pub fn originating_from(
    tx: &mut dyn LedgerTx,
    origin: ExchangeId,
) -> Result<Vec<CashBundle>, LedgerError> {
    lock_table(tx)?;
    Ok(fetch_all::<CashBundle>(tx)?
        .into_iter()
        .filter(|b| b.origin == origin)
        .collect())
}

/// Bundles in transit for a withdrawal
pub fn withdrawn_by(
    tx: &mut dyn LedgerTx,
    withdrawal: ExchangeId,
) -> Result<Vec<CashBundle>, LedgerError> {
    lock_table(tx)?;
    Ok(fetch_all::<CashBundle>(tx)?
        .into_iter()
        .filter(|b| b.withdrawal == Some(withdrawal))
        .collect())
}

/// Create a fresh bundle for money entering a holder's wallet
pub fn create(
    tx: &mut dyn LedgerTx,
    owner: HolderId,
    origin: ExchangeId,
    ts: DateTime<Utc>,
    amount: Money,
    wallet_id: WalletId,
) -> Result<CashBundle, LedgerError> {
    if !amount.is_positive() {
        return Err(LedgerError::invariant(format!(
            "refusing to create a cash bundle of {}",
            amount
        )));
    }
    lock_table(tx)?;

    let bundle = CashBundle {
        id: tx.next_id(Table::CashBundles),
        owner: Some(owner),
        origin,
        ts,
        amount,
        withdrawal: None,
        disputed: false,
        locked_for: None,
        wallet_id: Some(wallet_id),
    };
    rows::insert(tx, &bundle)?;
    tracing::debug!(bundle = bundle.id, owner, origin, %amount, "created cash bundle");
    Ok(bundle)
}

/// Cut `amount` out of `bundle` into a new bundle
///
/// The new bundle copies every attribute of the original except its id and
/// amount. Requires `0 < amount < bundle.amount` and an unlocked bundle.
pub fn split(
    tx: &mut dyn LedgerTx,
    bundle: &CashBundle,
    amount: Money,
) -> Result<(CashBundle, CashBundle), LedgerError> {
    lock_table(tx)?;

    if bundle.locked_for.is_some() {
        return Err(LedgerError::invariant(format!(
            "cannot split cash bundle {}: it is locked",
            bundle.id
        )));
    }
    if !amount.is_positive() || amount.try_cmp(&bundle.amount)?.is_ge() {
        return Err(LedgerError::invariant(format!(
            "cannot split {} out of cash bundle {} holding {}",
            amount, bundle.id, bundle.amount
        )));
    }

    let mut reduced = bundle.clone();
    reduced.amount = bundle.amount.checked_sub(amount)?;
    write(tx, bundle, &reduced)?;

    let piece = CashBundle {
        id: tx.next_id(Table::CashBundles),
        amount,
        ..bundle.clone()
    };
    rows::insert(tx, &piece)?;
    tracing::debug!(bundle = bundle.id, new_bundle = piece.id, %amount, "split cash bundle");
    Ok((reduced, piece))
}

/// Collapse a holder's bundles sharing origin and wallet
///
/// Only bundles that are neither disputed nor locked take part. The survivor
/// is the lowest id, keeping the latest timestamp. Returns the number of
/// bundles removed.
pub fn merge(tx: &mut dyn LedgerTx, holder: HolderId) -> Result<usize, LedgerError> {
    lock_table(tx)?;

    let mut groups: BTreeMap<(ExchangeId, Option<WalletId>), Vec<CashBundle>> = BTreeMap::new();
    for bundle in fetch_all::<CashBundle>(tx)? {
        if bundle.owner == Some(holder) && !bundle.disputed && bundle.locked_for.is_none() {
            groups
                .entry((bundle.origin, bundle.wallet_id))
                .or_default()
                .push(bundle);
        }
    }

    let mut removed = 0;
    for group in groups.into_values().filter(|g| g.len() > 1) {
        let survivor = &group[0];
        let mut merged = survivor.clone();
        for donor in &group[1..] {
            merged.amount = merged.amount.checked_add(donor.amount)?;
            merged.ts = merged.ts.max(donor.ts);
            rows::remove::<CashBundle>(tx, donor.id)?;
            removed += 1;
        }
        write(tx, survivor, &merged)?;
    }

    if removed > 0 {
        tracing::debug!(holder, removed, "merged cash bundles");
    }
    Ok(removed)
}

/// Lock `total` worth of a holder's bundles for a transfer
///
/// Bundles originating from `preference`'s payins are taken first, then those
/// originating from the transfer recipient's own payins, then the oldest. The
/// last bundle is split when it holds more than needed.
pub fn lock_for(
    tx: &mut dyn LedgerTx,
    holder: HolderId,
    transfer: TransferId,
    total: Money,
    preference: Option<HolderId>,
) -> Result<Vec<BundleId>, LedgerError> {
    lock_table(tx)?;
    if !total.is_positive() {
        return Err(LedgerError::invalid_amount(total));
    }

    let recipient = rows::fetch::<Transfer>(tx, transfer)?.map(|t| t.tippee);
    let mut candidates: Vec<CashBundle> = fetch_all::<CashBundle>(tx)?
        .into_iter()
        .filter(|b| {
            b.owner == Some(holder)
                && b.amount.currency == total.currency
                && b.withdrawal.is_none()
                && b.locked_for.is_none()
        })
        .collect();

    let payers = origins(tx, &candidates)?;
    let payer = |b: &CashBundle| payers.get(&b.origin).map(|e| e.participant);
    candidates.sort_by_key(|b| {
        let from = payer(b);
        (
            !(preference.is_some() && from == preference),
            !(recipient.is_some() && from == recipient),
            b.ts,
            b.id,
        )
    });

    let mut remaining = total;
    let mut locked = Vec::new();
    for bundle in candidates {
        if !remaining.is_positive() {
            break;
        }
        let taken = if bundle.amount.try_cmp(&remaining)?.is_gt() {
            let (_, piece) = split(tx, &bundle, remaining)?;
            piece
        } else {
            bundle
        };
        let mut after = taken.clone();
        after.locked_for = Some(transfer);
        write(tx, &taken, &after)?;
        remaining = remaining.checked_sub(taken.amount)?;
        locked.push(taken.id);
    }

    if remaining.is_positive() {
        let available = total.checked_sub(remaining)?;
        return Err(LedgerError::insufficient_funds(holder, available, total));
    }
    tracing::debug!(holder, transfer, %total, bundles = locked.len(), "locked cash bundles");
    Ok(locked)
}

/// Lock a preselected set of bundles for a transfer
///
/// Every bundle must belong to `holder`, be free and available, and their sum
/// must equal `total`.
pub fn lock_bundles(
    tx: &mut dyn LedgerTx,
    holder: HolderId,
    transfer: TransferId,
    bundles: &[BundleId],
    total: Money,
) -> Result<(), LedgerError> {
    lock_table(tx)?;

    let mut sum = Money::zero(total.currency);
    for &id in bundles {
        let bundle = rows::fetch_required::<CashBundle>(tx, id)?;
        if bundle.owner != Some(holder) || bundle.withdrawal.is_some() {
            return Err(LedgerError::invariant(format!(
                "cash bundle {} is not available to holder {}",
                id, holder
            )));
        }
        if let Some(other) = bundle.locked_for {
            return Err(LedgerError::invariant(format!(
                "cash bundle {} is already locked for transfer {}",
                id, other
            )));
        }
        sum = sum.checked_add(bundle.amount)?;
        let mut after = bundle.clone();
        after.locked_for = Some(transfer);
        write(tx, &bundle, &after)?;
    }

    if sum != total {
        return Err(LedgerError::invariant(format!(
            "preselected bundles hold {} but transfer {} is for {}",
            sum, transfer, total
        )));
    }
    Ok(())
}

/// Release the bundles locked for a transfer
///
/// With `new_owner`, the bundles are handed over to that holder's wallet.
/// Returns the bundles as they are after unlocking.
pub fn unlock(
    tx: &mut dyn LedgerTx,
    transfer: TransferId,
    new_owner: Option<(HolderId, WalletId)>,
) -> Result<Vec<CashBundle>, LedgerError> {
    let bundles = locked_for(tx, transfer)?;
    let mut unlocked = Vec::with_capacity(bundles.len());
    for bundle in bundles {
        let mut after = bundle.clone();
        after.locked_for = None;
        if let Some((owner, wallet)) = new_owner {
            after.owner = Some(owner);
            after.wallet_id = Some(wallet);
        }
        write(tx, &bundle, &after)?;
        unlocked.push(after);
    }
    Ok(unlocked)
}

/// Exchange the locations of two bundles of equal amount
pub fn swap(tx: &mut dyn LedgerTx, a: &CashBundle, b: &CashBundle) -> Result<(), LedgerError> {
    lock_table(tx)?;

    if a.locked_for.is_some() || b.locked_for.is_some() {
        return Err(LedgerError::invariant(format!(
            "cannot swap cash bundles {} and {}: locked",
            a.id, b.id
        )));
    }
    if a.amount != b.amount {
        return Err(LedgerError::invariant(format!(
            "cannot swap cash bundles {} ({}) and {} ({})",
            a.id, a.amount, b.id, b.amount
        )));
    }

    let mut new_a = a.clone();
    let mut new_b = b.clone();
    new_a.owner = b.owner;
    new_a.withdrawal = b.withdrawal;
    new_a.wallet_id = b.wallet_id;
    new_b.owner = a.owner;
    new_b.withdrawal = a.withdrawal;
    new_b.wallet_id = a.wallet_id;
    write(tx, a, &new_a)?;
    write(tx, b, &new_b)?;
    tracing::debug!(a = a.id, b = b.id, amount = %a.amount, "swapped cash bundles");
    Ok(())
}

/// Flag every bundle originating from an exchange as disputed
pub fn mark_disputed(
    tx: &mut dyn LedgerTx,
    origin: ExchangeId,
) -> Result<Vec<CashBundle>, LedgerError> {
    let mut flagged = Vec::new();
    for bundle in originating_from(tx, origin)? {
        let mut after = bundle.clone();
        after.disputed = true;
        if after != bundle {
            write(tx, &bundle, &after)?;
        }
        flagged.push(after);
    }
    Ok(flagged)
}

/// Move `amount` of a holder's aged bundles out of the ledger for a payout
///
/// Bundles must have spent the quarantine period of the network they came
/// in through. Returns the ids of the withdrawn bundles.
pub fn mark_withdrawn(
    tx: &mut dyn LedgerTx,
    holder: HolderId,
    withdrawal: ExchangeId,
    amount: Money,
    now: DateTime<Utc>,
    quarantine: &QuarantinePolicy,
) -> Result<Vec<BundleId>, LedgerError> {
    lock_table(tx)?;
    if !amount.is_positive() {
        return Err(LedgerError::invalid_amount(amount));
    }

    let owned: Vec<CashBundle> = fetch_all::<CashBundle>(tx)?
        .into_iter()
        .filter(|b| {
            b.owner == Some(holder)
                && b.amount.currency == amount.currency
                && !b.disputed
                && b.locked_for.is_none()
        })
        .collect();
    let networks = origins(tx, &owned)?;
    let mut aged: Vec<CashBundle> = owned
        .into_iter()
        .filter(|b| {
            let period = networks
                .get(&b.origin)
                .map(|e| quarantine.for_network(e.network))
                .unwrap_or(quarantine.default);
            b.ts.checked_add_signed(period).is_some_and(|aged| aged <= now)
        })
        .collect();
    aged.sort_by_key(|b| (b.ts, b.id));

    let available = Money::sum(aged.iter().map(|b| b.amount), amount.currency)?;
    if available.try_cmp(&amount)?.is_lt() {
        return Err(LedgerError::NotEnoughWithdrawableMoney { available });
    }

    let mut remaining = amount;
    let mut withdrawn = Vec::new();
    for bundle in aged {
        if !remaining.is_positive() {
            break;
        }
        let taken = if bundle.amount.try_cmp(&remaining)?.is_gt() {
            let (_, piece) = split(tx, &bundle, remaining)?;
            piece
        } else {
            bundle
        };
        let mut after = taken.clone();
        after.owner = None;
        after.withdrawal = Some(withdrawal);
        after.wallet_id = None;
        write(tx, &taken, &after)?;
        remaining = remaining.checked_sub(taken.amount)?;
        withdrawn.push(taken.id);
    }

    tracing::debug!(holder, withdrawal, %amount, bundles = withdrawn.len(), "marked bundles withdrawn");
    Ok(withdrawn)
}

/// Give up to `limit` of a withdrawal's bundles back to their holder
///
/// Oldest bundles come back first; the last one is split when it holds more
/// than needed. Returns the total restored, which is less than `limit` when
/// the withdrawal didn't carry that much.
pub fn restore_withdrawn(
    tx: &mut dyn LedgerTx,
    withdrawal: ExchangeId,
    owner: HolderId,
    wallet_id: WalletId,
    limit: Money,
) -> Result<Money, LedgerError> {
    let mut bundles = withdrawn_by(tx, withdrawal)?;
    bundles.retain(|b| b.amount.currency == limit.currency && b.locked_for.is_none());
    bundles.sort_by_key(|b| (b.ts, b.id));

    let mut restored = Money::zero(limit.currency);
    for bundle in bundles {
        let remaining = limit.checked_sub(restored)?;
        if !remaining.is_positive() {
            break;
        }
        let taken = if bundle.amount.try_cmp(&remaining)?.is_gt() {
            let (_, piece) = split(tx, &bundle, remaining)?;
            piece
        } else {
            bundle
        };
        let mut after = taken.clone();
        after.owner = Some(owner);
        after.withdrawal = None;
        after.wallet_id = Some(wallet_id);
        write(tx, &taken, &after)?;
        restored = restored.checked_add(taken.amount)?;
    }
    Ok(restored)
}
