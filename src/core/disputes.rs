//! Dispute and chargeback recovery
//!
//! When the processor reverts a payin, the money it brought in may already
//! have been given away or withdrawn. Recovery works in two stages:
//!
//! - `lock_disputed_funds` flags the payin's bundles as disputed and swaps
//!   them, where possible, with safe bundles of the original payer so the
//!   disputed money finds its way back to them.
//! - `recover_lost_funds` retries the swaps, records debts for what third
//!   parties still hold, and moves what was recovered to the chargebacks
//!   account.
//!
//! The swap search is greedy: it takes the first candidate that fits.

use crate::core::bundles;
use crate::core::context::LedgerContext;
use crate::core::debts::insert_debt;
use crate::core::rows;
use crate::core::traits::{LedgerStore, LedgerTx, PaymentProcessor};
use crate::core::transfers::TransferRequest;
use crate::types::{
    BundleId, CashBundle, Debt, Exchange, ExchangeId, ExchangeStatus, HolderId, LedgerError,
    LedgerEvent, Money, Transfer, TransferContext, TransferStatus,
};
use std::collections::BTreeMap;

/// Outcome of `recover_lost_funds`
#[derive(Debug, Clone, PartialEq)]
pub struct Recovery {
    pub exchange_id: ExchangeId,
    pub repudiation_id: String,
    /// Disputed money taken back from the original payer
    pub recovered: Money,
    pub debts: Vec<Debt>,
    /// Transfer of the recovered money to the chargebacks account
    pub transfer: Option<Transfer>,
}

/// Fetch a succeeded, not yet settled payin and check a dispute covers all of it
fn disputed_payin(
    tx: &dyn LedgerTx,
    exchange_id: ExchangeId,
    amount: Money,
) -> Result<Exchange, LedgerError> {
    let exchange = rows::fetch_required::<Exchange>(tx, exchange_id)?;
    if !exchange.is_payin() || exchange.status != ExchangeStatus::Succeeded {
        return Err(LedgerError::invalid_transition(
            "exchange",
            exchange_id,
            exchange.status,
            "disputed",
        ));
    }
    if exchange.repudiation.is_some() {
        return Err(LedgerError::invalid_transition(
            "exchange",
            exchange_id,
            "recovered",
            "disputed",
        ));
    }
    if amount != exchange.amount.checked_add(exchange.fee)? {
        return Err(LedgerError::not_implemented("partial disputes"));
    }
    Ok(exchange)
}

/// Swap `target` with the first candidate that fits
///
/// Tries an exact match first, then a larger candidate (split down to the
/// target's amount), then a smaller one (the target is split instead, so
/// only part of it moves). Returns whether a swap happened.
pub fn try_to_swap_bundle_with(
    tx: &mut dyn LedgerTx,
    target: &CashBundle,
    candidates: &[CashBundle],
) -> Result<bool, LedgerError> {
    if target.locked_for.is_some() {
        return Ok(false);
    }
    let usable = |c: &&CashBundle| {
        c.id != target.id && c.locked_for.is_none() && c.amount.currency == target.amount.currency
    };

    if let Some(exact) = candidates.iter().filter(usable).find(|c| c.amount == target.amount) {
        bundles::swap(tx, target, exact)?;
        return Ok(true);
    }

    if let Some(larger) = candidates
        .iter()
        .filter(usable)
        .find(|c| c.amount.amount > target.amount.amount)
    {
        let (_, piece) = bundles::split(tx, larger, target.amount)?;
        bundles::swap(tx, target, &piece)?;
        return Ok(true);
    }

    if let Some(smaller) = candidates
        .iter()
        .filter(usable)
        .find(|c| c.amount.amount < target.amount.amount)
    {
        let (_, piece) = bundles::split(tx, target, smaller.amount)?;
        bundles::swap(tx, &piece, smaller)?;
        return Ok(true);
    }

    Ok(false)
}

/// Safe bundles of a holder: not disputed, not locked, not withdrawn
fn safe_bundles(
    tx: &mut dyn LedgerTx,
    holder: HolderId,
    like: &CashBundle,
) -> Result<Vec<CashBundle>, LedgerError> {
    let mut safe: Vec<CashBundle> = bundles::bundles_of(tx, holder, like.amount.currency)?
        .into_iter()
        .filter(|b| !b.disputed && b.locked_for.is_none() && b.withdrawal.is_none())
        .collect();
    safe.sort_by_key(|b| (b.ts, b.id));
    Ok(safe)
}

/// Try to bring a disputed bundle back to its original owner
///
/// Swaps with the original owner's safe bundles first. If the bundle was
/// withdrawn and is still out, tries the withdrawer's safe bundles so the
/// disputed money at least comes back into the ledger. Returns whether any
/// swap happened.
pub fn try_to_swap_bundle(
    tx: &mut dyn LedgerTx,
    bundle_id: BundleId,
    original_owner: HolderId,
) -> Result<bool, LedgerError> {
    let bundle = rows::fetch_required::<CashBundle>(tx, bundle_id)?;
    if bundle.owner == Some(original_owner) {
        return Ok(false);
    }
    let holder = bundle.owner;

    let candidates = safe_bundles(tx, original_owner, &bundle)?;
    let mut swapped = try_to_swap_bundle_with(tx, &bundle, &candidates)?;
    if swapped {
        bundles::merge(tx, original_owner)?;
        if let Some(holder) = holder {
            bundles::merge(tx, holder)?;
        }
    }

    let bundle = rows::fetch_required::<CashBundle>(tx, bundle_id)?;
    if bundle.owner != Some(original_owner) {
        if let Some(withdrawal) = bundle.withdrawal {
            let withdrawer = rows::fetch_required::<Exchange>(tx, withdrawal)?.participant;
            let candidates = safe_bundles(tx, withdrawer, &bundle)?;
            if try_to_swap_bundle_with(tx, &bundle, &candidates)? {
                bundles::merge(tx, withdrawer)?;
                swapped = true;
            }
        }
    }

    if swapped {
        tracing::debug!(bundle = bundle_id, original_owner, "swapped disputed bundle");
    }
    Ok(swapped)
}

/// Whether a disputed bundle should be pulled back to the payer
///
/// Money already in the chargebacks account has been recovered and stays there.
fn needs_swap(bundle: &CashBundle, payer: HolderId, chargebacks: HolderId) -> bool {
    bundle.disputed && bundle.owner != Some(payer) && bundle.owner != Some(chargebacks)
}

/// Run swap attempts over the disputed bundles until none succeeds
fn swap_until_stable(
    tx: &mut dyn LedgerTx,
    exchange: &Exchange,
    chargebacks: HolderId,
) -> Result<(), LedgerError> {
    loop {
        let mut progressed = false;
        for bundle in bundles::originating_from(tx, exchange.id)? {
            if needs_swap(&bundle, exchange.participant, chargebacks)
                && try_to_swap_bundle(tx, bundle.id, exchange.participant)?
            {
                progressed = true;
            }
        }
        if !progressed {
            return Ok(());
        }
    }
}

/// Who is answerable for a disputed bundle held outside the payer's wallet
fn holder_of(tx: &dyn LedgerTx, bundle: &CashBundle) -> Result<HolderId, LedgerError> {
    match (bundle.owner, bundle.withdrawal) {
        (Some(owner), _) => Ok(owner),
        (None, Some(withdrawal)) => Ok(rows::fetch_required::<Exchange>(tx, withdrawal)?.participant),
        (None, None) => Err(LedgerError::invariant(format!(
            "cash bundle {} has neither owner nor withdrawal",
            bundle.id
        ))),
    }
}

impl<S: LedgerStore> LedgerContext<S> {
    /// Flag the money of a reverted payin as disputed
    ///
    /// `amount` must cover the whole exchange; partial disputes aren't
    /// supported. Returns the ids of the disputed bundles.
    pub fn lock_disputed_funds(
        &self,
        exchange_id: ExchangeId,
        amount: Money,
    ) -> Result<Vec<BundleId>, LedgerError> {
        let chargebacks = self.config.chargebacks_holder;
        let disputed = self.store.transaction(|tx| {
            let exchange = disputed_payin(tx, exchange_id, amount)?;
            let flagged = bundles::mark_disputed(tx, exchange.id)?;

            let credited = exchange.amount.checked_sub(exchange.fee.clamp_non_negative())?;
            let total = Money::sum(flagged.iter().map(|b| b.amount), credited.currency)?;
            if total != credited {
                return Err(LedgerError::invariant(format!(
                    "bundles of exchange {} hold {} but {} was credited",
                    exchange.id, total, credited
                )));
            }

            for bundle in flagged
                .iter()
                .filter(|b| needs_swap(b, exchange.participant, chargebacks))
            {
                try_to_swap_bundle(tx, bundle.id, exchange.participant)?;
            }
            Ok(flagged.into_iter().map(|b| b.id).collect::<Vec<_>>())
        })?;

        tracing::warn!(exchange = exchange_id, amount = %amount, bundles = disputed.len(), "funds disputed");
        self.publish(vec![LedgerEvent::FundsDisputed {
            exchange_id,
            bundles: disputed.clone(),
        }]);
        Ok(disputed)
    }

    /// Settle a lost dispute
    ///
    /// Third parties holding disputed money become debtors of the chargebacks
    /// account, the payer owes the platform the processor fee, and the
    /// disputed money still with the payer moves to the chargebacks account.
    ///
    /// # Errors
    ///
    /// `CompensationFailed` if the move to the chargebacks account doesn't go
    /// through. The debts recorded before are kept.
    pub fn recover_lost_funds(
        &self,
        processor: &dyn PaymentProcessor,
        exchange_id: ExchangeId,
        lost_amount: Money,
        repudiation_id: &str,
    ) -> Result<Recovery, LedgerError> {
        let now = self.clock.now();
        let chargebacks = self.config.chargebacks_holder;
        let platform = self.config.platform_holder;

        let (exchange, debts, recoverable) = self.store.transaction(|tx| {
            let mut exchange = disputed_payin(tx, exchange_id, lost_amount)?;
            let before = exchange.clone();
            exchange.repudiation = Some(repudiation_id.to_string());
            if !rows::update(tx, &before, &exchange)? {
                return Err(LedgerError::invariant(format!(
                    "exchange {} changed during dispute recovery",
                    exchange_id
                )));
            }
            swap_until_stable(tx, &exchange, chargebacks)?;

            let mut owed: BTreeMap<HolderId, Money> = BTreeMap::new();
            let mut recoverable = Vec::new();
            for bundle in bundles::originating_from(tx, exchange.id)? {
                if !bundle.disputed || bundle.owner == Some(chargebacks) {
                    continue;
                }
                if bundle.owner == Some(exchange.participant) && bundle.locked_for.is_none() {
                    recoverable.push(bundle);
                    continue;
                }
                let debtor = holder_of(tx, &bundle)?;
                let entry = owed
                    .entry(debtor)
                    .or_insert_with(|| Money::zero(bundle.amount.currency));
                *entry = entry.checked_add(bundle.amount)?;
            }

            let mut debts = Vec::new();
            for (debtor, amount) in owed {
                debts.push(insert_debt(tx, debtor, chargebacks, amount, exchange.id, now)?);
            }
            if exchange.fee.is_positive() {
                debts.push(insert_debt(
                    tx,
                    exchange.participant,
                    platform,
                    exchange.fee,
                    exchange.id,
                    now,
                )?);
            }
            Ok((exchange, debts, recoverable))
        })?;

        let currency = exchange.amount.currency;
        let recovered = Money::sum(recoverable.iter().map(|b| b.amount), currency)?;
        let transfer = if recovered.is_positive() {
            let request = TransferRequest::new(
                exchange.participant,
                chargebacks,
                recovered,
                TransferContext::Chargeback,
            )
            .with_bundles(recoverable.iter().map(|b| b.id).collect());

            let receipt = self.transfer(processor, &request).map_err(|e| {
                LedgerError::CompensationFailed {
                    message: e.to_string(),
                }
            })?;
            if receipt.transfer.status != TransferStatus::Succeeded {
                return Err(LedgerError::CompensationFailed {
                    message: receipt
                        .transfer
                        .error
                        .unwrap_or_else(|| format!("transfer {} failed", receipt.transfer.id)),
                });
            }
            Some(receipt.transfer)
        } else {
            None
        };

        tracing::warn!(
            exchange = exchange_id,
            repudiation = repudiation_id,
            recovered = %recovered,
            debts = debts.len(),
            "recovered lost funds"
        );
        let mut events: Vec<LedgerEvent> = debts
            .iter()
            .map(|debt| LedgerEvent::DebtCreated { debt: debt.clone() })
            .collect();
        events.push(LedgerEvent::FundsRecovered {
            exchange_id,
            recovered,
            repudiation_id: repudiation_id.to_string(),
        });
        self.publish(events);

        Ok(Recovery {
            exchange_id,
            repudiation_id: repudiation_id.to_string(),
            recovered,
            debts,
            transfer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::collaborators::InstantSettlement;
    use crate::core::test_support::{epoch, eur, insert_payin, seed_bundle, Harness};
    use crate::core::MemoryStore;
    use crate::types::{Currency, Network, Route};

    fn card(participant: HolderId) -> Route {
        Route {
            id: participant,
            participant,
            network: Network::Card,
        }
    }

    fn payin(h: &Harness, participant: HolderId, cents: i64, fee: i64) -> Exchange {
        let e = h
            .ctx
            .record_exchange(&card(participant), eur(cents), eur(fee), eur(0), participant, ExchangeStatus::Pre)
            .unwrap();
        h.ctx
            .record_exchange_result(e.id, None, ExchangeStatus::Succeeded, None, participant)
            .unwrap()
            .unwrap()
    }

    fn tip(h: &Harness, from: HolderId, to: HolderId, cents: i64) {
        h.ctx
            .transfer(
                &InstantSettlement,
                &TransferRequest::new(from, to, eur(cents), TransferContext::Tip),
            )
            .unwrap();
    }

    #[test]
    fn test_swap_with_exact_larger_and_smaller_candidates() {
        let store = MemoryStore::new();
        store
            .transaction(|tx| {
                let target = seed_bundle(tx, 2, 1, eur(500), epoch());
                let exact = seed_bundle(tx, 1, 2, eur(500), epoch());
                assert!(try_to_swap_bundle_with(tx, &target, &[exact.clone()])?);
                assert_eq!(rows::fetch_required::<CashBundle>(tx, target.id)?.owner, Some(1));

                let target = seed_bundle(tx, 2, 3, eur(300), epoch());
                let larger = seed_bundle(tx, 1, 4, eur(800), epoch());
                assert!(try_to_swap_bundle_with(tx, &target, &[larger.clone()])?);
                assert_eq!(rows::fetch_required::<CashBundle>(tx, target.id)?.owner, Some(1));
                assert_eq!(rows::fetch_required::<CashBundle>(tx, larger.id)?.amount, eur(500));

                let target = seed_bundle(tx, 2, 5, eur(300), epoch());
                let smaller = seed_bundle(tx, 1, 6, eur(100), epoch());
                assert!(try_to_swap_bundle_with(tx, &target, &[smaller.clone()])?);
                let rest = rows::fetch_required::<CashBundle>(tx, target.id)?;
                assert_eq!(rest.owner, Some(2));
                assert_eq!(rest.amount, eur(200));
                assert_eq!(rows::fetch_required::<CashBundle>(tx, smaller.id)?.owner, Some(2));

                assert!(!try_to_swap_bundle_with(tx, &rest, &[])?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_swaps_never_change_balances() {
        let store = MemoryStore::new();
        store
            .transaction(|tx| {
                let origin = insert_payin(tx, 2, Network::Card, eur(700));
                let target = seed_bundle(tx, 2, origin, eur(700), epoch());
                seed_bundle(tx, 1, 9, eur(200), epoch());
                seed_bundle(tx, 1, 10, eur(900), epoch());

                let candidates = safe_bundles(tx, 1, &target)?;
                try_to_swap_bundle_with(tx, &target, &candidates)?;
                for holder in [1, 2] {
                    let sum = Money::sum(
                        bundles::bundles_of(tx, holder, Currency::Eur)?.iter().map(|b| b.amount),
                        Currency::Eur,
                    )?;
                    let wallet = crate::core::wallets::current_wallet(tx, holder, Currency::Eur)?;
                    assert_eq!(sum, wallet.balance);
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_partial_disputes_are_not_supported() {
        let h = Harness::new(&[1]);
        let e = payin(&h, 1, 1000, 0);
        assert_eq!(
            h.ctx.lock_disputed_funds(e.id, eur(500)),
            Err(LedgerError::not_implemented("partial disputes"))
        );
        assert_eq!(
            h.ctx.recover_lost_funds(&InstantSettlement, e.id, eur(500), "r-1"),
            Err(LedgerError::not_implemented("partial disputes"))
        );
    }

    #[test]
    fn test_dispute_pulls_money_back_to_the_payer() {
        let h = Harness::new(&[1, 2, 3]);
        let disputed = payin(&h, 1, 1000, 0);
        tip(&h, 1, 2, 1000);
        payin(&h, 1, 1000, 0);

        let flagged = h.ctx.lock_disputed_funds(disputed.id, eur(1000)).unwrap();
        assert_eq!(flagged.len(), 1);

        let payer = h.bundles(1);
        assert!(payer.iter().all(|b| b.origin == disputed.id && b.disputed));
        let receiver = h.bundles(2);
        assert!(receiver.iter().all(|b| !b.disputed));
        assert_eq!(h.balance(1), eur(1000));
        assert_eq!(h.balance(2), eur(1000));
        assert_eq!(h.events.names().last(), Some(&"funds_disputed"));
    }

    #[test]
    fn test_recover_records_debts_for_spent_money() {
        let h = Harness::new(&[1, 2]);
        let disputed = payin(&h, 1, 1000, 50);
        tip(&h, 1, 2, 600);

        h.ctx.lock_disputed_funds(disputed.id, eur(1050)).unwrap();
        let recovery = h
            .ctx
            .recover_lost_funds(&InstantSettlement, disputed.id, eur(1050), "rep-7")
            .unwrap();

        assert_eq!(recovery.recovered, eur(350));
        assert_eq!(recovery.debts.len(), 2);
        let third_party = &recovery.debts[0];
        assert_eq!(third_party.debtor, 2);
        assert_eq!(third_party.creditor, h.ctx.config.chargebacks_holder);
        assert_eq!(third_party.amount, eur(600));
        let fee = &recovery.debts[1];
        assert_eq!(fee.debtor, 1);
        assert_eq!(fee.creditor, h.ctx.config.platform_holder);
        assert_eq!(fee.amount, eur(50));

        assert_eq!(h.balance(1), eur(0));
        assert_eq!(h.balance(h.ctx.config.chargebacks_holder), eur(350));
        let transfer = recovery.transfer.unwrap();
        assert_eq!(transfer.context, TransferContext::Chargeback);
        assert_eq!(
            h.events.names().last(),
            Some(&"funds_recovered")
        );
    }

    #[test]
    fn test_withdrawn_disputed_money_is_owed_by_the_withdrawer() {
        let h = Harness::new(&[1, 2]);
        let disputed = payin(&h, 1, 1000, 0);
        tip(&h, 1, 2, 1000);
        h.ctx
            .record_exchange(&card(2), eur(-1000), eur(0), eur(0), 2, ExchangeStatus::Pre)
            .unwrap();

        h.ctx.lock_disputed_funds(disputed.id, eur(1000)).unwrap();
        let recovery = h
            .ctx
            .recover_lost_funds(&InstantSettlement, disputed.id, eur(1000), "rep-8")
            .unwrap();
        assert_eq!(recovery.recovered, eur(0));
        assert!(recovery.transfer.is_none());
        assert_eq!(recovery.debts.len(), 1);
        assert_eq!(recovery.debts[0].debtor, 2);
        assert_eq!(recovery.debts[0].amount, eur(1000));
    }

    #[test]
    fn test_second_recovery_leaves_new_money_alone() {
        let h = Harness::new(&[1]);
        let chargebacks = h.ctx.config.chargebacks_holder;
        let disputed = payin(&h, 1, 1000, 0);
        h.ctx.lock_disputed_funds(disputed.id, eur(1000)).unwrap();
        h.ctx
            .recover_lost_funds(&InstantSettlement, disputed.id, eur(1000), "rep-9")
            .unwrap();
        assert_eq!(h.balance(chargebacks), eur(1000));

        let fresh = payin(&h, 1, 1000, 0);
        let again = h
            .ctx
            .recover_lost_funds(&InstantSettlement, disputed.id, eur(1000), "rep-9");
        assert!(matches!(again, Err(LedgerError::InvalidStatusTransition { .. })));
        let relock = h.ctx.lock_disputed_funds(disputed.id, eur(1000));
        assert!(matches!(relock, Err(LedgerError::InvalidStatusTransition { .. })));

        assert_eq!(h.balance(1), eur(1000));
        assert_eq!(h.balance(chargebacks), eur(1000));
        let payer = h.bundles(1);
        assert!(payer.iter().all(|b| b.origin == fresh.id && !b.disputed));
        assert!(h.bundles(chargebacks).iter().all(|b| b.origin == disputed.id));
    }

    #[test]
    fn test_recovered_bundles_are_not_swapped_back() {
        let store = MemoryStore::new();
        store
            .transaction(|tx| {
                let origin = insert_payin(tx, 1, Network::Card, eur(500));
                let mut recovered = seed_bundle(tx, 900, origin, eur(500), epoch());
                recovered.disputed = true;
                assert!(!needs_swap(&recovered, 1, 900));
                assert!(needs_swap(&recovered, 1, 2));
                recovered.owner = Some(1);
                assert!(!needs_swap(&recovered, 1, 900));
                Ok(())
            })
            .unwrap();
    }
}
