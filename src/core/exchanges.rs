//! Exchange engine
//!
//! Records interactions with the external payment processor and applies their
//! financial effect to wallets and cash bundles.
//!
//! - Payins (`amount > 0`) only touch the ledger once the processor confirms
//!   them: success credits `amount - fee` as a fresh cash bundle.
//! - Payouts (`amount < 0`) earmark the money as soon as they are recorded:
//!   `amount - fee` is debited and aged bundles are marked withdrawn. A failed
//!   payout gives those bundles back.
//! - Refunds of payouts carry a `refund_ref` and restore the payout's bundles
//!   instead of minting new ones.

use crate::core::bundles;
use crate::core::context::{LedgerContext, QuarantinePolicy};
use crate::core::rows;
use crate::core::traits::{LedgerStore, LedgerTx, Table};
use crate::core::wallets;
use crate::types::{
    Exchange, ExchangeId, ExchangeStatus, HolderId, LedgerError, LedgerEvent, Money, Route,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Check the amounts of a new exchange
///
/// # Arguments
///
/// * `amount` - Signed exchange amount
/// * `fee` - Processor fee, never negative
/// * `vat` - Tax on the fee, never negative
/// * `max_fee_ratio` - Fee ceiling for payins, `None` to skip the check
fn validate_amounts(
    amount: Money,
    fee: Money,
    vat: Money,
    max_fee_ratio: Option<Decimal>,
) -> Result<(), LedgerError> {
    if fee.currency != amount.currency {
        return Err(LedgerError::currency_mismatch(amount.currency, fee.currency));
    }
    if vat.currency != amount.currency {
        return Err(LedgerError::currency_mismatch(amount.currency, vat.currency));
    }
    if amount.is_zero() {
        return Err(LedgerError::invalid_amount(amount));
    }
    if fee.is_negative() {
        return Err(LedgerError::invalid_amount(fee));
    }
    if vat.is_negative() {
        return Err(LedgerError::invalid_amount(vat));
    }
    if fee.amount > amount.amount.abs() {
        return Err(LedgerError::FeeExceedsAmount { fee, amount });
    }

    if let Some(max_ratio) = max_fee_ratio {
        if amount.is_positive() && fee.amount > amount.amount * max_ratio {
            return Err(LedgerError::TransactionFeeTooHigh {
                fee,
                amount,
                max_ratio,
            });
        }
    }
    Ok(())
}

/// Apply `signed_amount` to an exchange's wallet and bundles
///
/// A debit marks aged bundles as withdrawn. A credit either restores bundles
/// (failed payouts and payout refunds) or creates a new bundle originating at
/// the exchange. The participant's bundles are merged afterwards.
///
/// Returns the new wallet balance.
pub fn propagate_exchange(
    tx: &mut dyn LedgerTx,
    exchange: &Exchange,
    signed_amount: Money,
    now: DateTime<Utc>,
    quarantine: &QuarantinePolicy,
) -> Result<Money, LedgerError> {
    let participant = exchange.participant;
    let balance = wallets::adjust_balance(tx, exchange.wallet_id, signed_amount)?;

    if signed_amount.is_negative() {
        bundles::mark_withdrawn(tx, participant, exchange.id, -signed_amount, now, quarantine)?;
    } else if signed_amount.is_positive() {
        let restored = if exchange.is_payout() || exchange.refund_ref.is_some() {
            let withdrawal = exchange.refund_ref.unwrap_or(exchange.id);
            bundles::restore_withdrawn(tx, withdrawal, participant, exchange.wallet_id, signed_amount)?
        } else {
            Money::zero(signed_amount.currency)
        };

        let fresh = signed_amount.checked_sub(restored)?;
        if fresh.is_positive() {
            bundles::create(tx, participant, exchange.id, now, fresh, exchange.wallet_id)?;
        }
    }

    bundles::merge(tx, participant)?;
    tracing::debug!(
        exchange = exchange.id,
        participant,
        amount = %signed_amount,
        balance = %balance,
        "propagated exchange"
    );
    Ok(balance)
}

fn insert_exchange(
    tx: &mut dyn LedgerTx,
    mut exchange: Exchange,
    now: DateTime<Utc>,
    quarantine: &QuarantinePolicy,
) -> Result<Exchange, LedgerError> {
    let wallet = wallets::current_wallet(tx, exchange.participant, exchange.amount.currency)?;
    exchange.id = tx.next_id(Table::Exchanges);
    exchange.wallet_id = wallet.remote_id;
    rows::insert(tx, &exchange)?;

    if exchange.is_payout() {
        let debit = exchange.amount.checked_sub(exchange.fee)?;
        propagate_exchange(tx, &exchange, debit, now, quarantine)?;
    }
    Ok(exchange)
}

impl<S: LedgerStore> LedgerContext<S> {
    /// Record a new exchange in a `pre*` status
    ///
    /// Payouts are propagated right away; payins wait for their result.
    ///
    /// # Errors
    ///
    /// `AccountSuspended`, `InvalidAmount`, `FeeExceedsAmount`,
    /// `TransactionFeeTooHigh`, and for payouts `NegativeBalance` or
    /// `NotEnoughWithdrawableMoney`.
    pub fn record_exchange(
        &self,
        route: &Route,
        amount: Money,
        fee: Money,
        vat: Money,
        participant: HolderId,
        status: ExchangeStatus,
    ) -> Result<Exchange, LedgerError> {
        let holder = self.registry.participant(participant)?;
        if holder.is_suspended {
            return Err(LedgerError::AccountSuspended { holder: participant });
        }
        if !status.is_pre() {
            return Err(LedgerError::invalid_transition("exchange", 0, "new", status));
        }
        if route.participant != participant {
            return Err(LedgerError::invariant(format!(
                "route {} doesn't belong to participant {}",
                route.id, participant
            )));
        }
        validate_amounts(amount, fee, vat, Some(self.config.max_fee_ratio))?;

        let now = self.clock.now();
        let draft = Exchange {
            id: 0,
            timestamp: now,
            amount,
            fee,
            vat,
            participant,
            status,
            route: route.id,
            network: route.network,
            remote_id: None,
            note: None,
            wallet_id: 0,
            refund_ref: None,
            repudiation: None,
        };
        let exchange = self
            .store
            .transaction(|tx| insert_exchange(tx, draft, now, &self.config.quarantine))?;

        tracing::info!(
            exchange = exchange.id,
            participant,
            amount = %amount,
            fee = %fee,
            status = %status,
            "recorded exchange"
        );
        if exchange.is_payout() {
            self.registry.refresh_totals(participant);
        }
        self.publish(vec![LedgerEvent::ExchangeRecorded {
            exchange: exchange.clone(),
        }]);
        Ok(exchange)
    }

    /// Record the refund of a succeeded payout
    ///
    /// The processor returned `amount` of the payout to the participant. Once
    /// this exchange succeeds, the payout's withdrawn bundles are restored.
    pub fn record_payout_refund(
        &self,
        payout: ExchangeId,
        amount: Money,
        fee: Money,
        vat: Money,
    ) -> Result<Exchange, LedgerError> {
        validate_amounts(amount, fee, vat, None)?;
        if !amount.is_positive() {
            return Err(LedgerError::invalid_amount(amount));
        }

        let now = self.clock.now();
        let exchange = self.store.transaction(|tx| {
            let original = rows::fetch_required::<Exchange>(tx, payout)?;
            if !original.is_payout() || original.status != ExchangeStatus::Succeeded {
                return Err(LedgerError::invalid_transition(
                    "exchange",
                    payout,
                    original.status,
                    "refunded",
                ));
            }
            if original.amount.currency != amount.currency {
                return Err(LedgerError::currency_mismatch(original.amount.currency, amount.currency));
            }

            let draft = Exchange {
                id: 0,
                timestamp: now,
                amount,
                fee,
                vat,
                participant: original.participant,
                status: ExchangeStatus::Pre,
                route: original.route,
                network: original.network,
                remote_id: None,
                note: None,
                wallet_id: 0,
                refund_ref: Some(payout),
                repudiation: None,
            };
            insert_exchange(tx, draft, now, &self.config.quarantine)
        })?;

        tracing::info!(exchange = exchange.id, payout, amount = %amount, "recorded payout refund");
        self.publish(vec![LedgerEvent::ExchangeRecorded {
            exchange: exchange.clone(),
        }]);
        Ok(exchange)
    }

    /// Move an exchange to a new status and apply its financial effect
    ///
    /// Returns `None` without changing anything when the exchange already has
    /// that status or is already final, so duplicate processor callbacks are
    /// harmless.
    pub fn record_exchange_result(
        &self,
        exchange_id: ExchangeId,
        remote_id: Option<String>,
        status: ExchangeStatus,
        error: Option<String>,
        participant: HolderId,
    ) -> Result<Option<Exchange>, LedgerError> {
        let now = self.clock.now();
        let updated = self.store.transaction(|tx| {
            let current = rows::fetch_required::<Exchange>(tx, exchange_id)?;
            if current.participant != participant {
                return Err(LedgerError::invariant(format!(
                    "exchange {} belongs to participant {}, not {}",
                    exchange_id, current.participant, participant
                )));
            }
            if current.status == status || current.status.is_terminal() {
                return Ok(None);
            }
            if status == ExchangeStatus::PreMandate {
                return Err(LedgerError::invalid_transition(
                    "exchange",
                    exchange_id,
                    current.status,
                    status,
                ));
            }

            let mut after = current.clone();
            after.status = status;
            if remote_id.is_some() {
                after.remote_id = remote_id.clone();
            }
            after.note = error.clone();
            if !rows::update(tx, &current, &after)? {
                return Ok(None);
            }

            let fee = after.fee.clamp_non_negative();
            let effect = match (status, after.is_payin()) {
                (ExchangeStatus::Succeeded, true) => Some(after.amount.checked_sub(fee)?),
                (ExchangeStatus::Failed, false) => Some((-after.amount).checked_add(fee)?),
                _ => None,
            };
            if let Some(amount) = effect {
                propagate_exchange(tx, &after, amount, now, &self.config.quarantine)?;
            }
            Ok(Some(after))
        })?;

        let Some(exchange) = updated else {
            tracing::debug!(exchange = exchange_id, %status, "exchange result already recorded");
            return Ok(None);
        };

        match status {
            ExchangeStatus::Failed => tracing::warn!(
                exchange = exchange.id,
                participant,
                error = exchange.note.as_deref().unwrap_or(""),
                "exchange failed"
            ),
            _ => tracing::info!(exchange = exchange.id, participant, %status, "exchange updated"),
        }
        if status.is_terminal() {
            self.registry.refresh_totals(participant);
            self.publish(vec![LedgerEvent::ExchangeFinalized {
                exchange: exchange.clone(),
            }]);
        }
        Ok(Some(exchange))
    }

    pub fn exchange(&self, id: ExchangeId) -> Result<Exchange, LedgerError> {
        self.store
            .transaction(|tx| rows::fetch_required::<Exchange>(tx, id))
    }
}
