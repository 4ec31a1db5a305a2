//! Transfer engine
//!
//! Internal movements of money between two holders. A transfer goes through
//! three steps:
//!
//! 1. `prepare_transfer` inserts the row in `pre` status and locks the exact
//!    cash bundles that will move.
//! 2. `execute_transfer` hands the prepared transfer to the payment processor.
//! 3. `record_transfer_result` either gives the locked bundles to the tippee
//!    and moves the balances, or releases the bundles to the tipper.
//!
//! `transfer` runs the three steps in a row.

use crate::core::bundles;
use crate::core::context::LedgerContext;
use crate::core::rows;
use crate::core::takes::{resolve_takes, TakeResolution, TransferInstruction};
use crate::core::traits::{LedgerStore, LedgerTx, PaymentProcessor, ProcessorOutcome, Table};
use crate::core::wallets;
use crate::types::{
    BundleId, Currency, HolderId, LedgerError, LedgerEvent, Money, Take, Tip, Transfer,
    TransferContext, TransferId, TransferStatus,
};
use chrono::{DateTime, Utc};

/// Parameters of a new transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub tipper: HolderId,
    pub tippee: HolderId,
    pub amount: Money,
    pub context: TransferContext,
    pub team: Option<HolderId>,
    /// Bundles to move, instead of letting the ledger pick them
    pub bundles: Option<Vec<BundleId>>,
}

impl TransferRequest {
    pub fn new(tipper: HolderId, tippee: HolderId, amount: Money, context: TransferContext) -> Self {
        TransferRequest {
            tipper,
            tippee,
            amount,
            context,
            team: None,
            bundles: None,
        }
    }

    pub fn with_team(mut self, team: HolderId) -> Self {
        self.team = Some(team);
        self
    }

    pub fn with_bundles(mut self, bundles: Vec<BundleId>) -> Self {
        self.bundles = Some(bundles);
        self
    }
}

/// Outcome of a complete transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReceipt {
    pub transfer: Transfer,
    /// New balance of the tippee's wallet, `None` if the transfer failed
    pub tippee_balance: Option<Money>,
}

/// Outcome of `distribute_team_income`
#[derive(Debug, Clone)]
pub struct TeamDistribution {
    pub resolution: TakeResolution,
    pub receipts: Vec<TransferReceipt>,
    /// Instructions that couldn't be carried out, with the reason
    pub failures: Vec<(TransferInstruction, LedgerError)>,
}

pub(crate) fn prepare_in(
    tx: &mut dyn LedgerTx,
    request: &TransferRequest,
    now: DateTime<Utc>,
) -> Result<Transfer, LedgerError> {
    let currency = request.amount.currency;
    let wallet_from = wallets::current_wallet(tx, request.tipper, currency)?;
    let wallet_to = wallets::current_wallet(tx, request.tippee, currency)?;

    let transfer = Transfer {
        id: tx.next_id(Table::Transfers),
        timestamp: now,
        tipper: request.tipper,
        tippee: request.tippee,
        amount: request.amount,
        context: request.context,
        team: request.team,
        status: TransferStatus::Pre,
        error: None,
        wallet_from: wallet_from.remote_id,
        wallet_to: wallet_to.remote_id,
    };
    rows::insert(tx, &transfer)?;

    match &request.bundles {
        Some(selected) => {
            bundles::lock_bundles(tx, request.tipper, transfer.id, selected, request.amount)?
        }
        None => {
            bundles::lock_for(tx, request.tipper, transfer.id, request.amount, request.team)
                .map_err(|e| match e {
                    LedgerError::InsufficientFunds { .. } => LedgerError::NegativeBalance {
                        wallet: wallet_from.remote_id,
                    },
                    other => other,
                })?;
        }
    }
    Ok(transfer)
}

fn record_result_in(
    tx: &mut dyn LedgerTx,
    transfer_id: TransferId,
    status: TransferStatus,
    error: Option<String>,
) -> Result<Option<(Transfer, Option<Money>)>, LedgerError> {
    if status == TransferStatus::Pre {
        return Err(LedgerError::invalid_transition(
            "transfer",
            transfer_id,
            TransferStatus::Pre,
            status,
        ));
    }

    let current = rows::fetch_required::<Transfer>(tx, transfer_id)?;
    if current.status == status {
        return Ok(None);
    }
    if current.status.is_terminal() {
        return Err(LedgerError::invalid_transition(
            "transfer",
            transfer_id,
            current.status,
            status,
        ));
    }

    let succeeded = status == TransferStatus::Succeeded;
    let mut tippee_balance = None;
    let moved = if succeeded {
        let credit = wallets::adjust_balance(tx, current.wallet_to, current.amount)?;
        wallets::adjust_balance(tx, current.wallet_from, -current.amount)?;
        tippee_balance = Some(credit);
        bundles::unlock(tx, transfer_id, Some((current.tippee, current.wallet_to)))?
    } else {
        bundles::unlock(tx, transfer_id, None)?
    };

    let total = Money::sum(moved.iter().map(|b| b.amount), current.amount.currency)?;
    if total != current.amount {
        tracing::error!(
            transfer = transfer_id,
            bundles = %total,
            amount = %current.amount,
            "locked bundles don't match the transfer amount"
        );
        return Err(LedgerError::invariant(format!(
            "transfer {} moved {} of bundles for an amount of {}",
            transfer_id, total, current.amount
        )));
    }

    let mut after = current.clone();
    after.status = status;
    after.error = error;
    rows::save(tx, &after)?;

    bundles::merge(tx, current.tippee)?;
    if !succeeded {
        bundles::merge(tx, current.tipper)?;
    }
    Ok(Some((after, tippee_balance)))
}

impl<S: LedgerStore> LedgerContext<S> {
    /// Insert a transfer in `pre` status and lock the bundles it will move
    ///
    /// # Errors
    ///
    /// `NegativeBalance` when the tipper doesn't have enough unlocked money,
    /// `AccountSuspended` when the tipper is suspended, `InvalidAmount` for a
    /// non-positive amount.
    pub fn prepare_transfer(&self, request: &TransferRequest) -> Result<Transfer, LedgerError> {
        if !request.amount.is_positive() {
            return Err(LedgerError::invalid_amount(request.amount));
        }
        let tipper = self.registry.participant(request.tipper)?;
        self.registry.participant(request.tippee)?;
        if tipper.is_suspended && request.context != TransferContext::Chargeback {
            return Err(LedgerError::AccountSuspended {
                holder: request.tipper,
            });
        }

        let now = self.clock.now();
        let transfer = self.store.transaction(|tx| prepare_in(tx, request, now))?;
        tracing::debug!(
            transfer = transfer.id,
            tipper = transfer.tipper,
            tippee = transfer.tippee,
            amount = %transfer.amount,
            "prepared transfer"
        );
        Ok(transfer)
    }

    /// Ask the payment processor to carry out a prepared transfer
    ///
    /// The amount sent is the total of the locked bundles, which must match
    /// the transfer amount.
    pub fn execute_transfer(
        &self,
        processor: &dyn PaymentProcessor,
        transfer: &Transfer,
    ) -> Result<ProcessorOutcome, LedgerError> {
        let locked = self
            .store
            .transaction(|tx| bundles::locked_for(tx, transfer.id))?;
        let total = Money::sum(locked.iter().map(|b| b.amount), transfer.amount.currency)?;
        if total != transfer.amount {
            return Err(LedgerError::invariant(format!(
                "transfer {} has {} of locked bundles for an amount of {}",
                transfer.id, total, transfer.amount
            )));
        }

        let outbound = Transfer {
            amount: total,
            ..transfer.clone()
        };
        processor.execute_transfer(&outbound)
    }

    /// Finalize a transfer
    ///
    /// Returns the tippee's new balance when the transfer succeeded, `None`
    /// when it failed or when the same result was already recorded.
    pub fn record_transfer_result(
        &self,
        transfer_id: TransferId,
        status: TransferStatus,
        error: Option<String>,
    ) -> Result<Option<Money>, LedgerError> {
        let outcome = self
            .store
            .transaction(|tx| record_result_in(tx, transfer_id, status, error))
            .inspect_err(|e| {
                if e.is_fatal() {
                    tracing::error!(transfer = transfer_id, error = %e, "ledger invariant violated");
                }
            })?;

        let Some((transfer, tippee_balance)) = outcome else {
            return Ok(None);
        };
        self.registry.refresh_totals(transfer.tipper);
        self.registry.refresh_totals(transfer.tippee);

        let event = if transfer.status == TransferStatus::Succeeded {
            tracing::info!(
                transfer = transfer.id,
                tipper = transfer.tipper,
                tippee = transfer.tippee,
                amount = %transfer.amount,
                "transfer succeeded"
            );
            LedgerEvent::TransferSucceeded { transfer }
        } else {
            tracing::warn!(
                transfer = transfer.id,
                error = transfer.error.as_deref().unwrap_or(""),
                "transfer failed"
            );
            LedgerEvent::TransferFailed { transfer }
        };
        self.publish(vec![event]);
        Ok(tippee_balance)
    }

    /// Prepare, execute and finalize a transfer
    ///
    /// A processor error is returned as is and leaves the transfer in `pre`
    /// status, with its bundles locked, for later reconciliation.
    pub fn transfer(
        &self,
        processor: &dyn PaymentProcessor,
        request: &TransferRequest,
    ) -> Result<TransferReceipt, LedgerError> {
        let prepared = self.prepare_transfer(request)?;
        let outcome = match self.execute_transfer(processor, &prepared) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(transfer = prepared.id, error = %e, "transfer left pending");
                return Err(e);
            }
        };

        let tippee_balance =
            self.record_transfer_result(prepared.id, outcome.status, outcome.error)?;
        let transfer = self.transfer_row(prepared.id)?;
        Ok(TransferReceipt {
            transfer,
            tippee_balance,
        })
    }

    /// Pay a team's members out of its funded tips
    ///
    /// Runs the take allocator, stores the granted amounts on `takes`, then
    /// carries out one transfer per positive instruction. Policy failures of
    /// individual transfers are collected; fatal errors abort.
    pub fn distribute_team_income(
        &self,
        processor: &dyn PaymentProcessor,
        team: HolderId,
        currency: Currency,
        tips: &[Tip],
        takes: &mut [Take],
    ) -> Result<TeamDistribution, LedgerError> {
        let resolution = resolve_takes(team, currency, tips, takes, &self.rates)?;
        resolution.apply(takes);

        let mut receipts = Vec::new();
        let mut failures = Vec::new();
        for instruction in resolution.transfers.iter().filter(|i| i.amount.is_positive()) {
            let request = TransferRequest::new(
                instruction.tipper,
                instruction.member,
                instruction.amount,
                TransferContext::Take,
            )
            .with_team(team);
            match self.transfer(processor, &request) {
                Ok(receipt) => receipts.push(receipt),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        team,
                        tipper = instruction.tipper,
                        member = instruction.member,
                        error = %e,
                        "take transfer not carried out"
                    );
                    failures.push((instruction.clone(), e));
                }
            }
        }

        tracing::info!(
            team,
            transfers = receipts.len(),
            failures = failures.len(),
            leftover = %resolution.leftover,
            "distributed team income"
        );
        Ok(TeamDistribution {
            resolution,
            receipts,
            failures,
        })
    }

    pub fn transfer_row(&self, id: TransferId) -> Result<Transfer, LedgerError> {
        self.store
            .transaction(|tx| rows::fetch_required::<Transfer>(tx, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::collaborators::InstantSettlement;
    use crate::core::test_support::{epoch, eur, insert_payin, seed_bundle, Harness};
    use crate::types::{CashBundle, Network};

    struct Declining;

    impl PaymentProcessor for Declining {
        fn execute_transfer(&self, _transfer: &Transfer) -> Result<ProcessorOutcome, LedgerError> {
            Ok(ProcessorOutcome {
                remote_id: "declined".into(),
                status: TransferStatus::Failed,
                error: Some("insufficient processor funds".into()),
            })
        }
    }

    struct Unreachable;

    impl PaymentProcessor for Unreachable {
        fn execute_transfer(&self, _transfer: &Transfer) -> Result<ProcessorOutcome, LedgerError> {
            Err(LedgerError::processor("connection reset"))
        }
    }

    fn fund(h: &Harness, holder: HolderId, cents: i64) {
        h.ctx
            .store
            .transaction(|tx| {
                let origin = insert_payin(tx, holder, Network::Card, eur(cents));
                seed_bundle(tx, holder, origin, eur(cents), epoch());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_successful_transfer_moves_bundles_and_balances() {
        let h = Harness::new(&[1, 2]);
        fund(&h, 1, 1000);

        let request = TransferRequest::new(1, 2, eur(400), TransferContext::Tip);
        let receipt = h.ctx.transfer(&InstantSettlement, &request).unwrap();
        assert_eq!(receipt.transfer.status, TransferStatus::Succeeded);
        assert_eq!(receipt.tippee_balance, Some(eur(400)));
        assert_eq!(h.balance(1), eur(600));
        assert_eq!(h.balance(2), eur(400));

        let received: Vec<CashBundle> = h.bundles(2);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].amount, eur(400));
        assert_eq!(received[0].locked_for, None);
        assert_eq!(h.events.names(), vec!["transfer_succeeded"]);
    }

    #[test]
    fn test_failed_transfer_releases_the_bundles() {
        let h = Harness::new(&[1, 2]);
        fund(&h, 1, 1000);

        let request = TransferRequest::new(1, 2, eur(400), TransferContext::Tip);
        let receipt = h.ctx.transfer(&Declining, &request).unwrap();
        assert_eq!(receipt.transfer.status, TransferStatus::Failed);
        assert_eq!(receipt.tippee_balance, None);
        assert_eq!(h.balance(1), eur(1000));
        assert_eq!(h.balance(2), eur(0));

        let bundles = h.bundles(1);
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].amount, eur(1000));
    }

    #[test]
    fn test_processor_error_leaves_the_transfer_pending() {
        let h = Harness::new(&[1, 2]);
        fund(&h, 1, 1000);

        let request = TransferRequest::new(1, 2, eur(400), TransferContext::Tip);
        let result = h.ctx.transfer(&Unreachable, &request);
        assert!(matches!(result, Err(LedgerError::Processor { .. })));

        let pending = h.ctx.transfer_row(1).unwrap();
        assert_eq!(pending.status, TransferStatus::Pre);
        assert_eq!(h.balance(1), eur(1000));

        h.ctx
            .record_transfer_result(pending.id, TransferStatus::Succeeded, None)
            .unwrap();
        assert_eq!(h.balance(2), eur(400));
    }

    #[test]
    fn test_insufficient_funds_surface_as_negative_balance() {
        let h = Harness::new(&[1, 2]);
        fund(&h, 1, 300);

        let request = TransferRequest::new(1, 2, eur(400), TransferContext::Tip);
        let result = h.ctx.prepare_transfer(&request);
        assert!(matches!(result, Err(LedgerError::NegativeBalance { .. })));
        assert!(h.ctx.transfer_row(1).is_err());
    }

    #[test]
    fn test_record_result_twice() {
        let h = Harness::new(&[1, 2]);
        fund(&h, 1, 1000);
        let prepared = h
            .ctx
            .prepare_transfer(&TransferRequest::new(1, 2, eur(500), TransferContext::Tip))
            .unwrap();

        let first = h
            .ctx
            .record_transfer_result(prepared.id, TransferStatus::Succeeded, None)
            .unwrap();
        assert_eq!(first, Some(eur(500)));
        let second = h
            .ctx
            .record_transfer_result(prepared.id, TransferStatus::Succeeded, None)
            .unwrap();
        assert_eq!(second, None);
        assert_eq!(h.balance(2), eur(500));

        let flip = h
            .ctx
            .record_transfer_result(prepared.id, TransferStatus::Failed, None);
        assert!(matches!(flip, Err(LedgerError::InvalidStatusTransition { .. })));
    }

    #[test]
    fn test_preselected_bundles_must_match_the_amount() {
        let h = Harness::new(&[1, 2]);
        fund(&h, 1, 1000);
        let bundle = h.bundles(1)[0].id;

        let wrong = TransferRequest::new(1, 2, eur(400), TransferContext::Tip).with_bundles(vec![bundle]);
        assert!(matches!(
            h.ctx.prepare_transfer(&wrong),
            Err(LedgerError::InvariantViolation { .. })
        ));

        let exact = TransferRequest::new(1, 2, eur(1000), TransferContext::Tip).with_bundles(vec![bundle]);
        let receipt = h.ctx.transfer(&InstantSettlement, &exact).unwrap();
        assert_eq!(receipt.tippee_balance, Some(eur(1000)));
    }

    #[test]
    fn test_suspended_tipper_cannot_give() {
        let h = Harness::new(&[1, 2]);
        fund(&h, 1, 1000);
        h.registry.set_suspended(1, true).unwrap();

        let request = TransferRequest::new(1, 2, eur(100), TransferContext::Tip);
        assert_eq!(
            h.ctx.prepare_transfer(&request),
            Err(LedgerError::AccountSuspended { holder: 1 })
        );
    }

    #[test]
    fn test_distribute_team_income() {
        let h = Harness::new(&[1, 2, 10, 11, 100]);
        fund(&h, 1, 6000);
        fund(&h, 2, 4000);

        let tips = vec![
            Tip {
                tipper: 1,
                tippee: 100,
                amount: eur(6000),
                is_funded: true,
            },
            Tip {
                tipper: 2,
                tippee: 100,
                amount: eur(4000),
                is_funded: true,
            },
        ];
        let mut takes = vec![
            Take::new(100, 10, Some(eur(8000))),
            Take::new(100, 11, Some(eur(8000))),
        ];

        let distribution = h
            .ctx
            .distribute_team_income(&InstantSettlement, 100, Currency::Eur, &tips, &mut takes)
            .unwrap();
        assert!(distribution.failures.is_empty());
        assert_eq!(distribution.receipts.len(), 4);
        assert_eq!(h.balance(10), eur(5000));
        assert_eq!(h.balance(11), eur(5000));
        assert_eq!(h.balance(1), eur(0));
        assert_eq!(takes[1].actual_amount.get(Currency::Eur), eur(5000));
        assert!(distribution
            .receipts
            .iter()
            .all(|r| r.transfer.team == Some(100) && r.transfer.context == TransferContext::Take));
    }
}
