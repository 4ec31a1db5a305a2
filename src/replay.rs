//! Replay of ledger scripts
//!
//! Drives a CSV script through a fresh in-memory ledger, then audits it and
//! writes the current wallets. Holders are registered on first sight as
//! individuals with a card route; exchanges are referred to by the labels
//! given in the script's `reference` column.
//!
//! Errors of individual steps are logged and the replay carries on, the same
//! way a processor callback failing doesn't stop the platform.

use crate::core::rows::fetch_all;
use crate::core::{
    InMemoryRegistry, InstantSettlement, LedgerConfig, LedgerContext, LedgerStore, MemoryStore,
    TracingSink, TransferRequest,
};
use crate::io::{write_wallets_csv, ScriptReader, WalletSummary};
use crate::types::{
    CashBundle, Currency, ExchangeId, ExchangeStatus, HolderId, LedgerError, Money, Network,
    Participant, Route, ScriptOp, ScriptStep, TransferContext, Wallet,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplayError {
    #[error("Unknown reference '{0}'")]
    UnknownReference(String),

    #[error("Reference '{0}' is already used")]
    DuplicateReference(String),

    #[error("{op} step is missing its {field}")]
    MissingField { op: ScriptOp, field: &'static str },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Replays script steps against an in-memory ledger
pub struct Replayer {
    ctx: LedgerContext<MemoryStore>,
    registry: Arc<InMemoryRegistry>,
    references: HashMap<String, ExchangeId>,
}

impl Replayer {
    pub fn new(config: LedgerConfig) -> Self {
        let registry = Arc::new(InMemoryRegistry::new());
        for holder in [config.chargebacks_holder, config.platform_holder] {
            registry.register(Participant::individual(holder, Currency::Eur));
        }
        let ctx = LedgerContext::new(MemoryStore::new(), registry.clone())
            .with_events(Arc::new(TracingSink))
            .with_config(config);
        Replayer {
            ctx,
            registry,
            references: HashMap::new(),
        }
    }

    pub fn context(&self) -> &LedgerContext<MemoryStore> {
        &self.ctx
    }

    /// Replay a whole script file and write the resulting wallets to `output`
    ///
    /// # Returns
    ///
    /// * `Ok(())` if the script was replayed (step errors are only logged)
    /// * `Err(String)` if the file couldn't be read or the output written
    pub fn process(&mut self, input_path: &Path, output: &mut dyn Write) -> Result<(), String> {
        let reader = ScriptReader::new(input_path)?;

        for result in reader {
            match result {
                Ok(step) => {
                    if let Err(e) = self.apply(&step) {
                        tracing::warn!(op = %step.op, holder = step.holder, error = %e, "step rejected");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "CSV parsing error"),
            }
        }

        let discrepancies = self.ctx.audit().map_err(|e| format!("Audit failed: {}", e))?;
        if !discrepancies.is_empty() {
            tracing::error!(count = discrepancies.len(), "ledger audit found discrepancies");
        }

        let wallets = self
            .wallets()
            .map_err(|e| format!("Failed to list wallets: {}", e))?;
        write_wallets_csv(&wallets, output)
    }

    /// Apply one step
    pub fn apply(&mut self, step: &ScriptStep) -> Result<(), ReplayError> {
        match step.op {
            ScriptOp::Payin => self.payin(step, ExchangeStatus::Succeeded),
            ScriptOp::PayinFailed => self.payin(step, ExchangeStatus::Failed),
            ScriptOp::Payout => self.payout(step),
            ScriptOp::PayoutSucceeded => self.payout_result(step, ExchangeStatus::Succeeded),
            ScriptOp::PayoutFailed => self.payout_result(step, ExchangeStatus::Failed),
            ScriptOp::Transfer => self.transfer(step),
            ScriptOp::Dispute => self.dispute(step),
        }
    }

    /// Current wallets with the number of bundles each one holds
    pub fn wallets(&self) -> Result<Vec<WalletSummary>, LedgerError> {
        self.ctx.store.transaction(|tx| {
            let bundles = fetch_all::<CashBundle>(tx)?;
            Ok(fetch_all::<Wallet>(tx)?
                .into_iter()
                .filter(|w| w.is_current)
                .map(|w| WalletSummary {
                    holder: w.owner,
                    balance: w.balance,
                    bundles: bundles
                        .iter()
                        .filter(|b| b.owner == Some(w.owner) && b.wallet_id == Some(w.remote_id))
                        .count(),
                })
                .collect())
        })
    }

    fn ensure_holder(&self, holder: HolderId, currency: Currency) {
        if !self.registry.is_registered(holder) {
            tracing::debug!(holder, %currency, "registering holder");
            self.registry.register(Participant::individual(holder, currency));
        }
    }

    fn route(holder: HolderId) -> Route {
        Route {
            id: holder,
            participant: holder,
            network: Network::Card,
        }
    }

    fn amount(step: &ScriptStep) -> Result<Money, ReplayError> {
        step.amount.ok_or(ReplayError::MissingField {
            op: step.op,
            field: "amount",
        })
    }

    fn reference(step: &ScriptStep) -> Result<&str, ReplayError> {
        step.reference.as_deref().ok_or(ReplayError::MissingField {
            op: step.op,
            field: "reference",
        })
    }

    fn lookup(&self, step: &ScriptStep) -> Result<ExchangeId, ReplayError> {
        let label = Self::reference(step)?;
        self.references
            .get(label)
            .copied()
            .ok_or_else(|| ReplayError::UnknownReference(label.to_string()))
    }

    fn remember(&mut self, step: &ScriptStep, id: ExchangeId) {
        if let Some(label) = &step.reference {
            self.references.insert(label.clone(), id);
        }
    }

    fn check_unused(&self, step: &ScriptStep) -> Result<(), ReplayError> {
        match &step.reference {
            Some(label) if self.references.contains_key(label) => {
                Err(ReplayError::DuplicateReference(label.clone()))
            }
            _ => Ok(()),
        }
    }

    fn payin(&mut self, step: &ScriptStep, status: ExchangeStatus) -> Result<(), ReplayError> {
        self.check_unused(step)?;
        let amount = Self::amount(step)?;
        let fee = step.fee.unwrap_or(Money::zero(amount.currency));
        self.ensure_holder(step.holder, amount.currency);

        let exchange = self.ctx.record_exchange(
            &Self::route(step.holder),
            amount,
            fee,
            Money::zero(amount.currency),
            step.holder,
            ExchangeStatus::Pre,
        )?;
        self.remember(step, exchange.id);

        let error = (status == ExchangeStatus::Failed).then(|| "declined".to_string());
        self.ctx.record_exchange_result(
            exchange.id,
            Some(format!("replay-{}", exchange.id)),
            status,
            error,
            step.holder,
        )?;
        Ok(())
    }

    fn payout(&mut self, step: &ScriptStep) -> Result<(), ReplayError> {
        self.check_unused(step)?;
        let amount = Self::amount(step)?;
        let fee = step.fee.unwrap_or(Money::zero(amount.currency));
        self.ensure_holder(step.holder, amount.currency);

        let exchange = self.ctx.record_exchange(
            &Self::route(step.holder),
            -amount,
            fee,
            Money::zero(amount.currency),
            step.holder,
            ExchangeStatus::Pre,
        )?;
        self.remember(step, exchange.id);
        Ok(())
    }

    fn payout_result(&mut self, step: &ScriptStep, status: ExchangeStatus) -> Result<(), ReplayError> {
        let id = self.lookup(step)?;
        let error = (status == ExchangeStatus::Failed).then(|| "rejected by the bank".to_string());
        let updated = self
            .ctx
            .record_exchange_result(id, None, status, error, step.holder)?;
        if updated.is_none() {
            tracing::debug!(exchange = id, %status, "payout result ignored");
        }
        Ok(())
    }

    fn transfer(&mut self, step: &ScriptStep) -> Result<(), ReplayError> {
        let amount = Self::amount(step)?;
        let tippee = step.counterparty.ok_or(ReplayError::MissingField {
            op: step.op,
            field: "counterparty",
        })?;
        self.ensure_holder(step.holder, amount.currency);
        self.ensure_holder(tippee, amount.currency);

        let request = TransferRequest::new(step.holder, tippee, amount, TransferContext::Tip);
        self.ctx.transfer(&InstantSettlement, &request)?;
        Ok(())
    }

    fn dispute(&mut self, step: &ScriptStep) -> Result<(), ReplayError> {
        let id = self.lookup(step)?;
        let label = Self::reference(step)?;
        let exchange = self.ctx.exchange(id)?;
        let lost = exchange.amount.checked_add(exchange.fee)?;

        self.ctx.lock_disputed_funds(id, lost)?;
        let recovery = self
            .ctx
            .recover_lost_funds(&InstantSettlement, id, lost, label)?;
        tracing::info!(
            exchange = id,
            recovered = %recovery.recovered,
            debts = recovery.debts.len(),
            "dispute replayed"
        );
        Ok(())
    }
}
