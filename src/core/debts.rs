//! Debts
//!
//! A debt records money a holder owes another because of a reverted payin.
//! Debts are created `due`, and end up either `paid` (through a transfer from
//! debtor to creditor) or `void`.

use crate::core::context::LedgerContext;
use crate::core::rows::{self, fetch_all};
use crate::core::traits::{LedgerStore, LedgerTx, PaymentProcessor, Table};
use crate::core::transfers::TransferRequest;
use crate::types::{
    Debt, DebtId, DebtStatus, ExchangeId, HolderId, LedgerError, LedgerEvent, Money,
    TransferContext, TransferStatus,
};
use chrono::{DateTime, Utc};

pub(crate) fn insert_debt(
    tx: &mut dyn LedgerTx,
    debtor: HolderId,
    creditor: HolderId,
    amount: Money,
    origin: ExchangeId,
    now: DateTime<Utc>,
) -> Result<Debt, LedgerError> {
    if !amount.is_positive() {
        return Err(LedgerError::invalid_amount(amount));
    }
    let debt = Debt {
        id: tx.next_id(Table::Debts),
        timestamp: now,
        debtor,
        creditor,
        amount,
        status: DebtStatus::Due,
        origin,
        settlement: None,
    };
    rows::insert(tx, &debt)?;
    tracing::info!(debt = debt.id, debtor, creditor, amount = %amount, origin, "recorded debt");
    Ok(debt)
}

fn due_debt(tx: &dyn LedgerTx, id: DebtId, to: DebtStatus) -> Result<Debt, LedgerError> {
    let debt = rows::fetch_required::<Debt>(tx, id)?;
    if debt.status != DebtStatus::Due {
        return Err(LedgerError::invalid_transition("debt", id, debt.status, to));
    }
    Ok(debt)
}

impl<S: LedgerStore> LedgerContext<S> {
    pub fn create_debt(
        &self,
        debtor: HolderId,
        creditor: HolderId,
        amount: Money,
        origin: ExchangeId,
    ) -> Result<Debt, LedgerError> {
        let now = self.clock.now();
        let debt = self
            .store
            .transaction(|tx| insert_debt(tx, debtor, creditor, amount, origin, now))?;
        self.publish(vec![LedgerEvent::DebtCreated { debt: debt.clone() }]);
        Ok(debt)
    }

    /// Pay a due debt with a transfer from the debtor to the creditor
    ///
    /// The debt stays `due` if the transfer fails; the returned debt shows
    /// which way it went.
    pub fn settle_debt(
        &self,
        processor: &dyn PaymentProcessor,
        id: DebtId,
    ) -> Result<Debt, LedgerError> {
        let debt = self
            .store
            .transaction(|tx| due_debt(tx, id, DebtStatus::Paid))?;

        let request = TransferRequest::new(debt.debtor, debt.creditor, debt.amount, TransferContext::Debt);
        let receipt = self.transfer(processor, &request)?;
        if receipt.transfer.status != TransferStatus::Succeeded {
            tracing::warn!(debt = id, transfer = receipt.transfer.id, "debt settlement failed");
            return Ok(debt);
        }

        let paid = self.store.transaction(|tx| {
            let current = due_debt(tx, id, DebtStatus::Paid)?;
            let paid = Debt {
                status: DebtStatus::Paid,
                settlement: Some(receipt.transfer.id),
                ..current
            };
            rows::save(tx, &paid)?;
            Ok(paid)
        })?;
        tracing::info!(debt = id, transfer = receipt.transfer.id, "debt settled");
        self.publish(vec![LedgerEvent::DebtSettled { debt: paid.clone() }]);
        Ok(paid)
    }

    pub fn void_debt(&self, id: DebtId) -> Result<Debt, LedgerError> {
        let void = self.store.transaction(|tx| {
            let current = due_debt(tx, id, DebtStatus::Void)?;
            let void = Debt {
                status: DebtStatus::Void,
                ..current
            };
            rows::save(tx, &void)?;
            Ok(void)
        })?;
        tracing::info!(debt = id, "debt voided");
        Ok(void)
    }

    /// Debts where `holder` is either side
    pub fn debts_of(&self, holder: HolderId) -> Result<Vec<Debt>, LedgerError> {
        self.store.transaction(|tx| {
            Ok(fetch_all::<Debt>(tx)?
                .into_iter()
                .filter(|d| d.debtor == holder || d.creditor == holder)
                .collect())
        })
    }
}
