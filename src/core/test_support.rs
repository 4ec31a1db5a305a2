//! Fixtures shared by the unit tests of the core modules

use crate::core::collaborators::{CollectingSink, InMemoryRegistry, ManualClock};
use crate::core::context::{LedgerConfig, LedgerContext, QuarantinePolicy};
use crate::core::memory_store::MemoryStore;
use crate::core::rows;
use crate::core::traits::{LedgerStore, LedgerTx, Table};
use crate::core::wallets;
use crate::types::{
    CashBundle, Currency, Exchange, ExchangeId, ExchangeStatus, HolderId, Money, Network,
    Participant,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

pub fn eur(cents: i64) -> Money {
    Money::new(Decimal::new(cents, 2), Currency::Eur)
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

pub struct Harness {
    pub ctx: LedgerContext<MemoryStore>,
    pub registry: Arc<InMemoryRegistry>,
    pub events: Arc<CollectingSink>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    /// Context with the given holders registered and no quarantine
    pub fn new(holders: &[HolderId]) -> Self {
        let config = LedgerConfig {
            quarantine: QuarantinePolicy::uniform(Duration::zero()),
            ..LedgerConfig::default()
        };
        Self::with_config(holders, config)
    }

    pub fn with_config(holders: &[HolderId], config: LedgerConfig) -> Self {
        let registry = Arc::new(InMemoryRegistry::new());
        for &holder in holders {
            registry.register(Participant::individual(holder, Currency::Eur));
        }
        registry.register(Participant::individual(config.chargebacks_holder, Currency::Eur));
        registry.register(Participant::individual(config.platform_holder, Currency::Eur));

        let events = Arc::new(CollectingSink::new());
        let clock = Arc::new(ManualClock::new(epoch()));
        let ctx = LedgerContext::new(MemoryStore::new(), registry.clone())
            .with_events(events.clone())
            .with_clock(clock.clone())
            .with_config(config);

        Harness {
            ctx,
            registry,
            events,
            clock,
        }
    }

    pub fn balance(&self, holder: HolderId) -> Money {
        self.ctx
            .store
            .transaction(|tx| wallets::current_wallet(tx, holder, Currency::Eur))
            .map(|w| w.balance)
            .unwrap()
    }

    pub fn bundles(&self, holder: HolderId) -> Vec<CashBundle> {
        self.ctx
            .store
            .transaction(|tx| crate::core::bundles::bundles_of(tx, holder, Currency::Eur))
            .unwrap()
    }

    pub fn all_bundles(&self) -> Vec<CashBundle> {
        self.ctx
            .store
            .transaction(|tx| rows::fetch_all::<CashBundle>(tx))
            .unwrap()
    }
}

/// Insert a succeeded payin row without touching balances or bundles
pub fn insert_payin(
    tx: &mut dyn LedgerTx,
    participant: HolderId,
    network: Network,
    amount: Money,
) -> ExchangeId {
    let wallet = wallets::current_wallet(tx, participant, amount.currency).unwrap();
    let id = tx.next_id(Table::Exchanges);
    let exchange = Exchange {
        id,
        timestamp: epoch(),
        amount,
        fee: Money::zero(amount.currency),
        vat: Money::zero(amount.currency),
        participant,
        status: ExchangeStatus::Succeeded,
        route: participant,
        network,
        remote_id: None,
        note: None,
        wallet_id: wallet.remote_id,
        refund_ref: None,
        repudiation: None,
    };
    rows::insert(tx, &exchange).unwrap();
    id
}

/// Give `owner` a bundle of `amount` and the matching wallet balance
pub fn seed_bundle(
    tx: &mut dyn LedgerTx,
    owner: HolderId,
    origin: ExchangeId,
    amount: Money,
    ts: DateTime<Utc>,
) -> CashBundle {
    let wallet = wallets::current_wallet(tx, owner, amount.currency).unwrap();
    wallets::adjust_balance(tx, wallet.remote_id, amount).unwrap();
    crate::core::bundles::create(tx, owner, origin, ts, amount, wallet.remote_id).unwrap()
}
