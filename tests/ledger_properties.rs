//! Property tests for the ledger's conservation laws
//!
//! - Take resolution hands out exactly the team's income
//! - Payins and transfers never create or destroy money
//! - Merging a holder's bundles is idempotent and keeps their total

use cash_bundle_ledger::core::rows::fetch_all;
use cash_bundle_ledger::core::{
    bundles, resolve_takes, wallets, InMemoryRegistry, InstantSettlement, LedgerConfig,
    LedgerContext, LedgerStore, MemoryStore, TransferRequest,
};
use cash_bundle_ledger::types::{
    CashBundle, Currency, ExchangeRates, ExchangeStatus, HolderId, Money, Network, Participant,
    Route, Take, Tip, TransferContext, Wallet,
};
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use std::sync::Arc;

const TEAM: HolderId = 100;

fn eur(cents: i64) -> Money {
    Money::from_minor_units(cents as i128, Currency::Eur)
}

fn tips_strategy() -> impl Strategy<Value = Vec<(i64, bool)>> {
    prop::collection::vec((1i64..50_000, prop::bool::weighted(0.8)), 0..8)
}

fn takes_strategy() -> impl Strategy<Value = Vec<Option<i64>>> {
    prop::collection::vec(prop::option::weighted(0.85, 0i64..40_000), 1..8)
}

fn build(tips: &[(i64, bool)], takes: &[Option<i64>]) -> (Vec<Tip>, Vec<Take>) {
    let tips = tips
        .iter()
        .enumerate()
        .map(|(i, &(cents, is_funded))| Tip {
            tipper: i as HolderId + 1,
            tippee: TEAM,
            amount: eur(cents),
            is_funded,
        })
        .collect();
    let takes = takes
        .iter()
        .enumerate()
        .map(|(i, cents)| Take::new(TEAM, 200 + i as HolderId, cents.map(eur)))
        .collect();
    (tips, takes)
}

proptest! {
    #[test]
    fn prop_take_resolution_conserves_income(tips in tips_strategy(), takes in takes_strategy()) {
        let (tips, takes) = build(&tips, &takes);
        let resolution = resolve_takes(TEAM, Currency::Eur, &tips, &takes, &ExchangeRates::new()).unwrap();

        let funded: i128 = tips.iter().filter(|t| t.is_funded).map(|t| t.amount.to_minor_units()).sum();
        let handed_out: i128 = resolution.transfers.iter().map(|t| t.amount.to_minor_units()).sum();
        prop_assert_eq!(resolution.total_income.to_minor_units(), funded);
        prop_assert_eq!(handed_out + resolution.leftover.to_minor_units(), funded);
        prop_assert!(!resolution.leftover.is_negative());
        prop_assert!(resolution.transfers.iter().all(|t| !t.amount.is_negative()));
    }

    #[test]
    fn prop_members_never_get_more_than_they_ask(tips in tips_strategy(), takes in takes_strategy()) {
        let (tips, takes) = build(&tips, &takes);
        let resolution = resolve_takes(TEAM, Currency::Eur, &tips, &takes, &ExchangeRates::new()).unwrap();

        for resolved in &resolution.takes {
            let nominal = resolved.nominal.map(|m| m.to_minor_units()).unwrap_or(0);
            prop_assert!(resolved.actual.to_minor_units() <= nominal);

            let paid: i128 = resolution
                .transfers
                .iter()
                .filter(|t| t.member == resolved.member)
                .map(|t| t.amount.to_minor_units())
                .sum();
            prop_assert_eq!(paid, resolved.actual.to_minor_units());
        }

        if resolution.total_requested.amount <= resolution.total_income.amount {
            for resolved in &resolution.takes {
                let nominal = resolved.nominal.map(|m| m.to_minor_units()).unwrap_or(0);
                prop_assert_eq!(resolved.actual.to_minor_units(), nominal);
            }
        } else {
            prop_assert!(resolution.leftover.is_zero());
        }
    }

    #[test]
    fn prop_payins_and_transfers_conserve_money(
        payins in prop::collection::vec((1u64..4, 100i64..10_000), 1..6),
        transfers in prop::collection::vec((1u64..4, 1u64..4, 1i64..8_000), 0..12),
    ) {
        let registry = Arc::new(InMemoryRegistry::new());
        for holder in 1..4 {
            registry.register(Participant::individual(holder, Currency::Eur));
        }
        let ctx = LedgerContext::new(MemoryStore::new(), registry)
            .with_config(LedgerConfig::new(Some(0), None));

        let mut credited = 0i128;
        for &(holder, cents) in &payins {
            let route = Route { id: holder, participant: holder, network: Network::Card };
            let exchange = ctx
                .record_exchange(&route, eur(cents), eur(0), eur(0), holder, ExchangeStatus::Pre)
                .unwrap();
            ctx.record_exchange_result(exchange.id, None, ExchangeStatus::Succeeded, None, holder)
                .unwrap();
            credited += cents as i128;
        }
        for &(tipper, tippee, cents) in &transfers {
            if tipper == tippee {
                continue;
            }
            // refusals for lack of money are part of the game
            let request = TransferRequest::new(tipper, tippee, eur(cents), TransferContext::Tip);
            let _ = ctx.transfer(&InstantSettlement, &request);
        }

        let (balances, held) = ctx
            .store
            .transaction(|tx| {
                let balances: i128 = fetch_all::<Wallet>(tx)?
                    .iter()
                    .map(|w| w.balance.to_minor_units())
                    .sum();
                let held: i128 = fetch_all::<CashBundle>(tx)?
                    .iter()
                    .map(|b| b.amount.to_minor_units())
                    .sum();
                Ok((balances, held))
            })
            .unwrap();
        prop_assert_eq!(balances, credited);
        prop_assert_eq!(held, credited);
        prop_assert!(ctx.audit().unwrap().is_empty());
    }

    #[test]
    fn prop_merge_is_idempotent(pieces in prop::collection::vec((1u64..4, 1i64..5_000), 1..12)) {
        let store = MemoryStore::new();
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let (first, second, before, after) = store
            .transaction(|tx| {
                let wallet = wallets::current_wallet(tx, 1, Currency::Eur)?;
                for &(origin, cents) in &pieces {
                    wallets::adjust_balance(tx, wallet.remote_id, eur(cents))?;
                    bundles::create(tx, 1, origin, ts, eur(cents), wallet.remote_id)?;
                }
                let before = bundles::bundles_of(tx, 1, Currency::Eur)?;
                let first = bundles::merge(tx, 1)?;
                let second = bundles::merge(tx, 1)?;
                let after = bundles::bundles_of(tx, 1, Currency::Eur)?;
                Ok((first, second, before, after))
            })
            .unwrap();

        let total = |list: &[CashBundle]| list.iter().map(|b| b.amount.to_minor_units()).sum::<i128>();
        prop_assert_eq!(second, 0);
        prop_assert_eq!(before.len() - first, after.len());
        prop_assert_eq!(total(&before), total(&after));

        let mut origins: Vec<u64> = after.iter().map(|b| b.origin).collect();
        origins.sort_unstable();
        origins.dedup();
        prop_assert_eq!(origins.len(), after.len());
    }
}
