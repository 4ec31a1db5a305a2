//! Ledger context and configuration
//!
//! Every engine operation receives a `LedgerContext` explicitly instead of
//! reaching for process-wide state: it bundles the store, the collaborators
//! and the configuration.

use crate::core::collaborators::{NullSink, SystemClock};
use crate::core::traits::{Clock, EventSink, LedgerStore, ParticipantRegistry};
use crate::types::{ExchangeRates, HolderId, LedgerEvent, Network};
use chrono::Duration;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;

/// How long money must stay in the ledger before it can be withdrawn
///
/// The period depends on the network the money originally came in through.
#[derive(Debug, Clone)]
pub struct QuarantinePolicy {
    pub default: Duration,
    pub per_network: BTreeMap<Network, Duration>,
}

impl QuarantinePolicy {
    /// Same quarantine for every network
    pub fn uniform(period: Duration) -> Self {
        QuarantinePolicy {
            default: period,
            per_network: BTreeMap::new(),
        }
    }

    pub fn for_network(&self, network: Network) -> Duration {
        self.per_network
            .get(&network)
            .copied()
            .unwrap_or(self.default)
    }
}

impl Default for QuarantinePolicy {
    fn default() -> Self {
        let mut per_network = BTreeMap::new();
        per_network.insert(Network::BankWire, Duration::weeks(9));
        per_network.insert(Network::DirectDebit, Duration::weeks(9));
        QuarantinePolicy {
            default: Duration::weeks(3),
            per_network,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub quarantine: QuarantinePolicy,
    /// Largest accepted `fee / amount` ratio for payins
    pub max_fee_ratio: Decimal,
    /// Holding account receiving funds recovered from chargebacks
    pub chargebacks_holder: HolderId,
    /// The platform itself, creditor of unrecoverable processor fees
    pub platform_holder: HolderId,
}

/// Longest quarantine `LedgerConfig::new` accepts, about a century
pub const MAX_QUARANTINE_DAYS: i64 = 36_500;

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            quarantine: QuarantinePolicy::default(),
            max_fee_ratio: Decimal::new(10, 2),
            chargebacks_holder: u64::MAX - 1,
            platform_holder: u64::MAX,
        }
    }
}

impl LedgerConfig {
    /// Create a config with a uniform quarantine and a custom fee ceiling
    ///
    /// Out-of-range values are replaced by defaults with a warning.
    pub fn new(quarantine_days: Option<i64>, max_fee_ratio: Option<Decimal>) -> Self {
        let default = Self::default();

        let quarantine = match quarantine_days {
            Some(days) if !(0..=MAX_QUARANTINE_DAYS).contains(&days) => {
                tracing::warn!(days, "Invalid quarantine period, using default");
                default.quarantine.clone()
            }
            Some(days) => QuarantinePolicy::uniform(Duration::days(days)),
            None => default.quarantine.clone(),
        };

        let max_fee_ratio = match max_fee_ratio {
            Some(ratio) if ratio <= Decimal::ZERO || ratio > Decimal::ONE => {
                tracing::warn!(%ratio, "Invalid max fee ratio, using default");
                default.max_fee_ratio
            }
            Some(ratio) => ratio,
            None => default.max_fee_ratio,
        };

        Self {
            quarantine,
            max_fee_ratio,
            ..default
        }
    }
}

/// Everything an engine operation needs
pub struct LedgerContext<S: LedgerStore> {
    pub store: S,
    pub registry: Arc<dyn ParticipantRegistry>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    pub rates: ExchangeRates,
    pub config: LedgerConfig,
}

impl<S: LedgerStore> LedgerContext<S> {
    pub fn new(store: S, registry: Arc<dyn ParticipantRegistry>) -> Self {
        LedgerContext {
            store,
            registry,
            events: Arc::new(NullSink),
            clock: Arc::new(SystemClock),
            rates: ExchangeRates::new(),
            config: LedgerConfig::default(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_rates(mut self, rates: ExchangeRates) -> Self {
        self.rates = rates;
        self
    }

    pub fn with_config(mut self, config: LedgerConfig) -> Self {
        self.config = config;
        self
    }

    pub(crate) fn publish(&self, events: Vec<LedgerEvent>) {
        for event in &events {
            self.events.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_quarantine_is_longer_for_bank_wires() {
        let policy = QuarantinePolicy::default();
        assert_eq!(policy.for_network(Network::Card), Duration::weeks(3));
        assert_eq!(policy.for_network(Network::BankWire), Duration::weeks(9));
    }

    #[rstest]
    #[case::defaults(None, None, Duration::weeks(3), Decimal::new(10, 2))]
    #[case::custom(Some(0), Some(Decimal::new(5, 2)), Duration::zero(), Decimal::new(5, 2))]
    #[case::negative_days(Some(-1), None, Duration::weeks(3), Decimal::new(10, 2))]
    #[case::too_many_days(Some(i64::MAX), None, Duration::weeks(3), Decimal::new(10, 2))]
    #[case::longest_quarantine(Some(MAX_QUARANTINE_DAYS), None, Duration::days(36_500), Decimal::new(10, 2))]
    #[case::ratio_too_big(None, Some(Decimal::new(2, 0)), Duration::weeks(3), Decimal::new(10, 2))]
    fn test_config_new(
        #[case] days: Option<i64>,
        #[case] ratio: Option<Decimal>,
        #[case] card_quarantine: Duration,
        #[case] expected_ratio: Decimal,
    ) {
        let config = LedgerConfig::new(days, ratio);
        assert_eq!(config.quarantine.for_network(Network::Card), card_quarantine);
        assert_eq!(config.max_fee_ratio, expected_ratio);
    }
}
