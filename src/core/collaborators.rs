//! In-process implementations of the external collaborators
//!
//! - `InMemoryRegistry`: participant registry backed by `DashMap`
//! - `TracingSink`, `CollectingSink`, `NullSink`: event sinks
//! - `SystemClock`, `ManualClock`: time sources
//! - `InstantSettlement`: payment processor settling internal movements at once

use crate::core::traits::{
    Clock, EventSink, ParticipantRegistry, PaymentProcessor, ProcessorOutcome,
};
use crate::types::{HolderId, LedgerError, LedgerEvent, Participant, Transfer, TransferStatus};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Mutex;

/// Thread-safe participant registry
///
/// Concurrent lookups for different holders don't block each other.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    participants: DashMap<HolderId, Participant>,
    /// Number of times each holder's cached totals were invalidated
    stale_totals: DashMap<HolderId, u64>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, participant: Participant) {
        self.participants.insert(participant.id, participant);
    }

    pub fn is_registered(&self, id: HolderId) -> bool {
        self.participants.contains_key(&id)
    }

    pub fn set_suspended(&self, id: HolderId, suspended: bool) -> Result<(), LedgerError> {
        let mut participant = self
            .participants
            .get_mut(&id)
            .ok_or(LedgerError::UnknownHolder { holder: id })?;
        participant.is_suspended = suspended;
        Ok(())
    }

    pub fn totals_refreshes(&self, id: HolderId) -> u64 {
        self.stale_totals.get(&id).map(|count| *count).unwrap_or(0)
    }
}

impl ParticipantRegistry for InMemoryRegistry {
    fn participant(&self, id: HolderId) -> Result<Participant, LedgerError> {
        self.participants
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(LedgerError::UnknownHolder { holder: id })
    }

    fn refresh_totals(&self, id: HolderId) {
        *self.stale_totals.entry(id).or_insert(0) += 1;
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &LedgerEvent) {}
}

/// Logs every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &LedgerEvent) {
        match serde_json::to_string(event) {
            Ok(payload) => tracing::info!(event = event.name(), %payload, "ledger event"),
            Err(e) => tracing::warn!(event = event.name(), error = %e, "unserializable ledger event"),
        }
    }
}

/// Keeps every event in memory, for tests and replays
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<LedgerEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(LedgerEvent::name).collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &LedgerEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Settles transfers immediately without calling out
///
/// Used for movements that never leave the platform's own books, such as
/// sending recovered chargeback funds to the holding account.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSettlement;

impl PaymentProcessor for InstantSettlement {
    fn execute_transfer(&self, transfer: &Transfer) -> Result<ProcessorOutcome, LedgerError> {
        Ok(ProcessorOutcome {
            remote_id: format!("internal-{}", transfer.id),
            status: TransferStatus::Succeeded,
            error: None,
        })
    }
}
