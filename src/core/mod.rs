//! Core business logic module
//!
//! This module contains the ledger engine:
//! - `traits` - Storage contract and external collaborator seams
//! - `memory_store` - In-memory transactional store
//! - `rows` - Typed mapping between records and store rows
//! - `context` - Ledger context and configuration
//! - `collaborators` - In-process registry, event sinks, clocks and processor
//! - `wallets` - Current wallet lookups and guarded balance updates
//! - `bundles` - Cash bundle ledger
//! - `exchanges` - Exchange engine (payins and payouts)
//! - `transfers` - Transfer engine
//! - `takes` - Take resolution allocator
//! - `disputes` - Dispute and chargeback recovery
//! - `debts` - Debts left by chargebacks
//! - `audit` - Ledger consistency checks

pub mod audit;
pub mod bundles;
pub mod collaborators;
pub mod context;
pub mod debts;
pub mod disputes;
pub mod exchanges;
pub mod memory_store;
pub mod rows;
pub mod takes;
pub mod traits;
pub mod transfers;
pub mod wallets;

#[cfg(test)]
pub(crate) mod test_support;

pub use audit::Discrepancy;
pub use collaborators::{
    CollectingSink, InMemoryRegistry, InstantSettlement, ManualClock, NullSink, SystemClock,
    TracingSink,
};
pub use context::{LedgerConfig, LedgerContext, QuarantinePolicy};
pub use disputes::Recovery;
pub use memory_store::MemoryStore;
pub use takes::{resolve_takes, ResolvedTake, TakeResolution, TransferInstruction};
pub use traits::{
    Clock, EventSink, LedgerStore, LedgerTx, ParticipantRegistry, PaymentProcessor,
    ProcessorOutcome, Table,
};
pub use transfers::{TeamDistribution, TransferReceipt, TransferRequest};
