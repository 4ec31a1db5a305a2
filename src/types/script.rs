//! Replay script steps
//!
//! A replay script is a sequence of ledger operations read from CSV, used to
//! drive the engine from the command line and in end-to-end tests.

use super::money::Money;
use super::records::HolderId;
use std::fmt;

/// Kind of operation a script step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOp {
    /// Payin confirmed by the processor
    Payin,
    /// Payin declined by the processor
    PayinFailed,
    /// Payout recorded, awaiting its result
    Payout,
    PayoutSucceeded,
    PayoutFailed,
    /// Internal transfer from `holder` to `counterparty`
    Transfer,
    /// Full chargeback of a payin, settled as lost
    Dispute,
}

impl fmt::Display for ScriptOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScriptOp::Payin => "payin",
            ScriptOp::PayinFailed => "payin_failed",
            ScriptOp::Payout => "payout",
            ScriptOp::PayoutSucceeded => "payout_succeeded",
            ScriptOp::PayoutFailed => "payout_failed",
            ScriptOp::Transfer => "transfer",
            ScriptOp::Dispute => "dispute",
        })
    }
}

/// One validated script line
///
/// `amount` is always positive; the direction comes from `op`. `reference`
/// labels an exchange so later steps can refer to it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptStep {
    pub op: ScriptOp,
    pub holder: HolderId,
    pub counterparty: Option<HolderId>,
    pub amount: Option<Money>,
    pub fee: Option<Money>,
    pub reference: Option<String>,
}
