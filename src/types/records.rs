//! Row records of the ledger
//!
//! One explicit struct per logical table (`wallets`, `exchanges`, `transfers`,
//! `cash_bundles`, `debts`) plus the value types the engine is fed with
//! (participants, routes, tips and takes).

use super::money::{Currency, Money, MoneyBasket};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Participant, team or system account identifier
pub type HolderId = u64;

/// Exchange (external payment) identifier
pub type ExchangeId = u64;

/// Transfer (internal movement) identifier
pub type TransferId = u64;

/// Cash bundle identifier
pub type BundleId = u64;

/// Wallet identifier (the wallet's `remote_id`)
pub type WalletId = u64;

/// Debt identifier
pub type DebtId = u64;

/// Payment route identifier
pub type RouteId = u64;

/// Kind of holder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HolderKind {
    Individual,
    Team,
    Organization,
}

/// What the core needs to know about a holder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: HolderId,
    pub kind: HolderKind,
    pub main_currency: Currency,
    pub is_suspended: bool,
}

impl Participant {
    pub fn individual(id: HolderId, main_currency: Currency) -> Self {
        Participant {
            id,
            kind: HolderKind::Individual,
            main_currency,
            is_suspended: false,
        }
    }

    pub fn team(id: HolderId, main_currency: Currency) -> Self {
        Participant {
            id,
            kind: HolderKind::Team,
            main_currency,
            is_suspended: false,
        }
    }
}

/// Payment network a route goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Card,
    BankWire,
    DirectDebit,
}

/// A participant's payment instrument at the processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,
    pub participant: HolderId,
    pub network: Network,
}

/// Cached balance of one holder in one currency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub remote_id: WalletId,
    pub balance: Money,
    pub owner: HolderId,
    pub is_current: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExchangeStatus {
    PreMandate,
    Pre,
    Succeeded,
    Failed,
}

impl ExchangeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExchangeStatus::Succeeded | ExchangeStatus::Failed)
    }

    pub fn is_pre(self) -> bool {
        matches!(self, ExchangeStatus::PreMandate | ExchangeStatus::Pre)
    }
}

impl fmt::Display for ExchangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExchangeStatus::PreMandate => "pre-mandate",
            ExchangeStatus::Pre => "pre",
            ExchangeStatus::Succeeded => "succeeded",
            ExchangeStatus::Failed => "failed",
        })
    }
}

/// One interaction with the external payment processor
///
/// `amount` is signed: positive for a payin (money entering the wallet),
/// negative for a payout (money leaving it). `fee` and `vat` are never negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub id: ExchangeId,
    pub timestamp: DateTime<Utc>,
    pub amount: Money,
    pub fee: Money,
    pub vat: Money,
    pub participant: HolderId,
    pub status: ExchangeStatus,
    pub route: RouteId,
    pub network: Network,
    pub remote_id: Option<String>,
    pub note: Option<String>,
    pub wallet_id: WalletId,
    pub refund_ref: Option<ExchangeId>,
    /// Repudiation id of the lost dispute settled against this payin
    #[serde(default)]
    pub repudiation: Option<String>,
}

impl Exchange {
    pub fn is_payin(&self) -> bool {
        self.amount.is_positive()
    }

    pub fn is_payout(&self) -> bool {
        self.amount.is_negative()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pre,
    Succeeded,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransferStatus::Pre)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferStatus::Pre => "pre",
            TransferStatus::Succeeded => "succeeded",
            TransferStatus::Failed => "failed",
        })
    }
}

/// Why money moved between two holders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferContext {
    Tip,
    Take,
    FinalGift,
    Chargeback,
    Debt,
}

/// One internal movement of money between two holders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub timestamp: DateTime<Utc>,
    pub tipper: HolderId,
    pub tippee: HolderId,
    pub amount: Money,
    pub context: TransferContext,
    pub team: Option<HolderId>,
    pub status: TransferStatus,
    pub error: Option<String>,
    pub wallet_from: WalletId,
    pub wallet_to: WalletId,
}

/// A traceable lot of money
///
/// Every unit of currency a holder possesses is part of some bundle, and the
/// bundle remembers the exchange that brought it into the system (`origin`).
/// `owner` is `None` exactly while the money is in transit out of the ledger
/// (`withdrawal` is set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashBundle {
    pub id: BundleId,
    pub owner: Option<HolderId>,
    pub origin: ExchangeId,
    pub ts: DateTime<Utc>,
    pub amount: Money,
    pub withdrawal: Option<ExchangeId>,
    pub disputed: bool,
    pub locked_for: Option<TransferId>,
    pub wallet_id: Option<WalletId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebtStatus {
    Due,
    Paid,
    Void,
}

impl fmt::Display for DebtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DebtStatus::Due => "due",
            DebtStatus::Paid => "paid",
            DebtStatus::Void => "void",
        })
    }
}

/// Money a holder owes another because of a reverted payin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Debt {
    pub id: DebtId,
    pub timestamp: DateTime<Utc>,
    pub debtor: HolderId,
    pub creditor: HolderId,
    pub amount: Money,
    pub status: DebtStatus,
    pub origin: ExchangeId,
    pub settlement: Option<TransferId>,
}

/// A donation towards a tippee (a team, for take resolution)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tip {
    pub tipper: HolderId,
    pub tippee: HolderId,
    pub amount: Money,
    pub is_funded: bool,
}

/// A team member's share of the team's income
///
/// `amount` is the nominal take the member asked for (`None` when the member
/// hasn't set one); `actual_amount` is what the allocator last granted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Take {
    pub team: HolderId,
    pub member: HolderId,
    pub amount: Option<Money>,
    pub actual_amount: MoneyBasket,
}

impl Take {
    pub fn new(team: HolderId, member: HolderId, amount: Option<Money>) -> Self {
        Take {
            team,
            member,
            amount,
            actual_amount: MoneyBasket::new(),
        }
    }
}
