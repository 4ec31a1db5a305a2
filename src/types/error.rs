//! Error types for the ledger engine
//!
//! Errors fall in four classes (see [`ErrorClass`]):
//!
//! - **Policy**: expected, caller-recoverable outcomes such as insufficient
//!   funds or a suspended account. Returned as typed results, never logged as bugs.
//! - **Invariant**: ledger corruption (bundle sums that don't add up, writes to
//!   locked bundles). The enclosing store transaction is rolled back and the
//!   error must reach an operator.
//! - **Unsupported**: documented limitations such as partial disputes.
//! - **External**: payment processor connectivity problems; the exchange or
//!   transfer stays in its `pre` status for later reconciliation.

use super::money::{Currency, Money};
use rust_decimal::Decimal;
use thiserror::Error;

/// Coarse classification used at the API boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Policy,
    Invariant,
    Unsupported,
    External,
}

/// Main error type for the ledger engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    /// Arithmetic between two amounts of different currencies
    #[error("Currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: Currency, right: Currency },

    #[error("Unknown currency '{code}'")]
    UnknownCurrency { code: String },

    #[error("No exchange rate from {from} to {to}")]
    MissingRate { from: Currency, to: Currency },

    #[error("Invalid amount '{amount}'")]
    InvalidAmount { amount: String },

    #[error("Arithmetic overflow in {operation}")]
    ArithmeticOverflow { operation: String },

    /// The store refused an update that would leave a wallet below zero
    #[error("Wallet {wallet} would end up with a negative balance")]
    NegativeBalance { wallet: u64 },

    #[error("Insufficient funds for holder {holder}: available {available}, requested {requested}")]
    InsufficientFunds {
        holder: u64,
        available: Money,
        requested: Money,
    },

    /// Only bundles past their quarantine period can leave the ledger
    #[error("Not enough withdrawable money: {available} available")]
    NotEnoughWithdrawableMoney { available: Money },

    #[error("Account {holder} is suspended")]
    AccountSuspended { holder: u64 },

    #[error("Fee {fee} exceeds amount {amount}")]
    FeeExceedsAmount { fee: Money, amount: Money },

    #[error("Transaction fee {fee} is too high for amount {amount} (max ratio {max_ratio})")]
    TransactionFeeTooHigh {
        fee: Money,
        amount: Money,
        max_ratio: Decimal,
    },

    #[error("Unknown holder {holder}")]
    UnknownHolder { holder: u64 },

    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: u64 },

    #[error("Invalid status transition for {kind} {id}: {from} -> {to}")]
    InvalidStatusTransition {
        kind: String,
        id: u64,
        from: String,
        to: String,
    },

    /// Ledger corruption; fatal to the enclosing transaction
    #[error("Ledger invariant violated: {message}")]
    InvariantViolation { message: String },

    #[error("Not implemented: {feature}")]
    NotImplemented { feature: String },

    /// Connectivity or server-side failure of the payment processor
    #[error("Payment processor error: {message}")]
    Processor { message: String },

    /// The compensating transfer of a chargeback recovery failed
    #[error("Compensating transfer failed: {message}")]
    CompensationFailed { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },
}

impl From<serde_json::Error> for LedgerError {
    fn from(error: serde_json::Error) -> Self {
        LedgerError::Storage {
            message: error.to_string(),
        }
    }
}

// Helper functions for creating common errors

impl LedgerError {
    pub fn currency_mismatch(left: Currency, right: Currency) -> Self {
        LedgerError::CurrencyMismatch { left, right }
    }

    pub fn unknown_currency(code: &str) -> Self {
        LedgerError::UnknownCurrency {
            code: code.to_string(),
        }
    }

    pub fn invalid_amount(amount: impl ToString) -> Self {
        LedgerError::InvalidAmount {
            amount: amount.to_string(),
        }
    }

    pub fn arithmetic_overflow(operation: &str) -> Self {
        LedgerError::ArithmeticOverflow {
            operation: operation.to_string(),
        }
    }

    pub fn insufficient_funds(holder: u64, available: Money, requested: Money) -> Self {
        LedgerError::InsufficientFunds {
            holder,
            available,
            requested,
        }
    }

    pub fn not_found(kind: &str, id: u64) -> Self {
        LedgerError::NotFound {
            kind: kind.to_string(),
            id,
        }
    }

    pub fn invalid_transition(kind: &str, id: u64, from: impl ToString, to: impl ToString) -> Self {
        LedgerError::InvalidStatusTransition {
            kind: kind.to_string(),
            id,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        LedgerError::InvariantViolation {
            message: message.into(),
        }
    }

    pub fn not_implemented(feature: &str) -> Self {
        LedgerError::NotImplemented {
            feature: feature.to_string(),
        }
    }

    pub fn processor(message: impl Into<String>) -> Self {
        LedgerError::Processor {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        LedgerError::Storage {
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            LedgerError::InvariantViolation { .. }
            | LedgerError::CompensationFailed { .. }
            | LedgerError::Storage { .. }
            | LedgerError::ArithmeticOverflow { .. } => ErrorClass::Invariant,
            LedgerError::NotImplemented { .. } => ErrorClass::Unsupported,
            LedgerError::Processor { .. } => ErrorClass::External,
            _ => ErrorClass::Policy,
        }
    }

    /// True for errors that indicate ledger corruption
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Invariant
    }

    /// Message suitable for showing to an end user
    ///
    /// Invariant violations never leak internal detail.
    pub fn user_message(&self) -> String {
        match self.class() {
            ErrorClass::Invariant => {
                "Something went wrong, we've been notified and will look into it.".to_string()
            }
            ErrorClass::External => {
                "The payment processor is not responding, please try again later.".to_string()
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn eur(cents: i64) -> Money {
        Money::new(Decimal::new(cents, 2), Currency::Eur)
    }

    #[rstest]
    #[case::mismatch(
        LedgerError::currency_mismatch(Currency::Eur, Currency::Usd),
        "Currency mismatch: EUR vs USD"
    )]
    #[case::insufficient(
        LedgerError::insufficient_funds(7, eur(500), eur(1000)),
        "Insufficient funds for holder 7: available 5.00 EUR, requested 10.00 EUR"
    )]
    #[case::withdrawable(
        LedgerError::NotEnoughWithdrawableMoney { available: eur(1234) },
        "Not enough withdrawable money: 12.34 EUR available"
    )]
    #[case::suspended(LedgerError::AccountSuspended { holder: 3 }, "Account 3 is suspended")]
    #[case::not_found(LedgerError::not_found("exchange", 9), "exchange 9 not found")]
    #[case::transition(
        LedgerError::invalid_transition("transfer", 4, "succeeded", "failed"),
        "Invalid status transition for transfer 4: succeeded -> failed"
    )]
    fn test_error_display(#[case] error: LedgerError, #[case] expected: &str) {
        assert_eq!(error.to_string(), expected);
    }

    #[rstest]
    #[case(LedgerError::NegativeBalance { wallet: 1 }, ErrorClass::Policy)]
    #[case(LedgerError::AccountSuspended { holder: 1 }, ErrorClass::Policy)]
    #[case(LedgerError::invariant("bundles sum mismatch"), ErrorClass::Invariant)]
    #[case(LedgerError::not_implemented("partial disputes"), ErrorClass::Unsupported)]
    #[case(LedgerError::processor("timeout"), ErrorClass::External)]
    fn test_error_class(#[case] error: LedgerError, #[case] expected: ErrorClass) {
        assert_eq!(error.class(), expected);
    }

    #[test]
    fn test_invariant_violations_hide_details_from_users() {
        let error = LedgerError::invariant("bundle 12 locked for transfer 3");
        assert!(error.is_fatal());
        assert!(!error.user_message().contains("bundle 12"));

        let policy = LedgerError::AccountSuspended { holder: 3 };
        assert_eq!(policy.user_message(), "Account 3 is suspended");
    }
}
