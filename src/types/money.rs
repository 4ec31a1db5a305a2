//! Money, currencies and exchange rates
//!
//! `Money` is an immutable fixed-point amount tagged with a currency. Arithmetic
//! between two values requires identical currencies and fails with
//! `CurrencyMismatch` otherwise; crossing currencies always goes through an
//! explicit [`Money::convert`] against an [`ExchangeRates`] table.

use super::error::LedgerError;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Neg;
use std::str::FromStr;

/// Currencies the ledger can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Eur,
    Usd,
    Gbp,
    Chf,
    Cad,
    Aud,
    Jpy,
}

impl Currency {
    /// Number of decimal places of the currency's minimum unit
    pub fn minor_units(self) -> u32 {
        match self {
            Currency::Jpy => 0,
            _ => 2,
        }
    }

    /// ISO 4217 code
    pub fn code(self) -> &'static str {
        match self {
            Currency::Eur => "EUR",
            Currency::Usd => "USD",
            Currency::Gbp => "GBP",
            Currency::Chf => "CHF",
            Currency::Cad => "CAD",
            Currency::Aud => "AUD",
            Currency::Jpy => "JPY",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "EUR" => Ok(Currency::Eur),
            "USD" => Ok(Currency::Usd),
            "GBP" => Ok(Currency::Gbp),
            "CHF" => Ok(Currency::Chf),
            "CAD" => Ok(Currency::Cad),
            "AUD" => Ok(Currency::Aud),
            "JPY" => Ok(Currency::Jpy),
            other => Err(LedgerError::unknown_currency(other)),
        }
    }
}

/// Fixed-point amount tagged with a currency
///
/// Ordering is only defined between values of the same currency:
/// `partial_cmp` returns `None` across currencies, so `a < b` is false for
/// mismatched values. Code that cannot guarantee matching currencies should use
/// [`Money::try_cmp`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Money { amount, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Money::new(Decimal::ZERO, currency)
    }

    /// Build an amount from an integer count of minimum units (cents, yen...)
    pub fn from_minor_units(units: i128, currency: Currency) -> Self {
        Money::new(
            Decimal::from_i128_with_scale(units, currency.minor_units()),
            currency,
        )
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.amount < Decimal::ZERO
    }

    pub fn abs(self) -> Self {
        Money::new(self.amount.abs(), self.currency)
    }

    /// `max(self, 0)`
    pub fn clamp_non_negative(self) -> Self {
        if self.is_negative() {
            Money::zero(self.currency)
        } else {
            self
        }
    }

    fn ensure_same_currency(&self, other: &Money) -> Result<(), LedgerError> {
        if self.currency != other.currency {
            return Err(LedgerError::currency_mismatch(self.currency, other.currency));
        }
        Ok(())
    }

    pub fn checked_add(self, other: Money) -> Result<Money, LedgerError> {
        self.ensure_same_currency(&other)?;
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or_else(|| LedgerError::arithmetic_overflow("money addition"))?;
        Ok(Money::new(amount, self.currency))
    }

    pub fn checked_sub(self, other: Money) -> Result<Money, LedgerError> {
        self.ensure_same_currency(&other)?;
        let amount = self
            .amount
            .checked_sub(other.amount)
            .ok_or_else(|| LedgerError::arithmetic_overflow("money subtraction"))?;
        Ok(Money::new(amount, self.currency))
    }

    /// Compare two amounts, refusing to compare across currencies
    pub fn try_cmp(&self, other: &Money) -> Result<Ordering, LedgerError> {
        self.ensure_same_currency(other)?;
        Ok(self.amount.cmp(&other.amount))
    }

    /// Round down to the currency's minimum unit
    pub fn round_down(self) -> Self {
        Money::new(
            self.amount.round_dp_with_strategy(
                self.currency.minor_units(),
                RoundingStrategy::ToNegativeInfinity,
            ),
            self.currency,
        )
    }

    /// Round half away from zero to the currency's minimum unit
    pub fn round(self) -> Self {
        Money::new(
            self.amount.round_dp_with_strategy(
                self.currency.minor_units(),
                RoundingStrategy::MidpointAwayFromZero,
            ),
            self.currency,
        )
    }

    /// Integer count of minimum units, rounding down any sub-unit precision
    pub fn to_minor_units(self) -> i128 {
        let mut scaled = self.round_down().amount;
        scaled.rescale(self.currency.minor_units());
        scaled.mantissa()
    }

    /// Convert into another currency using an externally supplied rate table
    pub fn convert(self, to: Currency, rates: &ExchangeRates) -> Result<Money, LedgerError> {
        if self.currency == to {
            return Ok(self);
        }
        let rate = rates.rate(self.currency, to)?;
        let amount = self
            .amount
            .checked_mul(rate)
            .ok_or_else(|| LedgerError::arithmetic_overflow("currency conversion"))?;
        Ok(Money::new(amount, to).round())
    }

    /// Sum a sequence of amounts that must all be in `currency`
    pub fn sum<I>(values: I, currency: Currency) -> Result<Money, LedgerError>
    where
        I: IntoIterator<Item = Money>,
    {
        values
            .into_iter()
            .try_fold(Money::zero(currency), |acc, m| acc.checked_add(m))
    }
}

impl Neg for Money {
    type Output = Money;

    fn neg(self) -> Money {
        Money::new(-self.amount, self.currency)
    }
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.currency != other.currency {
            return None;
        }
        Some(self.amount.cmp(&other.amount))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.*} {}",
            self.currency.minor_units() as usize,
            self.amount,
            self.currency
        )
    }
}

impl FromStr for Money {
    type Err = LedgerError;

    /// Parses `"12.50 EUR"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let (Some(amount), Some(currency), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(LedgerError::invalid_amount(s));
        };
        let amount = Decimal::from_str(amount).map_err(|_| LedgerError::invalid_amount(s))?;
        Ok(Money::new(amount, currency.parse()?))
    }
}

/// Exchange-rate table supplied by the caller
///
/// Rates are directional (`from -> to`); when only the reverse rate is known it
/// is inverted.
#[derive(Debug, Clone, Default)]
pub struct ExchangeRates {
    rates: HashMap<(Currency, Currency), Decimal>,
}

impl ExchangeRates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, from: Currency, to: Currency, rate: Decimal) -> Self {
        self.set(from, to, rate);
        self
    }

    pub fn set(&mut self, from: Currency, to: Currency, rate: Decimal) {
        self.rates.insert((from, to), rate);
    }

    pub fn rate(&self, from: Currency, to: Currency) -> Result<Decimal, LedgerError> {
        if from == to {
            return Ok(Decimal::ONE);
        }
        if let Some(rate) = self.rates.get(&(from, to)) {
            return Ok(*rate);
        }
        self.rates
            .get(&(to, from))
            .and_then(|inverse| Decimal::ONE.checked_div(*inverse))
            .ok_or(LedgerError::MissingRate { from, to })
    }
}

/// Amounts in several currencies held side by side
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoneyBasket {
    amounts: BTreeMap<Currency, Decimal>,
}

impl MoneyBasket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, money: Money) -> Result<(), LedgerError> {
        let entry = self.amounts.entry(money.currency).or_insert(Decimal::ZERO);
        *entry = entry
            .checked_add(money.amount)
            .ok_or_else(|| LedgerError::arithmetic_overflow("basket addition"))?;
        Ok(())
    }

    pub fn get(&self, currency: Currency) -> Money {
        Money::new(
            self.amounts.get(&currency).copied().unwrap_or(Decimal::ZERO),
            currency,
        )
    }

    pub fn is_zero(&self) -> bool {
        self.amounts.values().all(|amount| amount.is_zero())
    }

    pub fn iter(&self) -> impl Iterator<Item = Money> + '_ {
        self.amounts
            .iter()
            .map(|(currency, amount)| Money::new(*amount, *currency))
    }

    /// Value of the whole basket in a single currency
    pub fn total(&self, currency: Currency, rates: &ExchangeRates) -> Result<Money, LedgerError> {
        self.iter().try_fold(Money::zero(currency), |acc, money| {
            acc.checked_add(money.convert(currency, rates)?)
        })
    }
}

impl From<Money> for MoneyBasket {
    fn from(money: Money) -> Self {
        let mut basket = MoneyBasket::new();
        basket.amounts.insert(money.currency, money.amount);
        basket
    }
}
