//! Take resolution
//!
//! Splits a team's funded income among its members according to the takes
//! they asked for. All arithmetic happens in integer minimum units of the
//! team's currency, so the allocation is exactly conservative:
//! `sum(transfers) + leftover == total_income` for every input.

use crate::types::{Currency, ExchangeRates, HolderId, LedgerError, Money, MoneyBasket, Take, Tip};
use std::cmp::Reverse;

/// What the allocator granted one member
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTake {
    pub member: HolderId,
    /// Requested amount, `None` if the member hasn't set a take
    pub nominal: Option<Money>,
    pub actual: Money,
}

/// One tipper-to-member payment
#[derive(Debug, Clone, PartialEq)]
pub struct TransferInstruction {
    pub tipper: HolderId,
    pub member: HolderId,
    pub amount: Money,
}

/// Result of `resolve_takes`
#[derive(Debug, Clone, PartialEq)]
pub struct TakeResolution {
    pub team: HolderId,
    pub total_income: Money,
    pub total_requested: Money,
    pub takes: Vec<ResolvedTake>,
    pub transfers: Vec<TransferInstruction>,
    /// Income no member asked for; stays with the team
    pub leftover: Money,
}

impl TakeResolution {
    /// Store the granted amounts on the matching takes
    pub fn apply(&self, takes: &mut [Take]) {
        for take in takes.iter_mut().filter(|t| t.team == self.team) {
            if let Some(resolved) = self.takes.iter().find(|r| r.member == take.member) {
                take.actual_amount = MoneyBasket::from(resolved.actual);
            }
        }
    }

    pub fn actual_for(&self, member: HolderId) -> Option<Money> {
        self.takes
            .iter()
            .find(|r| r.member == member)
            .map(|r| r.actual)
    }
}

fn to_units(amount: Money, currency: Currency, rates: &ExchangeRates) -> Result<i128, LedgerError> {
    Ok(amount.convert(currency, rates)?.round_down().to_minor_units())
}

/// Compute each member's actual take and the tipper-to-member transfers
///
/// # Arguments
///
/// * `team` - The team whose income is being split
/// * `currency` - The team's reference currency; everything is converted to it
/// * `tips` - Donations; only funded tips to `team` count as income
/// * `takes` - The members' takes; takes of other teams are ignored
/// * `rates` - Conversion table for tips and takes in other currencies
///
/// # Returns
///
/// When the members ask for no more than the income, everyone gets their
/// nominal take and the rest is leftover. Otherwise every take is scaled down
/// by `income / requested`, rounded down, and the rounding remainder is handed
/// out one unit at a time by member id, leaving nothing over.
pub fn resolve_takes(
    team: HolderId,
    currency: Currency,
    tips: &[Tip],
    takes: &[Take],
    rates: &ExchangeRates,
) -> Result<TakeResolution, LedgerError> {
    let mut income = Vec::new();
    for tip in tips.iter().filter(|t| t.is_funded && t.tippee == team) {
        if tip.amount.is_negative() {
            return Err(LedgerError::invalid_amount(tip.amount));
        }
        income.push((tip.tipper, to_units(tip.amount, currency, rates)?));
    }

    let mut members = Vec::new();
    for take in takes.iter().filter(|t| t.team == team) {
        let nominal = match take.amount {
            Some(amount) if amount.is_negative() => return Err(LedgerError::invalid_amount(amount)),
            Some(amount) => Some(to_units(amount, currency, rates)?),
            None => None,
        };
        members.push((take.member, nominal));
    }

    let total_income = checked_sum(income.iter().map(|(_, units)| *units))?;
    let total_requested = checked_sum(members.iter().filter_map(|(_, n)| *n))?;

    let mut actual: Vec<i128> = members.iter().map(|(_, n)| n.unwrap_or(0)).collect();
    if total_requested > total_income {
        for (granted, (_, nominal)) in actual.iter_mut().zip(&members) {
            *granted = nominal
                .unwrap_or(0)
                .checked_mul(total_income)
                .ok_or_else(overflow)?
                / total_requested;
        }

        let mut order: Vec<usize> = (0..members.len()).collect();
        order.sort_by_key(|&i| members[i].0);
        let mut remainder = total_income - checked_sum(actual.iter().copied())?;
        while remainder > 0 {
            let mut progressed = false;
            for &i in &order {
                if remainder == 0 {
                    break;
                }
                if actual[i] < members[i].1.unwrap_or(0) {
                    actual[i] += 1;
                    remainder -= 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Err(LedgerError::invariant(format!(
                    "cannot place {} units of team {}'s income",
                    remainder, team
                )));
            }
        }
    }

    let allocated = checked_sum(actual.iter().copied())?;
    let shares = apportion(&income, &actual, total_income)?;

    let mut transfers = Vec::new();
    for (j, (tipper, _)) in income.iter().enumerate() {
        for (i, (member, nominal)) in members.iter().enumerate() {
            if nominal.is_some() {
                transfers.push(TransferInstruction {
                    tipper: *tipper,
                    member: *member,
                    amount: Money::from_minor_units(shares[i][j], currency),
                });
            }
        }
    }

    let resolution = TakeResolution {
        team,
        total_income: Money::from_minor_units(total_income, currency),
        total_requested: Money::from_minor_units(total_requested, currency),
        takes: members
            .iter()
            .zip(&actual)
            .map(|((member, nominal), granted)| ResolvedTake {
                member: *member,
                nominal: nominal.map(|n| Money::from_minor_units(n, currency)),
                actual: Money::from_minor_units(*granted, currency),
            })
            .collect(),
        transfers,
        leftover: Money::from_minor_units(total_income - allocated, currency),
    };
    tracing::debug!(
        team,
        income = %resolution.total_income,
        requested = %resolution.total_requested,
        leftover = %resolution.leftover,
        "resolved takes"
    );
    Ok(resolution)
}

fn overflow() -> LedgerError {
    LedgerError::arithmetic_overflow("take resolution")
}

fn checked_sum(units: impl IntoIterator<Item = i128>) -> Result<i128, LedgerError> {
    units
        .into_iter()
        .try_fold(0i128, |acc, u| acc.checked_add(u))
        .ok_or_else(overflow)
}

/// Spread each member's actual take over the tips, proportionally to the tips
///
/// `shares[i][j]` is what tip `j` pays member `i`. Rows sum to `actual[i]` and
/// no tip pays out more than it brings in.
fn apportion(
    income: &[(HolderId, i128)],
    actual: &[i128],
    total_income: i128,
) -> Result<Vec<Vec<i128>>, LedgerError> {
    let mut shares = vec![vec![0i128; income.len()]; actual.len()];
    if total_income == 0 {
        return Ok(shares);
    }

    let mut capacity: Vec<i128> = income.iter().map(|(_, units)| *units).collect();
    for (i, &wanted) in actual.iter().enumerate() {
        for (j, (_, tip)) in income.iter().enumerate() {
            let share = (tip.checked_mul(wanted).ok_or_else(overflow)? / total_income).min(capacity[j]);
            shares[i][j] = share;
            capacity[j] -= share;
        }
    }

    for (i, &wanted) in actual.iter().enumerate() {
        let mut missing = wanted - checked_sum(shares[i].iter().copied())?;
        let mut keyed = Vec::with_capacity(income.len());
        for (j, (_, tip)) in income.iter().enumerate() {
            let fraction = tip.checked_mul(wanted).ok_or_else(overflow)? % total_income;
            keyed.push((Reverse(fraction), j));
        }
        keyed.sort();
        let order: Vec<usize> = keyed.into_iter().map(|(_, j)| j).collect();

        while missing > 0 {
            let mut progressed = false;
            for &j in &order {
                if missing == 0 {
                    break;
                }
                if capacity[j] > 0 {
                    shares[i][j] += 1;
                    capacity[j] -= 1;
                    missing -= 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Err(LedgerError::invariant(
                    "tips cannot cover the resolved takes",
                ));
            }
        }
    }
    Ok(shares)
}
