//! Proration calculator.
//!
//! Pure functions over integer amounts. Division rounds half up to the nearest
//! currency unit and intermediate products are widened to `i128`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};

/// Breakdown of an immediate plan change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proration {
    /// Unused share of the old plan's amount.
    pub credit: i64,
    /// Share of the new plan's amount for the same remaining span.
    pub debit: i64,
    /// Amount charged now, `max(0, debit - credit)`.
    pub net: i64,
    /// Inclusive length of the current period.
    pub period_days: i64,
    /// Inclusive days left in the period, counting today.
    pub remaining_days: i64,
}

/// Inclusive day count of the period `[start, end]`.
///
/// # Errors
///
/// Returns `InvalidPeriod` when `end` is before `start`.
pub fn period_days(start: NaiveDate, end: NaiveDate) -> Result<i64> {
    let days = (end - start).num_days() + 1;
    if days <= 0 {
        return Err(BillingError::InvalidPeriod(format!(
            "period {start}..={end} has no days"
        )));
    }
    Ok(days)
}

/// Days from `today` through `period_end`, inclusive, clamped to the period.
#[must_use]
pub fn remaining_days(today: NaiveDate, period_start: NaiveDate, period_end: NaiveDate) -> i64 {
    if today > period_end {
        return 0;
    }
    let from = today.max(period_start);
    (period_end - from).num_days() + 1
}

/// `round_half_up(amount / period_days * remaining_days)`.
///
/// # Errors
///
/// Returns `InvalidPeriod` for a non-positive period and `InvalidAmount` for a
/// negative amount.
pub fn prorate(amount: i64, period_days: i64, remaining_days: i64) -> Result<i64> {
    if period_days <= 0 {
        return Err(BillingError::InvalidPeriod(format!(
            "cannot prorate over {period_days} days"
        )));
    }
    if amount < 0 {
        return Err(BillingError::InvalidAmount(format!(
            "cannot prorate negative amount {amount}"
        )));
    }
    let remaining = i128::from(remaining_days.clamp(0, period_days));
    let amount = i128::from(amount);
    let period = i128::from(period_days);

    let rounded = (2 * amount * remaining + period) / (2 * period);
    i64::try_from(rounded).map_err(|_| BillingError::InvalidAmount("prorated amount overflow".into()))
}

/// Immediate charge for moving from `old_amount` to `new_amount` on `today`.
///
/// # Errors
///
/// Propagates period and amount validation errors.
pub fn upgrade_charge(
    old_amount: i64,
    new_amount: i64,
    period_start: NaiveDate,
    period_end: NaiveDate,
    today: NaiveDate,
) -> Result<Proration> {
    let period_days = period_days(period_start, period_end)?;
    let remaining_days = remaining_days(today, period_start, period_end);

    let credit = prorate(old_amount, period_days, remaining_days)?;
    let debit = prorate(new_amount, period_days, remaining_days)?;

    Ok(Proration {
        credit,
        debit,
        net: (debit - credit).max(0),
        period_days,
        remaining_days,
    })
}

/// Unused share of `amount` refunded when canceling immediately on `today`.
///
/// # Errors
///
/// Propagates period and amount validation errors.
pub fn refund_amount(
    amount: i64,
    period_start: NaiveDate,
    period_end: NaiveDate,
    today: NaiveDate,
) -> Result<i64> {
    let period_days = period_days(period_start, period_end)?;
    prorate(amount, period_days, remaining_days(today, period_start, period_end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn period_days_is_inclusive() {
        assert_eq!(period_days(date(2024, 6, 1), date(2024, 6, 30)).unwrap(), 30);
        assert_eq!(period_days(date(2024, 6, 1), date(2024, 6, 1)).unwrap(), 1);
    }

    #[test]
    fn period_days_never_zero() {
        assert!(period_days(date(2024, 6, 2), date(2024, 6, 1)).is_err());
    }

    #[test]
    fn upgrade_with_ten_of_thirty_days_left() {
        // 30-day period, today is the 21st: 21..=30 is 10 days.
        let p = upgrade_charge(39_000, 99_000, date(2024, 6, 1), date(2024, 6, 30), date(2024, 6, 21))
            .unwrap();
        assert_eq!(p.remaining_days, 10);
        assert_eq!(p.credit, 13_000);
        assert_eq!(p.debit, 33_000);
        assert_eq!(p.net, 20_000);
    }

    #[test]
    fn rounds_half_up() {
        assert_eq!(prorate(5, 2, 1).unwrap(), 3);
        assert_eq!(prorate(1_000, 3, 1).unwrap(), 333);
        assert_eq!(prorate(1_000, 3, 2).unwrap(), 667);
    }

    #[test]
    fn zero_remaining_days_means_no_charge() {
        let p = upgrade_charge(39_000, 99_000, date(2024, 6, 1), date(2024, 6, 30), date(2024, 7, 1))
            .unwrap();
        assert_eq!(p.remaining_days, 0);
        assert_eq!(p.net, 0);
    }

    #[test]
    fn net_never_negative() {
        let p = upgrade_charge(99_000, 39_000, date(2024, 6, 1), date(2024, 6, 30), date(2024, 6, 10))
            .unwrap();
        assert!(p.credit > p.debit);
        assert_eq!(p.net, 0);
    }

    #[test]
    fn today_before_period_counts_whole_period() {
        assert_eq!(remaining_days(date(2024, 5, 20), date(2024, 6, 1), date(2024, 6, 30)), 30);
    }

    #[test]
    fn refund_on_first_day_is_full_amount() {
        assert_eq!(
            refund_amount(39_000, date(2024, 6, 1), date(2024, 6, 30), date(2024, 6, 1)).unwrap(),
            39_000
        );
    }

    #[test]
    fn negative_amount_rejected() {
        assert!(prorate(-1, 30, 10).is_err());
    }
}
