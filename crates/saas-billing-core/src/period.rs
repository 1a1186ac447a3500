//! Billing period arithmetic.
//!
//! Periods are inclusive date ranges. A monthly period starting on `start`
//! ends on `start + 1 month - 1 day`, and the next charge falls on the day
//! after the period ends.

use chrono::{Days, Months, NaiveDate};

use crate::error::{BillingError, Result};

/// Monthly period starting on `start`, as `(start, end)`.
///
/// # Errors
///
/// Returns `InvalidPeriod` if the end date overflows the calendar.
pub fn monthly_period(start: NaiveDate) -> Result<(NaiveDate, NaiveDate)> {
    let end = start
        .checked_add_months(Months::new(1))
        .and_then(|d| d.pred_opt())
        .ok_or_else(|| BillingError::InvalidPeriod(format!("no monthly period after {start}")))?;
    Ok((start, end))
}

/// Trial period of `days` days starting on `start`.
///
/// # Errors
///
/// Returns `InvalidPeriod` if `days` is zero or the end date overflows.
pub fn trial_period(start: NaiveDate, days: u32) -> Result<(NaiveDate, NaiveDate)> {
    if days == 0 {
        return Err(BillingError::InvalidPeriod("trial must last at least one day".into()));
    }
    let end = start
        .checked_add_days(Days::new(u64::from(days) - 1))
        .ok_or_else(|| BillingError::InvalidPeriod(format!("no trial period after {start}")))?;
    Ok((start, end))
}

/// Day after `period_end`.
///
/// # Errors
///
/// Returns `InvalidPeriod` on calendar overflow.
pub fn day_after(period_end: NaiveDate) -> Result<NaiveDate> {
    period_end
        .succ_opt()
        .ok_or_else(|| BillingError::InvalidPeriod(format!("no day after {period_end}")))
}

/// Check that `end` is not before `start`.
///
/// # Errors
///
/// Returns `InvalidPeriod` when the range is empty.
pub fn validate(start: NaiveDate, end: NaiveDate) -> Result<()> {
    if end < start {
        return Err(BillingError::InvalidPeriod(format!(
            "period end {end} is before start {start}"
        )));
    }
    Ok(())
}
