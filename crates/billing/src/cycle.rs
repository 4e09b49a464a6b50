//! Billing cycle arithmetic
//!
//! Pure functions: no clock, no I/O. Month and year steps clamp to the last
//! valid day of the target month (Jan 31 + 1 month = Feb 28/29).

use time::{Date, Duration, Month, OffsetDateTime, Time, UtcOffset};

use crate::error::{BillingError, BillingResult};
use crate::models::IntervalUnit;

/// Advance `date` by `count` units, keeping the time of day and offset.
pub fn next_boundary(
    date: OffsetDateTime,
    unit: IntervalUnit,
    count: u32,
) -> BillingResult<OffsetDateTime> {
    if count == 0 {
        return Err(BillingError::Validation(
            "interval count must be at least 1".to_string(),
        ));
    }

    let overflow = || BillingError::Validation(format!("{} {}s overflows the calendar", count, unit));

    match unit {
        IntervalUnit::Day => date
            .checked_add(Duration::days(i64::from(count)))
            .ok_or_else(overflow),
        IntervalUnit::Week => date
            .checked_add(Duration::weeks(i64::from(count)))
            .ok_or_else(overflow),
        IntervalUnit::Month => {
            let shifted = add_months(date.date(), i64::from(count)).ok_or_else(overflow)?;
            Ok(date.replace_date(shifted))
        }
        IntervalUnit::Year => {
            let shifted = add_months(date.date(), i64::from(count) * 12).ok_or_else(overflow)?;
            Ok(date.replace_date(shifted))
        }
    }
}

fn add_months(date: Date, months: i64) -> Option<Date> {
    let zero_based = i64::from(date.year()) * 12 + i64::from(u8::from(date.month())) - 1;
    let target = zero_based.checked_add(months)?;
    let year = i32::try_from(target.div_euclid(12)).ok()?;
    let month = Month::try_from(u8::try_from(target.rem_euclid(12) + 1).ok()?).ok()?;
    let day = date.day().min(time::util::days_in_year_month(year, month));
    Date::from_calendar_date(year, month, day).ok()
}

/// Midnight UTC starting the day after `now`. Everything billed "today" is
/// due strictly before this instant.
pub fn start_of_next_day(now: OffsetDateTime) -> OffsetDateTime {
    let midnight = now.to_offset(UtcOffset::UTC).replace_time(Time::MIDNIGHT);
    midnight.checked_add(Duration::days(1)).unwrap_or(midnight)
}

/// Plan amount plus metered usage, in minor units
pub fn amount_due(plan_amount: i64, usage_amount: i64) -> BillingResult<i64> {
    if plan_amount < 0 || usage_amount < 0 {
        return Err(BillingError::Validation(
            "amounts must not be negative".to_string(),
        ));
    }
    plan_amount
        .checked_add(usage_amount)
        .ok_or_else(|| BillingError::Validation("amount due overflows".to_string()))
}
