//! Recurrence math for rescheduled tasks.
//!
//! Fixed-width intervals (hourly, daily, weekly) add millisecond deltas.
//! Monthly and yearly intervals add calendar months, clamping to the last
//! valid day, so `2024-01-31 + 1 month` is `2024-02-29`.

use chrono::{DateTime, Duration, Months, Utc};
use thiserror::Error;

use crate::task::RecurringInterval;

const HOUR_MS: i64 = 60 * 60 * 1000;
const DAY_MS: i64 = 24 * HOUR_MS;
const WEEK_MS: i64 = 7 * DAY_MS;

/// Errors computing the next occurrence of a recurring task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecurrenceError {
    #[error("unsupported recurring interval: {0}")]
    Unsupported(RecurringInterval),
    #[error("recurring interval count must be at least 1")]
    ZeroCount,
    #[error("next occurrence overflows the supported date range")]
    Overflow,
}

/// Computes the next `scheduled_at` by adding `count` units of `interval`
/// to `previous`.
///
/// The base is always the previous schedule, never the current time, so a
/// late run does not shift the cadence.
///
/// # Errors
///
/// Returns [`RecurrenceError::Unsupported`] for [`RecurringInterval::None`],
/// [`RecurrenceError::ZeroCount`] when `count` is zero, and
/// [`RecurrenceError::Overflow`] if the result leaves chrono's range.
pub fn next_occurrence(
    previous: DateTime<Utc>,
    interval: RecurringInterval,
    count: u32,
) -> Result<DateTime<Utc>, RecurrenceError> {
    if count == 0 {
        return Err(RecurrenceError::ZeroCount);
    }

    match interval {
        RecurringInterval::Hourly => add_fixed(previous, HOUR_MS, count),
        RecurringInterval::Daily => add_fixed(previous, DAY_MS, count),
        RecurringInterval::Weekly => add_fixed(previous, WEEK_MS, count),
        RecurringInterval::Monthly => previous
            .checked_add_months(Months::new(count))
            .ok_or(RecurrenceError::Overflow),
        RecurringInterval::Yearly => {
            let months = count.checked_mul(12).ok_or(RecurrenceError::Overflow)?;
            previous
                .checked_add_months(Months::new(months))
                .ok_or(RecurrenceError::Overflow)
        }
        RecurringInterval::None => Err(RecurrenceError::Unsupported(interval)),
    }
}

fn add_fixed(
    previous: DateTime<Utc>,
    unit_ms: i64,
    count: u32,
) -> Result<DateTime<Utc>, RecurrenceError> {
    let total = unit_ms
        .checked_mul(i64::from(count))
        .ok_or(RecurrenceError::Overflow)?;
    let delta = Duration::try_milliseconds(total).ok_or(RecurrenceError::Overflow)?;
    previous
        .checked_add_signed(delta)
        .ok_or(RecurrenceError::Overflow)
}
