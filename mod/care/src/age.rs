//! Day-of-age calculation.
//!
//! One formula, used everywhere: calendar-day difference with the
//! enrollment day counted as day 1. Time-of-day never enters — two
//! timestamps on the same calendar day yield the same day-of-age.

use chrono::{DateTime, NaiveDate, Utc};

/// Day-of-age of a batch enrolled on `entry` as of `today`.
///
/// Same calendar day ⇒ 1; each following day adds 1. An `entry` in the
/// future yields a value ≤ 0, which callers treat as "not yet started",
/// never as an error.
pub fn day_of_age(entry: NaiveDate, today: NaiveDate) -> i64 {
    (today - entry).num_days() + 1
}

/// Strip time-of-day from a timestamp before it reaches the calculator.
pub fn calendar_day(ts: DateTime<Utc>) -> NaiveDate {
    ts.date_naive()
}
