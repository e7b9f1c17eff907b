//! Saturating instant arithmetic.
//!
//! Leases and backoffs are `std::time::Duration`s applied to `DateTime<Utc>`
//! instants. Overflow clamps to the representable range instead of panicking,
//! so a misconfigured "lease forever" simply never expires.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// `at + delta`, clamped to `DateTime::<Utc>::MAX_UTC`.
pub fn add(at: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delta)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - delta`, clamped to `DateTime::<Utc>::MIN_UTC`.
pub fn sub(at: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delta)
        .ok()
        .and_then(|delta| at.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
