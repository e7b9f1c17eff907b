//! CronScheduleCalculator - `cron` crate adapter.
//!
//! Accepts standard 5-field Unix expressions (minute, hour, day-of-month,
//! month, day-of-week) and converts them to the 6-field form (with seconds)
//! the `cron` crate expects. 6- and 7-field expressions pass through.
//!
//! Unix numbers weekdays 0-6 from Sunday (7 is Sunday too); the `cron` crate
//! numbers them 1-7 from Sunday. Numeric day-of-week items of a 5-field
//! expression are rewritten to the crate's numbering.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, FixedOffset, Utc};
use cron::Schedule;

use crate::domain::CronError;
use crate::ports::CronCalculator;

const CACHE_CAPACITY: usize = 256;

fn normalize(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, day, month, weekday] => {
            let weekday = weekday
                .split(',')
                .map(unix_weekday_item)
                .collect::<Vec<_>>()
                .join(",");
            format!("0 {minute} {hour} {day} {month} {weekday}")
        }
        _ => expr.trim().to_string(),
    }
}

/// Rewrites one numeric day-of-week item (`n`, `a-b`, `*/s`, `a-b/s`, `a/s`)
/// as an explicit list in the crate's numbering. Names and anything
/// malformed pass through for the parser to judge.
fn unix_weekday_item(item: &str) -> String {
    if item == "*" || item == "?" || item.chars().any(|c| c.is_ascii_alphabetic()) {
        return item.to_string();
    }
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => match step.parse::<u32>() {
            Ok(step) if step > 0 => (base, Some(step)),
            _ => return item.to_string(),
        },
        None => (item, None),
    };
    let bounds = match (base, base.split_once('-')) {
        ("*", _) => Some((0, 6)),
        (_, Some((lo, hi))) => lo.parse().ok().zip(hi.parse().ok()),
        (_, None) => base
            .parse()
            .ok()
            .map(|day| (day, if step.is_some() { 6 } else { day })),
    };
    let Some((lo, hi)) = bounds.filter(|(lo, hi): &(u32, u32)| lo <= hi && *hi <= 7) else {
        return item.to_string();
    };

    let days: BTreeSet<u32> = (lo..=hi)
        .step_by(step.unwrap_or(1) as usize)
        .map(|day| day % 7 + 1)
        .collect();
    days.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses expressions once and keeps up to 256 parsed schedules.
#[derive(Debug, Default)]
pub struct CronScheduleCalculator {
    cache: Mutex<HashMap<String, Schedule>>,
}

impl CronScheduleCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    fn schedule(&self, expr: &str) -> Result<Schedule, CronError> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(schedule) = cache.get(expr) {
            return Ok(schedule.clone());
        }

        let schedule = Schedule::from_str(&normalize(expr)).map_err(|e| CronError::Invalid {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        if cache.len() >= CACHE_CAPACITY {
            cache.clear();
        }
        cache.insert(expr.to_string(), schedule.clone());
        Ok(schedule)
    }
}

impl CronCalculator for CronScheduleCalculator {
    fn next_after(
        &self,
        from: DateTime<Utc>,
        expr: &str,
        zone: FixedOffset,
    ) -> Result<DateTime<Utc>, CronError> {
        self.schedule(expr)?
            .after(&from.with_timezone(&zone))
            .next()
            .map(|next| next.with_timezone(&Utc))
            .ok_or_else(|| CronError::Exhausted(expr.to_string()))
    }

    fn validate(&self, expr: &str) -> Result<(), CronError> {
        self.schedule(expr).map(|_| ())
    }
}
