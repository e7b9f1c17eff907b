//! CronCalculator port - next occurrence of a schedule expression.

use chrono::{DateTime, FixedOffset, Utc};

use crate::domain::CronError;

/// CronCalculator computes schedule occurrences.
///
/// `zone` is the offset the expression's fields are interpreted in; the
/// result is always returned in UTC.
pub trait CronCalculator: Send + Sync {
    /// First occurrence strictly after `from`.
    fn next_after(
        &self,
        from: DateTime<Utc>,
        expr: &str,
        zone: FixedOffset,
    ) -> Result<DateTime<Utc>, CronError>;

    /// Reject an expression without computing anything else.
    fn validate(&self, expr: &str) -> Result<(), CronError>;
}
