//! Retry policy: decides backoff delays and the retry budget.

use std::time::Duration;

/// Pluggable retry policy for failed task runs.
pub trait RetryPolicy: Send + Sync {
    /// Delay before the next attempt, given the attempt that just failed
    /// (1-indexed). `None` means the retry budget is spent.
    fn next_backoff(&self, attempt: u32) -> Option<Duration>;
}

/// Same delay every time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedBackoff {
    pub backoff: Duration,

    /// Total attempts allowed, including the first. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl FixedBackoff {
    pub fn new(backoff: Duration) -> Self {
        Self {
            backoff,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl RetryPolicy for FixedBackoff {
    fn next_backoff(&self, attempt: u32) -> Option<Duration> {
        within_budget(self.max_attempts, attempt).then_some(self.backoff)
    }
}

/// `base * multiplier^(attempt - 1)`, optionally capped.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    /// Delay after the first failure.
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Option<Duration>,
    pub max_attempts: Option<u32>,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, multiplier: f64) -> Self {
        Self {
            base,
            multiplier,
            max_delay: None,
            max_attempts: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl RetryPolicy for ExponentialBackoff {
    /// Example with base=2s, multiplier=2.0:
    /// - attempt 1 (first failure): 2s
    /// - attempt 2: 4s
    /// - attempt 3: 8s
    fn next_backoff(&self, attempt: u32) -> Option<Duration> {
        if !within_budget(self.max_attempts, attempt) {
            return None;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        // Overflowing or NaN delays fall back to the cap (or the longest delay).
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        Some(match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        })
    }
}

fn within_budget(max_attempts: Option<u32>, attempt: u32) -> bool {
    max_attempts.is_none_or(|max| attempt < max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn fixed_backoff_is_unbounded_by_default() {
        let policy = FixedBackoff::new(Duration::from_secs(10));

        assert_eq!(policy.next_backoff(1), Some(Duration::from_secs(10)));
        assert_eq!(policy.next_backoff(1_000), Some(Duration::from_secs(10)));
    }

    #[rstest]
    #[case(1, true)]
    #[case(2, true)]
    #[case(3, false)]
    #[case(4, false)]
    fn fixed_backoff_respects_the_budget(#[case] attempt: u32, #[case] retries: bool) {
        let policy = FixedBackoff::new(Duration::from_secs(10)).with_max_attempts(3);

        assert_eq!(policy.next_backoff(attempt).is_some(), retries);
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = ExponentialBackoff::new(Duration::from_secs(2), 2.0);

        assert_eq!(policy.next_backoff(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_backoff(2), Some(Duration::from_secs(4)));
        assert_eq!(policy.next_backoff(3), Some(Duration::from_secs(8)));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = ExponentialBackoff::new(Duration::from_secs(2), 2.0)
            .with_max_delay(Duration::from_secs(5));

        assert_eq!(policy.next_backoff(3), Some(Duration::from_secs(5)));
        assert_eq!(policy.next_backoff(500), Some(Duration::from_secs(5)));
    }
}
