//! Errors - error taxonomy for the scheduler core.
//!
//! Two layers:
//! - [`StoreError`]: what a store adapter reports (lock timeouts, misuse of a
//!   transaction handle, backend outages).
//! - [`SchedulerError`]: what services return to callers. Every variant maps
//!   to an [`ErrorKind`] so periodic drivers can decide whether to retry.
//!
//! A failed task handler is not an error here: it is reported through
//! `TaskDispatcher::fail_and_retry` and recorded as `last_error`.

use std::time::Duration;

/// StoreError is reported by store adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The transaction handle is finished or belongs to another store.
    #[error("transaction precondition violated: {0}")]
    Precondition(String),

    /// A row lock held by another transaction was not released in time.
    #[error("timed out after {0:?} waiting for a row lock")]
    LockTimeout(Duration),

    /// The backend could not serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// CronError is reported by schedule calculators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("invalid cron expression `{expr}`: {reason}")]
    Invalid { expr: String, reason: String },

    #[error("cron expression `{0}` has no occurrence after the given instant")]
    Exhausted(String),
}

/// SchedulerError is returned by the services.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// Programmer error: an operation ran without a usable unit of work.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The unit of work was rolled back; the next tick may retry.
    #[error("transient store failure: {0}")]
    TransientStore(StoreError),

    #[error(transparent)]
    Schedule(#[from] CronError),
}

impl SchedulerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PreconditionViolation(_) => ErrorKind::Precondition,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::TransientStore(_) => ErrorKind::Transient,
            Self::Schedule(_) => ErrorKind::InvalidSchedule,
        }
    }

    /// Only transient store failures are worth retrying on the next tick.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Precondition(message) => Self::PreconditionViolation(message),
            other => Self::TransientStore(other),
        }
    }
}

/// ErrorKind classifies a [`SchedulerError`] for operators and drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Precondition,
    NotFound,
    Transient,
    InvalidSchedule,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StoreError::Precondition("finished".into()), ErrorKind::Precondition, false)]
    #[case(StoreError::LockTimeout(Duration::from_secs(5)), ErrorKind::Transient, true)]
    #[case(StoreError::Unavailable("down".into()), ErrorKind::Transient, true)]
    fn store_errors_map_to_kinds(
        #[case] err: StoreError,
        #[case] kind: ErrorKind,
        #[case] retryable: bool,
    ) {
        let err = SchedulerError::from(err);

        assert_eq!(err.kind(), kind);
        assert_eq!(err.is_retryable(), retryable);
    }

    #[test]
    fn not_found_names_the_entity() {
        let err = SchedulerError::not_found("task run", "taskrun-1");

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "task run not found: taskrun-1");
        assert!(!err.is_retryable());
    }

    #[test]
    fn cron_errors_are_not_retryable() {
        let err: SchedulerError = CronError::Exhausted("0 0 0 30 2 *".into()).into();

        assert_eq!(err.kind(), ErrorKind::InvalidSchedule);
        assert!(!err.is_retryable());
    }
}
