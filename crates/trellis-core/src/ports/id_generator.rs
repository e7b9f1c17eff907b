//! IdGenerator port - id generation for store-assigned entities.
//!
//! # Implementations
//! - **UlidGenerator**: clock-seeded ULIDs

use std::sync::{Mutex, PoisonError};

use crate::domain::ids::{JobId, JobRunId, TaskId, TaskRunId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator mints ids for new rows.
///
/// Stores call it on insert, so it must be usable from many threads.
pub trait IdGenerator: Send + Sync {
    fn job_id(&self) -> JobId;

    fn job_run_id(&self) -> JobRunId;

    fn task_id(&self) -> TaskId;

    fn task_run_id(&self) -> TaskRunId;
}

/// UlidGenerator stamps ULIDs with the injected clock's time.
///
/// Ids are monotonic per generator: within one millisecond (or when the
/// clock stands still or goes back) the previous id is incremented, so rows
/// sort by id in creation order.
pub struct UlidGenerator<C> {
    clock: C,
    last: Mutex<Ulid>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            last: Mutex::new(Ulid::nil()),
        }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let next = if timestamp_ms <= last.timestamp_ms() {
            last.increment()
                .unwrap_or_else(|| Ulid::from_parts(timestamp_ms, rand::random()))
        } else {
            Ulid::from_parts(timestamp_ms, rand::random())
        };
        *last = next;
        next
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn job_id(&self) -> JobId {
        JobId::from(self.next())
    }

    fn job_run_id(&self) -> JobRunId {
        JobRunId::from(self.next())
    }

    fn task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn task_run_id(&self) -> TaskRunId {
        TaskRunId::from(self.next())
    }
}
