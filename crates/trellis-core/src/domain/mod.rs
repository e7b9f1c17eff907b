//! Domain model (ids, entities, statuses, errors).
//!
//! Entities own their per-row state transitions; store adapters only decide
//! which rows to touch and under which lock.

pub mod errors;
pub mod ids;
pub mod job;
pub mod state;
pub mod task;
pub mod time;
pub mod worker_slot;

pub use self::errors::{CronError, ErrorKind, SchedulerError, StoreError};
pub use self::ids::{JobId, JobRunId, TaskId, TaskRunId, WorkerId};
pub use self::job::{Job, JobRun, NewJob, RunKey};
pub use self::state::{JobRunStatus, TaskRunStatus};
pub use self::task::{DoneCountIncrement, NewTask, Task, TaskDependency, TaskRun};
pub use self::worker_slot::WorkerSlot;
