//! Task templates, dependency edges, and task runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, JobRunId, TaskId, TaskRunId, WorkerId};
use super::state::TaskRunStatus;

/// A task template inside a job. Not an execution instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    /// Unique within the job.
    pub name: String,
    pub handler_key: String,
    /// Number of direct predecessors, as declared by the catalog.
    pub indegree: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: TaskId, def: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            job_id: def.job_id,
            name: def.name,
            handler_key: def.handler_key,
            indegree: def.indegree,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn redefine(&mut self, def: NewTask, now: DateTime<Utc>) {
        self.handler_key = def.handler_key;
        self.indegree = def.indegree;
        self.updated_at = now;
    }
}

/// Input to `TaskRepository::upsert`, keyed by `(job_id, name)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub job_id: JobId,
    pub name: String,
    pub handler_key: String,
    pub indegree: u32,
}

/// Edge `pre -> post`: `post` waits for `pre`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskDependency {
    pub pre_task_id: TaskId,
    pub post_task_id: TaskId,
}

/// One task's execution instance inside a job run.
///
/// Design:
/// - `pre_cnt` is frozen at creation; `done_cnt` never decreases.
/// - All state transitions happen here, so every store adapter applies the
///   same rules. Guarded transitions return `false` when the current status
///   does not allow them and leave the row untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: TaskRunId,
    pub job_run_id: JobRunId,
    pub task_id: TaskId,
    pub status: TaskRunStatus,
    pub attempt: u32,
    pub pre_cnt: u32,
    pub done_cnt: u32,
    pub worker_id: Option<WorkerId>,
    pub available_at: Option<DateTime<Utc>>,
    pub lease_until: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRun {
    /// Fresh run for attempt 1: READY now when `indegree == 0`, BLOCKED otherwise.
    pub fn prepared(
        id: TaskRunId,
        job_run_id: JobRunId,
        task_id: TaskId,
        indegree: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let mut run = Self {
            id,
            job_run_id,
            task_id,
            status: TaskRunStatus::Blocked,
            attempt: 1,
            pre_cnt: 0,
            done_cnt: 0,
            worker_id: None,
            available_at: None,
            lease_until: None,
            started_at: None,
            finished_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        run.reset(indegree, now);
        run
    }

    /// Back to the prepared state for attempt 1, keeping `id` and `created_at`.
    pub fn reset(&mut self, indegree: u32, now: DateTime<Utc>) {
        if indegree == 0 {
            self.status = TaskRunStatus::Ready;
            self.available_at = Some(now);
        } else {
            self.status = TaskRunStatus::Blocked;
            self.available_at = None;
        }
        self.attempt = 1;
        self.pre_cnt = indegree;
        self.done_cnt = 0;
        self.worker_id = None;
        self.lease_until = None;
        self.started_at = None;
        self.finished_at = None;
        self.last_error = None;
        self.updated_at = now;
    }

    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskRunStatus::Ready && self.available_at.is_some_and(|at| at <= now)
    }

    /// READY -> RUNNING. `started_at` records the first claim only.
    pub fn claim(
        &mut self,
        lease_until: DateTime<Utc>,
        worker_id: Option<WorkerId>,
        now: DateTime<Utc>,
    ) {
        self.status = TaskRunStatus::Running;
        self.lease_until = Some(lease_until);
        self.worker_id = worker_id;
        self.started_at.get_or_insert(now);
        self.updated_at = now;
    }

    pub fn extend_lease(&mut self, lease_until: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.status != TaskRunStatus::Running {
            return false;
        }
        self.lease_until = Some(lease_until);
        self.updated_at = now;
        true
    }

    /// RUNNING -> DONE.
    pub fn complete(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != TaskRunStatus::Running {
            return false;
        }
        self.status = TaskRunStatus::Done;
        self.lease_until = None;
        self.finished_at = Some(now);
        self.updated_at = now;
        true
    }

    /// RUNNING -> READY for the next attempt.
    pub fn schedule_retry(
        &mut self,
        available_at: DateTime<Utc>,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status != TaskRunStatus::Running {
            return false;
        }
        self.requeue(available_at, error.into(), now);
        true
    }

    /// RUNNING -> FAILED. The retry budget is spent.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.status != TaskRunStatus::Running {
            return false;
        }
        self.status = TaskRunStatus::Failed;
        self.lease_until = None;
        self.finished_at = Some(now);
        self.last_error = Some(error.into());
        self.updated_at = now;
        true
    }

    /// Count one finished predecessor. Returns true when this increment is the
    /// one that moves the run from BLOCKED to READY.
    pub fn record_predecessor_done(&mut self, now: DateTime<Utc>) -> bool {
        self.done_cnt = self.done_cnt.saturating_add(1);
        self.updated_at = now;
        self.promote_if_unblocked(now)
    }

    /// BLOCKED -> READY when every predecessor is done.
    pub fn promote_if_unblocked(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != TaskRunStatus::Blocked || self.done_cnt < self.pre_cnt {
            return false;
        }
        self.status = TaskRunStatus::Ready;
        self.available_at = Some(now);
        self.updated_at = now;
        true
    }

    pub fn lease_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskRunStatus::Running && self.lease_until.is_some_and(|until| until <= now)
    }

    /// Abandoned RUNNING -> READY, charged as a failed attempt.
    pub fn recover_expired(
        &mut self,
        available_at: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.lease_expired_at(now) {
            return false;
        }
        self.requeue(available_at, reason.to_owned(), now);
        true
    }

    /// Pull a READY run's `available_at` back into `[min, max]`.
    ///
    /// A READY run without `available_at` could never be claimed; it becomes
    /// available now.
    pub fn clamp_availability(
        &mut self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status != TaskRunStatus::Ready {
            return false;
        }
        let clamped = match self.available_at {
            None => now,
            Some(at) if at < min => min,
            Some(at) if at > max => max,
            Some(_) => return false,
        };
        self.available_at = Some(clamped);
        self.updated_at = now;
        true
    }

    pub fn finished_before(&self, threshold: DateTime<Utc>) -> bool {
        self.status.is_archivable() && self.finished_at.is_some_and(|at| at < threshold)
    }

    fn requeue(&mut self, available_at: DateTime<Utc>, error: String, now: DateTime<Utc>) {
        self.status = TaskRunStatus::Ready;
        self.available_at = Some(available_at);
        self.attempt = self.attempt.saturating_add(1);
        self.lease_until = None;
        self.worker_id = None;
        self.last_error = Some(error);
        self.updated_at = now;
    }
}

/// Result of `TaskRunRepository::increment_done_count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoneCountIncrement {
    pub task_run: TaskRun,
    /// This increment crossed the threshold and promoted the run.
    pub promoted: bool,
}
