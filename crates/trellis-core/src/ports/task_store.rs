//! Task, TaskDependency and TaskRun repositories.
//!
//! Every mutating TaskRun operation is a single atomic read-modify-write on
//! one row (or a set of rows for the sweeps). Callers never read a row and
//! write it back in a separate step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    DoneCountIncrement, JobId, JobRunId, NewTask, Task, TaskId, TaskRun, TaskRunId, WorkerId,
};
use crate::ports::transaction::StoreResult;

#[async_trait]
pub trait TaskRepository<Tx: Send + 'static>: Send + Sync {
    async fn find_by_job_and_name(
        &self,
        tx: &mut Tx,
        job_id: JobId,
        name: &str,
    ) -> StoreResult<Option<Task>>;

    /// Ordered by id.
    async fn find_all_by_job(&self, tx: &mut Tx, job_id: JobId) -> StoreResult<Vec<Task>>;

    async fn find_by_id(&self, tx: &mut Tx, task_id: TaskId) -> StoreResult<Option<Task>>;

    /// Insert or update by `(job_id, name)`.
    async fn upsert(&self, tx: &mut Tx, task: NewTask, now: DateTime<Utc>) -> StoreResult<Task>;
}

#[async_trait]
pub trait TaskDependencyRepository<Tx: Send + 'static>: Send + Sync {
    /// Add `pre -> post`. False when the edge already existed.
    async fn add(&self, tx: &mut Tx, pre: TaskId, post: TaskId) -> StoreResult<bool>;

    /// Remove `pre -> post`. False when there was no such edge.
    async fn remove(&self, tx: &mut Tx, pre: TaskId, post: TaskId) -> StoreResult<bool>;

    /// Tasks `post` waits for.
    async fn find_predecessors(&self, tx: &mut Tx, post: TaskId) -> StoreResult<Vec<TaskId>>;

    /// Tasks waiting for `pre`.
    async fn find_successors(&self, tx: &mut Tx, pre: TaskId) -> StoreResult<Vec<TaskId>>;
}

#[async_trait]
pub trait TaskRunRepository<Tx: Send + 'static>: Send + Sync {
    /// Claim one READY run with `available_at <= now`, ordered by
    /// `(available_at, id)`, skipping rows locked by other transactions, and
    /// move it to RUNNING in the same step.
    async fn claim_ready(
        &self,
        tx: &mut Tx,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        worker_id: Option<WorkerId>,
    ) -> StoreResult<Option<TaskRun>>;

    /// Extend the lease of a RUNNING run. False otherwise.
    async fn heartbeat(
        &self,
        tx: &mut Tx,
        id: TaskRunId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// RUNNING -> DONE. False otherwise.
    async fn mark_done(&self, tx: &mut Tx, id: TaskRunId, now: DateTime<Utc>) -> StoreResult<bool>;

    /// RUNNING at `attempt` -> READY at `available_at`, `attempt += 1`.
    /// False otherwise, including when `attempt` is not the current one.
    async fn retry_with_backoff(
        &self,
        tx: &mut Tx,
        id: TaskRunId,
        attempt: u32,
        available_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// RUNNING at `attempt` -> FAILED. False otherwise.
    async fn mark_failed(
        &self,
        tx: &mut Tx,
        id: TaskRunId,
        attempt: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// `done_cnt += 1`, promoting BLOCKED -> READY in the same atomic step
    /// iff the new count reaches `pre_cnt`. `None` when the run is absent.
    async fn increment_done_count(
        &self,
        tx: &mut Tx,
        id: TaskRunId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DoneCountIncrement>>;

    async fn find_by_id(&self, tx: &mut Tx, id: TaskRunId) -> StoreResult<Option<TaskRun>>;

    /// Ordered by id.
    async fn find_all_by_run(&self, tx: &mut Tx, run_id: JobRunId) -> StoreResult<Vec<TaskRun>>;

    async fn find_by_run_and_task(
        &self,
        tx: &mut Tx,
        run_id: JobRunId,
        task_id: TaskId,
    ) -> StoreResult<Option<TaskRun>>;

    /// Create the attempt-1 run for `(run_id, task_id)`, or reset the existing
    /// one to the prepared state. Never duplicates.
    async fn create_or_reset(
        &self,
        tx: &mut Tx,
        run_id: JobRunId,
        task_id: TaskId,
        indegree: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<TaskRun>;

    /// RUNNING runs whose lease ended -> READY at `available_at`,
    /// `attempt += 1`, `last_error = reason`. Returns the count.
    async fn recover_expired_leases(
        &self,
        tx: &mut Tx,
        now: DateTime<Utc>,
        available_at: DateTime<Utc>,
        reason: &str,
    ) -> StoreResult<usize>;

    /// BLOCKED runs with `done_cnt >= pre_cnt` -> READY now. Returns the count.
    async fn promote_unblocked(&self, tx: &mut Tx, now: DateTime<Utc>) -> StoreResult<usize>;

    /// Delete DONE/FAILED runs finished before `threshold`. Returns the count.
    async fn archive_finished_older_than(
        &self,
        tx: &mut Tx,
        threshold: DateTime<Utc>,
    ) -> StoreResult<usize>;

    /// Clamp READY `available_at` into `[min, max]`. Returns the count.
    async fn normalize_availability(
        &self,
        tx: &mut Tx,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<usize>;
}
