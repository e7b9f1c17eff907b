//! Job and JobRun repositories.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Job, JobId, JobRun, JobRunId, JobRunStatus, NewJob, RunKey};
use crate::ports::transaction::StoreResult;

/// JobRepository persists job definitions and their schedule cursors.
#[async_trait]
pub trait JobRepository<Tx: Send + 'static>: Send + Sync {
    /// Claim one due job and set its activation lease.
    ///
    /// Candidates: `enabled ∧ next_due_at <= now ∧ (lease_until is null ∨
    /// lease_until <= now)`, ordered by `(next_due_at, id)`. Rows locked by
    /// other transactions are skipped, never waited for. The winner stays
    /// locked by `tx` until it settles.
    async fn claim_due(
        &self,
        tx: &mut Tx,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<Job>>;

    /// Set `next_due_at` and clear the activation lease. False if the job is gone.
    async fn advance_cursor(
        &self,
        tx: &mut Tx,
        job_id: JobId,
        next_due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn find_by_id(&self, tx: &mut Tx, job_id: JobId) -> StoreResult<Option<Job>>;

    async fn find_by_name(&self, tx: &mut Tx, name: &str) -> StoreResult<Option<Job>>;

    /// Insert or update by `name`, returning the stored row.
    async fn upsert(&self, tx: &mut Tx, job: NewJob, now: DateTime<Utc>) -> StoreResult<Job>;
}

/// JobRunRepository persists job runs, unique on `(job_id, run_key)`.
#[async_trait]
pub trait JobRunRepository<Tx: Send + 'static>: Send + Sync {
    /// Insert when `(job_id, run_key)` is absent; otherwise return the existing
    /// row unchanged.
    async fn upsert(
        &self,
        tx: &mut Tx,
        job_id: JobId,
        run_key: &RunKey,
        status: JobRunStatus,
        deadline_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreResult<JobRun>;

    async fn find_by_key(
        &self,
        tx: &mut Tx,
        job_id: JobId,
        run_key: &RunKey,
    ) -> StoreResult<Option<JobRun>>;

    async fn find_by_id(&self, tx: &mut Tx, run_id: JobRunId) -> StoreResult<Option<JobRun>>;

    /// Every run of `job_id`, oldest first.
    async fn find_all_by_job(&self, tx: &mut Tx, job_id: JobId) -> StoreResult<Vec<JobRun>>;

    /// Read the run and hold its row lock until `tx` settles, waiting for
    /// other holders. Serializes decisions that read the run's task runs.
    async fn lock_by_id(&self, tx: &mut Tx, run_id: JobRunId) -> StoreResult<Option<JobRun>>;

    /// CREATED -> RUNNING. False when the run is absent or already started.
    async fn mark_started(
        &self,
        tx: &mut Tx,
        run_id: JobRunId,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// -> DONE / FAILED. False when the run is absent or already terminal.
    async fn mark_finished(
        &self,
        tx: &mut Tx,
        run_id: JobRunId,
        success: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;
}
