//! Job and JobRun tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::table::{Access, TxId};
use super::{MemoryStore, MemoryTx, Tables};
use crate::domain::{Job, JobId, JobRun, JobRunId, JobRunStatus, NewJob, RunKey};
use crate::ports::{JobRepository, JobRunRepository, StoreResult};

#[async_trait]
impl JobRepository<MemoryTx> for MemoryStore {
    async fn claim_due(
        &self,
        tx: &mut MemoryTx,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<Job>> {
        self.write(tx, |tables, tx| {
            Access::Ready(tables.jobs.claim_first(
                tx,
                |job| job.is_due_at(now),
                |job| job.next_due_at,
                |job| {
                    job.claim(lease_until, now);
                    job.clone()
                },
            ))
        })
        .await
    }

    async fn advance_cursor(
        &self,
        tx: &mut MemoryTx,
        job_id: JobId,
        next_due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.write(tx, |tables, tx| {
            match tables
                .jobs
                .update(&job_id, tx, |job| job.advance(next_due_at, now))
            {
                Access::Ready(done) => Access::Ready(done.is_some()),
                Access::Blocked => Access::Blocked,
            }
        })
        .await
    }

    async fn find_by_id(&self, tx: &mut MemoryTx, job_id: JobId) -> StoreResult<Option<Job>> {
        self.read(tx, |tables, tx| tables.jobs.get(&job_id, tx).cloned())
    }

    async fn find_by_name(&self, tx: &mut MemoryTx, name: &str) -> StoreResult<Option<Job>> {
        self.read(tx, |tables, tx| tables.jobs.find(tx, |job| job.name == name))
    }

    async fn upsert(&self, tx: &mut MemoryTx, def: NewJob, now: DateTime<Utc>) -> StoreResult<Job> {
        let new_id = self.ids().job_id();
        self.write(tx, |tables, tx| {
            let existing = match tables.jobs.find_unique(tx, |job| job.name == def.name) {
                Access::Ready(existing) => existing,
                Access::Blocked => return Access::Blocked,
            };
            match existing {
                Some(id) => match tables.jobs.update(&id, tx, |job| {
                    job.redefine(def.clone(), now);
                    job.clone()
                }) {
                    Access::Ready(Some(job)) => Access::Ready(job),
                    // Deleted under us; insert a fresh row instead.
                    Access::Ready(None) => insert_job(tables, tx, new_id, &def, now),
                    Access::Blocked => Access::Blocked,
                },
                None => insert_job(tables, tx, new_id, &def, now),
            }
        })
        .await
    }
}

fn insert_job(
    tables: &mut Tables,
    tx: TxId,
    id: JobId,
    def: &NewJob,
    now: DateTime<Utc>,
) -> Access<Job> {
    let job = Job::new(id, def.clone(), now);
    match tables.jobs.insert(id, tx, job.clone()) {
        Access::Ready(()) => Access::Ready(job),
        Access::Blocked => Access::Blocked,
    }
}

#[async_trait]
impl JobRunRepository<MemoryTx> for MemoryStore {
    async fn upsert(
        &self,
        tx: &mut MemoryTx,
        job_id: JobId,
        run_key: &RunKey,
        status: JobRunStatus,
        deadline_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreResult<JobRun> {
        let new_id = self.ids().job_run_id();
        self.write(tx, |tables, tx| {
            let existing = match tables
                .job_runs
                .find_unique(tx, |run| run.job_id == job_id && run.run_key == *run_key)
            {
                Access::Ready(existing) => existing,
                Access::Blocked => return Access::Blocked,
            };
            if let Some(run) = existing.and_then(|id| tables.job_runs.get(&id, tx)) {
                return Access::Ready(run.clone());
            }
            let run = JobRun::new(new_id, job_id, run_key.clone(), status, deadline_at, now);
            match tables.job_runs.insert(new_id, tx, run.clone()) {
                Access::Ready(()) => Access::Ready(run),
                Access::Blocked => Access::Blocked,
            }
        })
        .await
    }

    async fn find_by_key(
        &self,
        tx: &mut MemoryTx,
        job_id: JobId,
        run_key: &RunKey,
    ) -> StoreResult<Option<JobRun>> {
        self.read(tx, |tables, tx| {
            tables
                .job_runs
                .find(tx, |run| run.job_id == job_id && run.run_key == *run_key)
        })
    }

    async fn find_by_id(&self, tx: &mut MemoryTx, run_id: JobRunId) -> StoreResult<Option<JobRun>> {
        self.read(tx, |tables, tx| tables.job_runs.get(&run_id, tx).cloned())
    }

    async fn find_all_by_job(&self, tx: &mut MemoryTx, job_id: JobId) -> StoreResult<Vec<JobRun>> {
        let mut runs = self.read(tx, |tables, tx| {
            tables.job_runs.filter(tx, |run| run.job_id == job_id)
        })?;
        runs.sort_by_key(|run| (run.created_at, run.id));
        Ok(runs)
    }

    async fn lock_by_id(&self, tx: &mut MemoryTx, run_id: JobRunId) -> StoreResult<Option<JobRun>> {
        self.write(tx, |tables, tx| tables.job_runs.update(&run_id, tx, |run| run.clone()))
            .await
    }

    async fn mark_started(
        &self,
        tx: &mut MemoryTx,
        run_id: JobRunId,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.write(tx, |tables, tx| {
            match tables.job_runs.update(&run_id, tx, |run| run.mark_started(now)) {
                Access::Ready(changed) => Access::Ready(changed.unwrap_or(false)),
                Access::Blocked => Access::Blocked,
            }
        })
        .await
    }

    async fn mark_finished(
        &self,
        tx: &mut MemoryTx,
        run_id: JobRunId,
        success: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.write(tx, |tables, tx| {
            match tables
                .job_runs
                .update(&run_id, tx, |run| run.mark_finished(success, now))
            {
                Access::Ready(changed) => Access::Ready(changed.unwrap_or(false)),
                Access::Blocked => Access::Blocked,
            }
        })
        .await
    }
}
