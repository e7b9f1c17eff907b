//! JobActivator - turns one due schedule slot into a prepared job run.
//!
//! One activation is one isolated unit of work:
//! claim the due job (skip-locked, with an activation lease), upsert the run
//! for the slot's key, prepare its task graph, advance the cursor. A crash or
//! error anywhere rolls all of it back and the slot stays due.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use tracing::{debug, info, warn};

use super::graph::TaskGraphPreparer;
use super::unit_of_work::TransactionBoundary;
use crate::domain::{JobId, JobRun, JobRunStatus, RunKey, SchedulerError, time};
use crate::ports::{Clock, CronCalculator, StorePorts, TransactionManager};

/// Result of [`JobActivator::activate_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// Nothing is due.
    Idle,
    Activated {
        job_id: JobId,
        job_run: JobRun,
        /// False when the run had already started and was left untouched.
        prepared: bool,
        task_runs: usize,
        next_due_at: DateTime<Utc>,
    },
}

pub struct JobActivator<M: TransactionManager> {
    ports: StorePorts<M>,
    boundary: TransactionBoundary<M>,
    clock: Arc<dyn Clock>,
    cron: Arc<dyn CronCalculator>,
    graph: Arc<TaskGraphPreparer<M>>,
    zone: FixedOffset,
    run_deadline: Option<Duration>,
}

impl<M: TransactionManager> JobActivator<M> {
    pub fn new(
        ports: StorePorts<M>,
        clock: Arc<dyn Clock>,
        cron: Arc<dyn CronCalculator>,
        graph: Arc<TaskGraphPreparer<M>>,
    ) -> Self {
        Self {
            boundary: TransactionBoundary::new(ports.transactions.clone()),
            ports,
            clock,
            cron,
            graph,
            zone: Utc.fix(),
            run_deadline: None,
        }
    }

    /// Zone the cron fields are read in.
    pub fn with_zone(mut self, zone: FixedOffset) -> Self {
        self.zone = zone;
        self
    }

    /// New runs get `deadline_at = now + run_deadline`.
    pub fn with_run_deadline(mut self, run_deadline: Option<Duration>) -> Self {
        self.run_deadline = run_deadline;
        self
    }

    /// Activate at most one due job.
    ///
    /// The run key is derived from the slot (`next_due_at`), so retrying an
    /// activation that rolled back reuses the same run. Slots missed while
    /// nothing was ticking are coalesced: the cursor moves to the first
    /// occurrence after now.
    pub async fn activate_next(&self, job_lease: Duration) -> Result<Activation, SchedulerError> {
        let mut uow = self.boundary.requires_new().await?;
        let now = self.clock.now();

        let Some(job) = self
            .ports
            .jobs
            .claim_due(uow.tx()?, now, time::add(now, job_lease))
            .await?
        else {
            uow.commit().await?;
            debug!("no job due");
            return Ok(Activation::Idle);
        };

        let next_due_at = match self.next_slot(&job.cron_expr, job.next_due_at, now) {
            Ok(next) => next,
            Err(err) => {
                // Keep the lease so this job does not shadow other due jobs
                // until it expires.
                uow.commit().await?;
                warn!(job = %job.id, name = %job.name, error = %err, "cannot compute next slot");
                return Err(err);
            }
        };

        let run_key = RunKey::for_slot(job.next_due_at);
        let deadline_at = self.run_deadline.map(|deadline| time::add(now, deadline));
        let job_run = self
            .ports
            .job_runs
            .upsert(uow.tx()?, job.id, &run_key, JobRunStatus::Created, deadline_at, now)
            .await?;

        let (prepared, task_runs) = if job_run.status == JobRunStatus::Created {
            let runs = self
                .graph
                .prepare_for(Some(uow.tx()?), job.id, job_run.id)
                .await?;
            (true, runs.len())
        } else {
            debug!(run = %job_run.id, status = ?job_run.status, "run already started, graph kept");
            (false, 0)
        };

        self.ports
            .jobs
            .advance_cursor(uow.tx()?, job.id, next_due_at, now)
            .await?;
        uow.commit().await?;

        info!(
            job = %job.id,
            name = %job.name,
            run = %job_run.id,
            key = %run_key,
            task_runs,
            %next_due_at,
            "job activated"
        );
        Ok(Activation::Activated {
            job_id: job.id,
            job_run,
            prepared,
            task_runs,
            next_due_at,
        })
    }

    fn next_slot(
        &self,
        expr: &str,
        slot: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        let next = self.cron.next_after(slot, expr, self.zone)?;
        if next > now {
            return Ok(next);
        }
        Ok(self.cron.next_after(now, expr, self.zone)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, TaskRunStatus};
    use crate::impls::{CronScheduleCalculator, MemoryStore};
    use crate::testing::{Harness, at};

    const LEASE: Duration = Duration::from_secs(5);

    fn activator(h: &Harness) -> JobActivator<MemoryStore> {
        let graph = Arc::new(TaskGraphPreparer::new(h.ports.clone(), h.clock.clone()));
        JobActivator::new(
            h.ports.clone(),
            h.clock.clone(),
            Arc::new(CronScheduleCalculator::new()),
            graph,
        )
    }

    async fn job_cursor(h: &Harness, id: JobId) -> crate::domain::Job {
        let mut tx = h.store.begin().await.unwrap();
        h.ports.jobs.find_by_id(&mut tx, id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn idle_when_nothing_is_due() {
        let h = Harness::new(at(12, 0, 0));
        h.define_job("later", "*/5 * * * *", at(12, 5, 0), &["a"], &[]).await;

        let activation = activator(&h).activate_next(LEASE).await.unwrap();

        assert_eq!(activation, Activation::Idle);
    }

    #[tokio::test]
    async fn due_job_gets_a_prepared_run_and_an_advanced_cursor() {
        let h = Harness::new(at(12, 1, 0));
        let (job, _) = h
            .define_job("etl", "*/5 * * * *", at(12, 0, 0), &["t1", "t2"], &[("t1", "t2")])
            .await;

        let activation = activator(&h)
            .with_run_deadline(Some(Duration::from_secs(3600)))
            .activate_next(LEASE)
            .await
            .unwrap();

        let Activation::Activated { job_run, prepared, task_runs, next_due_at, .. } = activation
        else {
            panic!("expected an activation");
        };
        assert!(prepared);
        assert_eq!(task_runs, 2);
        assert_eq!(job_run.run_key, RunKey::for_slot(at(12, 0, 0)));
        assert_eq!(job_run.deadline_at, Some(at(13, 1, 0)));
        assert_eq!(next_due_at, at(12, 5, 0));

        let job = job_cursor(&h, job.id).await;
        assert_eq!(job.next_due_at, at(12, 5, 0));
        assert_eq!(job.lease_until, None);
    }

    #[tokio::test]
    async fn missed_slots_are_coalesced() {
        let h = Harness::new(at(12, 17, 0));
        let (job, _) = h.define_job("etl", "*/5 * * * *", at(12, 0, 0), &["a"], &[]).await;

        activator(&h).activate_next(LEASE).await.unwrap();

        assert_eq!(job_cursor(&h, job.id).await.next_due_at, at(12, 20, 0));
    }

    #[tokio::test]
    async fn retried_slot_reuses_and_resets_the_run() {
        let h = Harness::new(at(12, 1, 0));
        let (job, _) = h.define_job("etl", "*/5 * * * *", at(12, 0, 0), &["a"], &[]).await;
        // A previous attempt created the run but never advanced the cursor.
        let existing = h.create_run(&job, at(12, 0, 0)).await;

        let activation = activator(&h).activate_next(LEASE).await.unwrap();

        let Activation::Activated { job_run, prepared, .. } = activation else {
            panic!("expected an activation");
        };
        assert_eq!(job_run.id, existing.id);
        assert!(prepared);
        let mut tx = h.store.begin().await.unwrap();
        let runs = h.ports.task_runs.find_all_by_run(&mut tx, existing.id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, TaskRunStatus::Ready);
    }

    #[tokio::test]
    async fn started_run_is_left_alone() {
        let h = Harness::new(at(12, 1, 0));
        let (job, _) = h.define_job("etl", "*/5 * * * *", at(12, 0, 0), &["a"], &[]).await;
        let existing = h.create_run(&job, at(12, 0, 0)).await;
        let mut tx = h.store.begin().await.unwrap();
        h.ports.job_runs.mark_started(&mut tx, existing.id, at(12, 0, 30)).await.unwrap();
        h.store.commit(tx).await.unwrap();

        let activation = activator(&h).activate_next(LEASE).await.unwrap();

        assert!(matches!(
            activation,
            Activation::Activated { prepared: false, task_runs: 0, .. }
        ));
        assert_eq!(job_cursor(&h, job.id).await.next_due_at, at(12, 5, 0));
    }

    #[tokio::test]
    async fn unparsable_schedule_does_not_starve_other_jobs() {
        let h = Harness::new(at(12, 1, 0));
        h.define_job("broken", "not a cron", at(11, 0, 0), &["a"], &[]).await;
        let (good, _) = h.define_job("good", "*/5 * * * *", at(12, 0, 0), &["a"], &[]).await;
        let activator = activator(&h);

        let err = activator.activate_next(LEASE).await.unwrap_err();
        let next = activator.activate_next(LEASE).await.unwrap();

        assert_eq!(err.kind(), ErrorKind::InvalidSchedule);
        assert!(matches!(next, Activation::Activated { job_id, .. } if job_id == good.id));
    }
}
