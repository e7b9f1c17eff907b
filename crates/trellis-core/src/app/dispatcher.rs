//! TaskDispatcher - claim, lease, heartbeat, completion and retry of task runs.
//!
//! Every public operation is one isolated unit of work. Task run rows are
//! always locked before their job run row, and successors in ascending id
//! order, so concurrent completions serialize instead of deadlocking.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::graph::TaskGraphPreparer;
use super::retry::RetryPolicy;
use super::unit_of_work::TransactionBoundary;
use crate::domain::{
    JobRunStatus, SchedulerError, TaskRun, TaskRunId, TaskRunStatus, WorkerId, time,
};
use crate::ports::{Clock, StorePorts, TransactionManager};

/// Result of [`TaskDispatcher::mark_done`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Completed {
        task_run: TaskRun,
        /// Successor runs this completion promoted to READY.
        promoted: Vec<TaskRunId>,
        /// Every task run of the job run is now DONE.
        run_finished: bool,
    },
    /// The run was not RUNNING; nothing changed.
    Ignored { status: TaskRunStatus },
}

/// Result of [`TaskDispatcher::fail_and_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Back to READY for the next attempt.
    Scheduled {
        attempt: u32,
        available_at: DateTime<Utc>,
    },
    /// Retry budget spent; the task run and its job run are FAILED.
    Exhausted,
    /// The run is not RUNNING at the reported attempt; nothing changed.
    Ignored { status: TaskRunStatus, attempt: u32 },
}

pub struct TaskDispatcher<M: TransactionManager> {
    ports: StorePorts<M>,
    boundary: TransactionBoundary<M>,
    clock: Arc<dyn Clock>,
    retry: Arc<dyn RetryPolicy>,
    graph: Arc<TaskGraphPreparer<M>>,
}

impl<M: TransactionManager> TaskDispatcher<M> {
    pub fn new(
        ports: StorePorts<M>,
        clock: Arc<dyn Clock>,
        retry: Arc<dyn RetryPolicy>,
        graph: Arc<TaskGraphPreparer<M>>,
    ) -> Self {
        Self {
            boundary: TransactionBoundary::new(ports.transactions.clone()),
            ports,
            clock,
            retry,
            graph,
        }
    }

    /// Claim one READY run whose `available_at` has passed.
    ///
    /// The first claim in a CREATED job run also marks the job run RUNNING.
    pub async fn claim_ready(
        &self,
        lease: Duration,
        worker_id: Option<WorkerId>,
    ) -> Result<Option<TaskRun>, SchedulerError> {
        let mut uow = self.boundary.requires_new().await?;
        let now = self.clock.now();

        let Some(run) = self
            .ports
            .task_runs
            .claim_ready(uow.tx()?, now, time::add(now, lease), worker_id)
            .await?
        else {
            uow.commit().await?;
            return Ok(None);
        };

        let job_run = self.ports.job_runs.find_by_id(uow.tx()?, run.job_run_id).await?;
        if job_run.is_some_and(|job_run| job_run.status == JobRunStatus::Created) {
            self.ports
                .job_runs
                .mark_started(uow.tx()?, run.job_run_id, now)
                .await?;
        }
        uow.commit().await?;

        debug!(
            task_run = %run.id,
            attempt = run.attempt,
            worker = ?worker_id,
            "task run claimed"
        );
        Ok(Some(run))
    }

    /// Claim up to `max` runs, one isolated unit of work per attempt.
    ///
    /// Stops at the first empty result. A failure after some claims have
    /// committed returns what was claimed; those runs are leased and must be
    /// handed to a worker rather than dropped.
    pub async fn claim_up_to(
        &self,
        max: usize,
        lease: Duration,
        worker_id: Option<WorkerId>,
    ) -> Result<Vec<TaskRun>, SchedulerError> {
        let mut claimed = Vec::with_capacity(max);
        while claimed.len() < max {
            match self.claim_ready(lease, worker_id).await {
                Ok(Some(run)) => claimed.push(run),
                Ok(None) => break,
                Err(err) if !claimed.is_empty() => {
                    warn!(error = %err, claimed = claimed.len(), "claim failed, keeping earlier claims");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(claimed)
    }

    /// Extend the lease of a RUNNING run. False (no-op) in any other state.
    pub async fn heartbeat(&self, id: TaskRunId, lease: Duration) -> Result<bool, SchedulerError> {
        let mut uow = self.boundary.requires_new().await?;
        let now = self.clock.now();
        let extended = self
            .ports
            .task_runs
            .heartbeat(uow.tx()?, id, time::add(now, lease), now)
            .await?;
        uow.commit().await?;
        Ok(extended)
    }

    /// RUNNING -> DONE, then count the completion on every successor.
    pub async fn mark_done(&self, id: TaskRunId) -> Result<Completion, SchedulerError> {
        let mut uow = self.boundary.requires_new().await?;
        let now = self.clock.now();

        let completed = self.ports.task_runs.mark_done(uow.tx()?, id, now).await?;
        let run = self
            .ports
            .task_runs
            .find_by_id(uow.tx()?, id)
            .await?
            .ok_or_else(|| SchedulerError::not_found("task run", id))?;
        if !completed {
            uow.commit().await?;
            debug!(task_run = %id, status = ?run.status, "completion ignored");
            return Ok(Completion::Ignored { status: run.status });
        }

        let successors = self
            .ports
            .dependencies
            .find_successors(uow.tx()?, run.task_id)
            .await?;
        let mut successor_runs = Vec::with_capacity(successors.len());
        for task_id in successors {
            if let Some(successor) = self
                .ports
                .task_runs
                .find_by_run_and_task(uow.tx()?, run.job_run_id, task_id)
                .await?
            {
                successor_runs.push(successor.id);
            }
        }
        successor_runs.sort();

        let mut promoted = Vec::new();
        for successor in successor_runs {
            let increment = self.graph.on_predecessor_done(Some(uow.tx()?), successor).await?;
            if increment.promoted {
                promoted.push(successor);
            }
        }

        // Under the job run lock, the last of two concurrent completions
        // sees the other one committed.
        self.ports.job_runs.lock_by_id(uow.tx()?, run.job_run_id).await?;
        let siblings = self
            .ports
            .task_runs
            .find_all_by_run(uow.tx()?, run.job_run_id)
            .await?;
        let run_finished = siblings.iter().all(|r| r.status == TaskRunStatus::Done)
            && self
                .ports
                .job_runs
                .mark_finished(uow.tx()?, run.job_run_id, true, now)
                .await?;
        uow.commit().await?;

        info!(
            task_run = %id,
            promoted = promoted.len(),
            run_finished,
            "task run done"
        );
        Ok(Completion::Completed {
            task_run: run,
            promoted,
            run_finished,
        })
    }

    /// Report a failed `attempt` of a RUNNING run.
    ///
    /// Within the retry budget the run goes back to READY at
    /// `now + backoff` with `attempt + 1`; otherwise it becomes FAILED and so
    /// does its job run. Reports for an attempt that is no longer current are
    /// ignored.
    pub async fn fail_and_retry(
        &self,
        id: TaskRunId,
        attempt: u32,
        error: &str,
    ) -> Result<RetryOutcome, SchedulerError> {
        let mut uow = self.boundary.requires_new().await?;
        let now = self.clock.now();

        let run = self
            .ports
            .task_runs
            .find_by_id(uow.tx()?, id)
            .await?
            .ok_or_else(|| SchedulerError::not_found("task run", id))?;

        let outcome = match self.retry.next_backoff(attempt) {
            Some(backoff) => {
                let available_at = time::add(now, backoff);
                self.ports
                    .task_runs
                    .retry_with_backoff(uow.tx()?, id, attempt, available_at, error, now)
                    .await?
                    .then_some(RetryOutcome::Scheduled {
                        attempt: attempt.saturating_add(1),
                        available_at,
                    })
            }
            None => {
                let failed = self
                    .ports
                    .task_runs
                    .mark_failed(uow.tx()?, id, attempt, error, now)
                    .await?;
                if failed {
                    self.ports
                        .job_runs
                        .mark_finished(uow.tx()?, run.job_run_id, false, now)
                        .await?;
                }
                failed.then_some(RetryOutcome::Exhausted)
            }
        };

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => {
                // The guarded write locked the row, so this read is current.
                let current = self
                    .ports
                    .task_runs
                    .find_by_id(uow.tx()?, id)
                    .await?
                    .unwrap_or(run);
                RetryOutcome::Ignored {
                    status: current.status,
                    attempt: current.attempt,
                }
            }
        };
        uow.commit().await?;

        match &outcome {
            RetryOutcome::Scheduled { available_at, .. } => {
                info!(task_run = %id, attempt, %available_at, error, "task run retry scheduled");
            }
            RetryOutcome::Exhausted => {
                warn!(task_run = %id, attempt, error, "task run failed, retry budget spent");
            }
            RetryOutcome::Ignored { status, .. } => {
                debug!(task_run = %id, attempt, ?status, "stale failure report ignored");
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::retry::FixedBackoff;
    use crate::impls::MemoryStore;
    use crate::testing::{Harness, at};

    const LEASE: Duration = Duration::from_secs(30);

    fn dispatcher(h: &Harness, retry: impl RetryPolicy + 'static) -> TaskDispatcher<MemoryStore> {
        let graph = Arc::new(TaskGraphPreparer::new(h.ports.clone(), h.clock.clone()));
        TaskDispatcher::new(h.ports.clone(), h.clock.clone(), Arc::new(retry), graph)
    }

    /// `t1 -> t2`, prepared for one run.
    async fn chain(h: &Harness) -> (crate::domain::JobRun, Vec<TaskRun>) {
        let (job, _) = h
            .define_job("chain", "*/5 * * * *", at(12, 0, 0), &["t1", "t2"], &[("t1", "t2")])
            .await;
        let run = h.create_run(&job, at(12, 0, 0)).await;
        let graph = TaskGraphPreparer::new(h.ports.clone(), h.clock.clone());
        let runs = graph.prepare_for(None, job.id, run.id).await.unwrap();
        (run, runs)
    }

    async fn job_run_status(h: &Harness, run: &crate::domain::JobRun) -> JobRunStatus {
        let mut tx = h.store.begin().await.unwrap();
        h.ports.job_runs.find_by_id(&mut tx, run.id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn claim_starts_the_run_and_leases_the_task() {
        let h = Harness::new(at(12, 0, 0));
        let d = dispatcher(&h, FixedBackoff::new(Duration::from_secs(10)));
        let (run, runs) = chain(&h).await;

        let claimed = d.claim_ready(LEASE, Some(WorkerId::new(3))).await.unwrap().unwrap();

        assert_eq!(claimed.id, runs[0].id);
        assert_eq!(claimed.status, TaskRunStatus::Running);
        assert_eq!(claimed.lease_until, Some(at(12, 0, 30)));
        assert_eq!(claimed.worker_id, Some(WorkerId::new(3)));
        assert_eq!(job_run_status(&h, &run).await, JobRunStatus::Running);
        assert_eq!(d.claim_ready(LEASE, None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn chain_completes_in_order() {
        let h = Harness::new(at(12, 0, 0));
        let d = dispatcher(&h, FixedBackoff::new(Duration::from_secs(10)));
        let (run, runs) = chain(&h).await;

        let t1 = d.claim_ready(LEASE, None).await.unwrap().unwrap();
        let done = d.mark_done(t1.id).await.unwrap();
        let Completion::Completed { promoted, run_finished, .. } = done else {
            panic!("expected a completion");
        };
        assert_eq!(promoted, vec![runs[1].id]);
        assert!(!run_finished);

        let t2 = d.claim_ready(LEASE, None).await.unwrap().unwrap();
        assert_eq!(t2.id, runs[1].id);
        let done = d.mark_done(t2.id).await.unwrap();
        assert!(matches!(done, Completion::Completed { run_finished: true, .. }));
        assert_eq!(job_run_status(&h, &run).await, JobRunStatus::Done);
    }

    #[tokio::test]
    async fn second_completion_is_ignored() {
        let h = Harness::new(at(12, 0, 0));
        let d = dispatcher(&h, FixedBackoff::new(Duration::from_secs(10)));
        let (_, runs) = chain(&h).await;

        let t1 = d.claim_ready(LEASE, None).await.unwrap().unwrap();
        d.mark_done(t1.id).await.unwrap();
        let again = d.mark_done(t1.id).await.unwrap();

        assert_eq!(again, Completion::Ignored { status: TaskRunStatus::Done });
        let mut tx = h.store.begin().await.unwrap();
        let t2 = h.ports.task_runs.find_by_id(&mut tx, runs[1].id).await.unwrap().unwrap();
        assert_eq!(t2.done_cnt, 1);
    }

    #[tokio::test]
    async fn completing_an_unknown_run_is_not_found() {
        let h = Harness::new(at(12, 0, 0));
        let d = dispatcher(&h, FixedBackoff::new(Duration::from_secs(10)));

        let err = d
            .mark_done(TaskRunId::from_ulid(ulid::Ulid::new()))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::domain::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn heartbeat_extends_only_running_leases() {
        let h = Harness::new(at(12, 0, 0));
        let d = dispatcher(&h, FixedBackoff::new(Duration::from_secs(10)));
        let (_, runs) = chain(&h).await;
        let t1 = d.claim_ready(LEASE, None).await.unwrap().unwrap();

        h.clock.advance(Duration::from_secs(20));
        assert!(d.heartbeat(t1.id, LEASE).await.unwrap());
        assert!(!d.heartbeat(runs[1].id, LEASE).await.unwrap());

        let mut tx = h.store.begin().await.unwrap();
        let t1 = h.ports.task_runs.find_by_id(&mut tx, t1.id).await.unwrap().unwrap();
        assert_eq!(t1.lease_until, Some(at(12, 0, 50)));
    }

    #[tokio::test]
    async fn failure_backs_off_before_the_next_claim() {
        let h = Harness::new(at(12, 0, 0));
        let d = dispatcher(&h, FixedBackoff::new(Duration::from_secs(10)));
        chain(&h).await;
        let t1 = d.claim_ready(LEASE, None).await.unwrap().unwrap();

        let outcome = d.fail_and_retry(t1.id, 1, "boom").await.unwrap();

        assert_eq!(
            outcome,
            RetryOutcome::Scheduled {
                attempt: 2,
                available_at: at(12, 0, 10),
            }
        );
        assert_eq!(d.claim_ready(LEASE, None).await.unwrap(), None);

        h.clock.advance(Duration::from_secs(10));
        let retried = d.claim_ready(LEASE, None).await.unwrap().unwrap();
        assert_eq!(retried.id, t1.id);
        assert_eq!(retried.attempt, 2);
        assert_eq!(retried.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn stale_attempt_is_ignored() {
        let h = Harness::new(at(12, 0, 0));
        let d = dispatcher(&h, FixedBackoff::new(Duration::from_secs(10)));
        chain(&h).await;
        let t1 = d.claim_ready(LEASE, None).await.unwrap().unwrap();

        let outcome = d.fail_and_retry(t1.id, 7, "late").await.unwrap();

        assert_eq!(
            outcome,
            RetryOutcome::Ignored {
                status: TaskRunStatus::Running,
                attempt: 1,
            }
        );
    }

    #[tokio::test]
    async fn spent_budget_fails_task_and_run() {
        let h = Harness::new(at(12, 0, 0));
        let d = dispatcher(&h, FixedBackoff::new(Duration::from_secs(10)).with_max_attempts(1));
        let (run, _) = chain(&h).await;
        let t1 = d.claim_ready(LEASE, None).await.unwrap().unwrap();

        let outcome = d.fail_and_retry(t1.id, 1, "boom").await.unwrap();

        assert_eq!(outcome, RetryOutcome::Exhausted);
        assert_eq!(job_run_status(&h, &run).await, JobRunStatus::Failed);
        let mut tx = h.store.begin().await.unwrap();
        let t1 = h.ports.task_runs.find_by_id(&mut tx, t1.id).await.unwrap().unwrap();
        assert_eq!(t1.status, TaskRunStatus::Failed);
        assert_eq!(t1.finished_at, Some(at(12, 0, 0)));
    }

    #[tokio::test]
    async fn claim_up_to_stops_when_nothing_is_ready() {
        let h = Harness::new(at(12, 0, 0));
        let d = dispatcher(&h, FixedBackoff::new(Duration::from_secs(10)));
        let (job, _) = h
            .define_job("fan", "*/5 * * * *", at(12, 0, 0), &["a", "b", "c"], &[])
            .await;
        let run = h.create_run(&job, at(12, 0, 0)).await;
        TaskGraphPreparer::new(h.ports.clone(), h.clock.clone())
            .prepare_for(None, job.id, run.id)
            .await
            .unwrap();

        assert_eq!(d.claim_up_to(2, LEASE, None).await.unwrap().len(), 2);
        assert_eq!(d.claim_up_to(5, LEASE, None).await.unwrap().len(), 1);
        assert!(d.claim_up_to(5, LEASE, None).await.unwrap().is_empty());
    }
}
