//! WorkerLoop - executes claimed task runs.
//!
//! # Flow
//! 1. Lease a worker slot (wait while the pool is exhausted)
//! 2. Receive a claimed run from the tick loop
//! 3. Load its task and run the handler, heartbeating the run's lease and
//!    the slot's lease meanwhile
//! 4. Report `mark_done` or `fail_and_retry`
//! 5. On shutdown, release the slot
//!
//! Shutdown does not cancel a handler that is already running; the worker
//! stops taking new runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use super::dispatcher::{Completion, RetryOutcome, TaskDispatcher};
use super::runtime::{HandlerError, Runtime, TaskContext};
use super::unit_of_work::TransactionBoundary;
use super::worker_pool::WorkerSlotPool;
use crate::domain::{SchedulerError, TaskRun, WorkerSlot};
use crate::ports::{StorePorts, TransactionManager};

/// Receiving end shared by every worker of a group.
pub type RunReceiver = Arc<Mutex<mpsc::Receiver<TaskRun>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Extension applied on every task run heartbeat.
    pub task_lease: Duration,
    pub slot_lease: Duration,
    /// Wait between attempts to lease a slot from an exhausted pool.
    pub slot_retry: Duration,
}

impl WorkerOptions {
    /// Heartbeat often enough that one missed beat does not lose a lease.
    fn heartbeat_period(&self) -> Duration {
        (self.task_lease.min(self.slot_lease) / 3).max(Duration::from_millis(10))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub completed: usize,
    pub failed: usize,
    /// Reports the store ignored or rejected.
    pub ignored: usize,
}

pub struct WorkerLoop<M: TransactionManager> {
    token: String,
    ports: StorePorts<M>,
    boundary: TransactionBoundary<M>,
    dispatcher: Arc<TaskDispatcher<M>>,
    pool: Arc<WorkerSlotPool<M>>,
    runtime: Runtime,
    options: WorkerOptions,
}

impl<M: TransactionManager> WorkerLoop<M> {
    /// `token` identifies this worker instance on the slot it leases.
    pub fn new(
        token: impl Into<String>,
        ports: StorePorts<M>,
        dispatcher: Arc<TaskDispatcher<M>>,
        pool: Arc<WorkerSlotPool<M>>,
        runtime: Runtime,
        options: WorkerOptions,
    ) -> Self {
        Self {
            token: token.into(),
            boundary: TransactionBoundary::new(ports.transactions.clone()),
            ports,
            dispatcher,
            pool,
            runtime,
            options,
        }
    }

    pub async fn run(self, runs: RunReceiver, mut shutdown_rx: watch::Receiver<bool>) -> WorkerSummary {
        let mut summary = WorkerSummary::default();

        'lease: while let Some(slot) = self.acquire_slot(&mut shutdown_rx).await {
            info!(worker = %slot.id, token = %self.token, "worker started");
            let mut beat = tokio::time::interval(self.options.heartbeat_period());
            beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                let run = tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = beat.tick() => {
                        if !self.heartbeat_slot(&slot).await {
                            continue 'lease;
                        }
                        continue;
                    }
                    run = recv(&runs) => match run {
                        Some(run) => run,
                        None => break,
                    },
                };
                self.execute(run, &slot, &mut beat, &mut summary).await;
            }

            match self.pool.release(slot.id, &self.token).await {
                Ok(_) => {}
                Err(err) => warn!(worker = %slot.id, error = %err, "failed to release worker slot"),
            }
            break;
        }

        info!(
            token = %self.token,
            completed = summary.completed,
            failed = summary.failed,
            "worker stopped"
        );
        summary
    }

    async fn acquire_slot(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Option<WorkerSlot> {
        loop {
            if *shutdown_rx.borrow() {
                return None;
            }
            match self.pool.lease_one(&self.token, self.options.slot_lease).await {
                Ok(Some(slot)) => return Some(slot),
                Ok(None) => debug!(token = %self.token, "waiting for a free worker slot"),
                Err(err) => warn!(token = %self.token, error = %err, "worker slot lease failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.options.slot_retry) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// False once the slot belongs to someone else.
    async fn heartbeat_slot(&self, slot: &WorkerSlot) -> bool {
        match self.pool.heartbeat(slot.id, &self.token, self.options.slot_lease).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(worker = %slot.id, token = %self.token, "worker slot lost");
                false
            }
            Err(err) => {
                warn!(worker = %slot.id, error = %err, "worker slot heartbeat failed");
                true
            }
        }
    }

    async fn execute(
        &self,
        run: TaskRun,
        slot: &WorkerSlot,
        beat: &mut tokio::time::Interval,
        summary: &mut WorkerSummary,
    ) {
        let (id, attempt) = (run.id, run.attempt);
        let result = match self.load_context(run).await {
            Ok(ctx) => {
                let execution = self.runtime.execute(&ctx);
                tokio::pin!(execution);
                loop {
                    tokio::select! {
                        result = &mut execution => break result,
                        _ = beat.tick() => {
                            self.heartbeat_slot(slot).await;
                            match self.dispatcher.heartbeat(id, self.options.task_lease).await {
                                Ok(true) => {}
                                Ok(false) => debug!(task_run = %id, "task run lease lost while running"),
                                Err(err) => warn!(task_run = %id, error = %err, "task run heartbeat failed"),
                            }
                        }
                    }
                }
            }
            Err(err) => Err(HandlerError::failed(err.to_string())),
        };

        match result {
            Ok(()) => match self.dispatcher.mark_done(id).await {
                Ok(Completion::Completed { .. }) => summary.completed += 1,
                Ok(Completion::Ignored { status }) => {
                    debug!(task_run = %id, ?status, "completion ignored");
                    summary.ignored += 1;
                }
                Err(err) => {
                    warn!(task_run = %id, error = %err, "completion report failed");
                    summary.ignored += 1;
                }
            },
            Err(handler_err) => {
                summary.failed += 1;
                match self
                    .dispatcher
                    .fail_and_retry(id, attempt, &handler_err.to_string())
                    .await
                {
                    Ok(RetryOutcome::Ignored { .. }) => summary.ignored += 1,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(task_run = %id, error = %err, "failure report failed");
                        summary.ignored += 1;
                    }
                }
            }
        }
    }

    async fn load_context(&self, task_run: TaskRun) -> Result<TaskContext, SchedulerError> {
        let mut uow = self.boundary.requires_new().await?;
        let task = self
            .ports
            .tasks
            .find_by_id(uow.tx()?, task_run.task_id)
            .await?
            .ok_or_else(|| SchedulerError::not_found("task", task_run.task_id))?;
        uow.commit().await?;
        Ok(TaskContext { task, task_run })
    }
}

async fn recv(runs: &RunReceiver) -> Option<TaskRun> {
    runs.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::graph::TaskGraphPreparer;
    use crate::app::retry::FixedBackoff;
    use crate::app::runtime::{HandlerRegistry, TaskHandler};
    use crate::domain::{JobRunStatus, TaskRunStatus};
    use crate::impls::MemoryStore;
    use crate::testing::{Harness, at};
    use async_trait::async_trait;

    struct Flaky;

    #[async_trait]
    impl TaskHandler for Flaky {
        async fn handle(&self, ctx: &TaskContext) -> Result<(), HandlerError> {
            if ctx.task.name == "bad" {
                return Err(HandlerError::failed("bad input"));
            }
            Ok(())
        }
    }

    fn options() -> WorkerOptions {
        WorkerOptions {
            task_lease: Duration::from_secs(30),
            slot_lease: Duration::from_secs(30),
            slot_retry: Duration::from_millis(10),
        }
    }

    struct Fixture {
        h: Harness,
        dispatcher: Arc<TaskDispatcher<MemoryStore>>,
        pool: Arc<WorkerSlotPool<MemoryStore>>,
        runtime: Runtime,
    }

    impl Fixture {
        fn new() -> Self {
            let h = Harness::new(at(12, 0, 0));
            h.store.provision_worker_slots(1);
            let graph = Arc::new(TaskGraphPreparer::new(h.ports.clone(), h.clock.clone()));
            let dispatcher = Arc::new(TaskDispatcher::new(
                h.ports.clone(),
                h.clock.clone(),
                Arc::new(FixedBackoff::new(Duration::from_secs(10)).with_max_attempts(1)),
                graph,
            ));
            let pool = Arc::new(WorkerSlotPool::new(h.ports.clone(), h.clock.clone()));
            let mut registry = HandlerRegistry::new();
            registry.register("good", Arc::new(Flaky)).unwrap();
            registry.register("bad", Arc::new(Flaky)).unwrap();
            Self {
                runtime: Runtime::new(Arc::new(registry)),
                h,
                dispatcher,
                pool,
            }
        }

        fn worker(&self, token: &str) -> WorkerLoop<MemoryStore> {
            WorkerLoop::new(
                token,
                self.h.ports.clone(),
                self.dispatcher.clone(),
                self.pool.clone(),
                self.runtime.clone(),
                options(),
            )
        }

        async fn claimed(&self, tasks: &[&str]) -> (crate::domain::JobRun, Vec<TaskRun>) {
            let (job, _) = self
                .h
                .define_job("job", "*/5 * * * *", at(13, 0, 0), tasks, &[])
                .await;
            let run = self.h.create_run(&job, at(12, 0, 0)).await;
            TaskGraphPreparer::new(self.h.ports.clone(), self.h.clock.clone())
                .prepare_for(None, job.id, run.id)
                .await
                .unwrap();
            let claimed = self
                .dispatcher
                .claim_up_to(tasks.len(), Duration::from_secs(30), None)
                .await
                .unwrap();
            (run, claimed)
        }
    }

    #[tokio::test]
    async fn worker_reports_outcomes_and_releases_its_slot() {
        let f = Fixture::new();
        let (run, claimed) = f.claimed(&["good", "bad"]).await;
        let (tx, rx) = mpsc::channel(4);
        for task_run in claimed {
            tx.send(task_run).await.unwrap();
        }
        drop(tx);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let summary = f.worker("w-1").run(Arc::new(Mutex::new(rx)), shutdown_rx).await;

        assert_eq!(
            summary,
            WorkerSummary {
                completed: 1,
                failed: 1,
                ignored: 0
            }
        );
        let mut tx = f.h.store.begin().await.unwrap();
        let runs = f.h.ports.task_runs.find_all_by_run(&mut tx, run.id).await.unwrap();
        let mut statuses: Vec<_> = runs.iter().map(|r| r.status).collect();
        statuses.sort_by_key(|s| format!("{s:?}"));
        assert_eq!(statuses, vec![TaskRunStatus::Done, TaskRunStatus::Failed]);
        let job_run = f.h.ports.job_runs.find_by_id(&mut tx, run.id).await.unwrap().unwrap();
        assert_eq!(job_run.status, JobRunStatus::Failed);
        drop(tx);

        // The slot is free again.
        assert!(f.pool.lease_one("w-2", Duration::from_secs(30)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_handler_fails_the_run() {
        let f = Fixture::new();
        let (run, claimed) = f.claimed(&["unknown"]).await;
        let (tx, rx) = mpsc::channel(1);
        tx.send(claimed[0].clone()).await.unwrap();
        drop(tx);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let summary = f.worker("w-1").run(Arc::new(Mutex::new(rx)), shutdown_rx).await;

        assert_eq!(summary.failed, 1);
        let mut tx = f.h.store.begin().await.unwrap();
        let runs = f.h.ports.task_runs.find_all_by_run(&mut tx, run.id).await.unwrap();
        assert_eq!(
            runs[0].last_error.as_deref(),
            Some("no handler registered for `unknown`")
        );
    }

    #[tokio::test]
    async fn worker_waits_for_a_slot_until_shutdown() {
        let f = Fixture::new();
        let held = f.pool.lease_one("other", Duration::from_secs(30)).await.unwrap();
        assert!(held.is_some());
        let (_tx, rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(f.worker("w-1").run(Arc::new(Mutex::new(rx)), shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary, WorkerSummary::default());
    }
}
