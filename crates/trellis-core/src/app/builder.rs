//! SchedulerBuilder - wiring of the services and start-up validation.
//!
//! # Fail-fast
//! - `expect_catalog()` records the handler keys a catalog needs.
//! - `build()` checks "expected keys ⊆ registered handlers" and returns
//!   `BuildError::MissingHandlers` otherwise, so a typo surfaces at start-up
//!   instead of as a stream of failing task runs.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

use super::activator::JobActivator;
use super::dispatcher::TaskDispatcher;
use super::driver::{DriverOptions, LoopGroup};
use super::graph::TaskGraphPreparer;
use super::maintenance::MaintenanceSweeper;
use super::orchestrator::Orchestrator;
use super::retry::{FixedBackoff, RetryPolicy};
use super::runtime::{DuplicateHandler, HandlerRegistry, Runtime, TaskHandler};
use super::status::{RunStatus, StatusReader};
use super::worker_pool::WorkerSlotPool;
use crate::catalog::{CatalogDef, CatalogError, CatalogRegistrar};
use crate::config::SchedulerConfig;
use crate::domain::{Job, JobId, JobRunId, SchedulerError};
use crate::ports::{Clock, CronCalculator, StorePorts, SystemClock, TransactionManager};

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("no cron calculator configured")]
    MissingCronCalculator,

    #[error("Missing handlers: {0:?}. The catalog uses these keys but nothing is registered for them.")]
    MissingHandlers(Vec<String>),
}

/// SchedulerBuilder assembles a [`Scheduler`] over one set of store ports.
///
/// ```ignore
/// let scheduler = SchedulerBuilder::new(StorePorts::from_store(store))
///     .cron(Arc::new(CronScheduleCalculator::new()))
///     .with_config(&settings.scheduler)
///     .handler("extract", Arc::new(Extract))?
///     .expect_catalog(&settings.catalog)
///     .build()?;
/// ```
pub struct SchedulerBuilder<M: TransactionManager> {
    ports: StorePorts<M>,
    clock: Arc<dyn Clock>,
    cron: Option<Arc<dyn CronCalculator>>,
    retry: Arc<dyn RetryPolicy>,
    zone: FixedOffset,
    run_deadline: Option<Duration>,
    registry: HandlerRegistry,
    expected_handlers: BTreeSet<String>,
}

impl<M: TransactionManager> SchedulerBuilder<M> {
    /// Defaults: wall clock, 10s fixed backoff without a budget, UTC, no
    /// run deadline.
    pub fn new(ports: StorePorts<M>) -> Self {
        Self {
            ports,
            clock: Arc::new(SystemClock),
            cron: None,
            retry: Arc::new(FixedBackoff::new(DEFAULT_RETRY_BACKOFF)),
            zone: Utc.fix(),
            run_deadline: None,
            registry: HandlerRegistry::new(),
            expected_handlers: BTreeSet::new(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cron(mut self, cron: Arc<dyn CronCalculator>) -> Self {
        self.cron = Some(cron);
        self
    }

    pub fn retry(mut self, retry: Arc<dyn RetryPolicy>) -> Self {
        self.retry = retry;
        self
    }

    pub fn zone(mut self, zone: FixedOffset) -> Self {
        self.zone = zone;
        self
    }

    pub fn run_deadline(mut self, run_deadline: Option<Duration>) -> Self {
        self.run_deadline = run_deadline;
        self
    }

    /// Zone, run deadline and retry policy from `config`.
    pub fn with_config(self, config: &SchedulerConfig) -> Self {
        self.zone(config.zone())
            .run_deadline(config.run_deadline())
            .retry(config.retry_policy())
    }

    pub fn handler(
        mut self,
        handler_key: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, DuplicateHandler> {
        self.registry.register(handler_key, handler)?;
        Ok(self)
    }

    /// Require a handler for every task of `catalog`.
    pub fn expect_catalog(mut self, catalog: &CatalogDef) -> Self {
        let keys = catalog
            .jobs
            .iter()
            .flat_map(|job| &job.tasks)
            .map(|task| task.handler_key().to_owned());
        self.expected_handlers.extend(keys);
        self
    }

    pub fn build(self) -> Result<Scheduler<M>, BuildError> {
        let cron = self.cron.ok_or(BuildError::MissingCronCalculator)?;

        let missing: Vec<String> = self
            .expected_handlers
            .iter()
            .filter(|key| self.registry.get(key).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::MissingHandlers(missing));
        }

        let ports = self.ports;
        let clock = self.clock;
        let graph = Arc::new(TaskGraphPreparer::new(ports.clone(), clock.clone()));
        let dispatcher = Arc::new(TaskDispatcher::new(
            ports.clone(),
            clock.clone(),
            self.retry,
            graph.clone(),
        ));
        let activator = Arc::new(
            JobActivator::new(ports.clone(), clock.clone(), cron.clone(), graph.clone())
                .with_zone(self.zone)
                .with_run_deadline(self.run_deadline),
        );
        Ok(Scheduler {
            orchestrator: Arc::new(Orchestrator::new(activator.clone(), dispatcher.clone())),
            pool: Arc::new(WorkerSlotPool::new(ports.clone(), clock.clone())),
            sweeper: Arc::new(MaintenanceSweeper::new(ports.clone(), clock.clone())),
            status: Arc::new(StatusReader::new(ports.clone())),
            registrar: Arc::new(CatalogRegistrar::new(ports.clone(), clock, cron, self.zone)),
            runtime: Runtime::new(Arc::new(self.registry)),
            graph,
            dispatcher,
            activator,
            ports,
        })
    }
}

/// Scheduler holds every service, wired to the same ports.
pub struct Scheduler<M: TransactionManager> {
    ports: StorePorts<M>,
    graph: Arc<TaskGraphPreparer<M>>,
    dispatcher: Arc<TaskDispatcher<M>>,
    activator: Arc<JobActivator<M>>,
    orchestrator: Arc<Orchestrator<M>>,
    pool: Arc<WorkerSlotPool<M>>,
    sweeper: Arc<MaintenanceSweeper<M>>,
    status: Arc<StatusReader<M>>,
    registrar: Arc<CatalogRegistrar<M>>,
    runtime: Runtime,
}

impl<M: TransactionManager> Scheduler<M> {
    pub fn ports(&self) -> &StorePorts<M> {
        &self.ports
    }

    pub fn graph(&self) -> &Arc<TaskGraphPreparer<M>> {
        &self.graph
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher<M>> {
        &self.dispatcher
    }

    pub fn activator(&self) -> &Arc<JobActivator<M>> {
        &self.activator
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator<M>> {
        &self.orchestrator
    }

    pub fn worker_pool(&self) -> &Arc<WorkerSlotPool<M>> {
        &self.pool
    }

    pub fn sweeper(&self) -> &Arc<MaintenanceSweeper<M>> {
        &self.sweeper
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub async fn register_catalog(&self, catalog: &CatalogDef) -> Result<Vec<Job>, CatalogError> {
        self.registrar.register(catalog).await
    }

    pub async fn run_status(&self, run_id: JobRunId) -> Result<RunStatus, SchedulerError> {
        self.status.run_status(run_id).await
    }

    pub async fn job_status(&self, job_id: JobId) -> Result<Vec<RunStatus>, SchedulerError> {
        self.status.job_status(job_id).await
    }

    /// Start the tick, worker and maintenance loops.
    pub fn spawn(&self, options: DriverOptions) -> LoopGroup {
        LoopGroup::spawn(self, options)
    }
}

// Manual impl: deriving would require `M: Clone`.
impl<M: TransactionManager> Clone for Scheduler<M> {
    fn clone(&self) -> Self {
        Self {
            ports: self.ports.clone(),
            graph: self.graph.clone(),
            dispatcher: self.dispatcher.clone(),
            activator: self.activator.clone(),
            orchestrator: self.orchestrator.clone(),
            pool: self.pool.clone(),
            sweeper: self.sweeper.clone(),
            status: self.status.clone(),
            registrar: self.registrar.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::runtime::{HandlerError, TaskContext};
    use crate::catalog::{JobDef, TaskDef};
    use crate::impls::{CronScheduleCalculator, MemoryStore};
    use crate::testing::{Harness, at};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl TaskHandler for Noop {
        async fn handle(&self, _ctx: &TaskContext) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn catalog() -> CatalogDef {
        let task = |name: &str, handler: Option<&str>| TaskDef {
            name: name.into(),
            handler: handler.map(str::to_owned),
            depends_on: vec![],
        };
        CatalogDef {
            jobs: vec![JobDef {
                name: "etl".into(),
                description: None,
                cron: "*/5 * * * *".into(),
                enabled: true,
                tasks: vec![task("extract", None), task("load", Some("loader"))],
            }],
        }
    }

    fn builder(h: &Harness) -> SchedulerBuilder<MemoryStore> {
        SchedulerBuilder::new(h.ports.clone())
            .clock(h.clock.clone())
            .cron(Arc::new(CronScheduleCalculator::new()))
    }

    #[test]
    fn build_requires_a_cron_calculator() {
        let h = Harness::new(at(12, 0, 0));

        let result = SchedulerBuilder::new(h.ports.clone()).build();

        assert_eq!(result.err(), Some(BuildError::MissingCronCalculator));
    }

    #[test]
    fn build_reports_missing_handlers() {
        let h = Harness::new(at(12, 0, 0));

        let result = builder(&h)
            .handler("extract", Arc::new(Noop))
            .unwrap()
            .expect_catalog(&catalog())
            .build();

        assert_eq!(
            result.err(),
            Some(BuildError::MissingHandlers(vec!["loader".into()]))
        );
    }

    #[tokio::test]
    async fn built_scheduler_registers_and_reports() {
        let h = Harness::new(at(12, 1, 0));
        let scheduler = builder(&h)
            .handler("extract", Arc::new(Noop))
            .unwrap()
            .handler("loader", Arc::new(Noop))
            .unwrap()
            .expect_catalog(&catalog())
            .build()
            .unwrap();

        let jobs = scheduler.register_catalog(&catalog()).await.unwrap();
        assert_eq!(jobs[0].next_due_at, at(12, 5, 0));

        h.clock.set(at(12, 5, 30));
        let activation = scheduler.activator().activate_next(Duration::from_secs(5)).await.unwrap();
        let crate::app::activator::Activation::Activated { job_run, .. } = activation else {
            panic!("expected an activation");
        };

        let status = scheduler.run_status(job_run.id).await.unwrap();
        assert_eq!(status.counts.ready, 2);
    }

    #[test]
    fn duplicate_handler_is_rejected() {
        let h = Harness::new(at(12, 0, 0));

        let result = builder(&h)
            .handler("extract", Arc::new(Noop))
            .unwrap()
            .handler("extract", Arc::new(Noop));

        assert_eq!(result.err(), Some(DuplicateHandler("extract".into())));
    }
}
