//! TaskGraphPreparer - materializes task runs and promotes dependents.

use std::sync::Arc;

use tracing::{debug, info};

use super::unit_of_work::TransactionBoundary;
use crate::domain::{DoneCountIncrement, JobId, JobRunId, SchedulerError, TaskRun, TaskRunId};
use crate::ports::{Clock, StorePorts, TransactionManager};

pub struct TaskGraphPreparer<M: TransactionManager> {
    ports: StorePorts<M>,
    boundary: TransactionBoundary<M>,
    clock: Arc<dyn Clock>,
}

impl<M: TransactionManager> TaskGraphPreparer<M> {
    pub fn new(ports: StorePorts<M>, clock: Arc<dyn Clock>) -> Self {
        Self {
            boundary: TransactionBoundary::new(ports.transactions.clone()),
            ports,
            clock,
        }
    }

    /// Create or reset one task run per task of `job_id` for `run_id`.
    ///
    /// Tasks without predecessors start READY now, the rest start BLOCKED with
    /// `pre_cnt = indegree`. Safe to repeat: existing runs are reset in place.
    pub async fn prepare_for(
        &self,
        ambient: Option<&mut M::Tx>,
        job_id: JobId,
        run_id: JobRunId,
    ) -> Result<Vec<TaskRun>, SchedulerError> {
        let mut uow = self.boundary.required(ambient).await?;
        let now = self.clock.now();

        let tasks = self.ports.tasks.find_all_by_job(uow.tx()?, job_id).await?;
        let mut runs = Vec::with_capacity(tasks.len());
        for task in tasks {
            let run = self
                .ports
                .task_runs
                .create_or_reset(uow.tx()?, run_id, task.id, task.indegree, now)
                .await?;
            runs.push(run);
        }
        uow.commit().await?;

        debug!(
            job = %job_id,
            run = %run_id,
            task_runs = runs.len(),
            "task graph prepared"
        );
        Ok(runs)
    }

    /// Count one finished predecessor of `task_run_id`, promoting it to READY
    /// in the same atomic step when that was the last one.
    pub async fn on_predecessor_done(
        &self,
        ambient: Option<&mut M::Tx>,
        task_run_id: TaskRunId,
    ) -> Result<DoneCountIncrement, SchedulerError> {
        let mut uow = self.boundary.required(ambient).await?;
        let now = self.clock.now();

        let increment = self
            .ports
            .task_runs
            .increment_done_count(uow.tx()?, task_run_id, now)
            .await?
            .ok_or_else(|| SchedulerError::not_found("task run", task_run_id))?;
        uow.commit().await?;

        if increment.promoted {
            info!(
                task_run = %task_run_id,
                done = increment.task_run.done_cnt,
                "task run promoted to READY"
            );
        }
        Ok(increment)
    }
}
