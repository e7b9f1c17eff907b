//! Status - per-run progress views.

use serde::{Deserialize, Serialize};

use super::unit_of_work::TransactionBoundary;
use crate::domain::{JobId, JobRun, JobRunId, SchedulerError, TaskRun, TaskRunId, TaskRunStatus};
use crate::ports::{StorePorts, TransactionManager};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunCounts {
    pub blocked: usize,
    pub ready: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub expired: usize,
}

impl TaskRunCounts {
    pub fn from_runs<'a>(runs: impl IntoIterator<Item = &'a TaskRun>) -> Self {
        let mut counts = Self::default();
        for run in runs {
            let slot = match run.status {
                TaskRunStatus::Blocked => &mut counts.blocked,
                TaskRunStatus::Ready => &mut counts.ready,
                TaskRunStatus::Running => &mut counts.running,
                TaskRunStatus::Done => &mut counts.done,
                TaskRunStatus::Failed => &mut counts.failed,
                TaskRunStatus::Skipped => &mut counts.skipped,
                TaskRunStatus::Cancelled => &mut counts.cancelled,
                TaskRunStatus::Expired => &mut counts.expired,
            };
            *slot += 1;
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.blocked
            + self.ready
            + self.running
            + self.done
            + self.failed
            + self.skipped
            + self.cancelled
            + self.expired
    }

    /// Nothing left to run or wait for.
    pub fn is_settled(&self) -> bool {
        self.blocked + self.ready + self.running == 0
    }
}

/// The latest error of a task run that has failed at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRunError {
    pub task_run_id: TaskRunId,
    pub attempt: u32,
    pub status: TaskRunStatus,
    pub last_error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    pub job_run: JobRun,
    pub counts: TaskRunCounts,
    pub errors: Vec<TaskRunError>,
}

pub struct StatusReader<M: TransactionManager> {
    ports: StorePorts<M>,
    boundary: TransactionBoundary<M>,
}

impl<M: TransactionManager> StatusReader<M> {
    pub fn new(ports: StorePorts<M>) -> Self {
        Self {
            boundary: TransactionBoundary::new(ports.transactions.clone()),
            ports,
        }
    }

    pub async fn run_status(&self, run_id: JobRunId) -> Result<RunStatus, SchedulerError> {
        let mut uow = self.boundary.requires_new().await?;
        let job_run = self
            .ports
            .job_runs
            .find_by_id(uow.tx()?, run_id)
            .await?
            .ok_or_else(|| SchedulerError::not_found("job run", run_id))?;
        let runs = self.ports.task_runs.find_all_by_run(uow.tx()?, run_id).await?;
        uow.commit().await?;
        Ok(summarize(job_run, &runs))
    }

    /// Status of every run of `job_id`, oldest first.
    pub async fn job_status(&self, job_id: JobId) -> Result<Vec<RunStatus>, SchedulerError> {
        let mut uow = self.boundary.requires_new().await?;
        let job_runs = self.ports.job_runs.find_all_by_job(uow.tx()?, job_id).await?;
        let mut statuses = Vec::with_capacity(job_runs.len());
        for job_run in job_runs {
            let runs = self.ports.task_runs.find_all_by_run(uow.tx()?, job_run.id).await?;
            statuses.push(summarize(job_run, &runs));
        }
        uow.commit().await?;
        Ok(statuses)
    }
}

fn summarize(job_run: JobRun, runs: &[TaskRun]) -> RunStatus {
    let errors = runs
        .iter()
        .filter_map(|run| {
            run.last_error.as_ref().map(|last_error| TaskRunError {
                task_run_id: run.id,
                attempt: run.attempt,
                status: run.status,
                last_error: last_error.clone(),
            })
        })
        .collect();
    RunStatus {
        job_run,
        counts: TaskRunCounts::from_runs(runs),
        errors,
    }
}
