//! Orchestrator - one scheduling tick: activate at most one job, then claim.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::activator::{Activation, JobActivator};
use super::dispatcher::TaskDispatcher;
use crate::domain::{SchedulerError, TaskRun, WorkerId};
use crate::ports::TransactionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOptions {
    pub job_lease: Duration,
    pub task_lease: Duration,
    pub max_claims: usize,
    /// Recorded on every claimed run when set.
    pub worker_id: Option<WorkerId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub activation: Activation,
    /// Activation failed and rolled back; claiming still ran.
    pub activation_error: Option<SchedulerError>,
    /// Leased to the caller, who must execute or abandon them.
    pub claimed: Vec<TaskRun>,
}

pub struct Orchestrator<M: TransactionManager> {
    activator: Arc<JobActivator<M>>,
    dispatcher: Arc<TaskDispatcher<M>>,
}

impl<M: TransactionManager> Orchestrator<M> {
    pub fn new(activator: Arc<JobActivator<M>>, dispatcher: Arc<TaskDispatcher<M>>) -> Self {
        Self {
            activator,
            dispatcher,
        }
    }

    /// A failed activation does not stop the tick: runs that are already
    /// READY are still claimed. A claim failure with nothing claimed is
    /// returned as the tick's error.
    pub async fn tick(&self, options: &TickOptions) -> Result<TickReport, SchedulerError> {
        let (activation, activation_error) = match self.activator.activate_next(options.job_lease).await
        {
            Ok(activation) => (activation, None),
            Err(err) => {
                warn!(error = %err, retryable = err.is_retryable(), "activation failed");
                (Activation::Idle, Some(err))
            }
        };

        let claimed = self
            .dispatcher
            .claim_up_to(options.max_claims, options.task_lease, options.worker_id)
            .await?;

        debug!(
            activated = matches!(activation, Activation::Activated { .. }),
            claimed = claimed.len(),
            "tick finished"
        );
        Ok(TickReport {
            activation,
            activation_error,
            claimed,
        })
    }
}
