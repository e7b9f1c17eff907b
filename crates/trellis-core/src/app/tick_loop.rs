//! TickLoop - drives [`Orchestrator::tick`] on an interval.
//!
//! Claimed runs are forwarded to the workers over a bounded channel. A tick
//! never claims more than the channel has room for, so a run is not leased
//! while it waits behind a busy worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::orchestrator::{Orchestrator, TickOptions};
use crate::domain::{SchedulerError, TaskRun};
use crate::ports::TransactionManager;

pub struct TickLoop<M: TransactionManager> {
    orchestrator: Arc<Orchestrator<M>>,
    options: TickOptions,
    interval: Duration,
    sink: mpsc::Sender<TaskRun>,
}

impl<M: TransactionManager> TickLoop<M> {
    pub fn new(
        orchestrator: Arc<Orchestrator<M>>,
        options: TickOptions,
        interval: Duration,
        sink: mpsc::Sender<TaskRun>,
    ) -> Self {
        Self {
            orchestrator,
            options,
            interval,
            sink,
        }
    }

    /// One tick. Returns how many runs were handed to workers.
    pub async fn tick_once(&self) -> Result<usize, SchedulerError> {
        let options = TickOptions {
            max_claims: self.options.max_claims.min(self.sink.capacity()),
            ..self.options
        };
        let report = self.orchestrator.tick(&options).await?;

        let mut forwarded = 0;
        for run in report.claimed {
            let id = run.id;
            if self.sink.send(run).await.is_err() {
                // Leased but undeliverable; maintenance recovers it.
                warn!(task_run = %id, "workers are gone, dropping claimed run");
                continue;
            }
            forwarded += 1;
        }
        Ok(forwarded)
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "tick loop started");
        loop {
            if *shutdown_rx.borrow() || self.sink.is_closed() {
                break;
            }

            match self.tick_once().await {
                Ok(forwarded) => debug!(forwarded, "tick"),
                Err(err) => warn!(error = %err, retryable = err.is_retryable(), "tick failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("tick loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::activator::JobActivator;
    use crate::app::dispatcher::TaskDispatcher;
    use crate::app::graph::TaskGraphPreparer;
    use crate::app::retry::FixedBackoff;
    use crate::impls::{CronScheduleCalculator, MemoryStore};
    use crate::testing::{Harness, at};

    fn tick_loop(h: &Harness, sink: mpsc::Sender<TaskRun>) -> TickLoop<MemoryStore> {
        let graph = Arc::new(TaskGraphPreparer::new(h.ports.clone(), h.clock.clone()));
        let activator = JobActivator::new(
            h.ports.clone(),
            h.clock.clone(),
            Arc::new(CronScheduleCalculator::new()),
            graph.clone(),
        );
        let dispatcher = TaskDispatcher::new(
            h.ports.clone(),
            h.clock.clone(),
            Arc::new(FixedBackoff::new(Duration::from_secs(10))),
            graph,
        );
        let options = TickOptions {
            job_lease: Duration::from_secs(5),
            task_lease: Duration::from_secs(30),
            max_claims: 10,
            worker_id: None,
        };
        TickLoop::new(
            Arc::new(Orchestrator::new(Arc::new(activator), Arc::new(dispatcher))),
            options,
            Duration::from_millis(10),
            sink,
        )
    }

    #[tokio::test]
    async fn claims_are_limited_by_channel_room() {
        let h = Harness::new(at(12, 1, 0));
        h.define_job("wide", "*/5 * * * *", at(12, 0, 0), &["a", "b", "c"], &[])
            .await;
        let (tx, mut rx) = mpsc::channel(2);
        let ticks = tick_loop(&h, tx);

        assert_eq!(ticks.tick_once().await.unwrap(), 2);
        assert_eq!(ticks.tick_once().await.unwrap(), 0);

        rx.recv().await.unwrap();
        assert_eq!(ticks.tick_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = Harness::new(at(12, 1, 0));
        let (tx, _rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(tick_loop(&h, tx).run(shutdown_rx));
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
