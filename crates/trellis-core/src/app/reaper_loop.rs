//! ReaperLoop - runs the maintenance sweep on an interval.
//!
//! Expired worker slots and task run leases are recovered here, so a crashed
//! worker only delays its runs by one lease plus one sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use super::maintenance::{MaintenanceReport, MaintenanceSweeper, SweepOptions};
use crate::ports::TransactionManager;

pub struct ReaperLoop<M: TransactionManager> {
    sweeper: Arc<MaintenanceSweeper<M>>,
    options: SweepOptions,
    interval: Duration,
}

impl<M: TransactionManager> ReaperLoop<M> {
    pub fn new(sweeper: Arc<MaintenanceSweeper<M>>, options: SweepOptions, interval: Duration) -> Self {
        Self {
            sweeper,
            options,
            interval,
        }
    }

    /// Returns the number of sweeps run.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> usize {
        info!(interval = ?self.interval, "reaper loop started");
        let mut sweeps = 0;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let report: MaintenanceReport = self.sweeper.run_once(&self.options).await;
                    sweeps += 1;
                    if report.total_repairs() == 0 && report.is_clean() {
                        debug!("nothing to repair");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!(sweeps, "reaper loop stopped");
        sweeps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::dispatcher::TaskDispatcher;
    use crate::app::graph::TaskGraphPreparer;
    use crate::app::retry::FixedBackoff;
    use crate::domain::TaskRunStatus;
    use crate::testing::{Harness, at};

    #[tokio::test]
    async fn reaper_recovers_expired_leases_until_shutdown() {
        let h = Harness::new(at(12, 0, 0));
        let (job, _) = h.define_job("job", "*/5 * * * *", at(13, 0, 0), &["a"], &[]).await;
        let run = h.create_run(&job, at(12, 0, 0)).await;
        let graph = Arc::new(TaskGraphPreparer::new(h.ports.clone(), h.clock.clone()));
        graph.prepare_for(None, job.id, run.id).await.unwrap();
        let dispatcher = TaskDispatcher::new(
            h.ports.clone(),
            h.clock.clone(),
            Arc::new(FixedBackoff::new(Duration::from_secs(10))),
            graph,
        );
        dispatcher.claim_ready(Duration::from_secs(30), None).await.unwrap().unwrap();
        h.clock.advance(Duration::from_secs(31));

        let options = SweepOptions {
            default_backoff: Duration::from_secs(5),
            finished_ttl: None,
            ready_window: None,
        };
        let sweeper = Arc::new(MaintenanceSweeper::new(h.ports.clone(), h.clock.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(
            ReaperLoop::new(sweeper, options, Duration::from_millis(10)).run(shutdown_rx),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();

        let sweeps = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(sweeps >= 1);
        let mut tx = h.store.begin().await.unwrap();
        let runs = h.ports.task_runs.find_all_by_run(&mut tx, run.id).await.unwrap();
        assert_eq!(runs[0].status, TaskRunStatus::Ready);
        assert_eq!(runs[0].attempt, 2);
    }
}
