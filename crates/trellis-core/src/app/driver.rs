//! Loop group handle.
//!
//! - One tick loop, `workers` worker loops and one reaper loop, sharing a
//!   `watch` shutdown signal.
//! - `request_shutdown()` stops new claims and new runs; handlers already
//!   running are allowed to finish.
//! - `shutdown_and_join()` waits for every loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use super::builder::Scheduler;
use super::maintenance::SweepOptions;
use super::orchestrator::TickOptions;
use super::reaper_loop::ReaperLoop;
use super::tick_loop::TickLoop;
use super::worker_loop::{WorkerLoop, WorkerOptions, WorkerSummary};
use crate::config::SchedulerConfig;
use crate::ports::TransactionManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverOptions {
    pub tick: TickOptions,
    pub tick_interval: Duration,
    pub workers: usize,
    pub worker: WorkerOptions,
    pub sweep: SweepOptions,
    pub maintenance_interval: Duration,
    /// Prefix of each worker's slot token; the worker index is appended.
    pub instance: String,
}

impl DriverOptions {
    /// One worker per configured slot.
    pub fn from_config(config: &SchedulerConfig, instance: impl Into<String>) -> Self {
        Self {
            tick: config.tick_options(None),
            tick_interval: config.tick_interval(),
            workers: config.worker_slots as usize,
            worker: WorkerOptions {
                task_lease: config.task_lease(),
                slot_lease: config.task_lease(),
                slot_retry: config.tick_interval(),
            },
            sweep: config.sweep_options(),
            maintenance_interval: config.maintenance_interval(),
            instance: instance.into(),
        }
    }
}

pub struct LoopGroup {
    shutdown_tx: watch::Sender<bool>,
    tick: JoinHandle<()>,
    workers: Vec<JoinHandle<WorkerSummary>>,
    reaper: JoinHandle<usize>,
}

impl LoopGroup {
    pub fn spawn<M: TransactionManager>(scheduler: &Scheduler<M>, options: DriverOptions) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (run_tx, run_rx) = mpsc::channel(options.workers.max(1));
        let runs = Arc::new(Mutex::new(run_rx));

        let tick = TickLoop::new(
            scheduler.orchestrator().clone(),
            options.tick,
            options.tick_interval,
            run_tx,
        );
        let tick = tokio::spawn(tick.run(shutdown_rx.clone()));

        let workers = (0..options.workers)
            .map(|index| {
                let worker = WorkerLoop::new(
                    format!("{}-{index}", options.instance),
                    scheduler.ports().clone(),
                    scheduler.dispatcher().clone(),
                    scheduler.worker_pool().clone(),
                    scheduler.runtime().clone(),
                    options.worker,
                );
                tokio::spawn(worker.run(runs.clone(), shutdown_rx.clone()))
            })
            .collect();

        let reaper = ReaperLoop::new(
            scheduler.sweeper().clone(),
            options.sweep,
            options.maintenance_interval,
        );
        let reaper = tokio::spawn(reaper.run(shutdown_rx));

        Self {
            shutdown_tx,
            tick,
            workers,
            reaper,
        }
    }

    pub fn request_shutdown(&self) {
        // Receivers may already be gone.
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait. Returns the summary of every worker that exited
    /// normally.
    pub async fn shutdown_and_join(self) -> Vec<WorkerSummary> {
        self.request_shutdown();
        if let Err(err) = self.tick.await {
            warn!(error = %err, "tick loop panicked");
        }
        let mut summaries = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            match worker.await {
                Ok(summary) => summaries.push(summary),
                Err(err) => warn!(error = %err, "worker loop panicked"),
            }
        }
        if let Err(err) = self.reaper.await {
            warn!(error = %err, "reaper loop panicked");
        }
        summaries
    }
}
