//! MaintenanceSweeper - periodic repair of drift the hot path cannot see.
//!
//! Steps, in order, each in its own unit of work:
//! 1. reclaim expired worker slots
//! 2. recover task runs whose lease expired while RUNNING
//! 3. promote BLOCKED runs whose predecessors are all done
//! 4. archive old DONE/FAILED runs (when a TTL is set)
//! 5. clamp READY availability into a window around now (when set)
//!
//! A failing step is logged and reported; the remaining steps still run.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use super::unit_of_work::TransactionBoundary;
use crate::domain::{SchedulerError, time};
use crate::ports::{Clock, StorePorts, TransactionManager};

/// `last_error` written on runs recovered from an expired lease.
pub const LEASE_EXPIRED_REASON: &str = "lease expired: recovered by maintenance";

/// Bounds for READY `available_at`, relative to now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyWindow {
    pub past: Duration,
    pub future: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepOptions {
    /// Backoff applied to runs recovered from an expired lease.
    pub default_backoff: Duration,
    pub finished_ttl: Option<Duration>,
    pub ready_window: Option<ReadyWindow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStep {
    ReclaimSlots,
    RecoverLeases,
    PromoteUnblocked,
    ArchiveFinished,
    NormalizeAvailability,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedStep {
    pub step: SweepStep,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub reclaimed_slots: usize,
    pub recovered_leases: usize,
    pub promoted: usize,
    pub archived: usize,
    pub normalized: usize,
    pub failed_steps: Vec<FailedStep>,
}

impl MaintenanceReport {
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }

    pub fn total_repairs(&self) -> usize {
        self.reclaimed_slots + self.recovered_leases + self.promoted + self.archived + self.normalized
    }
}

pub struct MaintenanceSweeper<M: TransactionManager> {
    ports: StorePorts<M>,
    boundary: TransactionBoundary<M>,
    clock: Arc<dyn Clock>,
}

fn record(failed: &mut Vec<FailedStep>, step: SweepStep, result: Result<usize, SchedulerError>) -> usize {
    result.unwrap_or_else(|err| {
        warn!(?step, error = %err, "maintenance step failed");
        failed.push(FailedStep {
            step,
            error: err.to_string(),
        });
        0
    })
}

impl<M: TransactionManager> MaintenanceSweeper<M> {
    pub fn new(ports: StorePorts<M>, clock: Arc<dyn Clock>) -> Self {
        Self {
            boundary: TransactionBoundary::new(ports.transactions.clone()),
            ports,
            clock,
        }
    }

    pub async fn run_once(&self, options: &SweepOptions) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let failed = &mut report.failed_steps;

        report.reclaimed_slots = record(failed, SweepStep::ReclaimSlots, self.reclaim_slots().await);
        report.recovered_leases = record(
            failed,
            SweepStep::RecoverLeases,
            self.recover_leases(options.default_backoff).await,
        );
        report.promoted = record(failed, SweepStep::PromoteUnblocked, self.promote_unblocked().await);
        if let Some(ttl) = options.finished_ttl.filter(|ttl| !ttl.is_zero()) {
            report.archived =
                record(failed, SweepStep::ArchiveFinished, self.archive_finished(ttl).await);
        }
        if let Some(window) = options.ready_window {
            report.normalized = record(
                failed,
                SweepStep::NormalizeAvailability,
                self.normalize_availability(window).await,
            );
        }

        if report.total_repairs() > 0 || !report.is_clean() {
            info!(
                reclaimed_slots = report.reclaimed_slots,
                recovered_leases = report.recovered_leases,
                promoted = report.promoted,
                archived = report.archived,
                normalized = report.normalized,
                failed_steps = report.failed_steps.len(),
                "maintenance sweep finished"
            );
        }
        report
    }

    async fn reclaim_slots(&self) -> Result<usize, SchedulerError> {
        let mut uow = self.boundary.requires_new().await?;
        let count = self
            .ports
            .worker_slots
            .reclaim_expired(uow.tx()?, self.clock.now())
            .await?;
        uow.commit().await?;
        Ok(count)
    }

    async fn recover_leases(&self, backoff: Duration) -> Result<usize, SchedulerError> {
        let mut uow = self.boundary.requires_new().await?;
        let now = self.clock.now();
        let count = self
            .ports
            .task_runs
            .recover_expired_leases(uow.tx()?, now, time::add(now, backoff), LEASE_EXPIRED_REASON)
            .await?;
        uow.commit().await?;
        Ok(count)
    }

    async fn promote_unblocked(&self) -> Result<usize, SchedulerError> {
        let mut uow = self.boundary.requires_new().await?;
        let count = self
            .ports
            .task_runs
            .promote_unblocked(uow.tx()?, self.clock.now())
            .await?;
        uow.commit().await?;
        Ok(count)
    }

    async fn archive_finished(&self, ttl: Duration) -> Result<usize, SchedulerError> {
        let mut uow = self.boundary.requires_new().await?;
        let threshold = time::sub(self.clock.now(), ttl);
        let count = self
            .ports
            .task_runs
            .archive_finished_older_than(uow.tx()?, threshold)
            .await?;
        uow.commit().await?;
        Ok(count)
    }

    async fn normalize_availability(&self, window: ReadyWindow) -> Result<usize, SchedulerError> {
        let mut uow = self.boundary.requires_new().await?;
        let now = self.clock.now();
        let count = self
            .ports
            .task_runs
            .normalize_availability(
                uow.tx()?,
                time::sub(now, window.past),
                time::add(now, window.future),
                now,
            )
            .await?;
        uow.commit().await?;
        Ok(count)
    }
}
