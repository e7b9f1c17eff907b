//! WorkerSlot repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{WorkerId, WorkerSlot};
use crate::ports::transaction::StoreResult;

/// WorkerSlotRepository toggles lease state on pre-provisioned slots.
///
/// Token-guarded operations (`heartbeat`, `release`) return false, not an
/// error, when the stored token differs from the caller's.
#[async_trait]
pub trait WorkerSlotRepository<Tx: Send + 'static>: Send + Sync {
    /// Lease the lowest free slot, skipping slots locked by other
    /// transactions. `None` when nothing is free.
    async fn lease_free_slot(
        &self,
        tx: &mut Tx,
        token: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<WorkerSlot>>;

    async fn heartbeat(
        &self,
        tx: &mut Tx,
        id: WorkerId,
        token: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn release(&self, tx: &mut Tx, id: WorkerId, token: &str) -> StoreResult<bool>;

    /// Clear every lease that ended at or before `now`. Returns the count.
    async fn reclaim_expired(&self, tx: &mut Tx, now: DateTime<Utc>) -> StoreResult<usize>;

    async fn find_by_id(&self, tx: &mut Tx, id: WorkerId) -> StoreResult<Option<WorkerSlot>>;
}
