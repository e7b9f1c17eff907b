//! WorkerSlotPool - leases numbered worker identities from a fixed pool.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::unit_of_work::TransactionBoundary;
use crate::domain::{SchedulerError, WorkerId, WorkerSlot, time};
use crate::ports::{Clock, StorePorts, TransactionManager};

pub struct WorkerSlotPool<M: TransactionManager> {
    ports: StorePorts<M>,
    boundary: TransactionBoundary<M>,
    clock: Arc<dyn Clock>,
}

impl<M: TransactionManager> WorkerSlotPool<M> {
    pub fn new(ports: StorePorts<M>, clock: Arc<dyn Clock>) -> Self {
        Self {
            boundary: TransactionBoundary::new(ports.transactions.clone()),
            ports,
            clock,
        }
    }

    /// Lease one free slot for `token`. `None` when the pool is exhausted.
    pub async fn lease_one(
        &self,
        token: &str,
        lease: Duration,
    ) -> Result<Option<WorkerSlot>, SchedulerError> {
        let mut uow = self.boundary.requires_new().await?;
        let now = self.clock.now();
        let slot = self
            .ports
            .worker_slots
            .lease_free_slot(uow.tx()?, token, time::add(now, lease), now)
            .await?;
        uow.commit().await?;

        match &slot {
            Some(slot) => info!(worker = %slot.id, "worker slot leased"),
            None => debug!("no free worker slot"),
        }
        Ok(slot)
    }

    /// Extend the lease held by `token`. False when someone else holds it.
    pub async fn heartbeat(
        &self,
        id: WorkerId,
        token: &str,
        lease: Duration,
    ) -> Result<bool, SchedulerError> {
        let mut uow = self.boundary.requires_new().await?;
        let now = self.clock.now();
        let extended = self
            .ports
            .worker_slots
            .heartbeat(uow.tx()?, id, token, time::add(now, lease), now)
            .await?;
        uow.commit().await?;
        Ok(extended)
    }

    /// Give the slot back. False when someone else holds it.
    pub async fn release(&self, id: WorkerId, token: &str) -> Result<bool, SchedulerError> {
        let mut uow = self.boundary.requires_new().await?;
        let released = self.ports.worker_slots.release(uow.tx()?, id, token).await?;
        uow.commit().await?;
        if released {
            info!(worker = %id, "worker slot released");
        }
        Ok(released)
    }

    /// Free every slot whose lease has ended.
    pub async fn reclaim_expired(&self) -> Result<usize, SchedulerError> {
        let mut uow = self.boundary.requires_new().await?;
        let reclaimed = self
            .ports
            .worker_slots
            .reclaim_expired(uow.tx()?, self.clock.now())
            .await?;
        uow.commit().await?;
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MemoryStore;
    use crate::testing::{Harness, at};

    const LEASE: Duration = Duration::from_secs(60);

    fn pool(h: &Harness, slots: u32) -> WorkerSlotPool<MemoryStore> {
        h.store.provision_worker_slots(slots);
        WorkerSlotPool::new(h.ports.clone(), h.clock.clone())
    }

    #[tokio::test]
    async fn exhausted_pool_yields_none() {
        let h = Harness::new(at(12, 0, 0));
        let pool = pool(&h, 2);

        let a = pool.lease_one("a", LEASE).await.unwrap().unwrap();
        let b = pool.lease_one("b", LEASE).await.unwrap().unwrap();
        let c = pool.lease_one("c", LEASE).await.unwrap();

        assert_eq!((a.id.get(), b.id.get()), (0, 1));
        assert_eq!(c, None);
    }

    #[tokio::test]
    async fn mismatched_token_changes_nothing() {
        let h = Harness::new(at(12, 0, 0));
        let pool = pool(&h, 1);
        let held = pool.lease_one("owner", LEASE).await.unwrap().unwrap();

        assert!(!pool.heartbeat(held.id, "intruder", Duration::from_secs(600)).await.unwrap());
        assert!(!pool.release(held.id, "intruder").await.unwrap());

        let mut tx = h.store.begin().await.unwrap();
        let slot = h.ports.worker_slots.find_by_id(&mut tx, held.id).await.unwrap().unwrap();
        assert_eq!(slot, held);
    }

    #[tokio::test]
    async fn released_slot_can_be_leased_again() {
        let h = Harness::new(at(12, 0, 0));
        let pool = pool(&h, 1);
        let held = pool.lease_one("first", LEASE).await.unwrap().unwrap();

        assert!(pool.release(held.id, "first").await.unwrap());
        let again = pool.lease_one("second", LEASE).await.unwrap().unwrap();

        assert_eq!(again.id, held.id);
        assert_eq!(again.instance_token.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn heartbeat_keeps_a_lease_alive_past_reclaim() {
        let h = Harness::new(at(12, 0, 0));
        let pool = pool(&h, 2);
        let kept = pool.lease_one("kept", LEASE).await.unwrap().unwrap();
        pool.lease_one("lost", LEASE).await.unwrap().unwrap();

        h.clock.advance(Duration::from_secs(50));
        assert!(pool.heartbeat(kept.id, "kept", LEASE).await.unwrap());
        h.clock.advance(Duration::from_secs(20));

        assert_eq!(pool.reclaim_expired().await.unwrap(), 1);
        let mut tx = h.store.begin().await.unwrap();
        let kept = h.ports.worker_slots.find_by_id(&mut tx, kept.id).await.unwrap().unwrap();
        assert_eq!(kept.lease_until, Some(at(12, 1, 50)));
    }
}
