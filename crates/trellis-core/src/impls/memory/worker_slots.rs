//! WorkerSlot table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::table::Access;
use super::{MemoryStore, MemoryTx};
use crate::domain::{WorkerId, WorkerSlot};
use crate::ports::{StoreResult, WorkerSlotRepository};

#[async_trait]
impl WorkerSlotRepository<MemoryTx> for MemoryStore {
    async fn lease_free_slot(
        &self,
        tx: &mut MemoryTx,
        token: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<WorkerSlot>> {
        self.write(tx, |tables, tx| {
            Access::Ready(tables.worker_slots.claim_first(
                tx,
                |slot| slot.is_free_at(now),
                |slot| slot.id,
                |slot| {
                    slot.lease(token, lease_until, now);
                    slot.clone()
                },
            ))
        })
        .await
    }

    async fn heartbeat(
        &self,
        tx: &mut MemoryTx,
        id: WorkerId,
        token: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.write(tx, |tables, tx| {
            match tables
                .worker_slots
                .update(&id, tx, |slot| slot.heartbeat(token, lease_until, now))
            {
                Access::Ready(changed) => Access::Ready(changed.unwrap_or(false)),
                Access::Blocked => Access::Blocked,
            }
        })
        .await
    }

    async fn release(&self, tx: &mut MemoryTx, id: WorkerId, token: &str) -> StoreResult<bool> {
        self.write(tx, |tables, tx| {
            match tables.worker_slots.update(&id, tx, |slot| slot.release(token)) {
                Access::Ready(changed) => Access::Ready(changed.unwrap_or(false)),
                Access::Blocked => Access::Blocked,
            }
        })
        .await
    }

    async fn reclaim_expired(&self, tx: &mut MemoryTx, now: DateTime<Utc>) -> StoreResult<usize> {
        self.write(tx, |tables, tx| {
            Access::Ready(tables.worker_slots.update_unlocked_where(
                tx,
                |slot| slot.lease_expired_at(now),
                |slot| {
                    slot.clear();
                    true
                },
            ))
        })
        .await
    }

    async fn find_by_id(&self, tx: &mut MemoryTx, id: WorkerId) -> StoreResult<Option<WorkerSlot>> {
        self.read(tx, |tables, tx| tables.worker_slots.get(&id, tx).cloned())
    }
}
