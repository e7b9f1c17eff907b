//! MemoryStore - single-process transactional store.
//!
//! Realizes every repository port on top of versioned in-memory tables:
//! - Each transaction's writes stay private until commit.
//! - Claims skip rows other transactions hold (non-blocking selection).
//! - Targeted writes wait for a held row to be released, up to
//!   `lock_timeout`, then fail with `StoreError::LockTimeout`.
//!
//! Intended for tests, demos and single-process deployments. A database
//! adapter would map the same contracts onto row locks and `SKIP LOCKED`.

mod jobs;
mod table;
mod tasks;
mod worker_slots;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use self::table::{Access, Table, TxId};
use crate::domain::{
    Job, JobId, JobRun, JobRunId, StoreError, Task, TaskDependency, TaskId, TaskRun, TaskRunId,
    WorkerId, WorkerSlot,
};
use crate::ports::{Clock, IdGenerator, StoreResult, TransactionManager, UlidGenerator};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

struct Tables {
    jobs: Table<JobId, Job>,
    job_runs: Table<JobRunId, JobRun>,
    tasks: Table<TaskId, Task>,
    dependencies: Table<TaskDependency, TaskDependency>,
    task_runs: Table<TaskRunId, TaskRun>,
    worker_slots: Table<WorkerId, WorkerSlot>,
}

impl Tables {
    fn new() -> Self {
        Self {
            jobs: Table::new(),
            job_runs: Table::new(),
            tasks: Table::new(),
            dependencies: Table::new(),
            task_runs: Table::new(),
            worker_slots: Table::new(),
        }
    }

    fn settle(&mut self, tx: TxId, commit: bool) {
        self.jobs.settle(tx, commit);
        self.job_runs.settle(tx, commit);
        self.tasks.settle(tx, commit);
        self.dependencies.settle(tx, commit);
        self.task_runs.settle(tx, commit);
        self.worker_slots.settle(tx, commit);
    }
}

struct Shared {
    id: u64,
    tables: Mutex<Tables>,
    /// Signalled whenever a transaction releases its row locks.
    released: Notify,
    next_tx: AtomicU64,
    ids: Arc<dyn IdGenerator>,
    lock_timeout: Duration,
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        // A panic while holding the guard cannot leave a row half-written:
        // every mutation is a single assignment under the lock.
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, tx: TxId, commit: bool) {
        self.tables().settle(tx, commit);
        self.released.notify_waiters();
    }
}

/// Transaction handle for [`MemoryStore`].
///
/// Dropping an unfinished handle rolls it back.
pub struct MemoryTx {
    id: TxId,
    shared: Arc<Shared>,
    active: bool,
}

impl MemoryTx {
    fn finish(&mut self, commit: bool) {
        if self.active {
            self.active = false;
            self.shared.settle(self.id, commit);
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.finish(false);
    }
}

impl std::fmt::Debug for MemoryTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTx")
            .field("id", &self.id)
            .field("store", &self.shared.id)
            .field("active", &self.active)
            .finish()
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Store whose ids are ULIDs stamped by `clock`.
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self::with_options(Arc::new(UlidGenerator::new(clock)), DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_options(ids: Arc<dyn IdGenerator>, lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
                tables: Mutex::new(Tables::new()),
                released: Notify::new(),
                next_tx: AtomicU64::new(1),
                ids,
                lock_timeout,
            }),
        }
    }

    /// Pre-provision free worker slots `0..count`. Existing slots are kept.
    pub fn provision_worker_slots(&self, count: u32) {
        let mut tables = self.shared.tables();
        for id in (0..count).map(WorkerId::new) {
            tables.worker_slots.seed(id, WorkerSlot::free(id));
        }
    }

    fn ids(&self) -> &dyn IdGenerator {
        self.shared.ids.as_ref()
    }

    fn check(&self, tx: &MemoryTx) -> StoreResult<()> {
        if !Arc::ptr_eq(&tx.shared, &self.shared) {
            return Err(StoreError::Precondition(format!(
                "transaction {} belongs to another store",
                tx.id
            )));
        }
        if !tx.active {
            return Err(StoreError::Precondition(format!(
                "transaction {} is already finished",
                tx.id
            )));
        }
        Ok(())
    }

    /// Run a read against the versions visible to `tx`.
    fn read<R>(&self, tx: &MemoryTx, op: impl FnOnce(&Tables, TxId) -> R) -> StoreResult<R> {
        self.check(tx)?;
        let tables = self.shared.tables();
        Ok(op(&tables, tx.id))
    }

    /// Run a write, waiting while it reports `Access::Blocked`.
    ///
    /// `op` is retried from scratch after every lock release, so it must
    /// not mutate anything before it knows it can complete.
    async fn write<R>(
        &self,
        tx: &MemoryTx,
        mut op: impl FnMut(&mut Tables, TxId) -> Access<R> + Send,
    ) -> StoreResult<R> {
        self.check(tx)?;
        let timeout = self.shared.lock_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let released = self.shared.released.notified();
            tokio::pin!(released);
            // Register before trying, so a release between the attempt and
            // the wait is not missed.
            released.as_mut().enable();

            {
                let attempt = op(&mut self.shared.tables(), tx.id);
                if let Access::Ready(result) = attempt {
                    return Ok(result);
                }
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(StoreError::LockTimeout(timeout));
            }
        }
    }
}

#[async_trait]
impl TransactionManager for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> StoreResult<MemoryTx> {
        Ok(MemoryTx {
            id: self.shared.next_tx.fetch_add(1, Ordering::Relaxed),
            shared: self.shared.clone(),
            active: true,
        })
    }

    async fn commit(&self, mut tx: MemoryTx) -> StoreResult<()> {
        self.check(&tx)?;
        tx.finish(true);
        Ok(())
    }

    fn rollback(&self, mut tx: MemoryTx) {
        tx.finish(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewJob;
    use crate::ports::{JobRepository, ManualClock};
    use chrono::{DateTime, TimeZone, Utc};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn new_job(name: &str) -> NewJob {
        NewJob {
            name: name.into(),
            description: None,
            cron_expr: "*/5 * * * *".into(),
            next_due_at: now(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn committed_writes_become_visible() {
        let store = MemoryStore::new(ManualClock::new(now()));

        let mut tx = store.begin().await.unwrap();
        let job = store.upsert(&mut tx, new_job("a"), now()).await.unwrap();

        let mut other = store.begin().await.unwrap();
        assert_eq!(store.find_by_id(&mut other, job.id).await.unwrap(), None);

        store.commit(tx).await.unwrap();
        assert_eq!(store.find_by_id(&mut other, job.id).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = MemoryStore::new(ManualClock::new(now()));

        let job_id = {
            let mut tx = store.begin().await.unwrap();
            store.upsert(&mut tx, new_job("a"), now()).await.unwrap().id
        };

        let mut tx = store.begin().await.unwrap();
        assert_eq!(JobRepository::find_by_id(&store, &mut tx, job_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn foreign_handle_is_a_precondition_error() {
        let store = MemoryStore::new(ManualClock::new(now()));
        let other = MemoryStore::new(ManualClock::new(now()));

        let mut tx = other.begin().await.unwrap();
        let err = store.find_by_name(&mut tx, "a").await.unwrap_err();

        assert!(matches!(err, StoreError::Precondition(_)));
    }

    #[tokio::test]
    async fn blocked_write_times_out() {
        let store = MemoryStore::with_options(
            Arc::new(UlidGenerator::new(ManualClock::new(now()))),
            Duration::from_millis(50),
        );
        let mut setup = store.begin().await.unwrap();
        let job = store.upsert(&mut setup, new_job("a"), now()).await.unwrap();
        store.commit(setup).await.unwrap();

        let mut holder = store.begin().await.unwrap();
        assert!(store.advance_cursor(&mut holder, job.id, now(), now()).await.unwrap());

        let mut waiter = store.begin().await.unwrap();
        let err = store
            .advance_cursor(&mut waiter, job.id, now(), now())
            .await
            .unwrap_err();

        assert_eq!(err, StoreError::LockTimeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn blocked_write_resumes_after_release() {
        let store = MemoryStore::new(ManualClock::new(now()));
        let mut setup = store.begin().await.unwrap();
        let job = store.upsert(&mut setup, new_job("a"), now()).await.unwrap();
        store.commit(setup).await.unwrap();

        let mut holder = store.begin().await.unwrap();
        assert!(store.advance_cursor(&mut holder, job.id, now(), now()).await.unwrap());

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut tx = store.begin().await.unwrap();
                let advanced = store.advance_cursor(&mut tx, job.id, now(), now()).await;
                store.commit(tx).await.unwrap();
                advanced
            })
        };

        tokio::task::yield_now().await;
        store.commit(holder).await.unwrap();

        assert_eq!(waiter.await.unwrap(), Ok(true));
    }
}
