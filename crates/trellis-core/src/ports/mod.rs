//! Ports - abstraction layer over the shared store and the collaborators.
//!
//! This module holds the "ports" of the hexagonal layout. Services depend on
//! these traits only; `impls` provides the adapters.
//!
//! # Design
//! - The store is the only shared mutable resource.
//! - Repository traits are generic over the transaction handle type, so one
//!   adapter can serve every port with a single `Tx`.

pub mod clock;
pub mod cron;
pub mod id_generator;
pub mod job_store;
pub mod task_store;
pub mod transaction;
pub mod worker_slot_store;

use std::sync::Arc;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::cron::CronCalculator;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::job_store::{JobRepository, JobRunRepository};
pub use self::task_store::{TaskDependencyRepository, TaskRepository, TaskRunRepository};
pub use self::transaction::{StoreResult, TransactionManager};
pub use self::worker_slot_store::WorkerSlotRepository;

/// StorePorts is the capability set injected into every service.
///
/// All repositories share the transaction manager's handle type, so a
/// handle opened by `transactions` can be passed to any of them.
pub struct StorePorts<M: TransactionManager> {
    pub transactions: Arc<M>,
    pub jobs: Arc<dyn JobRepository<M::Tx>>,
    pub job_runs: Arc<dyn JobRunRepository<M::Tx>>,
    pub tasks: Arc<dyn TaskRepository<M::Tx>>,
    pub dependencies: Arc<dyn TaskDependencyRepository<M::Tx>>,
    pub task_runs: Arc<dyn TaskRunRepository<M::Tx>>,
    pub worker_slots: Arc<dyn WorkerSlotRepository<M::Tx>>,
}

impl<M> StorePorts<M>
where
    M: TransactionManager
        + JobRepository<M::Tx>
        + JobRunRepository<M::Tx>
        + TaskRepository<M::Tx>
        + TaskDependencyRepository<M::Tx>
        + TaskRunRepository<M::Tx>
        + WorkerSlotRepository<M::Tx>,
{
    /// Wire every port to one store that implements all of them.
    pub fn from_store(store: Arc<M>) -> Self {
        Self {
            jobs: store.clone(),
            job_runs: store.clone(),
            tasks: store.clone(),
            dependencies: store.clone(),
            task_runs: store.clone(),
            worker_slots: store.clone(),
            transactions: store,
        }
    }
}

// Manual impl: deriving would require `M: Clone`.
impl<M: TransactionManager> Clone for StorePorts<M> {
    fn clone(&self) -> Self {
        Self {
            transactions: self.transactions.clone(),
            jobs: self.jobs.clone(),
            job_runs: self.job_runs.clone(),
            tasks: self.tasks.clone(),
            dependencies: self.dependencies.clone(),
            task_runs: self.task_runs.clone(),
            worker_slots: self.worker_slots.clone(),
        }
    }
}
