//! TransactionManager port - atomic units of work over the shared store.
//!
//! Transactions are explicit handles, not thread-bound state: every store
//! operation takes `&mut Tx`, and "join the ambient transaction" simply means
//! passing the caller's handle down. See `app::unit_of_work` for the scoped
//! guard built on top of this port.

use async_trait::async_trait;

use crate::domain::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

/// TransactionManager opens and settles transactions.
///
/// # Contract
/// - Writes made through a handle are invisible to other transactions until
///   `commit`, and are discarded by `rollback`.
/// - `rollback` must not block or fail: it runs from `Drop` on every exit
///   path, including panics and cancelled futures.
/// - A handle that was committed or rolled back is unusable; adapters report
///   `StoreError::Precondition` when it is passed to a repository.
#[async_trait]
pub trait TransactionManager: Send + Sync + 'static {
    type Tx: Send + 'static;

    async fn begin(&self) -> StoreResult<Self::Tx>;

    async fn commit(&self, tx: Self::Tx) -> StoreResult<()>;

    fn rollback(&self, tx: Self::Tx);
}
