//! TransactionBoundary - scoped units of work.
//!
//! Two modes:
//! - **isolated-new** (`requires_new`): always a fresh transaction, settled by
//!   this unit. Used for every claim attempt so a sibling's rollback cannot
//!   undo it and lock scope stays short.
//! - **join-ambient** (`required`): reuse the caller's open transaction when
//!   one is passed in, otherwise open a fresh one. A joined unit never commits
//!   or rolls back; its owner does.
//!
//! The ambient transaction is an explicit `&mut Tx` argument, so joining does
//! not depend on thread-locals and works the same under any executor.

use std::sync::Arc;

use tracing::warn;

use crate::domain::SchedulerError;
use crate::ports::TransactionManager;

pub struct TransactionBoundary<M: TransactionManager> {
    manager: Arc<M>,
}

// Manual impl: deriving would require `M: Clone`.
impl<M: TransactionManager> Clone for TransactionBoundary<M> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
        }
    }
}

impl<M: TransactionManager> TransactionBoundary<M> {
    pub fn new(manager: Arc<M>) -> Self {
        Self { manager }
    }

    /// Open a fresh unit of work regardless of any ambient one.
    pub async fn requires_new(&self) -> Result<UnitOfWork<'static, M>, SchedulerError> {
        let tx = self.manager.begin().await?;
        Ok(UnitOfWork {
            manager: self.manager.clone(),
            handle: Handle::Owned(Some(tx)),
        })
    }

    /// Join `ambient` when given, otherwise open a fresh unit of work.
    pub async fn required<'a>(
        &self,
        ambient: Option<&'a mut M::Tx>,
    ) -> Result<UnitOfWork<'a, M>, SchedulerError> {
        match ambient {
            Some(tx) => Ok(UnitOfWork {
                manager: self.manager.clone(),
                handle: Handle::Joined(tx),
            }),
            None => {
                let tx = self.manager.begin().await?;
                Ok(UnitOfWork {
                    manager: self.manager.clone(),
                    handle: Handle::Owned(Some(tx)),
                })
            }
        }
    }
}

enum Handle<'a, Tx> {
    /// `None` once settled.
    Owned(Option<Tx>),
    Joined(&'a mut Tx),
}

/// Guard over one unit of work.
///
/// Dropping an uncommitted owned unit rolls it back, so every early return
/// (including `?`) leaves the store unchanged.
pub struct UnitOfWork<'a, M: TransactionManager> {
    manager: Arc<M>,
    handle: Handle<'a, M::Tx>,
}

impl<'a, M: TransactionManager> UnitOfWork<'a, M> {
    /// The transaction handle to pass to repositories.
    pub fn tx(&mut self) -> Result<&mut M::Tx, SchedulerError> {
        match &mut self.handle {
            Handle::Owned(Some(tx)) => Ok(tx),
            Handle::Owned(None) => Err(SchedulerError::PreconditionViolation(
                "unit of work is already finished".into(),
            )),
            Handle::Joined(tx) => Ok(&mut **tx),
        }
    }

    /// True when this unit shares the caller's transaction.
    pub fn is_joined(&self) -> bool {
        matches!(self.handle, Handle::Joined(_))
    }

    /// Commit an owned transaction. A joined unit leaves settling to its owner.
    pub async fn commit(mut self) -> Result<(), SchedulerError> {
        if let Handle::Owned(slot) = &mut self.handle
            && let Some(tx) = slot.take()
        {
            self.manager.commit(tx).await?;
        }
        Ok(())
    }
}

impl<M: TransactionManager> Drop for UnitOfWork<'_, M> {
    fn drop(&mut self) {
        if let Handle::Owned(slot) = &mut self.handle
            && let Some(tx) = slot.take()
        {
            warn!("unit of work dropped without commit, rolling back");
            self.manager.rollback(tx);
        }
    }
}
