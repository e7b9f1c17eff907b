//! Versioned rows with per-row exclusive locks.
//!
//! Design:
//! - A row carries its committed value and at most one pending version. The
//!   pending version's owner holds the row lock until it commits or rolls back.
//! - Readers see their own pending version, everyone else sees the committed one.
//! - `Access::Blocked` means "another transaction holds a lock you need"; the
//!   store decides whether to wait (targeted writes) or skip (claims, sweeps).

use std::collections::{BTreeMap, BTreeSet, HashMap};

pub(crate) type TxId = u64;

#[derive(Debug)]
pub(crate) enum Access<R> {
    Ready(R),
    Blocked,
}

#[derive(Debug)]
struct Pending<T> {
    owner: TxId,
    /// `None` is a pending delete.
    value: Option<T>,
}

#[derive(Debug)]
struct Row<T> {
    committed: Option<T>,
    pending: Option<Pending<T>>,
}

impl<T> Row<T> {
    fn visible(&self, tx: TxId) -> Option<&T> {
        match &self.pending {
            Some(pending) if pending.owner == tx => pending.value.as_ref(),
            _ => self.committed.as_ref(),
        }
    }

    fn locked_by_other(&self, tx: TxId) -> bool {
        self.pending.as_ref().is_some_and(|pending| pending.owner != tx)
    }
}

#[derive(Debug)]
pub(crate) struct Table<K, T> {
    rows: BTreeMap<K, Row<T>>,
    /// Keys each open transaction holds a lock on.
    owned: HashMap<TxId, BTreeSet<K>>,
}

impl<K: Ord + Clone, T: Clone> Table<K, T> {
    pub fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            owned: HashMap::new(),
        }
    }

    pub fn get(&self, key: &K, tx: TxId) -> Option<&T> {
        self.rows.get(key).and_then(|row| row.visible(tx))
    }

    /// Visible rows in key order.
    pub fn iter(&self, tx: TxId) -> impl Iterator<Item = (&K, &T)> + '_ {
        self.rows
            .iter()
            .filter_map(move |(key, row)| row.visible(tx).map(|value| (key, value)))
    }

    pub fn find(&self, tx: TxId, pred: impl Fn(&T) -> bool) -> Option<T> {
        self.iter(tx).map(|(_, value)| value).find(|value| pred(value)).cloned()
    }

    pub fn filter(&self, tx: TxId, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.iter(tx)
            .map(|(_, value)| value)
            .filter(|value| pred(value))
            .cloned()
            .collect()
    }

    /// Look up a row by a unique attribute before inserting.
    ///
    /// Blocks when another transaction holds a lock on a row matching `pred`
    /// in either version, so two transactions never insert the same unique
    /// key side by side.
    pub fn find_unique(&self, tx: TxId, pred: impl Fn(&T) -> bool) -> Access<Option<K>> {
        for (key, row) in &self.rows {
            if row.locked_by_other(tx) {
                let pending_match = row
                    .pending
                    .as_ref()
                    .and_then(|pending| pending.value.as_ref())
                    .is_some_and(&pred);
                if pending_match || row.committed.as_ref().is_some_and(&pred) {
                    return Access::Blocked;
                }
            } else if row.visible(tx).is_some_and(&pred) {
                return Access::Ready(Some(key.clone()));
            }
        }
        Access::Ready(None)
    }

    /// Lock the row and mutate its visible value. `Ready(None)` when absent.
    pub fn update<R>(&mut self, key: &K, tx: TxId, f: impl FnOnce(&mut T) -> R) -> Access<Option<R>> {
        let Some(row) = self.rows.get_mut(key) else {
            return Access::Ready(None);
        };
        if row.locked_by_other(tx) {
            return Access::Blocked;
        }
        if row.pending.is_none() {
            if row.committed.is_none() {
                return Access::Ready(None);
            }
            row.pending = Some(Pending {
                owner: tx,
                value: row.committed.clone(),
            });
            self.owned.entry(tx).or_default().insert(key.clone());
        }
        let value = row.pending.as_mut().and_then(|pending| pending.value.as_mut());
        Access::Ready(value.map(f))
    }

    pub fn insert(&mut self, key: K, tx: TxId, value: T) -> Access<()> {
        let row = self.rows.entry(key.clone()).or_insert(Row {
            committed: None,
            pending: None,
        });
        if row.locked_by_other(tx) {
            return Access::Blocked;
        }
        row.pending = Some(Pending {
            owner: tx,
            value: Some(value),
        });
        self.owned.entry(tx).or_default().insert(key);
        Access::Ready(())
    }

    /// Insert unless a visible row exists. `Ready(false)` when it did.
    pub fn insert_if_absent(&mut self, key: K, tx: TxId, value: T) -> Access<bool> {
        match self.rows.get(&key) {
            Some(row) if row.locked_by_other(tx) => Access::Blocked,
            Some(row) if row.visible(tx).is_some() => Access::Ready(false),
            _ => match self.insert(key, tx, value) {
                Access::Ready(()) => Access::Ready(true),
                Access::Blocked => Access::Blocked,
            },
        }
    }

    pub fn delete(&mut self, key: &K, tx: TxId) -> Access<bool> {
        let Some(row) = self.rows.get_mut(key) else {
            return Access::Ready(false);
        };
        if row.locked_by_other(tx) {
            return Access::Blocked;
        }
        if row.visible(tx).is_none() {
            return Access::Ready(false);
        }
        row.pending = Some(Pending {
            owner: tx,
            value: None,
        });
        self.owned.entry(tx).or_default().insert(key.clone());
        Access::Ready(true)
    }

    /// Skip-locked selection: lock and mutate the first visible row matching
    /// `pred` by `order` (ties broken by key), ignoring rows other
    /// transactions hold.
    pub fn claim_first<O: Ord, R>(
        &mut self,
        tx: TxId,
        pred: impl Fn(&T) -> bool,
        order: impl Fn(&T) -> O,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let key = self
            .rows
            .iter()
            .filter(|(_, row)| !row.locked_by_other(tx))
            .filter_map(|(key, row)| row.visible(tx).map(|value| (key, value)))
            .filter(|(_, value)| pred(value))
            .min_by(|(_, a), (_, b)| order(a).cmp(&order(b)))
            .map(|(key, _)| key.clone())?;

        match self.update(&key, tx, f) {
            Access::Ready(result) => result,
            Access::Blocked => None,
        }
    }

    /// Set-based update over rows no other transaction holds. Returns how
    /// many rows `f` reported as changed.
    pub fn update_unlocked_where(
        &mut self,
        tx: TxId,
        pred: impl Fn(&T) -> bool,
        mut f: impl FnMut(&mut T) -> bool,
    ) -> usize {
        let keys = self.unlocked_keys_where(tx, pred);
        let mut changed = 0;
        for key in &keys {
            if let Access::Ready(Some(true)) = self.update(key, tx, &mut f) {
                changed += 1;
            }
        }
        changed
    }

    pub fn delete_unlocked_where(&mut self, tx: TxId, pred: impl Fn(&T) -> bool) -> usize {
        let keys = self.unlocked_keys_where(tx, pred);
        let mut deleted = 0;
        for key in &keys {
            if let Access::Ready(true) = self.delete(key, tx) {
                deleted += 1;
            }
        }
        deleted
    }

    /// Write a committed row directly, outside any transaction.
    pub fn seed(&mut self, key: K, value: T) {
        self.rows.entry(key).or_insert(Row {
            committed: Some(value),
            pending: None,
        });
    }

    /// Publish or discard every pending version owned by `tx`, releasing its locks.
    pub fn settle(&mut self, tx: TxId, commit: bool) {
        let Some(keys) = self.owned.remove(&tx) else {
            return;
        };
        for key in keys {
            let Some(row) = self.rows.get_mut(&key) else {
                continue;
            };
            match row.pending.take() {
                Some(pending) if pending.owner == tx => {
                    if commit {
                        row.committed = pending.value;
                    }
                }
                other => row.pending = other,
            }
            let vacant = row.committed.is_none() && row.pending.is_none();
            if vacant {
                self.rows.remove(&key);
            }
        }
    }

    fn unlocked_keys_where(&self, tx: TxId, pred: impl Fn(&T) -> bool) -> Vec<K> {
        self.rows
            .iter()
            .filter(|(_, row)| !row.locked_by_other(tx))
            .filter(|(_, row)| row.visible(tx).is_some_and(&pred))
            .map(|(key, _)| key.clone())
            .collect()
    }
}
