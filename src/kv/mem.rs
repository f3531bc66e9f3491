//! Embedded in-memory reference store.
//!
//! Snapshots are immutable `Arc`s swapped atomically on commit, which gives
//! `Db::view` true MVCC read views. Writers clone the current snapshot into
//! a private working copy; the single-writer discipline is the caller's
//! (same as the host stores this models).

use super::{KvRead, Table};
use eyre::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

type Dups = BTreeSet<Vec<u8>>;
type TableData = BTreeMap<Vec<u8>, Dups>;

#[derive(Debug, Default, Clone)]
struct Snapshot {
    tables: BTreeMap<Table, TableData>,
}

impl Snapshot {
    fn table(&self, table: Table) -> Option<&TableData> {
        self.tables.get(&table)
    }

    fn scan_impl(
        &self,
        table: Table,
        from: &[u8],
        to: Option<&[u8]>,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        let Some(data) = self.table(table) else {
            return Ok(());
        };
        let upper = match to {
            Some(t) => Bound::Excluded(t.to_vec()),
            None => Bound::Unbounded,
        };
        for (key, dups) in data.range::<Vec<u8>, _>((Bound::Included(from.to_vec()), upper)) {
            for value in dups {
                if !f(key, value)? {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Shared {
    current: RwLock<Arc<Snapshot>>,
}

/// The embedded store. Cheap to clone; all clones share state.
#[derive(Debug, Clone)]
pub struct Db {
    shared: Arc<Shared>,
}

impl Default for Db {
    fn default() -> Self {
        Self::new()
    }
}

impl Db {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                current: RwLock::new(Arc::new(Snapshot::default())),
            }),
        }
    }

    /// Runs `f` against an immutable snapshot of the store.
    pub fn view<T>(&self, f: impl FnOnce(&RoTx) -> Result<T>) -> Result<T> {
        let snap = self.shared.current.read().clone();
        f(&RoTx { snap })
    }

    /// Begins a read-write transaction. Writes stay private to the handle
    /// until `commit()` publishes them as the new current snapshot.
    pub fn begin_rw(&self) -> RwTx {
        let snap = self.shared.current.read().as_ref().clone();
        RwTx {
            inner: Arc::new(RwInner {
                shared: self.shared.clone(),
                work: Mutex::new(snap),
            }),
        }
    }
}

/// Read-only MVCC view.
#[derive(Debug, Clone)]
pub struct RoTx {
    snap: Arc<Snapshot>,
}

impl KvRead for RoTx {
    fn get(&self, table: Table, key: &[u8]) -> Option<Vec<u8>> {
        self.snap
            .table(table)
            .and_then(|t| t.get(key))
            .and_then(|dups| dups.iter().next().cloned())
    }

    fn get_dups(&self, table: Table, key: &[u8]) -> Vec<Vec<u8>> {
        self.snap
            .table(table)
            .and_then(|t| t.get(key))
            .map(|dups| dups.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn first_key(&self, table: Table) -> Option<Vec<u8>> {
        self.snap.table(table).and_then(|t| t.keys().next().cloned())
    }

    fn last_key(&self, table: Table) -> Option<Vec<u8>> {
        self.snap
            .table(table)
            .and_then(|t| t.keys().next_back().cloned())
    }

    fn scan(
        &self,
        table: Table,
        from: &[u8],
        to: Option<&[u8]>,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        self.snap.scan_impl(table, from, to, f)
    }
}

#[derive(Debug)]
struct RwInner {
    shared: Arc<Shared>,
    work: Mutex<Snapshot>,
}

/// Owned read-write transaction handle. Clones share the same working
/// copy, which is what lets the aggregator keep the bound transaction
/// while the caller continues to use it.
#[derive(Debug, Clone)]
pub struct RwTx {
    inner: Arc<RwInner>,
}

impl RwTx {
    pub fn put(&self, table: Table, key: &[u8], value: &[u8]) {
        let mut work = self.inner.work.lock();
        let slot = work
            .tables
            .entry(table)
            .or_default()
            .entry(key.to_vec())
            .or_default();
        if !table.is_dup_sort() {
            slot.clear();
        }
        slot.insert(value.to_vec());
    }

    /// Removes the key and every duplicate under it.
    pub fn delete(&self, table: Table, key: &[u8]) {
        let mut work = self.inner.work.lock();
        if let Some(data) = work.tables.get_mut(&table) {
            data.remove(key);
        }
    }

    /// Removes a single duplicate entry; drops the key once empty.
    pub fn delete_dup(&self, table: Table, key: &[u8], value: &[u8]) {
        let mut work = self.inner.work.lock();
        if let Some(data) = work.tables.get_mut(&table) {
            if let Some(dups) = data.get_mut(key) {
                dups.remove(value);
                if dups.is_empty() {
                    data.remove(key);
                }
            }
        }
    }

    /// Publishes the working copy as the store's current snapshot. The
    /// handle stays usable; later commits publish later states.
    pub fn commit(&self) {
        let snap = Arc::new(self.inner.work.lock().clone());
        *self.inner.shared.current.write() = snap;
    }
}

impl KvRead for RwTx {
    fn get(&self, table: Table, key: &[u8]) -> Option<Vec<u8>> {
        let work = self.inner.work.lock();
        work.table(table)
            .and_then(|t| t.get(key))
            .and_then(|dups| dups.iter().next().cloned())
    }

    fn get_dups(&self, table: Table, key: &[u8]) -> Vec<Vec<u8>> {
        let work = self.inner.work.lock();
        work.table(table)
            .and_then(|t| t.get(key))
            .map(|dups| dups.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn first_key(&self, table: Table) -> Option<Vec<u8>> {
        let work = self.inner.work.lock();
        work.table(table).and_then(|t| t.keys().next().cloned())
    }

    fn last_key(&self, table: Table) -> Option<Vec<u8>> {
        let work = self.inner.work.lock();
        work.table(table).and_then(|t| t.keys().next_back().cloned())
    }

    fn scan(
        &self,
        table: Table,
        from: &[u8],
        to: Option<&[u8]>,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        let work = self.inner.work.lock();
        work.scan_impl(table, from, to, f)
    }
}
