//! Query context: an immutable snapshot-of-snapshots view.
//!
//! `make_context` captures each domain's shard cover (cloned `Arc`s, so
//! retired shards stay alive and on disk until the context drops) plus
//! the live locality pair. Reads then run against exactly that set.

use super::Aggregator;
use crate::kv::{tx_num_key, KvRead, Table};
use crate::snapshots::history::{latest_le, read_hist_value};
use crate::snapshots::inverted_index::InvertedIndex;
use crate::snapshots::history::History;
use crate::snapshots::locality::LocalityFiles;
use crate::snapshots::FilesItem;
use eyre::{eyre, Result};
use roaring::RoaringTreemap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub(crate) struct InvertedIndexContext {
    files: Vec<Arc<FilesItem>>,
    locality: Option<Arc<LocalityFiles>>,
    index_keys_table: Table,
    index_table: Table,
    aggregation_step: u64,
    steps_in_biggest_file: u64,
}

impl InvertedIndexContext {
    fn capture(ii: &InvertedIndex) -> Self {
        Self {
            files: ii.cover(),
            locality: ii.locality().current(),
            index_keys_table: ii.index_keys_table(),
            index_table: ii.index_table(),
            aggregation_step: ii.aggregation_step(),
            steps_in_biggest_file: ii.steps_in_biggest_file(),
        }
    }

    fn txnums_for_key(&self, key: &[u8], from_tx: u64, to_tx: u64) -> Result<RoaringTreemap> {
        let mut out = RoaringTreemap::new();
        for item in &self.files {
            if item.end_tx_num <= from_tx || item.start_tx_num >= to_tx {
                continue;
            }
            if let Some(bitmap) = crate::snapshots::history::bitmap_for_key(item, key)? {
                out |= bitmap;
            }
        }
        Ok(out)
    }

    /// Merged file + live-DB txnum iteration for one key, bounded.
    fn iterate_range(
        &self,
        key: &[u8],
        from_tx: u64,
        to_tx: u64,
        asc: bool,
        limit: usize,
        tx: &dyn KvRead,
    ) -> Result<InvertedIterator> {
        let mut all = self.txnums_for_key(key, from_tx, to_tx)?;
        for v in tx.get_dups(self.index_table, key) {
            if let Some(t) = crate::kv::parse_tx_num(&v) {
                all.insert(t);
            }
        }
        let mut txs: Vec<u64> = all
            .iter()
            .filter(|t| *t >= from_tx && *t < to_tx)
            .collect();
        if !asc {
            txs.reverse();
        }
        txs.truncate(limit);
        Ok(InvertedIterator {
            txs: txs.into_iter(),
        })
    }
}

pub(crate) struct HistoryContext {
    ic: InvertedIndexContext,
    hist_files: Vec<Arc<FilesItem>>,
    vals_table: Table,
}

impl HistoryContext {
    fn capture(h: &History) -> Self {
        Self {
            ic: InvertedIndexContext::capture(h.ii()),
            hist_files: h.hist_cover(),
            vals_table: h.vals_table(),
        }
    }

    /// Snapshot-only point read: latest row with txnum `<= tx_num`.
    fn get_no_state(&self, key: &[u8], tx_num: u64) -> Result<Option<Vec<u8>>> {
        let Some(found_tx) = latest_le(
            &self.ic.files,
            self.ic.locality.as_deref(),
            key,
            tx_num,
            self.ic.aggregation_step,
            self.ic.steps_in_biggest_file,
        )?
        else {
            return Ok(None);
        };
        let value = read_hist_value(&self.hist_files, key, found_tx)?
            .ok_or_else(|| eyre!("missing history value for indexed txnum {found_tx}"))?;
        Ok(Some(value))
    }

    fn get_no_state_with_recent(
        &self,
        key: &[u8],
        tx_num: u64,
        tx: &dyn KvRead,
    ) -> Result<Option<Vec<u8>>> {
        let db_tx = tx
            .get_dups(self.ic.index_table, key)
            .iter()
            .filter_map(|v| crate::kv::parse_tx_num(v))
            .filter(|t| *t <= tx_num)
            .max();
        let snap_tx = latest_le(
            &self.ic.files,
            self.ic.locality.as_deref(),
            key,
            tx_num,
            self.ic.aggregation_step,
            self.ic.steps_in_biggest_file,
        )?;
        match (db_tx, snap_tx) {
            (None, None) => Ok(None),
            (Some(t_db), snap) if snap.map_or(true, |t| t_db > t) => {
                let mut vals_key = key.to_vec();
                vals_key.extend_from_slice(&tx_num_key(t_db));
                let value = tx
                    .get(self.vals_table, &vals_key)
                    .ok_or_else(|| eyre!("missing DB value for indexed txnum {t_db}"))?;
                Ok(Some(value))
            }
            (_, Some(t_snap)) => {
                let value = read_hist_value(&self.hist_files, key, t_snap)?
                    .ok_or_else(|| eyre!("missing history value for indexed txnum {t_snap}"))?;
                Ok(Some(value))
            }
            (Some(_), None) => unreachable!("covered by the greater-than arm"),
        }
    }

    /// Keys changed in `[from_tx, to_tx)` with the value of their first
    /// change inside the window.
    fn iterate_changed(
        &self,
        from_tx: u64,
        to_tx: u64,
        asc: bool,
        limit: usize,
        tx: &dyn KvRead,
    ) -> Result<HistoryChangesIter> {
        let mut first_change: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
        for item in &self.ic.files {
            if item.end_tx_num <= from_tx || item.start_tx_num >= to_tx {
                continue;
            }
            let mut stream = item.data().stream()?;
            while let Some((key, value)) = stream.next_entry()? {
                let bitmap = RoaringTreemap::deserialize_from(&value[..])?;
                if let Some(t) = bitmap.iter().find(|t| *t >= from_tx && *t < to_tx) {
                    first_change
                        .entry(key)
                        .and_modify(|cur| *cur = (*cur).min(t))
                        .or_insert(t);
                }
            }
        }
        tx.scan(
            self.ic.index_keys_table,
            &tx_num_key(from_tx),
            Some(&tx_num_key(to_tx)),
            &mut |k, v| {
                let Some(t) = crate::kv::parse_tx_num(k) else {
                    return Ok(true);
                };
                first_change
                    .entry(v.to_vec())
                    .and_modify(|cur| *cur = (*cur).min(t))
                    .or_insert(t);
                Ok(true)
            },
        )?;

        let mut rows = Vec::new();
        for (key, t) in &first_change {
            let value = match read_hist_value(&self.hist_files, key, *t)? {
                Some(value) => value,
                None => {
                    let mut vals_key = key.clone();
                    vals_key.extend_from_slice(&tx_num_key(*t));
                    tx.get(self.vals_table, &vals_key)
                        .ok_or_else(|| eyre!("missing value for changed key at txnum {t}"))?
                }
            };
            rows.push((key.clone(), value));
        }
        if !asc {
            rows.reverse();
        }
        rows.truncate(limit);
        Ok(HistoryChangesIter {
            rows: rows.into_iter(),
        })
    }

    /// As-of walk over `[from_key, to_key)` at `at_tx`.
    fn historical_state_range(
        &self,
        at_tx: u64,
        from_key: &[u8],
        to_key: Option<&[u8]>,
        limit: usize,
        tx: &dyn KvRead,
    ) -> Result<StateAsOfIter> {
        let in_range = |key: &[u8]| {
            key >= from_key && to_key.map_or(true, |to| key < to)
        };
        let mut candidates: BTreeSet<Vec<u8>> = BTreeSet::new();
        for item in &self.ic.files {
            let mut stream = item.data().stream()?;
            while let Some((key, _)) = stream.next_entry()? {
                if in_range(&key) {
                    candidates.insert(key);
                }
            }
        }
        tx.scan(self.ic.index_table, from_key, to_key, &mut |k, _| {
            candidates.insert(k.to_vec());
            Ok(true)
        })?;

        let mut rows = Vec::new();
        for key in candidates {
            if rows.len() >= limit {
                break;
            }
            if let Some(value) = self.get_no_state_with_recent(&key, at_tx, tx)? {
                rows.push((key, value));
            }
        }
        Ok(StateAsOfIter {
            rows: rows.into_iter(),
        })
    }
}

/// Ascending or descending txnum iteration for one inverted-index key.
pub struct InvertedIterator {
    txs: std::vec::IntoIter<u64>,
}

impl Iterator for InvertedIterator {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.txs.next()
    }
}

/// `(key, value-at-first-change)` pairs for a txnum window.
pub struct HistoryChangesIter {
    rows: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Iterator for HistoryChangesIter {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

/// `(key, value-as-of)` pairs for a key range.
pub struct StateAsOfIter {
    rows: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Iterator for StateAsOfIter {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

/// Consistent read view over all seven domains, taken at `make_context`
/// time. Dropping it releases every captured shard reference; shards
/// marked deletable vanish from disk with their last context.
pub struct AggregatorContext {
    accounts: HistoryContext,
    storage: HistoryContext,
    code: HistoryContext,
    log_addrs: InvertedIndexContext,
    log_topics: InvertedIndexContext,
    traces_from: InvertedIndexContext,
    traces_to: InvertedIndexContext,
}

impl Aggregator {
    pub fn make_context(&self) -> AggregatorContext {
        let inner = self.inner();
        AggregatorContext {
            accounts: HistoryContext::capture(&inner.accounts),
            storage: HistoryContext::capture(&inner.storage),
            code: HistoryContext::capture(&inner.code),
            log_addrs: InvertedIndexContext::capture(&inner.log_addrs),
            log_topics: InvertedIndexContext::capture(&inner.log_topics),
            traces_from: InvertedIndexContext::capture(&inner.traces_from),
            traces_to: InvertedIndexContext::capture(&inner.traces_to),
        }
    }
}

impl AggregatorContext {
    /// Explicit release; dropping does the same.
    pub fn close(self) {}

    fn storage_key(addr: &[u8], loc: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(addr.len() + loc.len());
        key.extend_from_slice(addr);
        key.extend_from_slice(loc);
        key
    }

    // --- point reads ---

    pub fn read_account_data_no_state(&self, addr: &[u8], tx_num: u64) -> Result<Option<Vec<u8>>> {
        self.accounts.get_no_state(addr, tx_num)
    }

    pub fn read_account_data_no_state_with_recent(
        &self,
        addr: &[u8],
        tx_num: u64,
        tx: &dyn KvRead,
    ) -> Result<Option<Vec<u8>>> {
        self.accounts.get_no_state_with_recent(addr, tx_num, tx)
    }

    pub fn read_account_storage_no_state(
        &self,
        addr: &[u8],
        loc: &[u8],
        tx_num: u64,
    ) -> Result<Option<Vec<u8>>> {
        self.storage.get_no_state(&Self::storage_key(addr, loc), tx_num)
    }

    pub fn read_account_storage_no_state_with_recent(
        &self,
        addr: &[u8],
        loc: &[u8],
        tx_num: u64,
        tx: &dyn KvRead,
    ) -> Result<Option<Vec<u8>>> {
        self.storage
            .get_no_state_with_recent(&Self::storage_key(addr, loc), tx_num, tx)
    }

    /// Storage read for callers that already hold the composite key.
    pub fn read_account_storage_no_state_with_recent2(
        &self,
        key: &[u8],
        tx_num: u64,
        tx: &dyn KvRead,
    ) -> Result<Option<Vec<u8>>> {
        self.storage.get_no_state_with_recent(key, tx_num, tx)
    }

    pub fn read_account_code_no_state(&self, addr: &[u8], tx_num: u64) -> Result<Option<Vec<u8>>> {
        self.code.get_no_state(addr, tx_num)
    }

    pub fn read_account_code_no_state_with_recent(
        &self,
        addr: &[u8],
        tx_num: u64,
        tx: &dyn KvRead,
    ) -> Result<Option<Vec<u8>>> {
        self.code.get_no_state_with_recent(addr, tx_num, tx)
    }

    pub fn read_account_code_size_no_state(&self, addr: &[u8], tx_num: u64) -> Result<Option<usize>> {
        Ok(self.code.get_no_state(addr, tx_num)?.map(|code| code.len()))
    }

    pub fn read_account_code_size_no_state_with_recent(
        &self,
        addr: &[u8],
        tx_num: u64,
        tx: &dyn KvRead,
    ) -> Result<Option<usize>> {
        Ok(self
            .code
            .get_no_state_with_recent(addr, tx_num, tx)?
            .map(|code| code.len()))
    }

    // --- changed-key windows ---

    pub fn account_history_iterate_changed(
        &self,
        from_tx: u64,
        to_tx: u64,
        asc: bool,
        limit: usize,
        tx: &dyn KvRead,
    ) -> Result<HistoryChangesIter> {
        self.accounts.iterate_changed(from_tx, to_tx, asc, limit, tx)
    }

    pub fn storage_history_iterate_changed(
        &self,
        from_tx: u64,
        to_tx: u64,
        asc: bool,
        limit: usize,
        tx: &dyn KvRead,
    ) -> Result<HistoryChangesIter> {
        self.storage.iterate_changed(from_tx, to_tx, asc, limit, tx)
    }

    pub fn code_history_iterate_changed(
        &self,
        from_tx: u64,
        to_tx: u64,
        asc: bool,
        limit: usize,
        tx: &dyn KvRead,
    ) -> Result<HistoryChangesIter> {
        self.code.iterate_changed(from_tx, to_tx, asc, limit, tx)
    }

    // --- as-of walks ---

    pub fn account_historical_state_range(
        &self,
        at_tx: u64,
        from_key: &[u8],
        to_key: Option<&[u8]>,
        limit: usize,
        tx: &dyn KvRead,
    ) -> Result<StateAsOfIter> {
        self.accounts
            .historical_state_range(at_tx, from_key, to_key, limit, tx)
    }

    pub fn storage_historical_state_range(
        &self,
        at_tx: u64,
        from_key: &[u8],
        to_key: Option<&[u8]>,
        limit: usize,
        tx: &dyn KvRead,
    ) -> Result<StateAsOfIter> {
        self.storage
            .historical_state_range(at_tx, from_key, to_key, limit, tx)
    }

    pub fn code_historical_state_range(
        &self,
        at_tx: u64,
        from_key: &[u8],
        to_key: Option<&[u8]>,
        limit: usize,
        tx: &dyn KvRead,
    ) -> Result<StateAsOfIter> {
        self.code
            .historical_state_range(at_tx, from_key, to_key, limit, tx)
    }

    // --- inverted-index range iteration ---

    pub fn log_addr_iterator(
        &self,
        addr: &[u8],
        from_tx: u64,
        to_tx: u64,
        asc: bool,
        limit: usize,
        tx: &dyn KvRead,
    ) -> Result<InvertedIterator> {
        self.log_addrs.iterate_range(addr, from_tx, to_tx, asc, limit, tx)
    }

    pub fn log_topic_iterator(
        &self,
        topic: &[u8],
        from_tx: u64,
        to_tx: u64,
        asc: bool,
        limit: usize,
        tx: &dyn KvRead,
    ) -> Result<InvertedIterator> {
        self.log_topics
            .iterate_range(topic, from_tx, to_tx, asc, limit, tx)
    }

    pub fn trace_from_iterator(
        &self,
        addr: &[u8],
        from_tx: u64,
        to_tx: u64,
        asc: bool,
        limit: usize,
        tx: &dyn KvRead,
    ) -> Result<InvertedIterator> {
        self.traces_from
            .iterate_range(addr, from_tx, to_tx, asc, limit, tx)
    }

    pub fn trace_to_iterator(
        &self,
        addr: &[u8],
        from_tx: u64,
        to_tx: u64,
        asc: bool,
        limit: usize,
        tx: &dyn KvRead,
    ) -> Result<InvertedIterator> {
        self.traces_to
            .iterate_range(addr, from_tx, to_tx, asc, limit, tx)
    }

    pub fn account_history_idx_iterator(
        &self,
        addr: &[u8],
        from_tx: u64,
        to_tx: u64,
        asc: bool,
        limit: usize,
        tx: &dyn KvRead,
    ) -> Result<InvertedIterator> {
        self.accounts
            .ic
            .iterate_range(addr, from_tx, to_tx, asc, limit, tx)
    }

    pub fn storage_history_idx_iterator(
        &self,
        key: &[u8],
        from_tx: u64,
        to_tx: u64,
        asc: bool,
        limit: usize,
        tx: &dyn KvRead,
    ) -> Result<InvertedIterator> {
        self.storage
            .ic
            .iterate_range(key, from_tx, to_tx, asc, limit, tx)
    }

    pub fn code_history_idx_iterator(
        &self,
        addr: &[u8],
        from_tx: u64,
        to_tx: u64,
        asc: bool,
        limit: usize,
        tx: &dyn KvRead,
    ) -> Result<InvertedIterator> {
        self.code
            .ic
            .iterate_range(addr, from_tx, to_tx, asc, limit, tx)
    }
}
