//! History domain: a value log keyed by entity and txnum, embedding an
//! inverted index over the same keys. A row `(key, txnum) -> value`
//! records the value written at `txnum`; reads return the latest row at
//! or below the queried txnum.

use super::inverted_index::{InvertedCollation, InvertedFiles, InvertedIndex};
use super::locality::LocalityFiles;
use super::segment::{write_index, SegmentWriter};
use super::{
    end_tx_num_minimax, file_name, scan_dir, select_cover, Domain, FileKind, FileSet, FilesItem,
    Flusher, ReadAhead,
};
use crate::kv::{tx_num_key, KvRead, RwTx, Table};
use crate::tasks::{Cancel, LogTicker};
use eyre::{eyre, Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use roaring::RoaringTreemap;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// One step of history data pulled out of the DB: the per-key txnum map
/// for the embedded index plus the `(key ++ txnum) -> value` rows.
#[derive(Debug, Default)]
pub struct HistoryCollation {
    pub(crate) idx: BTreeMap<Vec<u8>, RoaringTreemap>,
    pub(crate) hist: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl HistoryCollation {
    pub fn keys(&self) -> usize {
        self.idx.len()
    }
}

/// Freshly built `.ef`/`.efi` + `.v`/`.vi` pair for one step.
pub struct HistoryFiles {
    pub(crate) index: InvertedFiles,
    pub(crate) hist: Arc<FilesItem>,
}

impl HistoryFiles {
    pub fn discard(self) {
        self.hist.mark_deletable();
        self.index.discard();
    }
}

struct HistWriteState {
    started: bool,
    discard: bool,
    entries: Vec<(Table, Vec<u8>, Vec<u8>)>,
}

pub struct History {
    ii: InvertedIndex,
    dir: PathBuf,
    vals_table: Table,
    // Declared for the host store per the table layout; the engine itself
    // stores nothing in it.
    #[allow(dead_code)]
    settings_table: Table,
    compress_vals: bool,
    hist_files: RwLock<FileSet>,
    writes: Mutex<HistWriteState>,
}

impl History {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dir: &Path,
        tmpdir: &Path,
        aggregation_step: u64,
        steps_in_biggest_file: u64,
        filename_base: &str,
        index_keys_table: Table,
        index_table: Table,
        vals_table: Table,
        settings_table: Table,
        compress_vals: bool,
    ) -> Result<Self> {
        let ii = InvertedIndex::new(
            dir,
            tmpdir,
            aggregation_step,
            steps_in_biggest_file,
            filename_base,
            index_keys_table,
            index_table,
        )?;
        let h = Self {
            ii,
            dir: dir.to_path_buf(),
            vals_table,
            settings_table,
            compress_vals,
            hist_files: RwLock::new(FileSet::new()),
            writes: Mutex::new(HistWriteState {
                started: false,
                discard: false,
                entries: Vec::new(),
            }),
        };
        h.reopen_hist_folder()
            .wrap_err_with(|| format!("History: {filename_base}"))?;
        Ok(h)
    }

    pub fn ii(&self) -> &InvertedIndex {
        &self.ii
    }

    pub fn vals_table(&self) -> Table {
        self.vals_table
    }

    pub fn compress_vals(&self) -> bool {
        self.compress_vals
    }

    pub fn hist_cover(&self) -> Vec<Arc<FilesItem>> {
        select_cover(&self.hist_files.read())
    }

    /// Appends one datum at the current writer position. `key2` (storage
    /// location) is concatenated onto `key1` when present.
    pub fn add_prev_value(&self, key1: &[u8], key2: Option<&[u8]>, value: &[u8]) -> Result<()> {
        let mut key = Vec::with_capacity(key1.len() + key2.map_or(0, <[u8]>::len));
        key.extend_from_slice(key1);
        if let Some(key2) = key2 {
            key.extend_from_slice(key2);
        }
        {
            let mut writes = self.writes.lock();
            if !writes.started {
                return Err(eyre!("{}: writes not started", self.ii.filename_base()));
            }
            if writes.discard {
                return Ok(());
            }
            let tx_num = self.ii.current_tx_num();
            let mut vals_key = key.clone();
            vals_key.extend_from_slice(&tx_num_key(tx_num));
            let vals_table = self.vals_table;
            writes.entries.push((vals_table, vals_key, value.to_vec()));
        }
        self.ii.add(&key)
    }

    /// Collates the DB range `[tx_from, tx_to)` into index and value rows.
    pub fn collate(
        &self,
        cancel: &Cancel,
        tx_from: u64,
        tx_to: u64,
        tx: &dyn KvRead,
        ticker: &mut LogTicker,
    ) -> Result<HistoryCollation> {
        let mut coll = HistoryCollation {
            idx: self.ii.collate(cancel, tx_from, tx_to, tx, ticker)?.idx,
            hist: BTreeMap::new(),
        };
        for (key, bitmap) in &coll.idx {
            for tx_num in bitmap.iter() {
                cancel.check()?;
                let mut vals_key = key.clone();
                vals_key.extend_from_slice(&tx_num_key(tx_num));
                let value = tx.get(self.vals_table, &vals_key).unwrap_or_default();
                coll.hist.insert(vals_key, value);
            }
        }
        Ok(coll)
    }

    /// Writes the step's `.ef`/`.efi` and `.v`/`.vi` shards.
    pub fn build_files(
        &self,
        cancel: &Cancel,
        step: u64,
        coll: HistoryCollation,
    ) -> Result<HistoryFiles> {
        let HistoryCollation { idx, hist } = coll;
        let index = self.ii.build_files(cancel, step, InvertedCollation { idx })?;
        match self.write_hist_shard(cancel, step, step + 1, hist.iter()) {
            Ok(hist_item) => Ok(HistoryFiles {
                index,
                hist: hist_item,
            }),
            Err(err) => {
                index.discard();
                Err(err).wrap_err_with(|| format!("buildFiles {}", self.ii.filename_base()))
            }
        }
    }

    fn write_hist_shard<'a>(
        &self,
        cancel: &Cancel,
        start_step: u64,
        end_step: u64,
        entries: impl Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)>,
    ) -> Result<Arc<FilesItem>> {
        let base = self.ii.filename_base();
        let data_path = self.dir.join(file_name(base, start_step, end_step, "v"));
        let index_path = self.dir.join(file_name(base, start_step, end_step, "vi"));
        let result = (|| -> Result<Arc<FilesItem>> {
            let mut writer = SegmentWriter::create(&data_path, self.compress_vals)?;
            for (key, value) in entries {
                cancel.check()?;
                writer.append(key, value)?;
            }
            let index_entries = writer.finish()?;
            write_index(&index_path, &index_entries)?;
            let item = FilesItem::open(
                &self.dir,
                base,
                FileKind::HistoryData,
                start_step,
                end_step,
                self.ii.aggregation_step(),
                self.ii.steps_in_biggest_file(),
                self.compress_vals,
            )?;
            Ok(Arc::new(item))
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&data_path);
            let _ = std::fs::remove_file(&index_path);
        }
        result
    }

    pub fn integrate_files(&self, sf: HistoryFiles, tx_from: u64, tx_to: u64) {
        self.ii.integrate_files(sf.index, tx_from, tx_to);
        self.hist_files.write().insert((tx_from, tx_to), sf.hist);
    }

    pub fn find_merge_range(&self, max_end_tx_num: u64, max_span: u64) -> Option<(u64, u64)> {
        self.ii.find_merge_range(max_end_tx_num, max_span)
    }

    /// `(index shards, history shards)` fully inside the range.
    pub fn static_files_in_range(
        &self,
        start_tx_num: u64,
        end_tx_num: u64,
    ) -> (Vec<Arc<FilesItem>>, Vec<Arc<FilesItem>>) {
        let idx = self.ii.static_files_in_range(start_tx_num, end_tx_num);
        let hist = self
            .hist_cover()
            .into_iter()
            .filter(|item| item.start_tx_num >= start_tx_num && item.end_tx_num <= end_tx_num)
            .collect();
        (idx, hist)
    }

    pub fn merge_files(
        &self,
        cancel: &Cancel,
        idx_items: &[Arc<FilesItem>],
        hist_items: &[Arc<FilesItem>],
        start_tx_num: u64,
        end_tx_num: u64,
    ) -> Result<(Arc<FilesItem>, Arc<FilesItem>)> {
        let merged_idx = self
            .ii
            .merge_files(cancel, idx_items, start_tx_num, end_tx_num)?;
        let result = (|| -> Result<Arc<FilesItem>> {
            let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
            for item in hist_items {
                let mut stream = item.data().stream()?;
                while let Some((key, value)) = stream.next_entry()? {
                    cancel.check()?;
                    merged.insert(key, value);
                }
            }
            let start_step = start_tx_num / self.ii.aggregation_step();
            let end_step = end_tx_num / self.ii.aggregation_step();
            self.write_hist_shard(cancel, start_step, end_step, merged.iter())
        })();
        match result {
            Ok(merged_hist) => Ok((merged_idx, merged_hist)),
            Err(err) => {
                merged_idx.mark_deletable();
                Err(err).wrap_err_with(|| format!("merge {}", self.ii.filename_base()))
            }
        }
    }

    pub fn integrate_merged_files(
        &self,
        outs_idx: &[Arc<FilesItem>],
        outs_hist: &[Arc<FilesItem>],
        merged_idx: Arc<FilesItem>,
        merged_hist: Arc<FilesItem>,
    ) {
        self.ii.integrate_merged_files(outs_idx, merged_idx);
        let mut files = self.hist_files.write();
        for out in outs_hist {
            files.remove(&(out.start_tx_num, out.end_tx_num));
        }
        files.insert((merged_hist.start_tx_num, merged_hist.end_tx_num), merged_hist);
    }

    pub fn clean_after_freeze(&self, outs_idx: &[Arc<FilesItem>], outs_hist: &[Arc<FilesItem>]) {
        self.ii.clean_after_freeze(outs_idx);
        for out in outs_hist {
            out.mark_deletable();
        }
    }

    fn prune_rows(
        &self,
        cancel: &Cancel,
        tx_from: u64,
        tx_to: u64,
        limit: u64,
        tx: &RwTx,
        ticker: &mut LogTicker,
        mut on_row: Option<&mut dyn FnMut(u64, &[u8], &[u8]) -> Result<()>>,
    ) -> Result<()> {
        let rows = self.ii.collect_prune_rows(tx, tx_from, tx_to, limit)?;
        let mut emitted: HashSet<Vec<u8>> = HashSet::new();
        for (tx_num, key) in rows {
            cancel.check()?;
            if let Some(on_row) = on_row.as_mut() {
                if emitted.insert(key.clone()) {
                    let restore = self
                        .value_before(&key, tx_from, tx)?
                        .unwrap_or_default();
                    on_row(tx_num, &key, &restore)?;
                }
            }
            let t_key = tx_num_key(tx_num);
            let mut vals_key = key.clone();
            vals_key.extend_from_slice(&t_key);
            tx.delete(self.vals_table, &vals_key);
            tx.delete_dup(self.ii.index_table(), &key, &t_key);
            tx.delete_dup(self.ii.index_keys_table(), &t_key, &key);
            if ticker.tick() {
                tracing::debug!(name = %self.ii.filename_base(), tx_num, "prune progress");
            }
        }
        Ok(())
    }

    /// Deletes DB rows in `[tx_from, tx_to)` and, once per affected key,
    /// hands the key's surviving value below `tx_from` (empty when none)
    /// to `f` — the reverse state `unwind` loads back into plain state.
    pub fn prune_f(
        &self,
        cancel: &Cancel,
        tx_from: u64,
        tx_to: u64,
        tx: &RwTx,
        f: &mut dyn FnMut(u64, &[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        let mut ticker = LogTicker::new(std::time::Duration::from_secs(30));
        self.prune_rows(cancel, tx_from, tx_to, u64::MAX, tx, &mut ticker, Some(f))
            .wrap_err_with(|| format!("pruneF {}", self.ii.filename_base()))
    }

    /// Latest value strictly below `bound_tx_num`, looking at the live DB
    /// tail and the snapshots.
    fn value_before(&self, key: &[u8], bound_tx_num: u64, tx: &RwTx) -> Result<Option<Vec<u8>>> {
        if bound_tx_num == 0 {
            return Ok(None);
        }
        self.get_no_state_with_recent(key, bound_tx_num - 1, tx)
            .map(|found| found.map(|(value, _)| value))
    }

    /// Snapshot-only point read: latest row with txnum `<= tx_num`.
    /// Returns `(value, state_tx_num)`.
    pub fn get_no_state(&self, key: &[u8], tx_num: u64) -> Result<Option<(Vec<u8>, u64)>> {
        let ef_cover = self.ii.cover();
        let locality = self.ii.locality().current();
        let Some(found_tx) = latest_le(
            &ef_cover,
            locality.as_deref(),
            key,
            tx_num,
            self.ii.aggregation_step(),
            self.ii.steps_in_biggest_file(),
        )?
        else {
            return Ok(None);
        };
        let hist_cover = self.hist_cover();
        let value = read_hist_value(&hist_cover, key, found_tx)?
            .ok_or_else(|| eyre!("{}: missing history value for indexed txnum {found_tx}", self.ii.filename_base()))?;
        Ok(Some((value, found_tx)))
    }

    /// Point read over snapshots plus the live DB tail.
    pub fn get_no_state_with_recent(
        &self,
        key: &[u8],
        tx_num: u64,
        tx: &dyn KvRead,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        let db_tx = self
            .ii
            .txnums_in_db(key, tx)
            .into_iter()
            .filter(|t| *t <= tx_num)
            .max();
        let snap = self.get_no_state(key, tx_num)?;
        match (db_tx, snap) {
            (Some(t_db), Some((value, t_snap))) if t_snap >= t_db => Ok(Some((value, t_snap))),
            (Some(t_db), _) => {
                let mut vals_key = key.to_vec();
                vals_key.extend_from_slice(&tx_num_key(t_db));
                let value = tx.get(self.vals_table, &vals_key).ok_or_else(|| {
                    eyre!("{}: missing DB value for indexed txnum {t_db}", self.ii.filename_base())
                })?;
                Ok(Some((value, t_db)))
            }
            (None, snap) => Ok(snap),
        }
    }

    /// Highest end txnum among frozen, indexed shards.
    pub fn end_frozen_and_indexed(&self) -> u64 {
        self.ii
            .cover()
            .iter()
            .rev()
            .find(|item| item.frozen)
            .map(|item| item.end_tx_num)
            .unwrap_or(0)
    }

    /// One [`HistoryStep`] per shard whose interval ends at or below
    /// `upto_tx_num`.
    pub fn make_steps(&self, upto_tx_num: u64) -> Vec<HistoryStep> {
        let hist_files = self.hist_files.read();
        self.ii
            .cover()
            .into_iter()
            .filter(|item| item.end_tx_num <= upto_tx_num)
            .filter_map(|index_file| {
                let hist_file = hist_files
                    .get(&(index_file.start_tx_num, index_file.end_tx_num))
                    .cloned()?;
                Some(HistoryStep {
                    index_file,
                    hist_file,
                })
            })
            .collect()
    }

    fn reopen_hist_folder(&self) -> Result<()> {
        let base = self.ii.filename_base().to_string();
        let mut next = FileSet::new();
        for (start_step, end_step) in scan_dir(&self.dir, &base, FileKind::HistoryData)? {
            match FilesItem::open(
                &self.dir,
                &base,
                FileKind::HistoryData,
                start_step,
                end_step,
                self.ii.aggregation_step(),
                self.ii.steps_in_biggest_file(),
                self.compress_vals,
            ) {
                Ok(item) => {
                    next.insert((item.start_tx_num, item.end_tx_num), Arc::new(item));
                }
                Err(err) => {
                    warn!(
                        name = %base,
                        start_step,
                        end_step,
                        error = %err,
                        "file ignored by snapshot scan"
                    );
                }
            }
        }
        *self.hist_files.write() = next;
        Ok(())
    }
}

impl Domain for History {
    fn name(&self) -> &str {
        self.ii.filename_base()
    }

    fn set_tx(&self, tx: &RwTx) {
        self.ii.set_tx(tx);
    }

    fn set_tx_num(&self, tx_num: u64) {
        self.ii.set_tx_num(tx_num);
    }

    fn start_writes(&self) {
        self.ii.start_writes();
        let mut writes = self.writes.lock();
        writes.started = true;
        writes.discard = false;
    }

    fn finish_writes(&self) {
        self.ii.finish_writes();
        let mut writes = self.writes.lock();
        writes.started = false;
        writes.entries.clear();
    }

    fn discard_history(&self) {
        self.ii.discard_history();
        let mut writes = self.writes.lock();
        writes.started = true;
        writes.discard = true;
    }

    fn rotate(&self) -> Flusher {
        let mut flusher = self.ii.rotate();
        let mut writes = self.writes.lock();
        flusher.entries.append(&mut writes.entries);
        flusher
    }

    fn prune(
        &self,
        cancel: &Cancel,
        tx_from: u64,
        tx_to: u64,
        limit: u64,
        ticker: &mut LogTicker,
    ) -> Result<()> {
        let tx = self.ii.bound_tx()?;
        self.prune_rows(cancel, tx_from, tx_to, limit, &tx, ticker, None)
            .wrap_err_with(|| format!("prune {}", self.ii.filename_base()))
    }

    fn warmup(&self, cancel: &Cancel, tx_from: u64, limit: u64, tx: &dyn KvRead) -> Result<()> {
        self.ii.warmup(cancel, tx_from, limit, tx)
    }

    fn reopen_folder(&self) -> Result<()> {
        self.ii.reopen_folder()?;
        self.reopen_hist_folder()
            .wrap_err_with(|| format!("ReopenFolder: {}", self.ii.filename_base()))
    }

    fn close(&self) {
        self.ii.close();
        self.hist_files.write().clear();
    }

    fn end_tx_num_minimax(&self) -> u64 {
        self.ii
            .end_tx_num_minimax()
            .min(end_tx_num_minimax(&self.hist_files.read()))
    }

    fn files(&self) -> Vec<String> {
        let mut out = self.ii.files();
        let step = self.ii.aggregation_step();
        out.extend(self.hist_cover().iter().map(|item| {
            file_name(
                self.ii.filename_base(),
                item.start_tx_num / step,
                item.end_tx_num / step,
                "v",
            )
        }));
        out
    }

    fn set_compress_workers(&self, n: usize) {
        self.ii.set_compress_workers(n);
    }

    fn set_read_ahead(&self, mode: ReadAhead) {
        self.ii.set_read_ahead(mode);
    }

    fn build_missed_indices(&self, cancel: &Cancel) -> Result<()> {
        self.ii.build_missed_indices(cancel)?;
        for (start_step, end_step) in
            scan_dir(&self.dir, self.ii.filename_base(), FileKind::HistoryData)?
        {
            cancel.check()?;
            let index_path =
                self.dir
                    .join(file_name(self.ii.filename_base(), start_step, end_step, "vi"));
            if index_path.exists() {
                continue;
            }
            let data_path =
                self.dir
                    .join(file_name(self.ii.filename_base(), start_step, end_step, "v"));
            super::inverted_index::rebuild_index(&data_path, &index_path, self.compress_vals)?;
        }
        self.reopen_hist_folder()
            .wrap_err_with(|| format!("BuildMissedIndices: {}", self.ii.filename_base()))
    }

    fn cleanup_dir(&self) {
        self.ii.cleanup_dir();
    }
}

/// One step of a history domain, isolated for offline reconstitution.
#[derive(Clone)]
pub struct HistoryStep {
    pub(crate) index_file: Arc<FilesItem>,
    pub(crate) hist_file: Arc<FilesItem>,
}

impl HistoryStep {
    pub fn tx_num_range(&self) -> (u64, u64) {
        (self.index_file.start_tx_num, self.index_file.end_tx_num)
    }

    /// Every txnum at which some key changed inside this step, ascending.
    pub fn iterate_txs(&self) -> Result<ScanIter> {
        let mut all = RoaringTreemap::new();
        let mut stream = self.index_file.data().stream()?;
        while let Some((_, value)) = stream.next_entry()? {
            all |= RoaringTreemap::deserialize_from(&value[..])?;
        }
        Ok(ScanIter {
            txs: all.iter().collect::<Vec<_>>().into_iter(),
        })
    }

    /// `(value, state_tx_num)` of the latest row `<= tx_num` within this
    /// step.
    pub fn get_no_state(&self, key: &[u8], tx_num: u64) -> Result<Option<(Vec<u8>, u64)>> {
        let Some(bitmap) = bitmap_for_key(&self.index_file, key)? else {
            return Ok(None);
        };
        let Some(found_tx) = max_le(&bitmap, tx_num) else {
            return Ok(None);
        };
        let value = read_hist_value(std::slice::from_ref(&self.hist_file), key, found_tx)?
            .ok_or_else(|| eyre!("missing history value for indexed txnum {found_tx}"))?;
        Ok(Some((value, found_tx)))
    }

    /// Highest txnum at which the key changed inside this step.
    pub fn max_tx_num(&self, key: &[u8]) -> Result<Option<u64>> {
        Ok(bitmap_for_key(&self.index_file, key)?.and_then(|bm| bm.max()))
    }

    /// For each key with a change strictly before `tx_num`, the latest such
    /// `(key, value)`, ascending by key.
    pub fn iterate_history_before_tx_num(&self, tx_num: u64) -> Result<HistoryStepIter> {
        if tx_num == 0 {
            return Ok(HistoryStepIter { rows: Vec::new().into_iter() });
        }
        let mut rows = Vec::new();
        let mut stream = self.index_file.data().stream()?;
        while let Some((key, value)) = stream.next_entry()? {
            let bitmap = RoaringTreemap::deserialize_from(&value[..])?;
            if let Some(found_tx) = max_le(&bitmap, tx_num - 1) {
                let row = read_hist_value(std::slice::from_ref(&self.hist_file), &key, found_tx)?
                    .ok_or_else(|| eyre!("missing history value for indexed txnum {found_tx}"))?;
                rows.push((key, row));
            }
        }
        Ok(HistoryStepIter {
            rows: rows.into_iter(),
        })
    }
}

pub struct ScanIter {
    txs: std::vec::IntoIter<u64>,
}

impl Iterator for ScanIter {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.txs.next()
    }
}

pub struct HistoryStepIter {
    rows: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Iterator for HistoryStepIter {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

pub(crate) fn bitmap_for_key(item: &FilesItem, key: &[u8]) -> Result<Option<RoaringTreemap>> {
    let Some((_, offset)) = item.index().lookup(key) else {
        return Ok(None);
    };
    let (_, value) = item.data().read_at(offset)?;
    Ok(Some(RoaringTreemap::deserialize_from(&value[..])?))
}

pub(crate) fn max_le(bitmap: &RoaringTreemap, bound: u64) -> Option<u64> {
    bitmap.iter().take_while(|t| *t <= bound).last()
}

/// Latest txnum `<= bound` for `key` across an index-shard cover, newest
/// shard first. Frozen shards the locality pair covers are skipped when
/// the key's bitmap says the key cannot occur there.
pub(crate) fn latest_le(
    ef_cover: &[Arc<FilesItem>],
    locality: Option<&LocalityFiles>,
    key: &[u8],
    bound: u64,
    aggregation_step: u64,
    steps_in_biggest_file: u64,
) -> Result<Option<u64>> {
    let loc_ordinal = locality.map(|loc| (loc, loc.ordinal(key)));
    for item in ef_cover.iter().rev() {
        if item.start_tx_num > bound {
            continue;
        }
        if item.frozen {
            if let Some((loc, ordinal)) = &loc_ordinal {
                if item.end_tx_num <= loc.end_tx_num {
                    let file_no =
                        item.start_tx_num / aggregation_step / steps_in_biggest_file;
                    match ordinal {
                        None => continue,
                        Some(ordinal) if !loc.contains(*ordinal, file_no) => continue,
                        Some(_) => {}
                    }
                }
            }
        }
        if let Some(bitmap) = bitmap_for_key(item, key)? {
            if let Some(found) = max_le(&bitmap, bound) {
                return Ok(Some(found));
            }
        }
    }
    Ok(None)
}

/// Reads the `(key ++ txnum)` row from whichever history shard covers the
/// txnum.
pub(crate) fn read_hist_value(
    hist_cover: &[Arc<FilesItem>],
    key: &[u8],
    tx_num: u64,
) -> Result<Option<Vec<u8>>> {
    let mut vals_key = key.to_vec();
    vals_key.extend_from_slice(&tx_num_key(tx_num));
    for item in hist_cover {
        if tx_num < item.start_tx_num || tx_num >= item.end_tx_num {
            continue;
        }
        let Some((_, offset)) = item.index().lookup(&vals_key) else {
            return Ok(None);
        };
        let (_, value) = item.data().read_at(offset)?;
        return Ok(Some(value));
    }
    Ok(None)
}
