//! Inverted-index domain: key -> set-of-txnums. Live writes land in the
//! `<name>Keys` / `<name>Idx` DB tables; step boundaries collate the DB
//! range into immutable `.ef`/`.efi` shards.

use super::locality::LocalityIndex;
use super::segment::{write_index, SegmentWriter};
use super::{
    end_tx_num_minimax, file_name, scan_dir, select_cover, Domain, FileKind, FileSet, FilesItem,
    Flusher, ReadAhead,
};
use crate::kv::{parse_tx_num, tx_num_key, KvRead, RwTx, Table};
use crate::tasks::{Cancel, LogTicker};
use eyre::{eyre, Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use roaring::RoaringTreemap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Transient accumulation of one `(domain, step)` worth of DB rows.
#[derive(Debug, Default)]
pub struct InvertedCollation {
    pub(crate) idx: BTreeMap<Vec<u8>, RoaringTreemap>,
}

impl InvertedCollation {
    pub fn keys(&self) -> usize {
        self.idx.len()
    }
}

/// Freshly built, not yet integrated shard.
pub struct InvertedFiles {
    pub(crate) item: Arc<FilesItem>,
}

impl InvertedFiles {
    /// Marks the underlying files for unlink; used on every failure path
    /// before the shard became visible.
    pub fn discard(self) {
        self.item.mark_deletable();
    }
}

struct WriteState {
    started: bool,
    discard: bool,
    entries: Vec<(Table, Vec<u8>, Vec<u8>)>,
}

pub struct InvertedIndex {
    dir: PathBuf,
    #[allow(dead_code)]
    tmpdir: PathBuf,
    filename_base: String,
    aggregation_step: u64,
    steps_in_biggest_file: u64,
    index_keys_table: Table,
    index_table: Table,
    files: RwLock<FileSet>,
    locality: LocalityIndex,
    tx: Mutex<Option<RwTx>>,
    tx_num: AtomicU64,
    writes: Mutex<WriteState>,
    compress_workers: AtomicUsize,
    read_ahead: AtomicU8,
}

impl InvertedIndex {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dir: &Path,
        tmpdir: &Path,
        aggregation_step: u64,
        steps_in_biggest_file: u64,
        filename_base: &str,
        index_keys_table: Table,
        index_table: Table,
    ) -> Result<Self> {
        let ii = Self {
            dir: dir.to_path_buf(),
            tmpdir: tmpdir.to_path_buf(),
            filename_base: filename_base.to_string(),
            aggregation_step,
            steps_in_biggest_file,
            index_keys_table,
            index_table,
            files: RwLock::new(FileSet::new()),
            locality: LocalityIndex::new(
                dir,
                tmpdir,
                aggregation_step,
                steps_in_biggest_file,
                filename_base,
            ),
            tx: Mutex::new(None),
            tx_num: AtomicU64::new(0),
            writes: Mutex::new(WriteState {
                started: false,
                discard: false,
                entries: Vec::new(),
            }),
            compress_workers: AtomicUsize::new(1),
            read_ahead: AtomicU8::new(ReadAhead::Normal as u8),
        };
        ii.reopen_folder()
            .wrap_err_with(|| format!("InvertedIndex: {filename_base}"))?;
        Ok(ii)
    }

    pub fn filename_base(&self) -> &str {
        &self.filename_base
    }

    pub fn aggregation_step(&self) -> u64 {
        self.aggregation_step
    }

    pub fn steps_in_biggest_file(&self) -> u64 {
        self.steps_in_biggest_file
    }

    pub fn index_keys_table(&self) -> Table {
        self.index_keys_table
    }

    pub fn index_table(&self) -> Table {
        self.index_table
    }

    pub fn locality(&self) -> &LocalityIndex {
        &self.locality
    }

    pub fn current_tx_num(&self) -> u64 {
        self.tx_num.load(Ordering::Acquire)
    }

    /// Txnums recorded for `key` in the live DB tail.
    pub fn txnums_in_db(&self, key: &[u8], tx: &dyn KvRead) -> Vec<u64> {
        tx.get_dups(self.index_table, key)
            .iter()
            .filter_map(|v| parse_tx_num(v))
            .collect()
    }

    pub(crate) fn bound_tx(&self) -> Result<RwTx> {
        self.tx
            .lock()
            .clone()
            .ok_or_else(|| eyre!("{}: no transaction bound", self.filename_base))
    }

    /// Shards visible to readers: maximal non-overlapping cover, ascending.
    pub fn cover(&self) -> Vec<Arc<FilesItem>> {
        select_cover(&self.files.read())
    }

    /// Frozen shards starting below `upto_tx_num`, ascending; the locality
    /// build input.
    pub fn frozen_cover_upto(&self, upto_tx_num: u64) -> Vec<Arc<FilesItem>> {
        self.cover()
            .into_iter()
            .filter(|item| item.frozen && item.start_tx_num < upto_tx_num)
            .collect()
    }

    /// Appends one datum at the current writer position.
    pub fn add(&self, key: &[u8]) -> Result<()> {
        let tx_num = self.tx_num.load(Ordering::Acquire);
        let mut writes = self.writes.lock();
        if !writes.started {
            return Err(eyre!("{}: writes not started", self.filename_base));
        }
        if writes.discard {
            return Ok(());
        }
        writes
            .entries
            .push((self.index_keys_table, tx_num_key(tx_num).to_vec(), key.to_vec()));
        writes
            .entries
            .push((self.index_table, key.to_vec(), tx_num_key(tx_num).to_vec()));
        Ok(())
    }

    /// Collates the DB range `[tx_from, tx_to)` into a per-key txnum map.
    pub fn collate(
        &self,
        cancel: &Cancel,
        tx_from: u64,
        tx_to: u64,
        tx: &dyn KvRead,
        ticker: &mut LogTicker,
    ) -> Result<InvertedCollation> {
        let mut coll = InvertedCollation::default();
        let mut visited = 0u64;
        tx.scan(
            self.index_keys_table,
            &tx_num_key(tx_from),
            Some(&tx_num_key(tx_to)),
            &mut |k, v| {
                cancel.check()?;
                let tx_num = parse_tx_num(k)
                    .ok_or_else(|| eyre!("{}: malformed txnum key", self.filename_base))?;
                coll.idx
                    .entry(v.to_vec())
                    .or_insert_with(RoaringTreemap::new)
                    .insert(tx_num);
                visited += 1;
                if ticker.tick() {
                    debug!(
                        name = %self.filename_base,
                        tx_num,
                        visited,
                        "collate progress"
                    );
                }
                Ok(true)
            },
        )
        .wrap_err_with(|| format!("collate {}", self.filename_base))?;
        Ok(coll)
    }

    /// Writes one `.ef`/`.efi` shard for `step` from a collation.
    pub fn build_files(
        &self,
        cancel: &Cancel,
        step: u64,
        coll: InvertedCollation,
    ) -> Result<InvertedFiles> {
        let item = self
            .write_shard(cancel, step, step + 1, coll.idx.iter())
            .wrap_err_with(|| format!("buildFiles {}", self.filename_base))?;
        Ok(InvertedFiles { item })
    }

    fn write_shard<'a>(
        &self,
        cancel: &Cancel,
        start_step: u64,
        end_step: u64,
        entries: impl Iterator<Item = (&'a Vec<u8>, &'a RoaringTreemap)>,
    ) -> Result<Arc<FilesItem>> {
        let data_path = self
            .dir
            .join(file_name(&self.filename_base, start_step, end_step, "ef"));
        let index_path = self
            .dir
            .join(file_name(&self.filename_base, start_step, end_step, "efi"));
        let result = (|| -> Result<Arc<FilesItem>> {
            let mut writer = SegmentWriter::create(&data_path, false)?;
            for (key, bitmap) in entries {
                cancel.check()?;
                let mut value = Vec::with_capacity(bitmap.serialized_size());
                bitmap.serialize_into(&mut value)?;
                writer.append(key, &value)?;
            }
            let index_entries = writer.finish()?;
            write_index(&index_path, &index_entries)?;
            let item = FilesItem::open(
                &self.dir,
                &self.filename_base,
                FileKind::InvertedData,
                start_step,
                end_step,
                self.aggregation_step,
                self.steps_in_biggest_file,
                false,
            )?;
            Ok(Arc::new(item))
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&data_path);
            let _ = std::fs::remove_file(&index_path);
        }
        result
    }

    /// Makes a freshly built shard visible to new readers.
    pub fn integrate_files(&self, sf: InvertedFiles, tx_from: u64, tx_to: u64) {
        debug_assert_eq!(sf.item.start_tx_num, tx_from);
        debug_assert_eq!(sf.item.end_tx_num, tx_to);
        self.files.write().insert((tx_from, tx_to), sf.item);
    }

    /// Largest mergeable contiguous run ending at or before `max_end_tx_num`
    /// whose merged span does not exceed `max_span`.
    pub fn find_merge_range(&self, max_end_tx_num: u64, max_span: u64) -> Option<(u64, u64)> {
        let mut found: Option<(u64, u64)> = None;
        for item in self.cover() {
            if item.end_tx_num > max_end_tx_num {
                continue;
            }
            let end_step = item.end_tx_num / self.aggregation_step;
            // Rightmost set bit of the end step bounds the largest aligned
            // merge that can end there.
            let span_step = end_step & end_step.wrapping_neg();
            let span = (span_step * self.aggregation_step).min(max_span);
            let start = item.end_tx_num - span;
            if start < item.start_tx_num {
                match found {
                    Some((s, _)) if start >= s => {}
                    _ => found = Some((start, item.end_tx_num)),
                }
            }
        }
        found
    }

    /// Concrete shards fully inside `[start_tx_num, end_tx_num)`.
    pub fn static_files_in_range(&self, start_tx_num: u64, end_tx_num: u64) -> Vec<Arc<FilesItem>> {
        self.cover()
            .into_iter()
            .filter(|item| item.start_tx_num >= start_tx_num && item.end_tx_num <= end_tx_num)
            .collect()
    }

    /// Merges a contiguous run of shards into one spanning the union
    /// interval, unioning each key's txnum bitmap.
    pub fn merge_files(
        &self,
        cancel: &Cancel,
        items: &[Arc<FilesItem>],
        start_tx_num: u64,
        end_tx_num: u64,
    ) -> Result<Arc<FilesItem>> {
        let mut merged: BTreeMap<Vec<u8>, RoaringTreemap> = BTreeMap::new();
        for item in items {
            let mut stream = item.data().stream()?;
            while let Some((key, value)) = stream.next_entry()? {
                cancel.check()?;
                let bitmap = RoaringTreemap::deserialize_from(&value[..])?;
                *merged.entry(key).or_insert_with(RoaringTreemap::new) |= bitmap;
            }
        }
        let start_step = start_tx_num / self.aggregation_step;
        let end_step = end_tx_num / self.aggregation_step;
        self.write_shard(cancel, start_step, end_step, merged.iter())
            .wrap_err_with(|| format!("merge {}", self.filename_base))
    }

    /// Swaps the merged inputs for the merged shard in one registry write.
    pub fn integrate_merged_files(&self, outs: &[Arc<FilesItem>], merged: Arc<FilesItem>) {
        let mut files = self.files.write();
        for out in outs {
            files.remove(&(out.start_tx_num, out.end_tx_num));
        }
        files.insert((merged.start_tx_num, merged.end_tx_num), merged);
    }

    /// Marks the superseded shards deletable; unlink happens when the last
    /// query context drops its reference.
    pub fn clean_after_freeze(&self, outs: &[Arc<FilesItem>]) {
        for out in outs {
            out.mark_deletable();
        }
    }

    /// Deletes DB rows with txnum in `[tx_from, tx_to)`, up to `limit`
    /// txnums.
    pub fn prune_range(
        &self,
        cancel: &Cancel,
        tx_from: u64,
        tx_to: u64,
        limit: u64,
        tx: &RwTx,
        ticker: &mut LogTicker,
    ) -> Result<()> {
        let rows = self.collect_prune_rows(tx, tx_from, tx_to, limit)?;
        for (tx_num, key) in rows {
            cancel.check()?;
            let t_key = tx_num_key(tx_num);
            tx.delete_dup(self.index_table, &key, &t_key);
            tx.delete_dup(self.index_keys_table, &t_key, &key);
            if ticker.tick() {
                debug!(name = %self.filename_base, tx_num, "prune progress");
            }
        }
        Ok(())
    }

    pub(crate) fn collect_prune_rows(
        &self,
        tx: &dyn KvRead,
        tx_from: u64,
        tx_to: u64,
        limit: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>> {
        let mut rows: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut tx_nums_seen = 0u64;
        let mut last_tx_num: Option<u64> = None;
        tx.scan(
            self.index_keys_table,
            &tx_num_key(tx_from),
            Some(&tx_num_key(tx_to)),
            &mut |k, v| {
                let tx_num = parse_tx_num(k)
                    .ok_or_else(|| eyre!("{}: malformed txnum key", self.filename_base))?;
                if last_tx_num != Some(tx_num) {
                    if tx_nums_seen >= limit {
                        return Ok(false);
                    }
                    tx_nums_seen += 1;
                    last_tx_num = Some(tx_num);
                }
                rows.push((tx_num, v.to_vec()));
                Ok(true)
            },
        )?;
        Ok(rows)
    }

    /// Best-effort page pre-fault: touch the rows in `[tx_from, tx_from +
    /// limit)` so a following prune works against warm pages.
    pub fn warmup_range(
        &self,
        cancel: &Cancel,
        tx_from: u64,
        limit: u64,
        tx: &dyn KvRead,
    ) -> Result<()> {
        let mut touched = 0u64;
        tx.scan(
            self.index_keys_table,
            &tx_num_key(tx_from),
            Some(&tx_num_key(tx_from.saturating_add(limit))),
            &mut |_, v| {
                cancel.check()?;
                let _ = tx.get(self.index_table, v);
                touched += 1;
                Ok(true)
            },
        )?;
        debug!(name = %self.filename_base, touched, "warmup");
        Ok(())
    }

    /// Rebuilds any `.efi` whose data segment exists without it.
    pub fn build_missed_indices_inner(&self, cancel: &Cancel) -> Result<()> {
        for (start_step, end_step) in
            scan_dir(&self.dir, &self.filename_base, FileKind::InvertedData)?
        {
            cancel.check()?;
            let index_path =
                self.dir
                    .join(file_name(&self.filename_base, start_step, end_step, "efi"));
            if index_path.exists() {
                continue;
            }
            let data_path = self
                .dir
                .join(file_name(&self.filename_base, start_step, end_step, "ef"));
            rebuild_index(&data_path, &index_path, false)?;
            debug!(name = %self.filename_base, start_step, end_step, "rebuilt missing index");
        }
        self.reopen_folder()
    }

    /// Builds the locality index when frozen shards outgrew it.
    pub fn build_optional_missed_indices(&self, cancel: &Cancel) -> Result<()> {
        self.locality.build_missed(cancel, self)
    }

    fn reopen_folder_inner(&self) -> Result<()> {
        let mut next = FileSet::new();
        for (start_step, end_step) in
            scan_dir(&self.dir, &self.filename_base, FileKind::InvertedData)?
        {
            match FilesItem::open(
                &self.dir,
                &self.filename_base,
                FileKind::InvertedData,
                start_step,
                end_step,
                self.aggregation_step,
                self.steps_in_biggest_file,
                false,
            ) {
                Ok(item) => {
                    next.insert((item.start_tx_num, item.end_tx_num), Arc::new(item));
                }
                Err(err) => {
                    warn!(
                        name = %self.filename_base,
                        start_step,
                        end_step,
                        error = %err,
                        "file ignored by snapshot scan"
                    );
                }
            }
        }
        *self.files.write() = next;
        self.locality.reopen_folder()?;
        Ok(())
    }
}

/// Rebuilds an index file by streaming its data segment.
pub(crate) fn rebuild_index(data_path: &Path, index_path: &Path, compressed: bool) -> Result<()> {
    let reader = super::segment::SegmentReader::open(data_path, compressed)?;
    let mut stream = reader.stream()?;
    let mut entries = Vec::new();
    while let Some((offset, key, _)) = stream.next_entry_at()? {
        entries.push((key, offset));
    }
    write_index(index_path, &entries)
}

impl Domain for InvertedIndex {
    fn name(&self) -> &str {
        &self.filename_base
    }

    fn set_tx(&self, tx: &RwTx) {
        *self.tx.lock() = Some(tx.clone());
    }

    fn set_tx_num(&self, tx_num: u64) {
        self.tx_num.store(tx_num, Ordering::Release);
    }

    fn start_writes(&self) {
        let mut writes = self.writes.lock();
        writes.started = true;
        writes.discard = false;
    }

    fn finish_writes(&self) {
        let mut writes = self.writes.lock();
        writes.started = false;
        writes.entries.clear();
    }

    fn discard_history(&self) {
        let mut writes = self.writes.lock();
        writes.started = true;
        writes.discard = true;
    }

    fn rotate(&self) -> Flusher {
        let mut writes = self.writes.lock();
        Flusher {
            entries: std::mem::take(&mut writes.entries),
        }
    }

    fn prune(
        &self,
        cancel: &Cancel,
        tx_from: u64,
        tx_to: u64,
        limit: u64,
        ticker: &mut LogTicker,
    ) -> Result<()> {
        let tx = self.bound_tx()?;
        self.prune_range(cancel, tx_from, tx_to, limit, &tx, ticker)
            .wrap_err_with(|| format!("prune {}", self.filename_base))
    }

    fn warmup(&self, cancel: &Cancel, tx_from: u64, limit: u64, tx: &dyn KvRead) -> Result<()> {
        self.warmup_range(cancel, tx_from, limit, tx)
    }

    fn reopen_folder(&self) -> Result<()> {
        self.reopen_folder_inner()
            .wrap_err_with(|| format!("ReopenFolder: {}", self.filename_base))
    }

    fn close(&self) {
        self.files.write().clear();
        self.locality.close();
    }

    fn end_tx_num_minimax(&self) -> u64 {
        end_tx_num_minimax(&self.files.read())
    }

    fn files(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .cover()
            .iter()
            .map(|item| {
                file_name(
                    &self.filename_base,
                    item.start_tx_num / self.aggregation_step,
                    item.end_tx_num / self.aggregation_step,
                    "ef",
                )
            })
            .collect();
        out.extend(self.locality.files());
        out
    }

    fn set_compress_workers(&self, n: usize) {
        self.compress_workers.store(n.max(1), Ordering::Release);
    }

    fn set_read_ahead(&self, mode: ReadAhead) {
        self.read_ahead.store(mode as u8, Ordering::Release);
    }

    fn build_missed_indices(&self, cancel: &Cancel) -> Result<()> {
        self.build_missed_indices_inner(cancel)
            .wrap_err_with(|| format!("BuildMissedIndices: {}", self.filename_base))
    }

    fn cleanup_dir(&self) {
        self.locality.cleanup_dir();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Db;
    use crate::tasks::cancel_pair;
    use std::time::Duration;

    fn temp_dirs() -> (PathBuf, PathBuf) {
        let base = crate::test_utils::temp_dir("invidx");
        let tmp = base.join("tmp");
        std::fs::create_dir_all(&tmp).expect("create dirs");
        (base, tmp)
    }

    fn ticker() -> LogTicker {
        LogTicker::new(Duration::from_secs(30))
    }

    fn new_ii(dir: &Path, tmp: &Path) -> InvertedIndex {
        InvertedIndex::new(
            dir,
            tmp,
            4,
            2,
            "logaddrs",
            Table::LogAddressKeys,
            Table::LogAddressIdx,
        )
        .expect("new ii")
    }

    #[test]
    fn add_requires_started_writes() {
        let (dir, tmp) = temp_dirs();
        let ii = new_ii(&dir, &tmp);
        assert!(ii.add(b"k").is_err());
        ii.start_writes();
        ii.set_tx_num(3);
        ii.add(b"k").expect("add");
        let flusher = ii.rotate();
        let db = Db::new();
        let tx = db.begin_rw();
        flusher.flush(&tx).expect("flush");
        assert_eq!(tx.get_dups(Table::LogAddressIdx, b"k"), vec![tx_num_key(3).to_vec()]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn discard_drops_writes() {
        let (dir, tmp) = temp_dirs();
        let ii = new_ii(&dir, &tmp);
        ii.discard_history();
        ii.set_tx_num(1);
        ii.add(b"k").expect("add");
        assert!(ii.rotate().entries.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn collate_build_integrate_and_find_merge() {
        let (dir, tmp) = temp_dirs();
        let ii = new_ii(&dir, &tmp);
        let (_handle, cancel) = cancel_pair();
        let db = Db::new();
        let tx = db.begin_rw();
        ii.start_writes();
        for t in 0..8u64 {
            ii.set_tx_num(t);
            ii.add(b"addr1").expect("add");
            if t % 2 == 0 {
                ii.add(b"addr2").expect("add");
            }
        }
        ii.rotate().flush(&tx).expect("flush");

        for step in 0..2u64 {
            let coll = ii
                .collate(&cancel, step * 4, (step + 1) * 4, &tx, &mut ticker())
                .expect("collate");
            assert_eq!(coll.keys(), 2);
            let sf = ii.build_files(&cancel, step, coll).expect("build");
            ii.integrate_files(sf, step * 4, (step + 1) * 4);
        }
        assert_eq!(ii.end_tx_num_minimax(), 8);

        let range = ii.find_merge_range(8, 8).expect("mergeable");
        assert_eq!(range, (0, 8));
        let outs = ii.static_files_in_range(0, 8);
        assert_eq!(outs.len(), 2);
        let merged = ii.merge_files(&cancel, &outs, 0, 8).expect("merge");
        assert!(merged.frozen);
        ii.integrate_merged_files(&outs, Arc::clone(&merged));
        ii.clean_after_freeze(&outs);
        assert!(outs.iter().all(|o| o.is_deletable()));
        assert!(ii.find_merge_range(8, 8).is_none());

        // merged bitmap is the union of the inputs
        let cover = ii.cover();
        assert_eq!(cover.len(), 1);
        let (_, off) = cover[0].index().lookup(b"addr1").expect("addr1");
        let (_, value) = cover[0].data().read_at(off).expect("read");
        let bm = RoaringTreemap::deserialize_from(&value[..]).expect("bitmap");
        assert_eq!(bm.len(), 8);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn prune_respects_limit_and_range() {
        let (dir, tmp) = temp_dirs();
        let ii = new_ii(&dir, &tmp);
        let (_handle, cancel) = cancel_pair();
        let db = Db::new();
        let tx = db.begin_rw();
        ii.start_writes();
        for t in 0..6u64 {
            ii.set_tx_num(t);
            ii.add(b"k").expect("add");
        }
        ii.rotate().flush(&tx).expect("flush");

        ii.prune_range(&cancel, 0, 6, 2, &tx, &mut ticker())
            .expect("prune");
        assert_eq!(tx.first_key(Table::LogAddressKeys), Some(tx_num_key(2).to_vec()));
        ii.prune_range(&cancel, 0, 6, u64::MAX, &tx, &mut ticker())
            .expect("prune");
        assert!(tx.first_key(Table::LogAddressKeys).is_none());
        assert!(tx.first_key(Table::LogAddressIdx).is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missed_index_rebuild() {
        let (dir, tmp) = temp_dirs();
        let ii = new_ii(&dir, &tmp);
        let (_handle, cancel) = cancel_pair();
        let db = Db::new();
        let tx = db.begin_rw();
        ii.start_writes();
        ii.set_tx_num(1);
        ii.add(b"k").expect("add");
        ii.rotate().flush(&tx).expect("flush");
        let coll = ii.collate(&cancel, 0, 4, &tx, &mut ticker()).expect("collate");
        let sf = ii.build_files(&cancel, 0, coll).expect("build");
        ii.integrate_files(sf, 0, 4);

        let index_path = dir.join(file_name("logaddrs", 0, 1, "efi"));
        ii.close();
        std::fs::remove_file(&index_path).expect("remove index");
        ii.build_missed_indices(&cancel).expect("rebuild");
        assert!(index_path.exists());
        assert_eq!(ii.end_tx_num_minimax(), 4);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
