//! Locality index: for a key, which frozen shards can possibly contain it.
//!
//! One live file pair per domain: `<base>.0-<e>.li` (key -> ordinal) and
//! `<base>.0-<e>.l` (per-ordinal fixed-size bitmap, bit *i* set iff the key
//! occurs in frozen shard *i*). Lookups return the first two candidate
//! shards so a reader can cover point-or-range queries and fall back to
//! the live DB when the second is absent.

use super::fixed_bitmaps::{FixedBitmaps, FixedBitmapsWriter};
use super::inverted_index::InvertedIndex;
use super::segment::{write_index, IndexReader, SegmentStream};
use super::{file_name, FilesItem, LOCALITY_INDEX_UINT64_LIMIT};
use crate::tasks::Cancel;
use eyre::{eyre, Result, WrapErr};
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// The open `.li`/`.l` pair. Replaced wholesale on rebuild; the old pair
/// is marked deletable and unlinked when its last reader drops.
#[derive(Debug)]
pub struct LocalityFiles {
    pub end_step: u64,
    pub end_tx_num: u64,
    index: IndexReader,
    bm: FixedBitmaps,
    can_delete: AtomicBool,
}

impl LocalityFiles {
    fn mark_deletable(&self) {
        self.can_delete.store(true, Ordering::Release);
    }

    /// Bitmap row for a key; `None` when the key occurs in no frozen shard
    /// this pair covers.
    pub fn ordinal(&self, key: &[u8]) -> Option<u64> {
        self.index.lookup(key).map(|(ordinal, _)| ordinal as u64)
    }

    /// Whether the key's row has frozen shard `file_no` set.
    pub fn contains(&self, ordinal: u64, file_no: u64) -> bool {
        self.bm.is_set(ordinal, file_no)
    }
}

impl Drop for LocalityFiles {
    fn drop(&mut self) {
        if self.can_delete.load(Ordering::Acquire) {
            let _ = std::fs::remove_file(self.index.path());
            let _ = std::fs::remove_file(self.bm.path());
        }
    }
}

pub struct LocalityIndex {
    dir: PathBuf,
    #[allow(dead_code)]
    tmpdir: PathBuf,
    filename_base: String,
    aggregation_step: u64,
    steps_in_biggest_file: u64,
    file: RwLock<Option<Arc<LocalityFiles>>>,
}

impl LocalityIndex {
    pub fn new(
        dir: &Path,
        tmpdir: &Path,
        aggregation_step: u64,
        steps_in_biggest_file: u64,
        filename_base: &str,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            tmpdir: tmpdir.to_path_buf(),
            filename_base: filename_base.to_string(),
            aggregation_step,
            steps_in_biggest_file,
            file: RwLock::new(None),
        }
    }

    fn max_end_step(&self) -> u64 {
        self.steps_in_biggest_file * LOCALITY_INDEX_UINT64_LIMIT
    }

    /// End steps of well-formed locality files in the directory, sorted.
    fn scan_state_files(&self) -> Result<Vec<u64>> {
        let mut found = Vec::new();
        if !self.dir.exists() {
            return Ok(found);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let Some((base, start_step, end_step, ext)) = super::parse_file_name(&name) else {
                continue;
            };
            if base != self.filename_base || ext != "li" {
                continue;
            }
            if start_step != 0 {
                warn!(name = %name, "locality index must always start from step 0");
                continue;
            }
            if end_step > self.max_end_step() {
                warn!(
                    name = %name,
                    limit = self.max_end_step(),
                    "locality index stores bitmaps as u64 words; end step over limit"
                );
                continue;
            }
            found.push(end_step);
        }
        found.sort_unstable();
        Ok(found)
    }

    pub fn reopen_folder(&self) -> Result<()> {
        let found = self
            .scan_state_files()
            .wrap_err_with(|| format!("LocalityIndex: {}", self.filename_base))?;
        let Some(&end_step) = found.last() else {
            *self.file.write() = None;
            return Ok(());
        };
        let files = self
            .open_files(end_step)
            .wrap_err_with(|| format!("LocalityIndex: {}", self.filename_base))?;
        *self.file.write() = Some(Arc::new(files));
        Ok(())
    }

    fn open_files(&self, end_step: u64) -> Result<LocalityFiles> {
        let li_path = self
            .dir
            .join(file_name(&self.filename_base, 0, end_step, "li"));
        let l_path = self
            .dir
            .join(file_name(&self.filename_base, 0, end_step, "l"));
        Ok(LocalityFiles {
            end_step,
            end_tx_num: end_step * self.aggregation_step,
            index: IndexReader::open(&li_path)?,
            bm: FixedBitmaps::open(&l_path)?,
            can_delete: AtomicBool::new(false),
        })
    }

    pub fn close(&self) {
        *self.file.write() = None;
    }

    /// Current live pair, shared with query contexts.
    pub fn current(&self) -> Option<Arc<LocalityFiles>> {
        self.file.read().clone()
    }

    pub fn files(&self) -> Vec<String> {
        match self.current() {
            Some(f) => vec![
                file_name(&self.filename_base, 0, f.end_step, "li"),
                file_name(&self.filename_base, 0, f.end_step, "l"),
            ],
            None => Vec::new(),
        }
    }

    /// For `key`, the start steps of the first two frozen shards at or
    /// after `from_tx_num` that can contain it, plus the highest indexed
    /// txnum. `ok2 == false` tells the reader to also consult newer shards
    /// and the live DB.
    pub fn lookup_idx_files(
        &self,
        key: &[u8],
        from_tx_num: u64,
    ) -> Result<(u64, u64, u64, bool, bool)> {
        let Some(f) = self.current() else {
            return Ok((0, 0, 0, false, false));
        };
        if from_tx_num >= f.end_tx_num {
            return Ok((0, 0, from_tx_num, false, false));
        }
        let from_file = from_tx_num / self.aggregation_step / self.steps_in_biggest_file;
        let Some((ordinal, _)) = f.index.lookup(key) else {
            return Ok((0, 0, f.end_tx_num, false, false));
        };
        let (fn1, fn2, ok1, ok2) = f
            .bm
            .first2_at(ordinal as u64, from_file)
            .wrap_err_with(|| format!("lookupIdxFiles {}", self.filename_base))?;
        Ok((
            fn1 * self.steps_in_biggest_file,
            fn2 * self.steps_in_biggest_file,
            f.end_tx_num,
            ok1,
            ok2,
        ))
    }

    /// Highest step covered by the companion's frozen shards, and whether
    /// a locality file for that range already exists.
    pub fn missed_idx_files(&self, ii: &InvertedIndex) -> (u64, bool) {
        let to_step = ii
            .cover()
            .iter()
            .rev()
            .find(|item| item.frozen)
            .map(|item| item.end_tx_num / self.aggregation_step)
            .unwrap_or(0);
        let exists = self
            .dir
            .join(file_name(&self.filename_base, 0, to_step, "li"))
            .exists();
        (to_step, exists)
    }

    /// Builds and swaps in the locality pair when the companion index has
    /// outgrown the current one.
    pub fn build_missed(&self, cancel: &Cancel, ii: &InvertedIndex) -> Result<()> {
        let (to_step, exists) = self.missed_idx_files(ii);
        if exists || to_step == 0 {
            return Ok(());
        }
        let files = self.build_files(cancel, ii, to_step)?;
        self.integrate_files(files);
        Ok(())
    }

    /// Two passes over the companion's frozen shards: count distinct keys,
    /// then emit key -> frozen-shard-set rows.
    pub fn build_files(
        &self,
        cancel: &Cancel,
        ii: &InvertedIndex,
        to_step: u64,
    ) -> Result<LocalityFiles> {
        if to_step > self.max_end_step() {
            return Err(eyre!(
                "LocalityIndex {}: end step {to_step} over limit {}",
                self.filename_base,
                self.max_end_step()
            ));
        }
        let upto_tx_num = to_step * self.aggregation_step;
        let frozen = ii.frozen_cover_upto(upto_tx_num);
        let files_amount = (to_step.div_ceil(self.steps_in_biggest_file)).max(1);

        let mut count = 0u64;
        let mut it = LocalityIterator::new(&frozen, self.aggregation_step, self.steps_in_biggest_file)?;
        while it.next_key()?.is_some() {
            cancel.check()?;
            count += 1;
        }

        let li_path = self
            .dir
            .join(file_name(&self.filename_base, 0, to_step, "li"));
        let l_path = self
            .dir
            .join(file_name(&self.filename_base, 0, to_step, "l"));
        let result = (|| -> Result<LocalityFiles> {
            let mut dense = FixedBitmapsWriter::new(&l_path, files_amount, count);
            let mut entries: Vec<(Vec<u8>, u64)> = Vec::with_capacity(count as usize);
            let mut it =
                LocalityIterator::new(&frozen, self.aggregation_step, self.steps_in_biggest_file)?;
            let mut i = 0u64;
            while let Some((key, in_files)) = it.next_key()? {
                cancel.check()?;
                dense.add_set(i, &in_files)?;
                entries.push((key, i));
                i += 1;
            }
            dense.build()?;
            write_index(&li_path, &entries)?;
            debug!(name = %self.filename_base, to_step, keys = count, "locality build");
            self.open_files(to_step)
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&li_path);
            let _ = std::fs::remove_file(&l_path);
        }
        result.wrap_err_with(|| format!("LocalityIndex build: {}", self.filename_base))
    }

    /// Atomic swap: the old pair is retired, the new one becomes live.
    pub fn integrate_files(&self, files: LocalityFiles) {
        let mut slot = self.file.write();
        if let Some(old) = slot.as_ref() {
            old.mark_deletable();
        }
        *slot = Some(Arc::new(files));
    }

    /// Removes every locality pair except the one with the largest end
    /// step.
    pub fn cleanup_dir(&self) {
        let found = match self.scan_state_files() {
            Ok(found) => found,
            Err(err) => {
                warn!(name = %self.filename_base, error = %err, "locality cleanup: can't read dir");
                return;
            }
        };
        let Some(&keep) = found.last() else { return };
        for end_step in found {
            if end_step == keep {
                continue;
            }
            for ext in ["li", "l"] {
                let path = self
                    .dir
                    .join(file_name(&self.filename_base, 0, end_step, ext));
                let removed = std::fs::remove_file(&path);
                debug!(file = %path.display(), ok = removed.is_ok(), "locality cleanup: remove");
            }
        }
    }
}

/// K-way heap merge over frozen shards, yielding each distinct key with
/// the set of frozen-shard numbers it occurs in, ascending by key.
struct LocalityIterator {
    streams: Vec<SegmentStream>,
    file_nos: Vec<u64>,
    heap: BinaryHeap<Reverse<(Vec<u8>, usize)>>,
}

impl LocalityIterator {
    fn new(frozen: &[Arc<FilesItem>], aggregation_step: u64, steps_in_biggest_file: u64) -> Result<Self> {
        let mut it = Self {
            streams: Vec::with_capacity(frozen.len()),
            file_nos: Vec::with_capacity(frozen.len()),
            heap: BinaryHeap::new(),
        };
        for item in frozen {
            let src = it.streams.len();
            it.streams.push(item.data().stream()?);
            it.file_nos
                .push(item.start_tx_num / aggregation_step / steps_in_biggest_file);
            it.advance(src)?;
        }
        Ok(it)
    }

    fn advance(&mut self, src: usize) -> Result<()> {
        if let Some((key, _)) = self.streams[src].next_entry()? {
            self.heap.push(Reverse((key, src)));
        }
        Ok(())
    }

    fn next_key(&mut self) -> Result<Option<(Vec<u8>, Vec<u64>)>> {
        let Some(Reverse((key, src))) = self.heap.pop() else {
            return Ok(None);
        };
        let mut in_files = vec![self.file_nos[src]];
        self.advance(src)?;
        while let Some(Reverse((next_key, _))) = self.heap.peek() {
            if next_key != &key {
                break;
            }
            let Reverse((_, next_src)) = self.heap.pop().expect("peeked entry");
            in_files.push(self.file_nos[next_src]);
            self.advance(next_src)?;
        }
        in_files.sort_unstable();
        in_files.dedup();
        Ok(Some((key, in_files)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{Db, Table};
    use crate::snapshots::Domain;
    use crate::tasks::{cancel_pair, LogTicker};
    use std::time::Duration;

    fn build_frozen_ii(dir: &Path, tmp: &Path) -> InvertedIndex {
        let ii = InvertedIndex::new(
            dir,
            tmp,
            4,
            2,
            "tracesto",
            Table::TracesToKeys,
            Table::TracesToIdx,
        )
        .expect("new ii");
        let (_handle, cancel) = cancel_pair();
        let db = Db::new();
        let tx = db.begin_rw();
        ii.start_writes();
        for t in 0..8u64 {
            ii.set_tx_num(t);
            ii.add(b"alpha").expect("add");
            if t >= 4 {
                ii.add(b"beta").expect("add");
            }
        }
        ii.rotate().flush(&tx).expect("flush");
        for step in 0..2u64 {
            let coll = ii
                .collate(&cancel, step * 4, (step + 1) * 4, &tx, &mut LogTicker::new(Duration::from_secs(30)))
                .expect("collate");
            let sf = ii.build_files(&cancel, step, coll).expect("build");
            ii.integrate_files(sf, step * 4, (step + 1) * 4);
        }
        let outs = ii.static_files_in_range(0, 8);
        let merged = ii.merge_files(&cancel, &outs, 0, 8).expect("merge");
        ii.integrate_merged_files(&outs, merged);
        ii.clean_after_freeze(&outs);
        ii
    }

    #[test]
    fn build_and_lookup() {
        let dir = crate::test_utils::temp_dir("locality");
        let tmp = dir.join("tmp");
        std::fs::create_dir_all(&tmp).expect("tmp");
        let ii = build_frozen_ii(&dir, &tmp);
        let (_handle, cancel) = cancel_pair();

        ii.locality().build_missed(&cancel, &ii).expect("build");
        let (s1, _, last_indexed, ok1, ok2) = ii
            .locality()
            .lookup_idx_files(b"alpha", 0)
            .expect("lookup");
        assert!(ok1);
        assert!(!ok2);
        assert_eq!(s1, 0);
        assert_eq!(last_indexed, 8);

        let (_, _, _, ok1, _) = ii
            .locality()
            .lookup_idx_files(b"missing", 0)
            .expect("lookup");
        assert!(!ok1);

        // from beyond the indexed range: nothing, lastIndexed echoes from
        let (_, _, last, ok1, _) = ii
            .locality()
            .lookup_idx_files(b"alpha", 100)
            .expect("lookup");
        assert!(!ok1);
        assert_eq!(last, 100);

        // idempotent: the file for this range already exists
        ii.locality().build_missed(&cancel, &ii).expect("noop");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_end_step_over_limit() {
        let dir = crate::test_utils::temp_dir("locality-limit");
        let tmp = dir.join("tmp");
        std::fs::create_dir_all(&tmp).expect("tmp");
        let ii = build_frozen_ii(&dir, &tmp);
        let (_handle, cancel) = cancel_pair();
        let limit = 2 * LOCALITY_INDEX_UINT64_LIMIT;
        let err = ii
            .locality()
            .build_files(&cancel, &ii, limit + 1)
            .expect_err("over limit");
        assert!(err.to_string().contains("over limit"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn scan_skips_nonzero_start_and_cleanup_keeps_largest() {
        let dir = crate::test_utils::temp_dir("locality-scan");
        let tmp = dir.join("tmp");
        std::fs::create_dir_all(&tmp).expect("tmp");
        let ii = build_frozen_ii(&dir, &tmp);
        let (_handle, cancel) = cancel_pair();
        ii.locality().build_missed(&cancel, &ii).expect("build");

        // a stale smaller pair plus a malformed non-zero-start name
        std::fs::write(dir.join("tracesto.1-2.li"), b"junk").expect("write");
        let old_li = dir.join("tracesto.0-1.li");
        let old_l = dir.join("tracesto.0-1.l");
        std::fs::write(&old_li, b"junk").expect("write");
        std::fs::write(&old_l, b"junk").expect("write");

        ii.locality().cleanup_dir();
        assert!(!old_li.exists());
        assert!(!old_l.exists());
        assert!(dir.join("tracesto.0-2.li").exists());

        // reopen still lands on the surviving largest pair
        ii.locality().reopen_folder().expect("reopen");
        let (_, _, last, ok1, _) = ii
            .locality()
            .lookup_idx_files(b"alpha", 0)
            .expect("lookup");
        assert!(ok1);
        assert_eq!(last, 8);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
