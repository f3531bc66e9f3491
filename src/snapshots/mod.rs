//! Snapshot artifacts: immutable step-sharded files and their registries.

pub mod fixed_bitmaps;
pub mod history;
pub mod inverted_index;
pub mod locality;
pub mod segment;

use crate::kv::{KvRead, RwTx, Table};
use crate::tasks::{Cancel, LogTicker};
use eyre::{eyre, Result};
use segment::{IndexReader, SegmentReader};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Maximum merge fan-in: a frozen shard covers this many aggregation steps.
pub const STEPS_IN_BIGGEST_FILE: u64 = 64;

/// The locality bitmap spends one bit per frozen shard, packed in `u64`
/// words; this bounds how many frozen shards a locality file can cover.
pub const LOCALITY_INDEX_UINT64_LIMIT: u64 = 64;

/// Advisory read-ahead mode, propagated to every domain. The embedded
/// store has no pages to advise on; real backends map these to madvise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadAhead {
    Normal = 0,
    Disabled = 1,
    Enabled = 2,
    WillNeed = 3,
}

/// Buffered live-DB writes rotated out of a domain; drained into the host
/// transaction by `Aggregator::flush`.
pub struct Flusher {
    pub(crate) entries: Vec<(Table, Vec<u8>, Vec<u8>)>,
}

impl Flusher {
    pub fn flush(&self, tx: &RwTx) -> Result<()> {
        for (table, key, value) in &self.entries {
            tx.put(*table, key, value);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The uniform pipeline contract the orchestrator drives across all seven
/// domains. History domains additionally expose time-travel reads and
/// inverted-index domains range iteration; those stay on the concrete
/// types since the orchestrator uses them "specifically only for reads".
pub trait Domain {
    fn name(&self) -> &str;
    fn set_tx(&self, tx: &RwTx);
    fn set_tx_num(&self, tx_num: u64);
    fn start_writes(&self);
    fn finish_writes(&self);
    fn discard_history(&self);
    fn rotate(&self) -> Flusher;
    /// Deletes DB rows in `[tx_from, tx_to)` up to `limit` txnums, using
    /// the transaction bound by `set_tx`.
    fn prune(
        &self,
        cancel: &Cancel,
        tx_from: u64,
        tx_to: u64,
        limit: u64,
        ticker: &mut LogTicker,
    ) -> Result<()>;
    fn warmup(&self, cancel: &Cancel, tx_from: u64, limit: u64, tx: &dyn KvRead) -> Result<()>;
    fn reopen_folder(&self) -> Result<()>;
    fn close(&self);
    fn end_tx_num_minimax(&self) -> u64;
    fn files(&self) -> Vec<String>;
    fn set_compress_workers(&self, n: usize);
    fn set_read_ahead(&self, mode: ReadAhead);
    fn build_missed_indices(&self, cancel: &Cancel) -> Result<()>;
    fn cleanup_dir(&self);
}

/// Which file pair a shard carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Inverted-index shard: `.ef` data + `.efi` index.
    InvertedData,
    /// History shard: `.v` data + `.vi` index.
    HistoryData,
}

impl FileKind {
    pub fn data_ext(self) -> &'static str {
        match self {
            FileKind::InvertedData => "ef",
            FileKind::HistoryData => "v",
        }
    }

    pub fn index_ext(self) -> &'static str {
        match self {
            FileKind::InvertedData => "efi",
            FileKind::HistoryData => "vi",
        }
    }
}

pub fn file_name(base: &str, start_step: u64, end_step: u64, ext: &str) -> String {
    format!("{base}.{start_step}-{end_step}.{ext}")
}

/// Parses `<base>.<sstep>-<estep>.<ext>`; `None` when the shape does not
/// match at all (foreign files are silently ignored by scans).
pub fn parse_file_name(name: &str) -> Option<(&str, u64, u64, &str)> {
    let (rest, ext) = name.rsplit_once('.')?;
    let (base, steps) = rest.rsplit_once('.')?;
    let (start, end) = steps.split_once('-')?;
    let start_step = start.parse::<u64>().ok()?;
    let end_step = end.parse::<u64>().ok()?;
    Some((base, start_step, end_step, ext))
}

/// One immutable shard: a data segment plus its lookup index over a closed
/// txnum interval. Retirement is ownership-based: `can_delete` is a one-way
/// flag and the files are unlinked when the last `Arc` reference drops.
#[derive(Debug)]
pub struct FilesItem {
    pub start_tx_num: u64,
    pub end_tx_num: u64,
    pub frozen: bool,
    can_delete: AtomicBool,
    data: SegmentReader,
    index: IndexReader,
}

impl FilesItem {
    pub fn open(
        dir: &Path,
        base: &str,
        kind: FileKind,
        start_step: u64,
        end_step: u64,
        aggregation_step: u64,
        steps_in_biggest_file: u64,
        compressed: bool,
    ) -> Result<Self> {
        if start_step >= end_step {
            return Err(eyre!("shard {base}.{start_step}-{end_step}: empty interval"));
        }
        let data_path = dir.join(file_name(base, start_step, end_step, kind.data_ext()));
        let index_path = dir.join(file_name(base, start_step, end_step, kind.index_ext()));
        let data = SegmentReader::open(&data_path, compressed)?;
        let index = IndexReader::open(&index_path)?;
        Ok(Self {
            start_tx_num: start_step * aggregation_step,
            end_tx_num: end_step * aggregation_step,
            frozen: end_step - start_step == steps_in_biggest_file,
            can_delete: AtomicBool::new(false),
            data,
            index,
        })
    }

    pub fn data(&self) -> &SegmentReader {
        &self.data
    }

    pub fn index(&self) -> &IndexReader {
        &self.index
    }

    pub fn mark_deletable(&self) {
        self.can_delete.store(true, Ordering::Release);
    }

    pub fn is_deletable(&self) -> bool {
        self.can_delete.load(Ordering::Acquire)
    }

    pub fn data_path(&self) -> PathBuf {
        self.data.path().to_path_buf()
    }
}

impl Drop for FilesItem {
    fn drop(&mut self) {
        if self.is_deletable() {
            let _ = std::fs::remove_file(self.data.path());
            let _ = std::fs::remove_file(self.index.path());
        }
    }
}

/// Per-domain ordered shard registry, keyed `(start_tx_num, end_tx_num)`.
pub type FileSet = BTreeMap<(u64, u64), Arc<FilesItem>>;

/// The read cover: maximal non-overlapping intervals, ascending. Smaller
/// shards fully contained in a merged one are excluded.
pub fn select_cover(set: &FileSet) -> Vec<Arc<FilesItem>> {
    let mut items: Vec<&Arc<FilesItem>> = set.values().collect();
    items.sort_by(|a, b| {
        a.start_tx_num
            .cmp(&b.start_tx_num)
            .then(b.end_tx_num.cmp(&a.end_tx_num))
    });
    let mut cover = Vec::new();
    let mut max_end = 0u64;
    for item in items {
        if item.end_tx_num <= max_end || item.start_tx_num < max_end {
            continue;
        }
        max_end = item.end_tx_num;
        cover.push(Arc::clone(item));
    }
    cover
}

/// Highest integrated end txnum of a domain (0 when no shards).
pub fn end_tx_num_minimax(set: &FileSet) -> u64 {
    set.keys().map(|(_, end)| *end).max().unwrap_or(0)
}

/// Scans `dir` for `<base>.<s>-<e>.<data_ext>` shards. Malformed step
/// bounds are logged and skipped; unrelated files are ignored.
pub fn scan_dir(dir: &Path, base: &str, kind: FileKind) -> Result<Vec<(u64, u64)>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some((file_base, start_step, end_step, ext)) = parse_file_name(&name) else {
            continue;
        };
        if file_base != base || ext != kind.data_ext() {
            continue;
        }
        if start_step >= end_step {
            warn!(name = %name, "file ignored by snapshot scan, startStep >= endStep");
            continue;
        }
        found.push((start_step, end_step));
    }
    found.sort_unstable();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use segment::{write_index, SegmentWriter};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir() -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time moves forward")
            .as_nanos();
        let suffix = COUNTER.fetch_add(1, Ordering::SeqCst);
        let mut path = std::env::temp_dir();
        path.push(format!(
            "stratum-snapshots-test-{now}-{}-{suffix}",
            std::process::id()
        ));
        std::fs::create_dir_all(&path).expect("create temp dir");
        path
    }

    fn write_shard(dir: &Path, base: &str, kind: FileKind, s: u64, e: u64) {
        let data_path = dir.join(file_name(base, s, e, kind.data_ext()));
        let index_path = dir.join(file_name(base, s, e, kind.index_ext()));
        let mut writer = SegmentWriter::create(&data_path, false).expect("create");
        writer.append(b"k", b"v").expect("append");
        let entries = writer.finish().expect("finish");
        write_index(&index_path, &entries).expect("index");
    }

    #[test]
    fn parse_and_format_roundtrip() {
        let name = file_name("accounts", 0, 64, "ef");
        assert_eq!(name, "accounts.0-64.ef");
        assert_eq!(parse_file_name(&name), Some(("accounts", 0, 64, "ef")));
        assert_eq!(parse_file_name("garbage"), None);
        assert_eq!(parse_file_name("accounts.x-2.ef"), None);
    }

    #[test]
    fn cover_prefers_merged_shards() {
        let dir = temp_dir();
        for (s, e) in [(0, 1), (1, 2), (0, 2), (2, 3)] {
            write_shard(&dir, "accounts", FileKind::InvertedData, s, e);
        }
        let mut set = FileSet::new();
        for (s, e) in [(0u64, 1u64), (1, 2), (0, 2), (2, 3)] {
            let item = FilesItem::open(&dir, "accounts", FileKind::InvertedData, s, e, 4, 2, false)
                .expect("open");
            set.insert((item.start_tx_num, item.end_tx_num), Arc::new(item));
        }
        let cover = select_cover(&set);
        let intervals: Vec<_> = cover
            .iter()
            .map(|i| (i.start_tx_num, i.end_tx_num))
            .collect();
        assert_eq!(intervals, vec![(0, 8), (8, 12)]);
        assert_eq!(end_tx_num_minimax(&set), 12);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn deletable_items_unlink_on_last_drop() {
        let dir = temp_dir();
        write_shard(&dir, "accounts", FileKind::HistoryData, 0, 1);
        let item = Arc::new(
            FilesItem::open(&dir, "accounts", FileKind::HistoryData, 0, 1, 4, 2, false)
                .expect("open"),
        );
        let data_path = item.data_path();
        let holder = Arc::clone(&item);
        item.mark_deletable();
        drop(item);
        assert!(data_path.exists(), "still referenced");
        drop(holder);
        assert!(!data_path.exists(), "unlinked with last reference");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn scan_skips_malformed_names() {
        let dir = temp_dir();
        write_shard(&dir, "logaddrs", FileKind::InvertedData, 0, 1);
        write_shard(&dir, "logaddrs", FileKind::InvertedData, 1, 2);
        std::fs::write(dir.join("logaddrs.5-2.ef"), b"junk").expect("write");
        std::fs::write(dir.join("other.0-1.ef"), b"junk").expect("write");
        let found = scan_dir(&dir, "logaddrs", FileKind::InvertedData).expect("scan");
        assert_eq!(found, vec![(0, 1), (1, 2)]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
