//! Extract-transform-load collector: accumulate `(key, value)` pairs in
//! memory, spill sorted runs to the tmpdir past a cap, and stream the
//! union back in key order. Run files use the same crc framing as every
//! other variable-length record in this crate.

use crc32fast::Hasher;
use eyre::{Result, WrapErr};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const DEFAULT_BUFFER_CAP: usize = 16 * 1024 * 1024;

/// How the collector treats repeated keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Keep every entry; duplicates replay in collection order.
    Sortable,
    /// First value collected for a key wins; later ones are dropped.
    OldestEntry,
}

pub struct Collector {
    log_prefix: String,
    tmpdir: PathBuf,
    kind: BufferKind,
    buffer: BTreeMap<Vec<u8>, Vec<Vec<u8>>>,
    buffer_bytes: usize,
    buffer_cap: usize,
    runs: Vec<PathBuf>,
}

impl Collector {
    pub fn new(log_prefix: &str, tmpdir: &Path, kind: BufferKind) -> Self {
        Self {
            log_prefix: log_prefix.to_string(),
            tmpdir: tmpdir.to_path_buf(),
            kind,
            buffer: BTreeMap::new(),
            buffer_bytes: 0,
            buffer_cap: DEFAULT_BUFFER_CAP,
            runs: Vec::new(),
        }
    }

    #[cfg(test)]
    fn with_buffer_cap(mut self, cap: usize) -> Self {
        self.buffer_cap = cap;
        self
    }

    pub fn collect(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        match self.kind {
            BufferKind::Sortable => {
                self.buffer_bytes += key.len() + value.len();
                self.buffer
                    .entry(key.to_vec())
                    .or_default()
                    .push(value.to_vec());
            }
            BufferKind::OldestEntry => {
                // A key already spilled to an earlier run also wins at merge
                // time (earlier sources take precedence), so dropping here is
                // only an in-memory dedup.
                if !self.buffer.contains_key(key) {
                    self.buffer_bytes += key.len() + value.len();
                    self.buffer.insert(key.to_vec(), vec![value.to_vec()]);
                }
            }
        }
        if self.buffer_bytes >= self.buffer_cap {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        fs::create_dir_all(&self.tmpdir).wrap_err("failed to create etl tmpdir")?;
        let path = self.tmpdir.join(format!(
            "{}-etl-{}-{}.tmp",
            self.log_prefix,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .wrap_err("failed to create etl run file")?;
        let mut out = BufWriter::new(file);
        for (key, values) in std::mem::take(&mut self.buffer) {
            for value in values {
                write_record(&mut out, &key, &value)?;
            }
        }
        out.flush()?;
        self.buffer_bytes = 0;
        self.runs.push(path);
        Ok(())
    }

    /// Streams every collected pair to `f` in ascending key order and
    /// consumes the collector. For [`BufferKind::OldestEntry`] exactly one
    /// pair per key is emitted.
    pub fn load(mut self, mut f: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        // Sources are ranked by age: spilled runs first (in spill order),
        // then the live buffer. OldestEntry dedup picks the lowest rank.
        let mut sources: Vec<RunSource> = Vec::with_capacity(self.runs.len() + 1);
        for path in &self.runs {
            sources.push(RunSource::open(path)?);
        }
        sources.push(RunSource::from_buffer(std::mem::take(&mut self.buffer)));

        let mut heap: BinaryHeap<Reverse<HeapEntry>> = BinaryHeap::new();
        for (rank, source) in sources.iter_mut().enumerate() {
            if let Some((key, value)) = source.next()? {
                heap.push(Reverse(HeapEntry { key, rank, value }));
            }
        }

        let mut last_key: Option<Vec<u8>> = None;
        while let Some(Reverse(entry)) = heap.pop() {
            let emit = match self.kind {
                BufferKind::Sortable => true,
                BufferKind::OldestEntry => last_key.as_deref() != Some(entry.key.as_slice()),
            };
            if emit {
                f(&entry.key, &entry.value)?;
            }
            last_key = Some(entry.key);
            if let Some((key, value)) = sources[entry.rank].next()? {
                heap.push(Reverse(HeapEntry {
                    key,
                    rank: entry.rank,
                    value,
                }));
            }
        }
        Ok(())
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        for path in &self.runs {
            let _ = fs::remove_file(path);
        }
    }
}

#[derive(PartialEq, Eq)]
struct HeapEntry {
    key: Vec<u8>,
    rank: usize,
    value: Vec<u8>,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key
            .cmp(&other.key)
            .then(self.rank.cmp(&other.rank))
            .then_with(|| self.value.cmp(&other.value))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

enum RunSource {
    File(BufReader<File>),
    Buffer(std::vec::IntoIter<(Vec<u8>, Vec<u8>)>),
}

impl RunSource {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).wrap_err("failed to open etl run file")?;
        Ok(Self::File(BufReader::new(file)))
    }

    fn from_buffer(buffer: BTreeMap<Vec<u8>, Vec<Vec<u8>>>) -> Self {
        let flat: Vec<(Vec<u8>, Vec<u8>)> = buffer
            .into_iter()
            .flat_map(|(k, vs)| vs.into_iter().map(move |v| (k.clone(), v)))
            .collect();
        Self::Buffer(flat.into_iter())
    }

    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self {
            Self::File(reader) => read_record(reader),
            Self::Buffer(iter) => Ok(iter.next()),
        }
    }
}

fn write_record(out: &mut impl Write, key: &[u8], value: &[u8]) -> Result<()> {
    let klen = (key.len() as u32).to_le_bytes();
    let vlen = (value.len() as u32).to_le_bytes();
    let mut hasher = Hasher::new();
    hasher.update(&klen);
    hasher.update(key);
    hasher.update(&vlen);
    hasher.update(value);
    let crc = hasher.finalize();

    out.write_all(&klen)?;
    out.write_all(key)?;
    out.write_all(&vlen)?;
    out.write_all(value)?;
    out.write_all(&crc.to_le_bytes())?;
    Ok(())
}

fn read_record(reader: &mut impl Read) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let klen = u32::from_le_bytes(len_buf) as usize;
    let mut key = vec![0u8; klen];
    reader.read_exact(&mut key)?;
    let mut vlen_buf = [0u8; 4];
    reader.read_exact(&mut vlen_buf)?;
    let vlen = u32::from_le_bytes(vlen_buf) as usize;
    let mut value = vec![0u8; vlen];
    reader.read_exact(&mut value)?;
    let mut crc_buf = [0u8; 4];
    reader.read_exact(&mut crc_buf)?;
    let crc_expected = u32::from_le_bytes(crc_buf);

    let mut hasher = Hasher::new();
    hasher.update(&len_buf);
    hasher.update(&key);
    hasher.update(&vlen_buf);
    hasher.update(&value);
    if hasher.finalize() != crc_expected {
        return Err(eyre::eyre!("etl run record crc mismatch"));
    }
    Ok(Some((key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
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
            "stratum-etl-test-{now}-{}-{suffix}",
            std::process::id()
        ));
        path
    }

    #[test]
    fn sortable_load_is_key_ordered() {
        let dir = temp_dir();
        let mut collector = Collector::new("test", &dir, BufferKind::Sortable);
        collector.collect(b"b", b"2").expect("collect");
        collector.collect(b"a", b"1").expect("collect");
        collector.collect(b"c", b"3").expect("collect");

        let mut out = Vec::new();
        collector
            .load(|k, v| {
                out.push((k.to_vec(), v.to_vec()));
                Ok(())
            })
            .expect("load");
        assert_eq!(
            out,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn oldest_entry_first_value_wins_across_spills() {
        let dir = temp_dir();
        let mut collector =
            Collector::new("test", &dir, BufferKind::OldestEntry).with_buffer_cap(8);
        collector.collect(b"k", b"first").expect("collect");
        // cap of 8 bytes forces a spill before the second value arrives
        collector.collect(b"zz", b"fill").expect("collect");
        collector.collect(b"k", b"second").expect("collect");

        let mut got = Vec::new();
        collector
            .load(|k, v| {
                got.push((k.to_vec(), v.to_vec()));
                Ok(())
            })
            .expect("load");
        assert_eq!(
            got,
            vec![
                (b"k".to_vec(), b"first".to_vec()),
                (b"zz".to_vec(), b"fill".to_vec()),
            ]
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn spilled_runs_merge_with_live_buffer() {
        let dir = temp_dir();
        let mut collector = Collector::new("test", &dir, BufferKind::Sortable).with_buffer_cap(4);
        for (k, v) in [(b"d", b"4"), (b"a", b"1"), (b"c", b"3"), (b"b", b"2")] {
            collector.collect(&k[..], &v[..]).expect("collect");
        }
        let mut keys = Vec::new();
        collector
            .load(|k, _| {
                keys.push(k.to_vec());
                Ok(())
            })
            .expect("load");
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        let _ = fs::remove_dir_all(&dir);
    }
}
