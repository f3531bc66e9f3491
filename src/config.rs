//! Aggregator configuration knobs.

use crate::snapshots::STEPS_IN_BIGGEST_FILE;
use eyre::{eyre, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Snapshot directory (flat; all domains share it).
    pub dir: PathBuf,
    /// Spill directory for ETL runs.
    pub tmpdir: PathBuf,
    /// Txnums per step; the finest shard size. Immutable per run.
    pub aggregation_step: u64,
    /// Max merge fan-in, in steps. The compile-time default suits
    /// production; tests shrink it to keep fixtures small.
    pub steps_in_biggest_file: u64,
    /// Recent txnum window that must stay in the live DB. Zero is fine
    /// when replaying from snapshots, where no re-org can happen.
    pub keep_in_db: u64,
    /// Per-domain compression worker count.
    pub compress_workers: usize,
    pub log_prefix: String,
}

impl AggregatorConfig {
    pub fn new(dir: &Path, tmpdir: &Path, aggregation_step: u64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            tmpdir: tmpdir.to_path_buf(),
            aggregation_step,
            steps_in_biggest_file: STEPS_IN_BIGGEST_FILE,
            keep_in_db: 2 * aggregation_step,
            compress_workers: 1,
            log_prefix: "snapshots".to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.aggregation_step == 0 {
            return Err(eyre!("aggregation_step must be positive"));
        }
        if self.steps_in_biggest_file < 2 {
            return Err(eyre!("steps_in_biggest_file must be at least 2"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_aggregation_step() {
        let cfg = AggregatorConfig::new(Path::new("/tmp/snap"), Path::new("/tmp/etl"), 16);
        assert_eq!(cfg.keep_in_db, 32);
        assert_eq!(cfg.steps_in_biggest_file, STEPS_IN_BIGGEST_FILE);
        cfg.validate().expect("valid");
    }

    #[test]
    fn rejects_degenerate_shapes() {
        let mut cfg = AggregatorConfig::new(Path::new("/tmp/snap"), Path::new("/tmp/etl"), 0);
        assert!(cfg.validate().is_err());
        cfg.aggregation_step = 4;
        cfg.steps_in_biggest_file = 1;
        assert!(cfg.validate().is_err());
    }
}
