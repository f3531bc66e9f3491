//! The aggregator orchestrator: seven domain handles driven in lock-step
//! through collate -> build -> integrate -> merge -> prune.

mod context;
mod steps;

pub use context::{AggregatorContext, HistoryChangesIter, InvertedIterator, StateAsOfIter};
pub use steps::AggregatorStep;

use crate::config::AggregatorConfig;
use crate::etl::{BufferKind, Collector};
use crate::kv::{parse_tx_num, Db, KvRead, RwTx, Table};
use crate::snapshots::history::{History, HistoryFiles};
use crate::snapshots::inverted_index::{InvertedFiles, InvertedIndex};
use crate::snapshots::{Domain, FilesItem, ReadAhead};
use crate::tasks::{cancel_pair, is_cancelled, BackgroundResult, Cancel, CancelHandle, LogTicker, WorkGuard};
use eyre::{eyre, Result, WrapErr};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Reserved; real counters may hang off this later.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilesStats {}

pub(crate) struct AggregatorInner {
    pub(crate) dir: PathBuf,
    pub(crate) tmpdir: PathBuf,
    pub(crate) aggregation_step: u64,
    pub(crate) steps_in_biggest_file: u64,
    keep_in_db: AtomicU64,
    log_prefix: Mutex<String>,
    db: Db,
    pub(crate) accounts: History,
    pub(crate) storage: History,
    pub(crate) code: History,
    pub(crate) log_addrs: InvertedIndex,
    pub(crate) log_topics: InvertedIndex,
    pub(crate) traces_from: InvertedIndex,
    pub(crate) traces_to: InvertedIndex,
    background_result: Mutex<BackgroundResult>,
    rw_tx: Mutex<Option<RwTx>>,
    tx_num: AtomicU64,
    max_tx_num: AtomicU64,
    open_close_lock: Mutex<()>,
    working: AtomicBool,
    working_merge: AtomicBool,
    working_optional_indices: AtomicBool,
    warmup_working: AtomicBool,
    cancel: Cancel,
    cancel_handle: CancelHandle,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

/// Historical state aggregation engine. Cheap to clone; all clones drive
/// the same engine.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<AggregatorInner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DomainSlot {
    Accounts,
    Storage,
    Code,
    LogAddrs,
    LogTopics,
    TracesFrom,
    TracesTo,
}

const HISTORY_SLOTS: [DomainSlot; 3] = [DomainSlot::Accounts, DomainSlot::Storage, DomainSlot::Code];
const INDEX_SLOTS: [DomainSlot; 4] = [
    DomainSlot::LogAddrs,
    DomainSlot::LogTopics,
    DomainSlot::TracesFrom,
    DomainSlot::TracesTo,
];

impl AggregatorInner {
    fn histories(&self) -> [&History; 3] {
        [&self.accounts, &self.storage, &self.code]
    }

    fn indexes(&self) -> [&InvertedIndex; 4] {
        [
            &self.log_addrs,
            &self.log_topics,
            &self.traces_from,
            &self.traces_to,
        ]
    }

    fn domains(&self) -> [&dyn Domain; 7] {
        [
            &self.accounts,
            &self.storage,
            &self.code,
            &self.log_addrs,
            &self.log_topics,
            &self.traces_from,
            &self.traces_to,
        ]
    }

    fn history(&self, slot: DomainSlot) -> &History {
        match slot {
            DomainSlot::Accounts => &self.accounts,
            DomainSlot::Storage => &self.storage,
            DomainSlot::Code => &self.code,
            _ => unreachable!("not a history slot"),
        }
    }

    fn index(&self, slot: DomainSlot) -> &InvertedIndex {
        match slot {
            DomainSlot::LogAddrs => &self.log_addrs,
            DomainSlot::LogTopics => &self.log_topics,
            DomainSlot::TracesFrom => &self.traces_from,
            DomainSlot::TracesTo => &self.traces_to,
            _ => unreachable!("not an index slot"),
        }
    }

    fn recalc_max_tx_num(&self) {
        let min = self
            .domains()
            .iter()
            .map(|d| d.end_tx_num_minimax())
            .min()
            .unwrap_or(0);
        self.max_tx_num.store(min, Ordering::Release);
    }

    fn log_prefix(&self) -> String {
        self.log_prefix.lock().clone()
    }

    fn bound_tx(&self) -> Result<RwTx> {
        self.rw_tx
            .lock()
            .clone()
            .ok_or_else(|| eyre!("aggregator: no transaction bound"))
    }

    fn prune_to(&self) -> u64 {
        self.max_tx_num
            .load(Ordering::Acquire)
            .saturating_sub(self.keep_in_db.load(Ordering::Acquire))
    }
}

impl Aggregator {
    pub fn new(cfg: AggregatorConfig, db: Db) -> Result<Self> {
        cfg.validate()?;
        let (cancel_handle, cancel) = cancel_pair();
        let (step, biggest) = (cfg.aggregation_step, cfg.steps_in_biggest_file);
        let accounts = History::new(
            &cfg.dir,
            &cfg.tmpdir,
            step,
            biggest,
            "accounts",
            Table::AccountHistoryKeys,
            Table::AccountIdx,
            Table::AccountHistoryVals,
            Table::AccountSettings,
            false,
        )
        .wrap_err("ReopenFolder")?;
        let storage = History::new(
            &cfg.dir,
            &cfg.tmpdir,
            step,
            biggest,
            "storage",
            Table::StorageHistoryKeys,
            Table::StorageIdx,
            Table::StorageHistoryVals,
            Table::StorageSettings,
            false,
        )
        .wrap_err("ReopenFolder")?;
        let code = History::new(
            &cfg.dir,
            &cfg.tmpdir,
            step,
            biggest,
            "code",
            Table::CodeHistoryKeys,
            Table::CodeIdx,
            Table::CodeHistoryVals,
            Table::CodeSettings,
            true,
        )
        .wrap_err("ReopenFolder")?;
        let log_addrs = InvertedIndex::new(
            &cfg.dir,
            &cfg.tmpdir,
            step,
            biggest,
            "logaddrs",
            Table::LogAddressKeys,
            Table::LogAddressIdx,
        )
        .wrap_err("ReopenFolder")?;
        let log_topics = InvertedIndex::new(
            &cfg.dir,
            &cfg.tmpdir,
            step,
            biggest,
            "logtopics",
            Table::LogTopicsKeys,
            Table::LogTopicsIdx,
        )
        .wrap_err("ReopenFolder")?;
        let traces_from = InvertedIndex::new(
            &cfg.dir,
            &cfg.tmpdir,
            step,
            biggest,
            "tracesfrom",
            Table::TracesFromKeys,
            Table::TracesFromIdx,
        )
        .wrap_err("ReopenFolder")?;
        let traces_to = InvertedIndex::new(
            &cfg.dir,
            &cfg.tmpdir,
            step,
            biggest,
            "tracesto",
            Table::TracesToKeys,
            Table::TracesToIdx,
        )
        .wrap_err("ReopenFolder")?;

        let inner = Arc::new(AggregatorInner {
            dir: cfg.dir,
            tmpdir: cfg.tmpdir,
            aggregation_step: step,
            steps_in_biggest_file: biggest,
            keep_in_db: AtomicU64::new(cfg.keep_in_db),
            log_prefix: Mutex::new(cfg.log_prefix),
            db,
            accounts,
            storage,
            code,
            log_addrs,
            log_topics,
            traces_from,
            traces_to,
            background_result: Mutex::new(BackgroundResult::default()),
            rw_tx: Mutex::new(None),
            tx_num: AtomicU64::new(0),
            max_tx_num: AtomicU64::new(0),
            open_close_lock: Mutex::new(()),
            working: AtomicBool::new(false),
            working_merge: AtomicBool::new(false),
            working_optional_indices: AtomicBool::new(false),
            warmup_working: AtomicBool::new(false),
            cancel,
            cancel_handle,
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        });
        for d in inner.domains() {
            d.set_compress_workers(cfg.compress_workers);
        }
        inner.recalc_max_tx_num();
        Ok(Self { inner })
    }

    /// Rescans the snapshot directory on every domain.
    pub fn reopen_folder(&self) -> Result<()> {
        let _guard = self.inner.open_close_lock.lock();
        for d in self.inner.domains() {
            d.reopen_folder().wrap_err("ReopenFolder")?;
        }
        self.inner.recalc_max_tx_num();
        Ok(())
    }

    /// Cancels background work, waits for it, and releases every file
    /// handle. Safe to call twice.
    pub async fn close(&self) {
        self.inner.cancel_handle.cancel();
        // Drain without holding the lock: a finishing task may re-lock it
        // to spawn a follow-up, which lands in the next round.
        loop {
            let mut round = std::mem::take(&mut *self.inner.tasks.lock().await);
            if round.is_empty() {
                break;
            }
            while round.join_next().await.is_some() {}
        }

        let _guard = self.inner.open_close_lock.lock();
        for d in self.inner.domains() {
            d.close();
        }
    }

    /// Admin: remove files superseded by merges or locality rebuilds.
    pub fn cleanup_dir(&self) {
        for d in self.inner.domains() {
            d.cleanup_dir();
        }
    }

    pub fn set_workers(&self, n: usize) {
        for d in self.inner.domains() {
            d.set_compress_workers(n);
        }
    }

    pub fn set_log_prefix(&self, prefix: &str) {
        *self.inner.log_prefix.lock() = prefix.to_string();
    }

    /// `keep_in_db` override; zero when re-executing from snapshots where
    /// no re-org can happen.
    pub fn set_keep_in_db(&self, v: u64) {
        self.inner.keep_in_db.store(v, Ordering::Release);
    }

    pub fn files(&self) -> Vec<String> {
        let _guard = self.inner.open_close_lock.lock();
        let mut out = Vec::new();
        for d in self.inner.domains() {
            out.extend(d.files());
        }
        out
    }

    pub fn stats(&self) -> FilesStats {
        FilesStats::default()
    }

    pub fn background_result(&self) -> (bool, Option<String>) {
        self.inner.background_result.lock().get_and_reset()
    }

    // --- writer pipeline ---

    pub fn set_tx(&self, tx: &RwTx) {
        *self.inner.rw_tx.lock() = Some(tx.clone());
        for d in self.inner.domains() {
            d.set_tx(tx);
        }
    }

    pub fn set_tx_num(&self, tx_num: u64) {
        self.inner.tx_num.store(tx_num, Ordering::Release);
        for d in self.inner.domains() {
            d.set_tx_num(tx_num);
        }
    }

    pub fn tx_num(&self) -> u64 {
        self.inner.tx_num.load(Ordering::Acquire)
    }

    pub fn start_writes(&self) {
        for d in self.inner.domains() {
            d.start_writes();
        }
    }

    pub fn finish_writes(&self) {
        for d in self.inner.domains() {
            d.finish_writes();
        }
    }

    /// Bulk-load mode: subsequent writes are accepted and dropped.
    pub fn discard_history(&self) {
        for d in self.inner.domains() {
            d.discard_history();
        }
    }

    pub fn add_account_prev(&self, addr: &[u8], prev: &[u8]) -> Result<()> {
        self.inner.accounts.add_prev_value(addr, None, prev)
    }

    pub fn add_storage_prev(&self, addr: &[u8], loc: &[u8], prev: &[u8]) -> Result<()> {
        self.inner.storage.add_prev_value(addr, Some(loc), prev)
    }

    pub fn add_code_prev(&self, addr: &[u8], prev: &[u8]) -> Result<()> {
        self.inner.code.add_prev_value(addr, None, prev)
    }

    pub fn add_trace_from(&self, addr: &[u8]) -> Result<()> {
        self.inner.traces_from.add(addr)
    }

    pub fn add_trace_to(&self, addr: &[u8]) -> Result<()> {
        self.inner.traces_to.add(addr)
    }

    pub fn add_log_addr(&self, addr: &[u8]) -> Result<()> {
        self.inner.log_addrs.add(addr)
    }

    pub fn add_log_topic(&self, topic: &[u8]) -> Result<()> {
        self.inner.log_topics.add(topic)
    }

    /// Rotates every domain's write buffer and drains them into `tx`.
    pub fn flush(&self, cancel: &Cancel, tx: &RwTx) -> Result<()> {
        let started = Instant::now();
        let flushers: Vec<_> = self.inner.domains().iter().map(|d| d.rotate()).collect();
        for flusher in &flushers {
            cancel.check()?;
            flusher.flush(tx)?;
        }
        debug!(prefix = %self.inner.log_prefix(), took = ?started.elapsed(), "history flush");
        Ok(())
    }

    // --- progress ---

    pub fn end_tx_num_minimax(&self) -> u64 {
        self.inner.max_tx_num.load(Ordering::Acquire)
    }

    pub fn end_tx_num_frozen_and_indexed(&self) -> u64 {
        self.inner
            .histories()
            .iter()
            .map(|h| h.end_frozen_and_indexed())
            .min()
            .unwrap_or(0)
    }

    /// One human log line of overall progress. DB cursor failures
    /// propagate instead of tearing the process down.
    pub fn log_stats(&self, tx: &dyn KvRead, tx2block: &dyn Fn(u64) -> u64) -> Result<()> {
        let max_tx_num = self.end_tx_num_minimax();
        if max_tx_num == 0 {
            return Ok(());
        }
        let hist_block_progress = tx2block(max_tx_num);
        let step_to_block: Vec<String> = self
            .inner
            .accounts
            .ii()
            .cover()
            .iter()
            .map(|item| {
                format!(
                    "{}={}K",
                    item.end_tx_num / self.inner.aggregation_step,
                    tx2block(item.end_tx_num) / 1_000
                )
            })
            .collect();
        let first_history_idx_block_in_db = tx
            .first_key(self.inner.accounts.ii().index_table())
            .and_then(|key| tx.get(self.inner.accounts.ii().index_table(), &key))
            .and_then(|v| parse_tx_num(&v))
            .map(|t| tx2block(t))
            .unwrap_or(0);
        let (rss_bytes, vm_bytes) = process_memory();
        info!(
            blocks = format!("{}k", (hist_block_progress + 1) / 1_000),
            txs = format!("{}m", max_tx_num / 1_000_000),
            tx_num2block_num = step_to_block.join(","),
            first_history_idx_in_db = first_history_idx_block_in_db,
            alloc = byte_count(rss_bytes),
            sys = byte_count(vm_bytes),
            "history stat"
        );
        Ok(())
    }

    // --- build ---

    /// Builds snapshot files for every complete step still sitting in the
    /// DB, then kicks the merge loop in the background. Idempotent;
    /// concurrent calls are a silent no-op via the working guard.
    pub async fn build_files(&self, cancel: &Cancel, db: &Db) -> Result<()> {
        let inner = &self.inner;
        let step_size = inner.aggregation_step;
        // Leave one step plus the safety margin in the DB.
        if inner.tx_num.load(Ordering::Acquire) + 1
            <= inner.max_tx_num.load(Ordering::Acquire)
                + step_size
                + inner.keep_in_db.load(Ordering::Acquire)
        {
            return Ok(());
        }
        let Some(_guard) = WorkGuard::acquire(&inner.working) else {
            return Ok(());
        };

        // As many small step files as possible: small merges stay cheap and
        // old DB rows become prunable early. New data may commit while we
        // build, so the DB high-water mark is re-read each pass. The writer
        // position joins the bound: a complete step need not carry a row at
        // its very last txnum.
        let high_water = || {
            last_id_in_db(db, inner.accounts.ii().index_keys_table())
                .max(inner.tx_num.load(Ordering::Acquire))
        };
        let mut step = inner.max_tx_num.load(Ordering::Acquire) / step_size;
        while step < (high_water() + 1) / step_size {
            if let Err(err) = self.build_files_in_background(cancel, step, db) {
                if is_cancelled(&err) || inner.cancel.is_cancelled() {
                    return Ok(());
                }
                warn!(error = %err, "buildFilesInBackground");
                break;
            }
            step += 1;
        }

        if inner
            .working_merge
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let bg = self.clone();
            inner.tasks.lock().await.spawn(async move {
                let cancel = bg.inner.cancel.clone();
                let result = bg.merge_loop(&cancel, 1).await;
                if let Err(err) = &result {
                    if !is_cancelled(err) {
                        warn!(error = %err, "merge");
                    }
                }
                bg.inner
                    .background_result
                    .lock()
                    .set(result.err().map(|e| e.to_string()));
                bg.inner.working_merge.store(false, Ordering::Release);
                bg.build_optional_missed_indices_in_background(1).await;
            });
        }
        Ok(())
    }

    /// One step: collate and build all seven domains against a read view,
    /// then integrate atomically and recompute the minimax.
    fn build_files_in_background(&self, cancel: &Cancel, step: u64, db: &Db) -> Result<()> {
        let inner = &self.inner;
        let started = Instant::now();
        info!(prefix = %inner.log_prefix(), step = format!("{}-{}", step, step + 1), "history build");
        let tx_from = step * inner.aggregation_step;
        let tx_to = (step + 1) * inner.aggregation_step;

        let sf = self.build_step_files(cancel, step, tx_from, tx_to, db)?;
        self.integrate_files(sf, tx_from, tx_to);
        info!(prefix = %inner.log_prefix(), step, took = ?started.elapsed(), "snapshot build");
        Ok(())
    }

    /// Domains run sequentially; each one's collation is private, so this
    /// loop body is the seam a parallel version would fan out.
    fn build_step_files(
        &self,
        cancel: &Cancel,
        step: u64,
        tx_from: u64,
        tx_to: u64,
        db: &Db,
    ) -> Result<AggStaticFiles> {
        let inner = &self.inner;
        let mut ticker = LogTicker::new(Duration::from_secs(60));
        let mut sf = AggStaticFiles::default();
        let result = (|| -> Result<()> {
            for slot in HISTORY_SLOTS {
                let h = inner.history(slot);
                let coll =
                    db.view(|tx| h.collate(cancel, tx_from, tx_to, tx, &mut ticker))?;
                sf.histories.push((slot, h.build_files(cancel, step, coll)?));
            }
            for slot in INDEX_SLOTS {
                let ii = inner.index(slot);
                let coll =
                    db.view(|tx| ii.collate(cancel, tx_from, tx_to, tx, &mut ticker))?;
                sf.indexes.push((slot, ii.build_files(cancel, step, coll)?));
            }
            Ok(())
        })();
        match result {
            Ok(()) => Ok(sf),
            Err(err) => {
                sf.discard();
                Err(err)
            }
        }
    }

    fn integrate_files(&self, sf: AggStaticFiles, tx_from: u64, tx_to: u64) {
        let inner = &self.inner;
        for (slot, files) in sf.histories {
            inner.history(slot).integrate_files(files, tx_from, tx_to);
        }
        for (slot, files) in sf.indexes {
            inner.index(slot).integrate_files(files, tx_from, tx_to);
        }
        inner.recalc_max_tx_num();
    }

    // --- merge ---

    /// Repeats merge steps until no domain has a mergeable range left.
    pub async fn merge_loop(&self, cancel: &Cancel, workers: usize) -> Result<()> {
        loop {
            if !self.merge_loop_step(cancel, workers).await? {
                return Ok(());
            }
        }
    }

    async fn merge_loop_step(&self, cancel: &Cancel, workers: usize) -> Result<bool> {
        let inner = &self.inner;
        let max_span = inner.aggregation_step * inner.steps_in_biggest_file;
        let max_end = inner.max_tx_num.load(Ordering::Acquire);

        let mut plans = Vec::new();
        for slot in HISTORY_SLOTS {
            let h = inner.history(slot);
            if let Some((start, end)) = h.find_merge_range(max_end, max_span) {
                let (idx_outs, hist_outs) = h.static_files_in_range(start, end);
                plans.push(MergePlan {
                    slot,
                    start,
                    end,
                    idx_outs,
                    hist_outs,
                });
            }
        }
        for slot in INDEX_SLOTS {
            let ii = inner.index(slot);
            if let Some((start, end)) = ii.find_merge_range(max_end, max_span) {
                plans.push(MergePlan {
                    slot,
                    start,
                    end,
                    idx_outs: ii.static_files_in_range(start, end),
                    hist_outs: Vec::new(),
                });
            }
        }
        if plans.is_empty() {
            return Ok(false);
        }

        // Hold a context for the duration so every input shard stays alive
        // in transaction style.
        let _ctx = self.make_context();

        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut join_set: JoinSet<Result<(usize, MergedUnit)>> = JoinSet::new();
        for (plan_id, plan) in plans.iter().enumerate() {
            let permit = semaphore.clone().acquire_owned().await?;
            let inner = Arc::clone(&self.inner);
            let cancel = cancel.clone();
            let slot = plan.slot;
            let (start, end) = (plan.start, plan.end);
            let idx_outs = plan.idx_outs.clone();
            let hist_outs = plan.hist_outs.clone();
            join_set.spawn(async move {
                let _permit = permit;
                tokio::task::spawn_blocking(move || {
                    let unit = match slot {
                        DomainSlot::Accounts | DomainSlot::Storage | DomainSlot::Code => {
                            let (idx, hist) = inner.history(slot).merge_files(
                                &cancel, &idx_outs, &hist_outs, start, end,
                            )?;
                            MergedUnit::History { idx, hist }
                        }
                        _ => MergedUnit::Index(
                            inner.index(slot).merge_files(&cancel, &idx_outs, start, end)?,
                        ),
                    };
                    Ok((plan_id, unit))
                })
                .await
                .map_err(|err| eyre!("merge task panicked: {err}"))?
            });
        }

        let mut merged: Vec<Option<MergedUnit>> = (0..plans.len()).map(|_| None).collect();
        let mut first_err: Option<eyre::Report> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined.map_err(|err| eyre!("merge task join: {err}"))? {
                Ok((plan_id, unit)) => merged[plan_id] = Some(unit),
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_err {
            // Fresh files never became visible; drop them from disk.
            for unit in merged.into_iter().flatten() {
                unit.discard();
            }
            return Err(err);
        }

        for (plan, unit) in plans.iter().zip(merged) {
            let unit = unit.ok_or_else(|| eyre!("merge result missing"))?;
            match unit {
                MergedUnit::History { idx, hist } => {
                    let h = inner.history(plan.slot);
                    h.integrate_merged_files(&plan.idx_outs, &plan.hist_outs, idx, hist);
                    h.clean_after_freeze(&plan.idx_outs, &plan.hist_outs);
                }
                MergedUnit::Index(item) => {
                    let ii = inner.index(plan.slot);
                    ii.integrate_merged_files(&plan.idx_outs, item);
                    ii.clean_after_freeze(&plan.idx_outs);
                }
            }
        }
        Ok(true)
    }

    // --- missed indices ---

    /// Rebuilds missing `.efi`/`.vi` files on every domain, capped by the
    /// caller's semaphore so CPU can be shared across subsystems.
    pub async fn build_missed_indices(
        &self,
        cancel: &Cancel,
        semaphore: Arc<Semaphore>,
    ) -> Result<()> {
        let mut join_set: JoinSet<Result<()>> = JoinSet::new();
        for slot in HISTORY_SLOTS.iter().chain(INDEX_SLOTS.iter()).copied() {
            let permit = semaphore.clone().acquire_owned().await?;
            let inner = Arc::clone(&self.inner);
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let _permit = permit;
                tokio::task::spawn_blocking(move || match slot {
                    DomainSlot::Accounts | DomainSlot::Storage | DomainSlot::Code => {
                        inner.history(slot).build_missed_indices(&cancel)
                    }
                    _ => inner.index(slot).build_missed_indices(&cancel),
                })
                .await
                .map_err(|err| eyre!("index task panicked: {err}"))?
            });
        }
        let mut first_err = None;
        while let Some(joined) = join_set.join_next().await {
            if let Err(err) = joined.map_err(|err| eyre!("index task join: {err}"))? {
                first_err.get_or_insert(err);
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }
        self.inner.recalc_max_tx_num();
        self.build_optional_missed_indices(cancel, 4).await
    }

    /// Builds locality indexes for the three history domains.
    pub async fn build_optional_missed_indices(
        &self,
        cancel: &Cancel,
        workers: usize,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut join_set: JoinSet<Result<()>> = JoinSet::new();
        for slot in HISTORY_SLOTS {
            let permit = semaphore.clone().acquire_owned().await?;
            let inner = Arc::clone(&self.inner);
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let _permit = permit;
                tokio::task::spawn_blocking(move || {
                    inner.history(slot).ii().build_optional_missed_indices(&cancel)
                })
                .await
                .map_err(|err| eyre!("locality task panicked: {err}"))?
            });
        }
        while let Some(joined) = join_set.join_next().await {
            joined.map_err(|err| eyre!("locality task join: {err}"))??;
        }
        Ok(())
    }

    pub async fn build_optional_missed_indices_in_background(&self, workers: usize) {
        if self
            .inner
            .working_optional_indices
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let bg = self.clone();
        self.inner.tasks.lock().await.spawn(async move {
            let cancel = bg.inner.cancel.clone();
            if let Err(err) = bg.build_optional_missed_indices(&cancel, workers).await {
                if !is_cancelled(&err) {
                    warn!(error = %err, "optional indices");
                }
            }
            bg.inner
                .working_optional_indices
                .store(false, Ordering::Release);
        });
    }

    // --- prune / unwind / warmup ---

    /// Earliest txnum still in the index-keys tables that prune would
    /// touch; `u64::MAX` when nothing is prunable.
    pub fn can_prune_from(&self, tx: &dyn KvRead) -> u64 {
        let fst = tx
            .first_key(Table::TracesToKeys)
            .and_then(|k| parse_tx_num(&k));
        let fst2 = tx
            .first_key(Table::StorageHistoryKeys)
            .and_then(|k| parse_tx_num(&k));
        match (fst, fst2) {
            (Some(a), Some(b)) => a.min(b),
            _ => u64::MAX,
        }
    }

    pub fn can_prune(&self, tx: &dyn KvRead) -> bool {
        self.can_prune_from(tx) < self.inner.prune_to()
    }

    /// Prunes snapshotted DB rows outside the keep-in-db window, up to
    /// `limit` txnums per domain.
    pub fn prune(&self, cancel: &Cancel, limit: u64) -> Result<()> {
        self.prune_range(cancel, 0, self.inner.prune_to(), limit)
    }

    fn prune_range(&self, cancel: &Cancel, tx_from: u64, tx_to: u64, limit: u64) -> Result<()> {
        let mut ticker = LogTicker::new(Duration::from_secs(30));
        for d in self.inner.domains() {
            d.prune(cancel, tx_from, tx_to, limit, &mut ticker)?;
        }
        Ok(())
    }

    /// Repeats small prunes until the quota is gone or the deadline hits.
    pub fn prune_with_timeout(&self, cancel: &Cancel, timeout: Duration) -> Result<()> {
        let tx = self.inner.bound_tx()?;
        let started = Instant::now();
        while self.can_prune(&tx) && started.elapsed() < timeout {
            cancel.check()?;
            self.prune(cancel, 1_000)?;
        }
        Ok(())
    }

    /// Rolls history back to `tx_unwind_to`: reverse state is collected
    /// from the history domains and handed to `load_fn` (typically writes
    /// into the plain state table; empty value means delete), then the
    /// index domains drop their tail rows.
    pub fn unwind(
        &self,
        cancel: &Cancel,
        tx_unwind_to: u64,
        load_fn: &mut dyn FnMut(&RwTx, &[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        let inner = &self.inner;
        let tx = inner.bound_tx()?;
        let mut state_changes = Collector::new(
            &inner.log_prefix(),
            &inner.tmpdir,
            BufferKind::OldestEntry,
        );
        for h in inner.histories() {
            h.prune_f(cancel, tx_unwind_to, u64::MAX, &tx, &mut |_, key, value| {
                state_changes.collect(key, value)
            })?;
        }
        state_changes.load(|key, value| load_fn(&tx, key, value))?;

        let mut ticker = LogTicker::new(Duration::from_secs(30));
        for ii in inner.indexes() {
            Domain::prune(ii, cancel, tx_unwind_to, u64::MAX, u64::MAX, &mut ticker)?;
        }
        Ok(())
    }

    /// Best-effort page pre-fault of `[tx_from, tx_from + limit)`.
    /// Advisory: the writer may advance `tx_num` concurrently.
    pub async fn warmup(&self, tx_from: u64, limit: u64) {
        if limit < 10_000 {
            return;
        }
        if self
            .inner
            .warmup_working
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let bg = self.clone();
        self.inner.tasks.lock().await.spawn(async move {
            let inner = &bg.inner;
            let cancel = inner.cancel.clone();
            let result = inner.db.view(|tx| {
                for d in inner.domains() {
                    d.warmup(&cancel, tx_from, limit, tx)?;
                }
                Ok(())
            });
            if let Err(err) = result {
                if !is_cancelled(&err) {
                    warn!(error = %err, "prune warmup");
                }
            }
            inner.warmup_working.store(false, Ordering::Release);
        });
    }

    // --- read-ahead advisories ---

    pub fn disable_read_ahead(&self) {
        for d in self.inner.domains() {
            d.set_read_ahead(ReadAhead::Disabled);
        }
    }

    pub fn enable_read_ahead(&self) -> &Self {
        for d in self.inner.domains() {
            d.set_read_ahead(ReadAhead::Enabled);
        }
        self
    }

    pub fn enable_madv_willneed(&self) -> &Self {
        for d in self.inner.domains() {
            d.set_read_ahead(ReadAhead::WillNeed);
        }
        self
    }

    pub fn enable_madv_normal(&self) -> &Self {
        for d in self.inner.domains() {
            d.set_read_ahead(ReadAhead::Normal);
        }
        self
    }

    pub(crate) fn inner(&self) -> &Arc<AggregatorInner> {
        &self.inner
    }
}

struct MergePlan {
    slot: DomainSlot,
    start: u64,
    end: u64,
    idx_outs: Vec<Arc<FilesItem>>,
    hist_outs: Vec<Arc<FilesItem>>,
}

enum MergedUnit {
    History {
        idx: Arc<FilesItem>,
        hist: Arc<FilesItem>,
    },
    Index(Arc<FilesItem>),
}

impl MergedUnit {
    fn discard(self) {
        match self {
            MergedUnit::History { idx, hist } => {
                idx.mark_deletable();
                hist.mark_deletable();
            }
            MergedUnit::Index(item) => item.mark_deletable(),
        }
    }
}

#[derive(Default)]
struct AggStaticFiles {
    histories: Vec<(DomainSlot, HistoryFiles)>,
    indexes: Vec<(DomainSlot, InvertedFiles)>,
}

impl AggStaticFiles {
    fn discard(self) {
        for (_, files) in self.histories {
            files.discard();
        }
        for (_, files) in self.indexes {
            files.discard();
        }
    }
}

fn last_id_in_db(db: &Db, table: Table) -> u64 {
    db.view(|tx| Ok(tx.last_key(table).and_then(|k| parse_tx_num(&k)).unwrap_or(0)))
        .unwrap_or_else(|err| {
            warn!(error = %err, "lastIdInDB");
            0
        })
}

/// `(rss, vm)` of this process in bytes, best effort.
fn process_memory() -> (u64, u64) {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return (0, 0);
    };
    let mut fields = statm.split_whitespace();
    let vm_pages: u64 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let rss_pages: u64 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (rss_pages * 4096, vm_pages * 4096)
}

fn byte_count(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1}{}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::cancel_pair;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::path::PathBuf;

    // S = 4, B = 2: the biggest shard spans 8 txnums.
    fn setup(keep_in_db: u64) -> (Aggregator, Db, RwTx, Cancel, PathBuf) {
        let dir = crate::test_utils::temp_dir("aggregator");
        let tmp = dir.join("tmp");
        std::fs::create_dir_all(&tmp).expect("tmp");
        let mut cfg = AggregatorConfig::new(&dir.join("snapshots"), &tmp, 4);
        cfg.steps_in_biggest_file = 2;
        cfg.keep_in_db = keep_in_db;
        let db = Db::new();
        let agg = Aggregator::new(cfg, db.clone()).expect("new aggregator");
        // keep step builds deterministic: no background merge kicks in
        // unless a test runs merge_loop itself
        agg.inner.working_merge.store(true, Ordering::Release);
        let tx = db.begin_rw();
        agg.set_tx(&tx);
        agg.start_writes();
        let (_handle, cancel) = cancel_pair();
        (agg, db, tx, cancel, dir)
    }

    fn write_row(agg: &Aggregator, tx_num: u64, addr: &[u8], value: &[u8]) {
        agg.set_tx_num(tx_num);
        agg.add_account_prev(addr, value).expect("add account");
        agg.add_storage_prev(addr, b"slot", value).expect("add storage");
        agg.add_code_prev(addr, value).expect("add code");
        agg.add_log_addr(addr).expect("add log addr");
        agg.add_log_topic(b"topic").expect("add log topic");
        agg.add_trace_from(addr).expect("add trace from");
        agg.add_trace_to(addr).expect("add trace to");
    }

    fn commit_writes(agg: &Aggregator, cancel: &Cancel, tx: &RwTx) {
        agg.flush(cancel, tx).expect("flush");
        tx.commit();
    }

    fn account_intervals(agg: &Aggregator) -> Vec<(u64, u64)> {
        agg.inner
            .accounts
            .ii()
            .cover()
            .iter()
            .map(|item| (item.start_tx_num, item.end_tx_num))
            .collect()
    }

    #[tokio::test]
    async fn scenario_build_produces_one_shard_per_step() {
        let (agg, db, tx, cancel, dir) = setup(0);
        for t in 0..8u64 {
            write_row(&agg, t, b"A", &[t as u8]);
        }
        commit_writes(&agg, &cancel, &tx);

        agg.build_files(&cancel, &db).await.expect("build");
        assert_eq!(account_intervals(&agg), vec![(0, 4), (4, 8)]);
        assert_eq!(agg.end_tx_num_minimax(), 8);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn scenario_merge_replaces_shards_with_one_frozen() {
        let (agg, db, tx, cancel, dir) = setup(0);
        for t in 0..8u64 {
            write_row(&agg, t, b"A", &[t as u8]);
        }
        commit_writes(&agg, &cancel, &tx);
        agg.build_files(&cancel, &db).await.expect("build");

        let before = agg.inner.accounts.ii().cover();
        assert_eq!(before.len(), 2);
        agg.merge_loop(&cancel, 2).await.expect("merge");

        let cover = agg.inner.accounts.ii().cover();
        assert_eq!(cover.len(), 1);
        assert_eq!((cover[0].start_tx_num, cover[0].end_tx_num), (0, 8));
        assert!(cover[0].frozen);
        assert!(before.iter().all(|item| item.is_deletable()));
        assert_eq!(agg.end_tx_num_minimax(), 8);

        let manifest = agg.files();
        assert!(manifest.iter().any(|f| f == "accounts.0-2.ef"));
        assert!(manifest.iter().any(|f| f == "accounts.0-2.v"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn scenario_point_reads_follow_write_history() {
        let (agg, db, tx, cancel, dir) = setup(0);
        for t in 0..8u64 {
            agg.set_tx_num(t);
            if t == 2 {
                agg.add_account_prev(b"A", &[0x11]).expect("add");
            }
            if t == 6 {
                agg.add_account_prev(b"A", &[0x22]).expect("add");
            }
        }
        commit_writes(&agg, &cancel, &tx);
        agg.build_files(&cancel, &db).await.expect("build");

        let ctx = agg.make_context();
        assert!(ctx.read_account_data_no_state(b"A", 1).expect("read").is_none());
        assert_eq!(
            ctx.read_account_data_no_state(b"A", 3).expect("read"),
            Some(vec![0x11])
        );
        assert_eq!(
            ctx.read_account_data_no_state(b"A", 7).expect("read"),
            Some(vec![0x22])
        );
        ctx.close();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn scenario_locality_lookup_after_merge() {
        let (agg, db, tx, cancel, dir) = setup(0);
        for t in 0..8u64 {
            write_row(&agg, t, b"A", &[t as u8]);
        }
        commit_writes(&agg, &cancel, &tx);
        agg.build_files(&cancel, &db).await.expect("build");
        agg.merge_loop(&cancel, 1).await.expect("merge");
        agg.build_optional_missed_indices(&cancel, 2)
            .await
            .expect("locality");

        let (shard1, _, last_indexed, ok1, ok2) = agg
            .inner
            .accounts
            .ii()
            .locality()
            .lookup_idx_files(b"A", 0)
            .expect("lookup");
        assert!(ok1);
        assert!(!ok2);
        assert_eq!(shard1, 0);
        assert_eq!(last_indexed, 8);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn scenario_unwind_rolls_back_db_tail_not_shards() {
        let (agg, db, tx, cancel, dir) = setup(0);
        for t in 0..8u64 {
            agg.set_tx_num(t);
            if t == 2 {
                agg.add_account_prev(b"A", &[0x11]).expect("add");
            }
            if t == 6 {
                agg.add_account_prev(b"A", &[0x22]).expect("add");
            }
            agg.add_storage_prev(b"A", b"slot", &[t as u8]).expect("add");
            agg.add_trace_to(b"A").expect("add");
        }
        commit_writes(&agg, &cancel, &tx);
        agg.build_files(&cancel, &db).await.expect("build");
        agg.merge_loop(&cancel, 1).await.expect("merge");
        let cover_before = account_intervals(&agg);

        agg.unwind(&cancel, 4, &mut |tx, key, value| {
            if value.is_empty() {
                tx.delete(Table::PlainState, key);
            } else {
                tx.put(Table::PlainState, key, value);
            }
            Ok(())
        })
        .expect("unwind");

        // shards are immutable; only the DB tail was truncated
        assert_eq!(account_intervals(&agg), cover_before);
        assert_eq!(
            tx.last_key(Table::AccountHistoryKeys),
            Some(crate::kv::tx_num_key(2).to_vec())
        );
        assert!(tx.last_key(Table::TracesToKeys).map_or(true, |k| parse_tx_num(&k) < Some(4)));
        assert_eq!(tx.get(Table::PlainState, b"A"), Some(vec![0x11]));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn scenario_prune_until_quiescent_empties_snapshotted_tail() {
        let (agg, db, tx, cancel, dir) = setup(0);
        for t in 0..8u64 {
            write_row(&agg, t, b"A", &[t as u8]);
        }
        commit_writes(&agg, &cancel, &tx);
        agg.build_files(&cancel, &db).await.expect("build");

        let ctx = agg.make_context();
        let before = ctx
            .read_account_data_no_state_with_recent(b"A", 7, &tx)
            .expect("read");

        assert!(agg.can_prune(&tx));
        let mut rounds = 0;
        while agg.can_prune(&tx) {
            agg.prune(&cancel, 1_000).expect("prune");
            rounds += 1;
            assert!(rounds < 100, "prune must converge");
        }
        // everything below maxTxNum - keepInDB is gone, nothing else
        for table in [
            Table::AccountHistoryKeys,
            Table::StorageHistoryKeys,
            Table::CodeHistoryKeys,
            Table::LogAddressKeys,
            Table::LogTopicsKeys,
            Table::TracesFromKeys,
            Table::TracesToKeys,
        ] {
            assert!(tx.first_key(table).is_none(), "{table} not pruned");
        }
        let after = ctx
            .read_account_data_no_state_with_recent(b"A", 7, &tx)
            .expect("read");
        assert_eq!(before, after, "prune must be invisible to reads");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn bulk_random_keys_survive_build_and_prune() {
        let (agg, db, tx, cancel, dir) = setup(0);
        let mut rng = StdRng::seed_from_u64(42);
        let keys: Vec<[u8; 20]> = (0..64).map(|_| rng.gen()).collect();
        for t in 0..8u64 {
            agg.set_tx_num(t);
            // each key changes twice, at t = i % 4 and t = 4 + i % 4
            for (i, key) in keys.iter().enumerate() {
                if i as u64 % 4 == t % 4 {
                    agg.add_account_prev(key, &[t as u8, i as u8]).expect("add");
                }
            }
            agg.add_storage_prev(b"S", b"slot", &[t as u8]).expect("add");
            agg.add_trace_to(b"S").expect("add");
        }
        commit_writes(&agg, &cancel, &tx);
        agg.build_files(&cancel, &db).await.expect("build");
        assert_eq!(agg.end_tx_num_minimax(), 8);

        while agg.can_prune(&tx) {
            agg.prune(&cancel, 1_000).expect("prune");
        }

        let ctx = agg.make_context();
        for (i, key) in keys.iter().enumerate() {
            let latest = 4 + i as u64 % 4;
            assert_eq!(
                ctx.read_account_data_no_state_with_recent(key, 7, &tx)
                    .expect("read"),
                Some(vec![latest as u8, i as u8]),
                "key {i} reads its latest write from the snapshots"
            );
            assert_eq!(
                ctx.read_account_data_no_state(key, latest - 4)
                    .expect("read"),
                Some(vec![(latest - 4) as u8, i as u8]),
                "key {i} reads its first write as-of the early window"
            );
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn keep_in_db_window_survives_prune() {
        let (agg, db, tx, cancel, dir) = setup(4);
        for t in 0..12u64 {
            write_row(&agg, t, b"A", &[t as u8]);
        }
        commit_writes(&agg, &cancel, &tx);
        agg.build_files(&cancel, &db).await.expect("build");
        assert_eq!(agg.end_tx_num_minimax(), 12);

        while agg.can_prune(&tx) {
            agg.prune(&cancel, 1_000).expect("prune");
        }
        // prune_to = 12 - 4 = 8
        assert_eq!(
            tx.first_key(Table::AccountHistoryKeys),
            Some(crate::kv::tx_num_key(8).to_vec())
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn build_is_noop_below_threshold() {
        let (agg, db, tx, cancel, dir) = setup(8);
        for t in 0..8u64 {
            write_row(&agg, t, b"A", &[t as u8]);
        }
        commit_writes(&agg, &cancel, &tx);
        // txNum + 1 = 8 <= maxTxNum(0) + S(4) + keepInDB(8)
        agg.build_files(&cancel, &db).await.expect("build");
        assert!(account_intervals(&agg).is_empty());
        assert_eq!(agg.end_tx_num_minimax(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn build_skips_incomplete_steps() {
        let (agg, db, tx, cancel, dir) = setup(0);
        for t in 0..6u64 {
            write_row(&agg, t, b"A", &[t as u8]);
        }
        commit_writes(&agg, &cancel, &tx);
        agg.build_files(&cancel, &db).await.expect("build");
        // only [0,4) is complete in the DB; [4,8) is half-written
        assert_eq!(account_intervals(&agg), vec![(0, 4)]);
        assert_eq!(agg.end_tx_num_minimax(), 4);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn inverted_index_iterators_merge_files_and_db_tail() {
        let (agg, db, tx, cancel, dir) = setup(0);
        for t in 0..10u64 {
            agg.set_tx_num(t);
            if t % 2 == 0 {
                agg.add_log_addr(b"addr").expect("add");
            }
            write_row(&agg, t, b"F", &[t as u8]);
        }
        commit_writes(&agg, &cancel, &tx);
        agg.build_files(&cancel, &db).await.expect("build");

        let ctx = agg.make_context();
        let asc: Vec<u64> = ctx
            .log_addr_iterator(b"addr", 0, u64::MAX, true, usize::MAX, &tx)
            .expect("iter")
            .collect();
        assert_eq!(asc, vec![0, 2, 4, 6, 8]);
        let desc: Vec<u64> = ctx
            .log_addr_iterator(b"addr", 0, u64::MAX, false, 2, &tx)
            .expect("iter")
            .collect();
        assert_eq!(desc, vec![8, 6]);
        let windowed: Vec<u64> = ctx
            .log_addr_iterator(b"addr", 2, 7, true, usize::MAX, &tx)
            .expect("iter")
            .collect();
        assert_eq!(windowed, vec![2, 4, 6]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn changed_keys_and_as_of_walks() {
        let (agg, db, tx, cancel, dir) = setup(0);
        for (t, key, value) in [(1u64, &b"a"[..], &[1u8][..]), (2, b"b", &[2]), (6, b"a", &[3])] {
            agg.set_tx_num(t);
            agg.add_account_prev(key, value).expect("add");
        }
        agg.set_tx_num(9);
        commit_writes(&agg, &cancel, &tx);
        agg.build_files(&cancel, &db).await.expect("build");

        let ctx = agg.make_context();
        let changed: Vec<_> = ctx
            .account_history_iterate_changed(0, 4, true, usize::MAX, &tx)
            .expect("iter")
            .collect();
        assert_eq!(
            changed,
            vec![(b"a".to_vec(), vec![1]), (b"b".to_vec(), vec![2])]
        );

        let as_of: Vec<_> = ctx
            .account_historical_state_range(7, b"", None, usize::MAX, &tx)
            .expect("walk")
            .collect();
        assert_eq!(
            as_of,
            vec![(b"a".to_vec(), vec![3]), (b"b".to_vec(), vec![2])]
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn steps_view_after_merge() {
        let (agg, db, tx, cancel, dir) = setup(0);
        for t in 0..8u64 {
            write_row(&agg, t, b"A", &[t as u8]);
        }
        commit_writes(&agg, &cancel, &tx);
        agg.build_files(&cancel, &db).await.expect("build");
        agg.merge_loop(&cancel, 1).await.expect("merge");

        assert_eq!(agg.end_tx_num_frozen_and_indexed(), 8);
        let steps = agg.make_steps().expect("steps");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].tx_num_range(), (0, 8));
        let (value, state_tx) = steps[0]
            .read_account_data_no_state(b"A", 5)
            .expect("read")
            .expect("present");
        assert_eq!((value, state_tx), (vec![5], 5));
        assert_eq!(steps[0].max_tx_num_accounts(b"A").expect("max"), Some(7));
        let clone = steps[0].clone_step();
        assert_eq!(clone.tx_num_range(), (0, 8));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn warmup_skips_small_limits_and_close_is_idempotent() {
        let (agg, _db, _tx, _cancel, dir) = setup(0);
        agg.warmup(0, 9_999).await;
        assert!(!agg.inner.warmup_working.load(Ordering::Acquire));
        assert_eq!(agg.inner.tasks.lock().await.len(), 0);

        agg.warmup(0, 10_000).await;
        agg.close().await;
        agg.close().await;
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn reopen_folder_restores_state_from_disk() {
        let (agg, db, tx, cancel, dir) = setup(0);
        for t in 0..8u64 {
            write_row(&agg, t, b"A", &[t as u8]);
        }
        commit_writes(&agg, &cancel, &tx);
        agg.build_files(&cancel, &db).await.expect("build");
        agg.close().await;
        assert_eq!(agg.end_tx_num_minimax(), 8, "close keeps the minimax");

        agg.reopen_folder().expect("reopen");
        assert_eq!(account_intervals(&agg), vec![(0, 4), (4, 8)]);
        let ctx = agg.make_context();
        assert_eq!(
            ctx.read_account_data_no_state(b"A", 7).expect("read"),
            Some(vec![7])
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn log_stats_reports_without_panicking() {
        let (agg, db, tx, cancel, dir) = setup(0);
        for t in 0..8u64 {
            write_row(&agg, t, b"A", &[t as u8]);
        }
        commit_writes(&agg, &cancel, &tx);
        agg.build_files(&cancel, &db).await.expect("build");
        agg.log_stats(&tx, &|tx_num| tx_num / 2).expect("log stats");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn cancelled_build_unwinds_silently() {
        let (agg, db, tx, _cancel, dir) = setup(0);
        for t in 0..8u64 {
            write_row(&agg, t, b"A", &[t as u8]);
        }
        let (handle, cancel) = cancel_pair();
        commit_writes(&agg, &cancel, &tx);
        handle.cancel();
        agg.build_files(&cancel, &db).await.expect("silent unwind");
        assert!(account_intervals(&agg).is_empty());
        // no half-built shards left behind
        let snapshots = dir.join("snapshots");
        let leftovers: Vec<_> = std::fs::read_dir(&snapshots)
            .map(|entries| entries.filter_map(|e| e.ok()).collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty(), "no files should survive a cancelled build");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
