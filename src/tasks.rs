//! Lifecycle primitives shared by the aggregator's background jobs.

use eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Cooperative-shutdown sentinel. Long-running operations return this
/// (wrapped in `eyre::Report`) when their [`Cancel`] token fires; callers
/// detect it with `err.is::<Cancelled>()` and unwind silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Returns true when `err` is the cooperative-shutdown sentinel.
pub fn is_cancelled(err: &eyre::Report) -> bool {
    err.is::<Cancelled>()
}

/// Cancellation token: a watch channel observed by every long loop.
///
/// The root token lives in the aggregator; children are cheap clones of the
/// receiver side. `check()` is the per-iteration poll, `cancelled()` the
/// async wait used by background tasks parked between rounds.
#[derive(Debug, Clone)]
pub struct Cancel {
    rx: watch::Receiver<bool>,
}

/// Owning side of a [`Cancel`] token.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

pub fn cancel_pair() -> (CancelHandle, Cancel) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, Cancel { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Cancel {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Per-iteration poll for blocking loops.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Cancelled.into());
        }
        Ok(())
    }

    /// Resolves once the token fires.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Single-flight guard over an `AtomicBool`, acquired with compare-and-swap
/// so two concurrent callers cannot both win the slot. Dropping the guard
/// releases it.
pub struct WorkGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> WorkGuard<'a> {
    pub fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Indicator that some background work finished. Consumers re-query real
/// state; only the fact and the error (if any) travel through here.
#[derive(Debug, Default)]
pub struct BackgroundResult {
    has: bool,
    err: Option<String>,
}

impl BackgroundResult {
    pub fn has(&self) -> bool {
        self.has
    }

    pub fn set(&mut self, err: Option<String>) {
        self.has = true;
        self.err = err;
    }

    pub fn get_and_reset(&mut self) -> (bool, Option<String>) {
        let out = (self.has, self.err.take());
        self.has = false;
        out
    }
}

/// Wall-clock tick for periodic progress logging inside long loops.
pub struct LogTicker {
    every: Duration,
    last: Instant,
}

impl LogTicker {
    pub fn new(every: Duration) -> Self {
        Self {
            every,
            last: Instant::now(),
        }
    }

    /// True at most once per `every`; the caller logs when it fires.
    pub fn tick(&mut self) -> bool {
        if self.last.elapsed() >= self.every {
            self.last = Instant::now();
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_guard_is_single_flight() {
        let flag = AtomicBool::new(false);
        let first = WorkGuard::acquire(&flag);
        assert!(first.is_some());
        assert!(WorkGuard::acquire(&flag).is_none());
        drop(first);
        assert!(WorkGuard::acquire(&flag).is_some());
    }

    #[test]
    fn background_result_resets() {
        let mut br = BackgroundResult::default();
        assert!(!br.has());
        br.set(Some("boom".to_string()));
        let (has, err) = br.get_and_reset();
        assert!(has);
        assert_eq!(err.as_deref(), Some("boom"));
        let (has, err) = br.get_and_reset();
        assert!(!has);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn cancel_fires_once_for_all_clones() {
        let (handle, cancel) = cancel_pair();
        let child = cancel.clone();
        assert!(cancel.check().is_ok());
        handle.cancel();
        assert!(child.is_cancelled());
        let err = cancel.check().expect_err("cancelled");
        assert!(is_cancelled(&err));
        child.cancelled().await;
    }
}
