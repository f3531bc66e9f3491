//! Historical state aggregation engine.
//!
//! A stream of versioned state changes (accounts, storage slots, contract
//! code) and append-only event indices (log addresses, log topics, trace
//! addresses) recorded in a key-value store is periodically turned into
//! immutable, range-indexed on-disk shards, merged into exponentially
//! larger ones, and served back through point and range queries over the
//! unified live-DB + snapshot view.
//!
//! Entry points:
//! - [`Aggregator`] drives the collate -> build -> integrate -> merge ->
//!   prune pipeline across seven domains in lock-step.
//! - [`Aggregator::make_context`] captures a consistent read view.
//! - [`Aggregator::make_steps`] slices frozen history per step for
//!   offline reconstitution.

pub mod aggregator;
pub mod config;
pub mod etl;
pub mod kv;
pub mod logging;
pub mod snapshots;
pub mod tasks;

#[cfg(test)]
pub(crate) mod test_utils;

pub use aggregator::{
    Aggregator, AggregatorContext, AggregatorStep, FilesStats, HistoryChangesIter,
    InvertedIterator, StateAsOfIter,
};
pub use config::AggregatorConfig;
pub use kv::{Db, KvRead, RwTx, Table};
pub use tasks::{cancel_pair, is_cancelled, Cancel, Cancelled};
