//! Host key-value store interface.
//!
//! The aggregator consumes a small transactional API: MVCC read views,
//! a read-write transaction it can hold onto between calls, ascending
//! cursors in big-endian key order, and duplicate-sorted index tables.
//! The embedded reference store lives in [`mem`]; a real deployment backs
//! these tables with its own engine.

mod mem;

pub use mem::{Db, RoTx, RwTx};

use eyre::Result;

/// Every table the seven domains touch, plus the plain state table that
/// `unwind` re-materializes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    AccountHistoryKeys,
    AccountIdx,
    AccountHistoryVals,
    AccountSettings,
    StorageHistoryKeys,
    StorageIdx,
    StorageHistoryVals,
    StorageSettings,
    CodeHistoryKeys,
    CodeIdx,
    CodeHistoryVals,
    CodeSettings,
    LogAddressKeys,
    LogAddressIdx,
    LogTopicsKeys,
    LogTopicsIdx,
    TracesFromKeys,
    TracesFromIdx,
    TracesToKeys,
    TracesToIdx,
    PlainState,
}

impl Table {
    pub const ALL: [Table; 21] = [
        Table::AccountHistoryKeys,
        Table::AccountIdx,
        Table::AccountHistoryVals,
        Table::AccountSettings,
        Table::StorageHistoryKeys,
        Table::StorageIdx,
        Table::StorageHistoryVals,
        Table::StorageSettings,
        Table::CodeHistoryKeys,
        Table::CodeIdx,
        Table::CodeHistoryVals,
        Table::CodeSettings,
        Table::LogAddressKeys,
        Table::LogAddressIdx,
        Table::LogTopicsKeys,
        Table::LogTopicsIdx,
        Table::TracesFromKeys,
        Table::TracesFromIdx,
        Table::TracesToKeys,
        Table::TracesToIdx,
        Table::PlainState,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::AccountHistoryKeys => "AccountHistoryKeys",
            Table::AccountIdx => "AccountIdx",
            Table::AccountHistoryVals => "AccountHistoryVals",
            Table::AccountSettings => "AccountSettings",
            Table::StorageHistoryKeys => "StorageHistoryKeys",
            Table::StorageIdx => "StorageIdx",
            Table::StorageHistoryVals => "StorageHistoryVals",
            Table::StorageSettings => "StorageSettings",
            Table::CodeHistoryKeys => "CodeHistoryKeys",
            Table::CodeIdx => "CodeIdx",
            Table::CodeHistoryVals => "CodeHistoryVals",
            Table::CodeSettings => "CodeSettings",
            Table::LogAddressKeys => "LogAddressKeys",
            Table::LogAddressIdx => "LogAddressIdx",
            Table::LogTopicsKeys => "LogTopicsKeys",
            Table::LogTopicsIdx => "LogTopicsIdx",
            Table::TracesFromKeys => "TracesFromKeys",
            Table::TracesFromIdx => "TracesFromIdx",
            Table::TracesToKeys => "TracesToKeys",
            Table::TracesToIdx => "TracesToIdx",
            Table::PlainState => "PlainState",
        }
    }

    /// Duplicate-sorted tables keep every value appended under a key, in
    /// byte order. Plain tables replace on put.
    pub fn is_dup_sort(self) -> bool {
        matches!(
            self,
            Table::AccountHistoryKeys
                | Table::AccountIdx
                | Table::StorageHistoryKeys
                | Table::StorageIdx
                | Table::CodeHistoryKeys
                | Table::CodeIdx
                | Table::LogAddressKeys
                | Table::LogAddressIdx
                | Table::LogTopicsKeys
                | Table::LogTopicsIdx
                | Table::TracesFromKeys
                | Table::TracesFromIdx
                | Table::TracesToKeys
                | Table::TracesToIdx
        )
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Read surface shared by [`RoTx`] and [`RwTx`].
pub trait KvRead {
    /// First (smallest) value under `key`, or `None`.
    fn get(&self, table: Table, key: &[u8]) -> Option<Vec<u8>>;

    /// All values under `key` in byte order; empty when absent.
    fn get_dups(&self, table: Table, key: &[u8]) -> Vec<Vec<u8>>;

    fn first_key(&self, table: Table) -> Option<Vec<u8>>;

    fn last_key(&self, table: Table) -> Option<Vec<u8>>;

    /// Ascending cursor over `[from, to)` (unbounded when `to` is `None`),
    /// visiting one `(key, value)` pair per duplicate entry. The visitor
    /// returns `false` to stop early.
    fn scan(
        &self,
        table: Table,
        from: &[u8],
        to: Option<&[u8]>,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()>;
}

/// Big-endian txnum encoding used for every `*HistoryKeys` table key, so
/// the cursor order is the txnum order.
pub fn tx_num_key(tx_num: u64) -> [u8; 8] {
    tx_num.to_be_bytes()
}

pub fn parse_tx_num(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_num_keys_sort_big_endian() {
        let mut keys: Vec<_> = [3u64, 256, 1, u64::MAX].iter().map(|t| tx_num_key(*t)).collect();
        keys.sort();
        let decoded: Vec<_> = keys.iter().map(|k| parse_tx_num(k).expect("8 bytes")).collect();
        assert_eq!(decoded, vec![1, 3, 256, u64::MAX]);
    }

    #[test]
    fn dup_sort_split_matches_table_roles() {
        assert!(Table::AccountIdx.is_dup_sort());
        assert!(Table::TracesToKeys.is_dup_sort());
        assert!(!Table::AccountHistoryVals.is_dup_sort());
        assert!(!Table::PlainState.is_dup_sort());
    }
}
