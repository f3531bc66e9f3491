//! Step view: per-step historical slices for offline reconstitution.

use super::Aggregator;
use crate::snapshots::history::{HistoryStep, HistoryStepIter, ScanIter};
use eyre::{eyre, Result};

/// One frozen-and-indexed step shared across the accounts, storage and
/// code domains, each accessible in isolation.
#[derive(Clone)]
pub struct AggregatorStep {
    accounts: HistoryStep,
    storage: HistoryStep,
    code: HistoryStep,
}

impl Aggregator {
    /// One [`AggregatorStep`] per frozen+indexed step. The three history
    /// domains must agree on the step count; merge snapshots when they do
    /// not.
    pub fn make_steps(&self) -> Result<Vec<AggregatorStep>> {
        let inner = self.inner();
        let frozen_and_indexed = self.end_tx_num_frozen_and_indexed();
        let account_steps = inner.accounts.make_steps(frozen_and_indexed);
        let storage_steps = inner.storage.make_steps(frozen_and_indexed);
        let code_steps = inner.code.make_steps(frozen_and_indexed);
        if account_steps.len() != storage_steps.len() || storage_steps.len() != code_steps.len() {
            return Err(eyre!(
                "different limit of steps (try merge snapshots): accountSteps={}, storageSteps={}, codeSteps={}",
                account_steps.len(),
                storage_steps.len(),
                code_steps.len()
            ));
        }
        Ok(account_steps
            .into_iter()
            .zip(storage_steps)
            .zip(code_steps)
            .map(|((accounts, storage), code)| AggregatorStep {
                accounts,
                storage,
                code,
            })
            .collect())
    }
}

impl AggregatorStep {
    pub fn tx_num_range(&self) -> (u64, u64) {
        self.accounts.tx_num_range()
    }

    pub fn iterate_accounts_txs(&self) -> Result<ScanIter> {
        self.accounts.iterate_txs()
    }

    pub fn iterate_storage_txs(&self) -> Result<ScanIter> {
        self.storage.iterate_txs()
    }

    pub fn iterate_code_txs(&self) -> Result<ScanIter> {
        self.code.iterate_txs()
    }

    /// `(value, state_tx_num)` of the latest account row `<= tx_num` in
    /// this step.
    pub fn read_account_data_no_state(
        &self,
        addr: &[u8],
        tx_num: u64,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        self.accounts.get_no_state(addr, tx_num)
    }

    pub fn read_account_storage_no_state(
        &self,
        addr: &[u8],
        loc: &[u8],
        tx_num: u64,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        let mut key = Vec::with_capacity(addr.len() + loc.len());
        key.extend_from_slice(addr);
        key.extend_from_slice(loc);
        self.storage.get_no_state(&key, tx_num)
    }

    pub fn read_account_code_no_state(
        &self,
        addr: &[u8],
        tx_num: u64,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        self.code.get_no_state(addr, tx_num)
    }

    pub fn read_account_code_size_no_state(
        &self,
        addr: &[u8],
        tx_num: u64,
    ) -> Result<Option<(usize, u64)>> {
        Ok(self
            .code
            .get_no_state(addr, tx_num)?
            .map(|(code, state_tx)| (code.len(), state_tx)))
    }

    pub fn max_tx_num_accounts(&self, addr: &[u8]) -> Result<Option<u64>> {
        self.accounts.max_tx_num(addr)
    }

    pub fn max_tx_num_storage(&self, addr: &[u8], loc: &[u8]) -> Result<Option<u64>> {
        let mut key = Vec::with_capacity(addr.len() + loc.len());
        key.extend_from_slice(addr);
        key.extend_from_slice(loc);
        self.storage.max_tx_num(&key)
    }

    pub fn max_tx_num_code(&self, addr: &[u8]) -> Result<Option<u64>> {
        self.code.max_tx_num(addr)
    }

    pub fn iterate_accounts_history(&self, tx_num: u64) -> Result<HistoryStepIter> {
        self.accounts.iterate_history_before_tx_num(tx_num)
    }

    pub fn iterate_storage_history(&self, tx_num: u64) -> Result<HistoryStepIter> {
        self.storage.iterate_history_before_tx_num(tx_num)
    }

    pub fn iterate_code_history(&self, tx_num: u64) -> Result<HistoryStepIter> {
        self.code.iterate_history_before_tx_num(tx_num)
    }

    /// Duplicate for parallel scans; readers are shared and stateless, so
    /// a clone is enough.
    pub fn clone_step(&self) -> AggregatorStep {
        self.clone()
    }
}
