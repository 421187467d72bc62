use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Mutex, MutexGuard},
};

use alloy_primitives::{Address, B256};
use error_stack::{Report, Result, ResultExt};

use crate::{
    provider::models::{Block, Log, Transaction},
    source::FactoryCriteria,
};

use super::{CacheStore, CachedInterval, StoreError};

/// A [CacheStore] that keeps everything in memory.
#[derive(Default)]
pub struct InMemoryCacheStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Keyed by (chain id, block number, block hash, log index).
    logs: BTreeMap<(u64, u64, B256, u64), Log>,
    blocks: HashMap<(u64, B256), Block>,
    transactions: HashMap<(u64, B256), Transaction>,
    intervals: HashMap<String, Vec<CachedInterval>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| Report::new(StoreError::Read).attach_printable("store lock poisoned"))
    }

    /// All logs, ordered by chain, block and log index.
    pub fn logs(&self) -> Vec<Log> {
        self.lock()
            .map(|inner| inner.logs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn block(&self, chain_id: u64, hash: B256) -> Option<Block> {
        self.lock()
            .ok()
            .and_then(|inner| inner.blocks.get(&(chain_id, hash)).cloned())
    }

    pub fn block_count(&self) -> usize {
        self.lock().map(|inner| inner.blocks.len()).unwrap_or(0)
    }

    pub fn transaction(&self, chain_id: u64, hash: B256) -> Option<Transaction> {
        self.lock()
            .ok()
            .and_then(|inner| inner.transactions.get(&(chain_id, hash)).cloned())
    }

    pub fn transaction_count(&self) -> usize {
        self.lock().map(|inner| inner.transactions.len()).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn insert_logs(&self, logs: &[Log]) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for log in logs {
            let key = (log.chain_id, log.block_number, log.block_hash, log.log_index);
            inner.logs.insert(key, log.clone());
        }
        Ok(())
    }

    async fn insert_block(&self, chain_id: u64, block: &Block) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.blocks.insert((chain_id, block.hash), block.clone());
        Ok(())
    }

    async fn insert_transactions(
        &self,
        chain_id: u64,
        transactions: &[Transaction],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for transaction in transactions {
            inner
                .transactions
                .insert((chain_id, transaction.hash), transaction.clone());
        }
        Ok(())
    }

    async fn insert_cached_interval(&self, interval: CachedInterval) -> Result<(), StoreError> {
        if interval.start_block > interval.end_block {
            return Err(StoreError::Invalid)
                .attach_printable("cached interval start is after its end")
                .attach_printable_lazy(|| format!("interval: {interval:?}"));
        }

        let mut inner = self.lock()?;
        let intervals = inner.intervals.entry(interval.key.clone()).or_default();
        intervals.push(interval);
        *intervals = merge_cached_intervals(std::mem::take(intervals));
        Ok(())
    }

    async fn get_cached_intervals(&self, key: &str) -> Result<Vec<CachedInterval>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.intervals.get(key).cloned().unwrap_or_default())
    }

    async fn get_factory_child_addresses(
        &self,
        chain_id: u64,
        factory: &FactoryCriteria,
        up_to_block: u64,
    ) -> Result<Vec<Address>, StoreError> {
        let inner = self.lock()?;
        let first = (chain_id, 0, B256::ZERO, 0);
        let last = (chain_id, up_to_block, B256::repeat_byte(0xff), u64::MAX);
        let children = inner
            .logs
            .range(first..=last)
            .map(|(_, log)| log)
            .filter(|log| {
                log.address == factory.address
                    && log.topics.first() == Some(&factory.event_selector)
            })
            .filter_map(|log| factory.child_address_location.extract(log))
            .collect::<BTreeSet<_>>();
        Ok(children.into_iter().collect())
    }

    async fn delete_realtime_data(
        &self,
        chain_id: u64,
        from_block: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.logs.retain(|(log_chain_id, number, _, _), _| {
            *log_chain_id != chain_id || *number < from_block
        });
        inner.blocks.retain(|(block_chain_id, _), block| {
            *block_chain_id != chain_id || block.number < from_block
        });
        inner.transactions.retain(|(tx_chain_id, _), tx| {
            *tx_chain_id != chain_id || tx.block_number.map_or(true, |n| n < from_block)
        });

        // Completed intervals cannot extend past the deleted blocks.
        let prefix = format!("{chain_id}_");
        for (key, intervals) in inner.intervals.iter_mut() {
            if !key.starts_with(&prefix) {
                continue;
            }
            intervals.retain(|interval| interval.start_block < from_block);
            for interval in intervals.iter_mut() {
                interval.end_block = interval.end_block.min(from_block.saturating_sub(1));
            }
        }

        Ok(())
    }
}

fn merge_cached_intervals(mut intervals: Vec<CachedInterval>) -> Vec<CachedInterval> {
    intervals.sort_by_key(|interval| (interval.start_block, interval.end_block));

    let mut merged: Vec<CachedInterval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(last) if interval.start_block <= last.end_block.saturating_add(1) => {
                if interval.end_block > last.end_block {
                    last.end_block = interval.end_block;
                    last.end_block_timestamp = interval.end_block_timestamp;
                }
            }
            _ => merged.push(interval),
        }
    }
    merged
}
