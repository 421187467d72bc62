//! Persistence of synced logs, blocks and completed intervals.
mod memory;

use alloy_primitives::Address;
use error_stack::Result;

use crate::{
    provider::models::{Block, Log, Transaction},
    source::FactoryCriteria,
};

pub use self::memory::InMemoryCacheStore;

/// A block range fully synced for one cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedInterval {
    pub key: String,
    pub start_block: u64,
    pub end_block: u64,
    /// Timestamp of `end_block`.
    pub end_block_timestamp: u64,
}

#[derive(Debug)]
pub enum StoreError {
    Write,
    Read,
    /// Data breaks an invariant, like a cached interval with start > end.
    Invalid,
}

/// Storage used by the sync engine.
///
/// Writes are idempotent: inserting the same log, block or transaction twice
/// keeps a single copy.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn insert_logs(&self, logs: &[Log]) -> Result<(), StoreError>;

    /// Insert a block header. Transactions are stored separately.
    async fn insert_block(&self, chain_id: u64, block: &Block) -> Result<(), StoreError>;

    async fn insert_transactions(
        &self,
        chain_id: u64,
        transactions: &[Transaction],
    ) -> Result<(), StoreError>;

    /// Insert an interval, merging it with the overlapping or adjacent
    /// intervals of the same key.
    async fn insert_cached_interval(&self, interval: CachedInterval) -> Result<(), StoreError>;

    async fn get_cached_intervals(&self, key: &str) -> Result<Vec<CachedInterval>, StoreError>;

    /// Child addresses announced by the factory up to `up_to_block`, inclusive.
    async fn get_factory_child_addresses(
        &self,
        chain_id: u64,
        factory: &FactoryCriteria,
        up_to_block: u64,
    ) -> Result<Vec<Address>, StoreError>;

    /// Delete logs, blocks and transactions from `from_block` onwards.
    async fn delete_realtime_data(&self, chain_id: u64, from_block: u64)
        -> Result<(), StoreError>;
}

impl error_stack::Context for StoreError {}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Write => write!(f, "store error: write failed"),
            StoreError::Read => write!(f, "store error: read failed"),
            StoreError::Invalid => write!(f, "store error: invalid data"),
        }
    }
}
