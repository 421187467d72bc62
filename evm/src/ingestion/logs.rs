use std::collections::{BTreeMap, BTreeSet};

use alloy_primitives::B256;
use error_stack::{Result, ResultExt};
use tracing::{debug, warn};

use crate::{
    provider::{
        models::{Log, RawLog},
        Dispatcher, LogQuery,
    },
    source::{Source, SourceCriteria, Topics},
    store::CacheStore,
};

use super::error::IngestionError;

/// Logs fetched for one source and block range.
#[derive(Debug, Default)]
pub struct LogBatch {
    pub logs: Vec<Log>,
    /// Pending logs returned by the node and dropped.
    pub dropped_pending: usize,
}

impl LogBatch {
    pub fn extend(&mut self, other: LogBatch) {
        self.logs.extend(other.logs);
        self.dropped_pending += other.dropped_pending;
    }
}

/// Convert raw logs, dropping the ones still pending.
pub fn parse_logs(raw_logs: Vec<RawLog>, chain_id: u64) -> LogBatch {
    let total = raw_logs.len();
    let logs = raw_logs
        .into_iter()
        .filter_map(|raw| Log::from_raw(raw, chain_id))
        .collect::<Vec<_>>();

    let dropped_pending = total - logs.len();
    if dropped_pending > 0 {
        warn!(
            chain_id,
            count = dropped_pending,
            "dropped pending logs returned by eth_getLogs"
        );
    }

    LogBatch {
        logs,
        dropped_pending,
    }
}

/// Group logs by block hash, with the hashes of the transactions emitting them.
pub fn group_logs_by_block(logs: &[Log]) -> BTreeMap<B256, BTreeSet<B256>> {
    let mut blocks = BTreeMap::<B256, BTreeSet<B256>>::new();
    for log in logs {
        blocks
            .entry(log.block_hash)
            .or_default()
            .insert(log.transaction_hash);
    }
    blocks
}

/// Fetch and store the factory events of `source` in `[from_block, to_block]`.
///
/// Does nothing for log filter sources.
pub async fn fetch_factory_events(
    dispatcher: &Dispatcher,
    store: &dyn CacheStore,
    source: &Source,
    from_block: u64,
    to_block: u64,
) -> Result<LogBatch, IngestionError> {
    let SourceCriteria::Factory(criteria) = &source.criteria else {
        return Ok(LogBatch::default());
    };

    let query = LogQuery::blocks(from_block, to_block)
        .with_addresses(vec![criteria.address])
        .with_topics(Topics::event(criteria.event_selector));

    let batch = get_logs(dispatcher, &query, source.chain_id).await?;
    insert_logs(store, &batch.logs).await?;
    Ok(batch)
}

/// Fetch and store the logs of `source` in `[from_block, to_block]`.
///
/// For factory sources these are the logs of the child contracts. The
/// factory events up to `to_block` must already be in the store.
pub async fn fetch_source_logs(
    dispatcher: &Dispatcher,
    store: &dyn CacheStore,
    source: &Source,
    from_block: u64,
    to_block: u64,
) -> Result<LogBatch, IngestionError> {
    let query = match &source.criteria {
        SourceCriteria::LogFilter(criteria) => {
            let query =
                LogQuery::blocks(from_block, to_block).with_topics(criteria.topics.clone());
            match &criteria.address {
                Some(address) => query.with_addresses(address.addresses()),
                None => query,
            }
        }
        SourceCriteria::Factory(criteria) => {
            let children = store
                .get_factory_child_addresses(source.chain_id, criteria, to_block)
                .await
                .change_context(IngestionError::Store)
                .attach_printable("failed to read factory child addresses")?;

            debug!(
                source = %source.name,
                children = children.len(),
                "fetching factory children logs"
            );

            if children.is_empty() {
                return Ok(LogBatch::default());
            }

            LogQuery::blocks(from_block, to_block)
                .with_addresses(children)
                .with_topics(criteria.topics.clone())
        }
    };

    let batch = get_logs(dispatcher, &query, source.chain_id).await?;
    insert_logs(store, &batch.logs).await?;
    Ok(batch)
}

async fn get_logs(
    dispatcher: &Dispatcher,
    query: &LogQuery,
    chain_id: u64,
) -> Result<LogBatch, IngestionError> {
    let raw_logs = dispatcher
        .get_logs(query)
        .await
        .change_context(IngestionError::RpcRequest)
        .attach_printable("failed to get logs")?;
    Ok(parse_logs(raw_logs, chain_id))
}

async fn insert_logs(store: &dyn CacheStore, logs: &[Log]) -> Result<(), IngestionError> {
    if logs.is_empty() {
        return Ok(());
    }

    store
        .insert_logs(logs)
        .await
        .change_context(IngestionError::Store)
        .attach_printable("failed to insert logs")
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{Address, Bytes};

    use super::*;

    fn raw_log(block_number: Option<u64>, block_hash: B256, transaction_hash: B256) -> RawLog {
        RawLog {
            address: Address::ZERO,
            topics: vec![],
            data: Bytes::new(),
            block_hash: block_number.map(|_| block_hash),
            block_number,
            transaction_hash: block_number.map(|_| transaction_hash),
            transaction_index: block_number.map(|_| 0),
            log_index: block_number.map(|n| n * 10),
            removed: false,
        }
    }

    #[test]
    fn test_parse_logs_drops_pending() {
        let raw = vec![
            raw_log(Some(1), B256::repeat_byte(1), B256::repeat_byte(0xa)),
            raw_log(Some(2), B256::repeat_byte(2), B256::repeat_byte(0xb)),
            raw_log(None, B256::ZERO, B256::ZERO),
        ];

        let batch = parse_logs(raw, 1);
        assert_eq!(batch.logs.len(), 2);
        assert_eq!(batch.dropped_pending, 1);
    }

    #[test]
    fn test_group_logs_by_block() {
        let raw = vec![
            raw_log(Some(1), B256::repeat_byte(1), B256::repeat_byte(0xa)),
            raw_log(Some(1), B256::repeat_byte(1), B256::repeat_byte(0xb)),
            raw_log(Some(1), B256::repeat_byte(1), B256::repeat_byte(0xa)),
            raw_log(Some(2), B256::repeat_byte(2), B256::repeat_byte(0xc)),
        ];
        let batch = parse_logs(raw, 1);

        let blocks = group_logs_by_block(&batch.logs);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[&B256::repeat_byte(1)].len(), 2);
        assert_eq!(blocks[&B256::repeat_byte(2)].len(), 1);
    }
}
