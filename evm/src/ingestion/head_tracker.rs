//! Follow the chain head, reconciling reorgs against the recent block window.
use std::{collections::HashSet, sync::Arc, time::Duration};

use alloy_primitives::B256;
use error_stack::{Report, Result, ResultExt};
use evm_sync_observability::KeyValue;
use futures::future::try_join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    interval::IntervalCache,
    provider::{
        models::{Log, LightBlock},
        BlockTag, DispatchErrorExt, Dispatcher,
    },
    source::SharedSource,
    store::CacheStore,
};

use super::{
    block_fetch::{BlockFetchCoordinator, BlockTicket},
    chain::ReorgWindow,
    error::{IngestionError, IngestionErrorExt},
    events::{EventEmitter, SyncEvent},
    logs::{fetch_factory_events, fetch_source_logs, group_logs_by_block},
    metrics::IngestionMetrics,
};

#[derive(Debug, Clone)]
pub struct HeadTrackerOptions {
    /// How often to poll the latest block.
    pub poll_interval: Duration,
    /// Number of recent blocks retained to find reorg common ancestors.
    pub reorg_depth: usize,
    /// Blocks behind the head after which a block is final.
    pub finality_block_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Polling,
    Reconciling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The head did not move.
    Unchanged,
    /// New blocks extend the previous head.
    Advanced {
        from_block: u64,
        to_block: u64,
        logs: usize,
    },
    /// The blocks after `common_ancestor` were replaced.
    Reorganized {
        common_ancestor: LightBlock,
        depth: u64,
        to_block: u64,
        logs: usize,
    },
}

/// New blocks found by walking back from the remote head.
struct HeadUpdate {
    common_ancestor: LightBlock,
    /// Oldest first.
    blocks: Vec<LightBlock>,
}

/// Realtime sync of one network.
///
/// Ticks are strictly sequential. The tracker stops on reorgs deeper than
/// `reorg_depth` and on terminal RPC errors.
pub struct HeadTracker {
    network: Arc<str>,
    chain_id: u64,
    dispatcher: Dispatcher,
    store: Arc<dyn CacheStore>,
    intervals: IntervalCache,
    coordinator: BlockFetchCoordinator,
    events: EventEmitter,
    sources: Vec<SharedSource>,
    window: ReorgWindow,
    finalized: LightBlock,
    state: TrackerState,
    metrics: IngestionMetrics,
    options: HeadTrackerOptions,
}

impl HeadTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        network: impl Into<String>,
        chain_id: u64,
        dispatcher: Dispatcher,
        store: Arc<dyn CacheStore>,
        coordinator: BlockFetchCoordinator,
        events: EventEmitter,
        sources: Vec<SharedSource>,
        finalized: LightBlock,
        options: HeadTrackerOptions,
    ) -> Self {
        Self {
            network: network.into().into(),
            chain_id,
            dispatcher,
            intervals: IntervalCache::new(store.clone()),
            store,
            coordinator,
            events,
            sources,
            window: ReorgWindow::new(finalized.clone(), options.reorg_depth),
            finalized,
            state: TrackerState::Idle,
            metrics: IngestionMetrics::default(),
            options,
        }
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn head(&self) -> &LightBlock {
        self.window.tip()
    }

    pub fn finalized(&self) -> &LightBlock {
        &self.finalized
    }

    pub fn window(&self) -> &ReorgWindow {
        &self.window
    }

    /// Poll the head until cancelled or a fatal condition.
    pub async fn run(mut self, ct: CancellationToken) -> Result<(), IngestionError> {
        info!(
            network = %self.network,
            head = %self.window.tip(),
            sources = self.sources.len(),
            "starting realtime sync"
        );

        let mut interval = tokio::time::interval(self.options.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = ct.cancelled() => break,

                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(outcome) => {
                            debug!(network = %self.network, outcome = ?outcome, "realtime tick");
                        }
                        Err(err) if is_fatal(&err) => {
                            error!(network = %self.network, error = ?err, "realtime sync stopped");
                            self.events.emit(SyncEvent::RealtimeFatal {
                                network: self.network.to_string(),
                                reason: format!("{}", err.current_context()),
                            });
                            self.state = TrackerState::Idle;
                            return Err(err);
                        }
                        Err(err) => {
                            warn!(network = %self.network, error = ?err, "realtime tick failed, retrying");
                        }
                    }
                }
            }
        }

        self.state = TrackerState::Idle;
        info!(network = %self.network, "realtime sync stopped");

        Ok(())
    }

    /// Fetch the latest block and bring the local chain up to it.
    #[instrument(skip_all, fields(network = %self.network))]
    pub async fn tick(&mut self) -> Result<TickOutcome, IngestionError> {
        self.state = TrackerState::Polling;

        let latest = self
            .dispatcher
            .get_latest_block()
            .await
            .change_context(IngestionError::RpcRequest)
            .attach_printable("failed to get latest block")?;

        if self.window.contains(&latest.hash) {
            return Ok(TickOutcome::Unchanged);
        }

        let update = self.walk_back(latest).await?;
        let previous_tip = self.window.tip().clone();
        let reorg = update.common_ancestor.hash != previous_tip.hash;

        let depth = previous_tip.number - update.common_ancestor.number;
        if reorg {
            self.reorganize(&update.common_ancestor, depth).await?;
        }

        let logs = self.ingest(&update.blocks).await?;

        for block in update.blocks {
            self.window
                .grow(block)
                .change_context(IngestionError::Chain)?;
        }

        let tip = self.window.tip().clone();
        self.metrics
            .head
            .record(tip.number, &[KeyValue::new("network", self.network.to_string())]);
        info!(head = %tip, logs, "realtime head advanced");

        self.finalize().await?;

        self.state = TrackerState::Polling;

        let from_block = update.common_ancestor.number + 1;
        if reorg {
            Ok(TickOutcome::Reorganized {
                common_ancestor: update.common_ancestor,
                depth,
                to_block: tip.number,
                logs,
            })
        } else {
            Ok(TickOutcome::Advanced {
                from_block,
                to_block: tip.number,
                logs,
            })
        }
    }

    /// Fetch ancestors of `latest` until one is in the window.
    async fn walk_back(&self, latest: LightBlock) -> Result<HeadUpdate, IngestionError> {
        let mut blocks = vec![latest];

        loop {
            let current = &blocks[blocks.len() - 1];
            if let Some(ancestor) = self.window.get(&current.parent_hash) {
                let common_ancestor = ancestor.clone();
                blocks.reverse();
                return Ok(HeadUpdate {
                    common_ancestor,
                    blocks,
                });
            }

            if current.number <= self.window.oldest().number {
                return Err(IngestionError::ReorgTooDeep)
                    .attach_printable("no common ancestor in the retained blocks")
                    .attach_printable_lazy(|| format!("oldest retained: {}", self.window.oldest()))
                    .attach_printable_lazy(|| format!("remote block: {current}"));
            }

            let parent_hash = current.parent_hash;
            let parent = self
                .dispatcher
                .get_light_block_by_hash(parent_hash)
                .await
                .change_context(IngestionError::RpcRequest)
                .attach_printable("failed to get parent block")
                .attach_printable_lazy(|| format!("hash: {parent_hash:#x}"))?;

            blocks.push(parent);
        }
    }

    /// Drop the local blocks and stored data after `common_ancestor`.
    async fn reorganize(
        &mut self,
        common_ancestor: &LightBlock,
        depth: u64,
    ) -> Result<(), IngestionError> {
        self.state = TrackerState::Reconciling;

        warn!(
            network = %self.network,
            common_ancestor = %common_ancestor,
            depth,
            "chain reorganization detected"
        );

        self.store
            .delete_realtime_data(self.chain_id, common_ancestor.number + 1)
            .await
            .change_context(IngestionError::Store)
            .attach_printable("failed to delete reorged data")?;

        self.window
            .shrink_to(&common_ancestor.hash)
            .change_context(IngestionError::Chain)?;

        if common_ancestor.number < self.finalized.number {
            warn!(
                network = %self.network,
                finalized = %self.finalized,
                "reorg replaced finalized blocks"
            );
            self.finalized = common_ancestor.clone();
        }

        self.metrics
            .reorgs
            .add(1, &[KeyValue::new("network", self.network.to_string())]);

        self.events.emit(SyncEvent::Reorg {
            network: self.network.to_string(),
            common_ancestor_number: common_ancestor.number,
            common_ancestor_hash: common_ancestor.hash,
            depth,
        });

        Ok(())
    }

    /// Fetch and store the logs and blocks of the new canonical blocks.
    ///
    /// On failure the data stored for `blocks` is deleted, the window never
    /// holds blocks that were not fully ingested.
    async fn ingest(&self, blocks: &[LightBlock]) -> Result<usize, IngestionError> {
        let Some(first) = blocks.first() else {
            return Ok(0);
        };

        match self.ingest_blocks(blocks).await {
            Ok(logs) => Ok(logs),
            Err(err) => {
                self.store
                    .delete_realtime_data(self.chain_id, first.number)
                    .await
                    .change_context(IngestionError::Store)
                    .attach_printable("failed to delete partially ingested data")?;
                Err(err)
            }
        }
    }

    async fn ingest_blocks(&self, blocks: &[LightBlock]) -> Result<usize, IngestionError> {
        let (Some(first), Some(last)) = (blocks.first(), blocks.last()) else {
            return Ok(0);
        };

        let canonical = blocks.iter().map(|block| block.hash).collect::<HashSet<B256>>();

        let mut logs = Vec::<Log>::new();
        for source in &self.sources {
            let Some((from_block, to_block)) = source.clamp(first.number, last.number) else {
                continue;
            };

            let events = fetch_factory_events(
                &self.dispatcher,
                self.store.as_ref(),
                source,
                from_block,
                to_block,
            )
            .await?;
            logs.extend(events.logs);

            let batch = fetch_source_logs(
                &self.dispatcher,
                self.store.as_ref(),
                source,
                from_block,
                to_block,
            )
            .await?;
            logs.extend(batch.logs);
        }

        if let Some(log) = logs.iter().find(|log| !canonical.contains(&log.block_hash)) {
            // The node moved to another fork while we were fetching.
            let block_hash = log.block_hash;
            return Err(IngestionError::Chain)
                .attach_printable("log belongs to a non canonical block")
                .attach_printable_lazy(|| format!("block hash: {block_hash:#x}"));
        }

        let tickets = group_logs_by_block(&logs)
            .into_iter()
            .map(|(block_hash, transactions)| self.coordinator.require(block_hash, transactions))
            .collect::<Vec<_>>();

        try_join_all(tickets.into_iter().map(BlockTicket::wait)).await?;

        if !logs.is_empty() {
            self.events.emit(SyncEvent::NewEventsAdded {
                network: self.network.to_string(),
                count: logs.len(),
            });
        }

        Ok(logs.len())
    }

    /// Record the blocks that became final as cached for every source.
    async fn finalize(&mut self) -> Result<(), IngestionError> {
        let tip = self.window.tip();
        let finalized_number = tip.number.saturating_sub(self.options.finality_block_count);

        if finalized_number <= self.finalized.number {
            return Ok(());
        }

        let finalized = match self.window.get_by_number(finalized_number) {
            Some(block) => block.clone(),
            None => self
                .dispatcher
                .get_block_by_number(BlockTag::Number(finalized_number), false)
                .await
                .change_context(IngestionError::RpcRequest)
                .attach_printable("failed to get finalized block")?
                .light(),
        };

        for source in &self.sources {
            let Some(range) = source.clamp(self.finalized.number + 1, finalized.number) else {
                continue;
            };

            let keys = source
                .interval_keys()
                .into_iter()
                .chain(source.factory_interval_key());

            for key in keys {
                self.intervals
                    .record_complete(&key, range, finalized.timestamp)
                    .await
                    .change_context(IngestionError::Store)
                    .attach_printable("failed to record finalized interval")?;
            }
        }

        debug!(network = %self.network, finalized = %finalized, "finalized blocks");

        self.metrics.finalized.record(
            finalized.number,
            &[KeyValue::new("network", self.network.to_string())],
        );

        self.events.emit(SyncEvent::Finalized {
            network: self.network.to_string(),
            block_number: finalized.number,
        });

        self.finalized = finalized;

        Ok(())
    }
}

fn is_fatal(err: &Report<IngestionError>) -> bool {
    err.is_reorg_too_deep() || err.is_terminal()
}

impl Default for HeadTrackerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            reorg_depth: 64,
            finality_block_count: 12,
        }
    }
}

impl HeadTrackerOptions {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_reorg_depth(mut self, reorg_depth: usize) -> Self {
        self.reorg_depth = reorg_depth;
        self
    }

    pub fn with_finality_block_count(mut self, finality_block_count: u64) -> Self {
        self.finality_block_count = finality_block_count;
        self
    }
}
