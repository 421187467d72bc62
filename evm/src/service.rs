//! Sync one network: backfill up to the finalized block, then follow the head.
use std::sync::Arc;

use error_stack::{Result, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::SyncError,
    ingestion::{
        BackfillOptions, BackfillReport, BlockFetchCoordinator, BlockFetchService, EventEmitter,
        HeadTracker, HeadTrackerOptions, LogBackfillPipeline,
    },
    provider::{BlockTag, Dispatcher, DispatcherOptions, DispatcherService, RpcTransport},
    source::SharedSource,
    store::CacheStore,
};

#[derive(Debug, Clone)]
pub struct NetworkOptions {
    pub name: String,
    pub chain_id: u64,
    pub dispatcher: DispatcherOptions,
    pub head_tracker: HeadTrackerOptions,
    /// Follow the chain head after the backfill.
    pub realtime: bool,
}

pub struct SyncService {
    network: NetworkOptions,
    transport: Arc<dyn RpcTransport>,
    store: Arc<dyn CacheStore>,
    sources: Vec<SharedSource>,
    events: EventEmitter,
    backfill: BackfillOptions,
}

impl SyncService {
    pub fn new(
        network: NetworkOptions,
        transport: Arc<dyn RpcTransport>,
        store: Arc<dyn CacheStore>,
        sources: Vec<SharedSource>,
    ) -> Self {
        Self {
            network,
            transport,
            store,
            sources,
            events: EventEmitter::disabled(),
            backfill: BackfillOptions::default(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn with_backfill_options(mut self, backfill: BackfillOptions) -> Self {
        self.backfill = backfill;
        self
    }

    /// Run until the sync is done or `ct` is cancelled.
    ///
    /// Without realtime, returns after the backfill.
    pub async fn run(self, ct: CancellationToken) -> Result<BackfillReport, SyncError> {
        let network = self.network.name.clone();
        let worker_ct = ct.child_token();

        let (dispatcher, dispatcher_fut) =
            DispatcherService::new(network.clone(), self.transport.clone())
                .with_options(self.network.dispatcher.clone())
                .start(worker_ct.clone());
        let dispatcher_handle = tokio::spawn(dispatcher_fut);

        let (coordinator, coordinator_fut) = BlockFetchService::new(
            network.clone(),
            self.network.chain_id,
            dispatcher.clone(),
            self.store.clone(),
        )
        .start(worker_ct.clone());
        let coordinator_handle = tokio::spawn(coordinator_fut);

        let result = self.sync(dispatcher, coordinator, &ct).await;

        worker_ct.cancel();

        match dispatcher_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(network, error = ?err, "rpc dispatcher failed"),
            Err(err) => warn!(network, error = ?err, "rpc dispatcher task panicked"),
        }

        match coordinator_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(network, error = ?err, "block fetch coordinator failed"),
            Err(err) => warn!(network, error = ?err, "block fetch coordinator task panicked"),
        }

        result
    }

    async fn sync(
        &self,
        dispatcher: Dispatcher,
        coordinator: BlockFetchCoordinator,
        ct: &CancellationToken,
    ) -> Result<BackfillReport, SyncError> {
        let network = self.network.name.as_str();

        let chain_id = dispatcher
            .chain_id()
            .await
            .change_context(SyncError::Rpc)
            .attach_printable("failed to get chain id")
            .attach_printable_lazy(|| format!("network: {network}"))?;

        if chain_id != self.network.chain_id {
            return Err(SyncError::ChainMismatch)
                .attach_printable_lazy(|| format!("network: {network}"))
                .attach_printable_lazy(|| format!("configured: {}", self.network.chain_id))
                .attach_printable_lazy(|| format!("remote: {chain_id}"));
        }

        let latest = dispatcher
            .get_latest_block()
            .await
            .change_context(SyncError::Rpc)
            .attach_printable("failed to get latest block")?;

        let finality_block_count = self.network.head_tracker.finality_block_count;
        let finalized_number = latest.number.saturating_sub(finality_block_count);
        let finalized = dispatcher
            .get_block_by_number(BlockTag::Number(finalized_number), false)
            .await
            .change_context(SyncError::Rpc)
            .attach_printable("failed to get finalized block")?
            .light();

        info!(network, latest = %latest, finalized = %finalized, "starting sync");

        let pipeline = LogBackfillPipeline::new(
            network,
            dispatcher.clone(),
            self.store.clone(),
            coordinator.clone(),
            self.events.clone(),
        )
        .with_options(self.backfill.clone());

        let report = pipeline
            .run(&self.sources, finalized.number, ct)
            .await
            .change_context(SyncError::Backfill)
            .attach_printable_lazy(|| format!("network: {network}"))?;

        if !report.dead_letters.is_empty() {
            warn!(
                network,
                dead_letters = report.dead_letters.len(),
                "some block ranges could not be synced"
            );
        }

        if !self.network.realtime || ct.is_cancelled() {
            return Ok(report);
        }

        let live_sources = self
            .sources
            .iter()
            .filter(|source| source.is_live_after(finalized.number))
            .cloned()
            .collect::<Vec<_>>();

        if live_sources.is_empty() {
            info!(network, "all sources reached their end block");
            return Ok(report);
        }

        let tracker = HeadTracker::new(
            network,
            self.network.chain_id,
            dispatcher,
            self.store.clone(),
            coordinator,
            self.events.clone(),
            live_sources,
            finalized,
            self.network.head_tracker.clone(),
        );

        tracker
            .run(ct.clone())
            .await
            .change_context(SyncError::Realtime)
            .attach_printable_lazy(|| format!("network: {network}"))?;

        Ok(report)
    }
}

impl NetworkOptions {
    pub fn new(name: impl Into<String>, chain_id: u64) -> Self {
        Self {
            name: name.into(),
            chain_id,
            dispatcher: DispatcherOptions::default(),
            head_tracker: HeadTrackerOptions::default(),
            realtime: true,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: DispatcherOptions) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_head_tracker(mut self, head_tracker: HeadTrackerOptions) -> Self {
        self.head_tracker = head_tracker;
        self
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}
