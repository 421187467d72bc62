use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Args;
use error_stack::{Result, ResultExt};
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::SyncError,
    ingestion::{BackfillOptions, EventEmitter, SyncEvent},
    provider::HttpTransport,
    service::SyncService,
    store::{CacheStore, InMemoryCacheStore},
};

use super::config::SyncConfig;

#[derive(Args, Debug)]
pub struct StartCommand {
    /// Path to the JSON configuration file.
    #[arg(long = "config", env = "EVM_SYNC_CONFIG")]
    config: PathBuf,

    /// Timeout of a single RPC request.
    #[arg(
        long = "rpc.timeout-sec",
        env = "EVM_SYNC_RPC_TIMEOUT_SEC",
        default_value = "30"
    )]
    rpc_timeout_sec: u64,

    /// Number of backfill tasks running at the same time, per network.
    #[arg(
        long = "backfill.max-concurrent-tasks",
        env = "EVM_SYNC_BACKFILL_MAX_CONCURRENT_TASKS",
        default_value = "10"
    )]
    max_concurrent_tasks: usize,

    /// Attempts before a backfill task is given up on.
    #[arg(
        long = "backfill.max-task-attempts",
        env = "EVM_SYNC_BACKFILL_MAX_TASK_ATTEMPTS",
        default_value = "25"
    )]
    max_task_attempts: u32,

    /// Stop after the backfill instead of following the chain head.
    #[arg(long = "no-realtime", env = "EVM_SYNC_NO_REALTIME", default_value = "false")]
    no_realtime: bool,
}

#[derive(Args, Debug)]
pub struct CheckConfigCommand {
    /// Path to the JSON configuration file.
    #[arg(long = "config", env = "EVM_SYNC_CONFIG")]
    config: PathBuf,
}

impl StartCommand {
    pub async fn run(self, ct: CancellationToken) -> Result<(), SyncError> {
        info!(config = %self.config.display(), "starting evm sync");

        let plans = SyncConfig::from_path(&self.config)?.into_plans()?;

        let store: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::new());
        let (events, events_rx) = EventEmitter::new();
        let events_handle = tokio::spawn(log_events(events_rx));

        let backfill = BackfillOptions::default()
            .with_max_concurrent_tasks(self.max_concurrent_tasks)
            .with_max_task_attempts(self.max_task_attempts);

        let services = plans.into_iter().map(|plan| {
            let name = plan.options.name.clone();
            let dispatcher = plan
                .options
                .dispatcher
                .clone()
                .with_request_timeout(Duration::from_secs(self.rpc_timeout_sec));
            let options = plan
                .options
                .with_dispatcher(dispatcher)
                .with_realtime(!self.no_realtime);

            let transport = Arc::new(HttpTransport::new(plan.rpc_url));
            let service = SyncService::new(options, transport, store.clone(), plan.sources)
                .with_events(events.clone())
                .with_backfill_options(backfill.clone());

            let ct = ct.clone();
            async move { (name, service.run(ct).await) }
        });

        let results = join_all(services).await;

        // Closes the events channel once the services are gone.
        drop(events);
        let _ = events_handle.await;

        let mut failed = 0;
        for (network, result) in results {
            match result {
                Ok(report) => info!(
                    network,
                    completed_tasks = report.completed_tasks,
                    logs = report.logs,
                    dead_letters = report.dead_letters.len(),
                    "network sync finished"
                ),
                Err(err) => {
                    failed += 1;
                    error!(network, error = ?err, "network sync failed");
                }
            }
        }

        if failed > 0 {
            return Err(SyncError::Fatal)
                .attach_printable("some networks failed to sync")
                .attach_printable_lazy(|| format!("failed networks: {failed}"));
        }

        Ok(())
    }
}

impl CheckConfigCommand {
    pub fn run(self) -> Result<(), SyncError> {
        let plans = SyncConfig::from_path(&self.config)?
            .into_plans()
            .attach_printable_lazy(|| format!("config: {}", self.config.display()))?;

        for plan in plans {
            info!(
                network = plan.options.name,
                chain_id = plan.options.chain_id,
                rpc_url = %plan.rpc_url,
                sources = plan.sources.len(),
                "network configuration is valid"
            );
        }

        Ok(())
    }
}

async fn log_events(mut rx: mpsc::UnboundedReceiver<SyncEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            SyncEvent::BackfillStarted {
                source,
                total_blocks,
                cached_blocks,
            } => {
                let cache_rate = if total_blocks == 0 {
                    1.0
                } else {
                    cached_blocks as f64 / total_blocks as f64
                };
                info!(source, total_blocks, cached_blocks, cache_rate, "backfill started");
            }
            SyncEvent::LogTaskFailed {
                source,
                error,
                dead_letter,
            } => warn!(source, error, dead_letter, "log task failed"),
            SyncEvent::Reorg {
                network,
                common_ancestor_number,
                common_ancestor_hash,
                depth,
            } => warn!(
                network,
                common_ancestor_number,
                common_ancestor_hash = %common_ancestor_hash,
                depth,
                "reorg"
            ),
            SyncEvent::Finalized {
                network,
                block_number,
            } => info!(network, block_number, "blocks finalized"),
            SyncEvent::RealtimeFatal { network, reason } => {
                error!(network, reason, "realtime sync stopped")
            }
            event => tracing::debug!(event = ?event, "sync event"),
        }
    }
}
