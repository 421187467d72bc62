use evm_sync_observability::{Counter, Gauge};

#[derive(Debug, Clone)]
pub struct IngestionMetrics {
    pub log_tasks_completed: Counter<u64>,
    pub log_tasks_failed: Counter<u64>,
    pub log_tasks_dead_letter: Counter<u64>,
    pub logs_inserted: Counter<u64>,
    pub blocks_fetched: Counter<u64>,
    pub head: Gauge<u64>,
    pub finalized: Gauge<u64>,
    pub reorgs: Counter<u64>,
}

impl Default for IngestionMetrics {
    fn default() -> Self {
        let meter = evm_sync_observability::meter("evm_sync_ingestion");

        Self {
            log_tasks_completed: meter
                .u64_counter("evm_sync.ingestion.log_tasks.completed")
                .with_description("number of completed log backfill tasks")
                .build(),
            log_tasks_failed: meter
                .u64_counter("evm_sync.ingestion.log_tasks.failed")
                .with_description("number of failed log backfill task attempts")
                .build(),
            log_tasks_dead_letter: meter
                .u64_counter("evm_sync.ingestion.log_tasks.dead_letter")
                .with_description("number of log backfill tasks given up on")
                .build(),
            logs_inserted: meter
                .u64_counter("evm_sync.ingestion.logs")
                .with_description("number of logs inserted")
                .build(),
            blocks_fetched: meter
                .u64_counter("evm_sync.ingestion.blocks")
                .with_description("number of blocks fetched")
                .build(),
            head: meter
                .u64_gauge("evm_sync.ingestion.head")
                .with_description("chain's head block")
                .with_unit("{block}")
                .build(),
            finalized: meter
                .u64_gauge("evm_sync.ingestion.finalized")
                .with_description("latest finalized block")
                .with_unit("{block}")
                .build(),
            reorgs: meter
                .u64_counter("evm_sync.ingestion.reorgs")
                .with_description("number of chain reorganizations")
                .build(),
        }
    }
}
