mod backfill;
mod block_fetch;
mod chain;
mod error;
mod events;
mod head_tracker;
mod logs;
mod metrics;

pub use self::backfill::{
    BackfillOptions, BackfillReport, BackfillTask, LogBackfillPipeline, TaskKind, TaskState,
};
pub use self::block_fetch::{
    BlockFetchCoordinator, BlockFetchFailure, BlockFetchResult, BlockFetchService, BlockTicket,
};
pub use self::chain::{ChainError, ReorgWindow};
pub use self::error::{IngestionError, IngestionErrorExt};
pub use self::events::{EventEmitter, SyncEvent};
pub use self::head_tracker::{HeadTracker, HeadTrackerOptions, TickOutcome, TrackerState};
pub use self::logs::{
    fetch_factory_events, fetch_source_logs, group_logs_by_block, parse_logs, LogBatch,
};
