use alloy_primitives::B256;
use tokio::sync::mpsc;

/// Progress notifications emitted while syncing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    BackfillStarted {
        source: String,
        total_blocks: u64,
        cached_blocks: u64,
    },
    /// A log task fetched and stored its logs. Its blocks may still be pending.
    LogTaskCompleted { source: String },
    LogTaskFailed {
        source: String,
        error: String,
        /// The task exhausted its attempts and will not be retried.
        dead_letter: bool,
    },
    BlockTasksAdded { source: String, count: usize },
    NewEventsAdded { network: String, count: usize },
    Reorg {
        network: String,
        common_ancestor_number: u64,
        common_ancestor_hash: B256,
        depth: u64,
    },
    Finalized { network: String, block_number: u64 },
    RealtimeFatal { network: String, reason: String },
}

/// Fire-and-forget sender of [SyncEvent]s.
///
/// Emitting never blocks and never fails, even without a listener.
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    tx: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl EventEmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// An emitter that drops every event.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: SyncEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
