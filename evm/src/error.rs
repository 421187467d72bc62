#[derive(Debug)]
pub enum SyncError {
    /// Invalid configuration or command line arguments.
    Configuration,
    /// The RPC node reports a different chain than configured.
    ChainMismatch,
    Rpc,
    Backfill,
    Realtime,
    Fatal,
}

impl error_stack::Context for SyncError {}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Configuration => write!(f, "sync error: configuration error"),
            SyncError::ChainMismatch => write!(f, "sync error: chain id mismatch"),
            SyncError::Rpc => write!(f, "sync error: rpc request error"),
            SyncError::Backfill => write!(f, "sync error: backfill failed"),
            SyncError::Realtime => write!(f, "sync error: realtime sync failed"),
            SyncError::Fatal => write!(f, "sync error: fatal error"),
        }
    }
}
