use error_stack::Report;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionError {
    RpcRequest,
    Store,
    /// Fetching a required block failed.
    BlockFetch,
    /// The block fetch coordinator is gone.
    CoordinatorClosed,
    /// The local chain would break the parent hash invariant.
    Chain,
    /// No common ancestor within the retained block history.
    ReorgTooDeep,
}

pub trait IngestionErrorExt {
    fn is_reorg_too_deep(&self) -> bool;
}

impl IngestionErrorExt for Report<IngestionError> {
    fn is_reorg_too_deep(&self) -> bool {
        matches!(self.current_context(), IngestionError::ReorgTooDeep)
    }
}

impl error_stack::Context for IngestionError {}

impl std::fmt::Display for IngestionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestionError::RpcRequest => write!(f, "ingestion error: rpc request error"),
            IngestionError::Store => write!(f, "ingestion error: store error"),
            IngestionError::BlockFetch => write!(f, "ingestion error: block fetch failed"),
            IngestionError::CoordinatorClosed => {
                write!(f, "ingestion error: block fetch coordinator closed")
            }
            IngestionError::Chain => write!(f, "ingestion error: inconsistent chain"),
            IngestionError::ReorgTooDeep => {
                write!(f, "ingestion error: reorg deeper than the retained history")
            }
        }
    }
}
