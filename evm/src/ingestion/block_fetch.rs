//! Fetch every required block exactly once, no matter how many tasks need it.
use std::{
    collections::{hash_map::Entry, BTreeSet, HashMap},
    fmt,
    sync::Arc,
};

use alloy_primitives::B256;
use error_stack::{Report, Result, ResultExt};
use evm_sync_observability::KeyValue;
use futures::{future::BoxFuture, stream::FuturesUnordered, Future, FutureExt, StreamExt};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    provider::{
        models::{Block, Transaction},
        DispatchError, Dispatcher,
    },
    store::CacheStore,
};

use super::{error::IngestionError, metrics::IngestionMetrics};

pub type BlockFetchResult = std::result::Result<Arc<Block>, BlockFetchFailure>;

/// Failure shared with every task waiting on the same block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFetchFailure {
    pub block_hash: B256,
    /// Set when the block request failed, `None` when storing it did.
    pub error: Option<DispatchError>,
    pub reason: String,
}

pub struct BlockFetchService {
    network: Arc<str>,
    chain_id: u64,
    dispatcher: Dispatcher,
    store: Arc<dyn CacheStore>,
    metrics: IngestionMetrics,
}

/// Handle to register interest in blocks. Cheap to clone.
#[derive(Clone)]
pub struct BlockFetchCoordinator {
    tx: mpsc::UnboundedSender<BlockFetchCommand>,
}

/// Resolves once the required block and transactions are stored.
pub struct BlockTicket {
    block_hash: B256,
    rx: oneshot::Receiver<BlockFetchResult>,
}

enum BlockFetchCommand {
    Require {
        block_hash: B256,
        transaction_hashes: BTreeSet<B256>,
        reply: oneshot::Sender<BlockFetchResult>,
    },
}

/// A block with an outstanding fetch.
struct PendingBlock {
    /// Union of the transactions required by all waiters.
    transaction_hashes: BTreeSet<B256>,
    waiters: Vec<oneshot::Sender<BlockFetchResult>>,
}

type FetchFuture = BoxFuture<'static, (B256, Result<Block, DispatchError>)>;

impl BlockFetchService {
    pub fn new(
        network: impl Into<String>,
        chain_id: u64,
        dispatcher: Dispatcher,
        store: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            network: network.into().into(),
            chain_id,
            dispatcher,
            store,
            metrics: IngestionMetrics::default(),
        }
    }

    pub fn start(
        self,
        ct: CancellationToken,
    ) -> (
        BlockFetchCoordinator,
        impl Future<Output = Result<(), IngestionError>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BlockFetchCoordinator { tx }, self.run(rx, ct))
    }

    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<BlockFetchCommand>,
        ct: CancellationToken,
    ) -> Result<(), IngestionError> {
        info!(network = %self.network, "starting block fetch coordinator");

        let mut pending = HashMap::<B256, PendingBlock>::new();
        let mut in_flight = FuturesUnordered::<FetchFuture>::new();
        let mut persisting = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = ct.cancelled() => break,

                Some((block_hash, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    let Some(block) = pending.remove(&block_hash) else {
                        continue;
                    };
                    self.complete(block_hash, block, result, &mut persisting);
                }

                Some(joined) = persisting.join_next(), if !persisting.is_empty() => {
                    if let Err(err) = joined {
                        warn!(network = %self.network, error = ?err, "block persist task failed");
                    }
                }

                command = rx.recv() => {
                    let Some(BlockFetchCommand::Require { block_hash, transaction_hashes, reply }) = command else {
                        break;
                    };

                    match pending.entry(block_hash) {
                        Entry::Occupied(mut entry) => {
                            trace!(block_hash = %block_hash, "block fetch already in flight");
                            let block = entry.get_mut();
                            block.transaction_hashes.extend(transaction_hashes);
                            block.waiters.push(reply);
                        }
                        Entry::Vacant(entry) => {
                            trace!(block_hash = %block_hash, "fetching block");
                            entry.insert(PendingBlock {
                                transaction_hashes,
                                waiters: vec![reply],
                            });
                            in_flight.push(self.fetch_block(block_hash));
                        }
                    }
                }
            }
        }

        // Blocks already fetched are stored before returning.
        while let Some(joined) = persisting.join_next().await {
            if let Err(err) = joined {
                warn!(network = %self.network, error = ?err, "block persist task failed");
            }
        }

        // Dropping the waiters' senders fails their tickets.
        debug!(
            network = %self.network,
            pending = pending.len(),
            "block fetch coordinator stopped"
        );

        Ok(())
    }

    fn fetch_block(&self, block_hash: B256) -> FetchFuture {
        let dispatcher = self.dispatcher.clone();
        async move {
            let result = dispatcher.get_block_by_hash(block_hash, true).await;
            (block_hash, result)
        }
        .boxed()
    }

    /// Persist the block and notify every waiter, in a separate task so that
    /// new requirements keep flowing.
    fn complete(
        &self,
        block_hash: B256,
        block: PendingBlock,
        result: Result<Block, DispatchError>,
        persisting: &mut JoinSet<()>,
    ) {
        let fetched = match result {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(
                    network = %self.network,
                    block_hash = %block_hash,
                    error = ?err,
                    "failed to fetch block"
                );
                notify(
                    block.waiters,
                    Err(BlockFetchFailure {
                        block_hash,
                        error: Some(err.current_context().clone()),
                        reason: format!("{err:?}"),
                    }),
                );
                return;
            }
        };

        self.metrics
            .blocks_fetched
            .add(1, &[KeyValue::new("network", self.network.to_string())]);

        let network = self.network.clone();
        let store = self.store.clone();
        let chain_id = self.chain_id;

        persisting.spawn(async move {
            let result = persist_block(store.as_ref(), chain_id, fetched, &block.transaction_hashes)
                .await
                .map_err(|err| {
                    warn!(
                        network = %network,
                        block_hash = %block_hash,
                        error = ?err,
                        "failed to store block"
                    );
                    BlockFetchFailure {
                        block_hash,
                        error: None,
                        reason: format!("{err:?}"),
                    }
                });
            notify(block.waiters, result);
        });
    }
}

async fn persist_block(
    store: &dyn CacheStore,
    chain_id: u64,
    block: Block,
    required: &BTreeSet<B256>,
) -> Result<Arc<Block>, IngestionError> {
    let (header, transactions) = block.split_transactions();

    let transactions = transactions
        .into_iter()
        .filter(|tx| required.contains(&tx.hash))
        .collect::<Vec<Transaction>>();

    if transactions.len() < required.len() {
        warn!(
            block_hash = %header.hash,
            required = required.len(),
            found = transactions.len(),
            "block is missing required transactions"
        );
    }

    store
        .insert_transactions(chain_id, &transactions)
        .await
        .change_context(IngestionError::Store)
        .attach_printable("failed to insert transactions")?;

    store
        .insert_block(chain_id, &header)
        .await
        .change_context(IngestionError::Store)
        .attach_printable("failed to insert block")?;

    debug!(block = %header.number, transactions = transactions.len(), "block stored");

    Ok(Arc::new(header))
}

fn notify(waiters: Vec<oneshot::Sender<BlockFetchResult>>, result: BlockFetchResult) {
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
}

impl BlockFetchCoordinator {
    /// Register interest in a block and the given transactions.
    ///
    /// Never blocks. If a fetch for the block is in flight, the transactions
    /// join it instead of starting a new one.
    pub fn require(
        &self,
        block_hash: B256,
        transaction_hashes: impl IntoIterator<Item = B256>,
    ) -> BlockTicket {
        let (reply, rx) = oneshot::channel();
        let command = BlockFetchCommand::Require {
            block_hash,
            transaction_hashes: transaction_hashes.into_iter().collect(),
            reply,
        };

        // If the coordinator is gone the reply sender is dropped with the
        // command and the ticket fails.
        let _ = self.tx.send(command);

        BlockTicket { block_hash, rx }
    }
}

impl BlockTicket {
    pub fn block_hash(&self) -> B256 {
        self.block_hash
    }

    pub async fn wait(self) -> Result<Arc<Block>, IngestionError> {
        let block_hash = self.block_hash;
        match self.rx.await {
            Ok(Ok(block)) => Ok(block),
            Ok(Err(failure)) => {
                // Keep the dispatch error in the chain so callers can classify it.
                let report = match failure.error.clone() {
                    Some(error) => Report::new(error).change_context(failure),
                    None => Report::new(failure),
                };
                Err(report.change_context(IngestionError::BlockFetch))
            }
            Err(_) => Err(IngestionError::CoordinatorClosed)
                .attach_printable_lazy(|| format!("block hash: {block_hash:#x}")),
        }
    }
}

impl error_stack::Context for BlockFetchFailure {}

impl fmt::Display for BlockFetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to fetch block {:#x}: {}",
            self.block_hash, self.reason
        )
    }
}
