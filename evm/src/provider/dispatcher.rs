use std::{
    fmt::{self, Debug},
    num::NonZeroU32,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use alloy_primitives::{Address, B256, U64};
use backon::Retryable;
use error_stack::{Report, Result, ResultExt};
use evm_sync_observability::{KeyValue, RecordRequest};
use futures::{future::join_all, Future};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::source::Topics;

use super::{
    metrics::DispatcherMetrics,
    models::{Block, LightBlock, RawLog},
    retry::{classify, FailureClass, RetryOptions},
    transport::{RpcFailure, RpcTransport},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The request failed with an error that retrying cannot fix.
    Terminal,
    /// `eth_getLogs` covered too many blocks. Never retried as is.
    RangeTooLarge { suggested: Option<(u64, u64)> },
    RetriesExhausted,
    NotFound,
    Decode,
    /// The dispatcher shut down before answering.
    Closed,
}

pub trait DispatchErrorExt {
    fn dispatch_error(&self) -> Option<&DispatchError>;

    fn is_range_too_large(&self) -> bool {
        matches!(
            self.dispatch_error(),
            Some(DispatchError::RangeTooLarge { .. })
        )
    }

    fn suggested_range(&self) -> Option<(u64, u64)> {
        match self.dispatch_error() {
            Some(DispatchError::RangeTooLarge { suggested }) => *suggested,
            _ => None,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self.dispatch_error(), Some(DispatchError::Terminal))
    }

    fn is_not_found(&self) -> bool {
        matches!(self.dispatch_error(), Some(DispatchError::NotFound))
    }

    fn is_closed(&self) -> bool {
        matches!(self.dispatch_error(), Some(DispatchError::Closed))
    }
}

/// Works on any report that has a dispatch error somewhere in its chain.
impl<C> DispatchErrorExt for Report<C> {
    fn dispatch_error(&self) -> Option<&DispatchError> {
        self.downcast_ref::<DispatchError>()
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Maximum number of requests started per second, across all workers.
    pub max_requests_per_second: u32,
    pub retry: RetryOptions,
    /// Timeout of a single attempt.
    pub request_timeout: Duration,
}

/// Block selector for `eth_getBlockByNumber`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Finalized,
    Number(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRange {
    Blocks { from: u64, to: u64 },
    BlockHash(B256),
}

/// An `eth_getLogs` filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    /// `None` matches any address.
    pub addresses: Option<Vec<Address>>,
    pub topics: Topics,
    pub range: LogRange,
}

pub struct DispatcherService {
    network: Arc<str>,
    transport: Arc<dyn RpcTransport>,
    options: DispatcherOptions,
    metrics: DispatcherMetrics,
}

/// Client side of the dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    network: Arc<str>,
    tx: async_channel::Sender<DispatchRequest>,
}

struct DispatchRequest {
    method: &'static str,
    params: Value,
    enqueued_at: Instant,
    reply: oneshot::Sender<Result<Value, DispatchError>>,
}

struct DispatchWorker {
    worker_index: usize,
    network: Arc<str>,
    transport: Arc<dyn RpcTransport>,
    limiter: Arc<DefaultDirectRateLimiter>,
    options: DispatcherOptions,
    metrics: DispatcherMetrics,
}

impl DispatcherService {
    pub fn new(network: impl Into<String>, transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            network: network.into().into(),
            transport,
            options: DispatcherOptions::default(),
            metrics: DispatcherMetrics::default(),
        }
    }

    pub fn with_options(mut self, options: DispatcherOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the dispatcher client and the future driving the workers.
    ///
    /// Requests still queued when the future completes fail with
    /// [DispatchError::Closed].
    pub fn start(
        self,
        ct: CancellationToken,
    ) -> (Dispatcher, impl Future<Output = Result<(), DispatchError>>) {
        let (tx, rx) = async_channel::unbounded();
        let concurrency = self.options.concurrency();
        let limiter = Arc::new(new_limiter(self.options.max_requests_per_second));

        info!(
            network = %self.network,
            rate_limit = self.options.max_requests_per_second,
            concurrency,
            "starting rpc dispatcher"
        );

        let network = self.network.clone();
        let fut = async move {
            let workers = (0..concurrency)
                .map(|worker_index| {
                    let worker = DispatchWorker {
                        worker_index,
                        network: self.network.clone(),
                        transport: self.transport.clone(),
                        limiter: limiter.clone(),
                        options: self.options.clone(),
                        metrics: self.metrics.clone(),
                    };
                    tokio::spawn(worker.start(rx.clone(), ct.clone()))
                })
                .collect::<Vec<_>>();

            let results = join_all(workers).await;
            rx.close();

            // Closing keeps the buffered requests alive, fail them explicitly.
            let mut dropped = 0;
            while let Ok(request) = rx.try_recv() {
                dropped += 1;
                let _ = request.reply.send(
                    Err(DispatchError::Closed)
                        .attach_printable("rpc dispatcher shut down before sending the request")
                        .attach_printable_lazy(|| format!("method: {}", request.method)),
                );
            }

            if dropped > 0 {
                debug!(network = %self.network, dropped, "failed queued rpc requests");
            }

            let failed = results.iter().filter(|result| result.is_err()).count();
            if failed > 0 {
                return Err(DispatchError::Closed)
                    .attach_printable("rpc worker panicked")
                    .attach_printable_lazy(|| format!("failed workers: {failed}"));
            }

            info!(network = %self.network, "rpc dispatcher stopped");
            Ok(())
        };

        (Dispatcher { network, tx }, fut)
    }
}

impl Dispatcher {
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Enqueue a request and wait for its final outcome.
    pub async fn request(&self, method: &'static str, params: Value) -> Result<Value, DispatchError> {
        let (reply, rx) = oneshot::channel();
        let request = DispatchRequest {
            method,
            params,
            enqueued_at: Instant::now(),
            reply,
        };

        if self.tx.send(request).await.is_err() {
            return Err(DispatchError::Closed)
                .attach_printable("rpc dispatcher is shut down")
                .attach_printable_lazy(|| format!("method: {method}"));
        }

        rx.await
            .change_context(DispatchError::Closed)
            .attach_printable("rpc dispatcher dropped the request")
            .attach_printable_lazy(|| format!("method: {method}"))?
    }

    async fn request_as<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<T, DispatchError> {
        let value = self.request(method, params).await?;
        serde_json::from_value(value)
            .change_context(DispatchError::Decode)
            .attach_printable_lazy(|| format!("failed to decode {method} response"))
    }

    pub async fn chain_id(&self) -> Result<u64, DispatchError> {
        let chain_id: U64 = self.request_as("eth_chainId", json!([])).await?;
        Ok(chain_id.to::<u64>())
    }

    #[instrument(skip(self), err(Debug))]
    pub async fn get_logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, DispatchError> {
        self.request_as("eth_getLogs", query.to_params()).await
    }

    pub async fn get_block_by_number(
        &self,
        tag: BlockTag,
        full_transactions: bool,
    ) -> Result<Block, DispatchError> {
        let block: Option<Block> = self
            .request_as(
                "eth_getBlockByNumber",
                json!([tag.to_param(), full_transactions]),
            )
            .await?;

        block
            .ok_or(DispatchError::NotFound)
            .attach_printable_lazy(|| format!("block not found: {tag:?}"))
    }

    pub async fn get_block_by_hash(
        &self,
        hash: B256,
        full_transactions: bool,
    ) -> Result<Block, DispatchError> {
        let block: Option<Block> = self
            .request_as("eth_getBlockByHash", json!([hash, full_transactions]))
            .await?;

        block
            .ok_or(DispatchError::NotFound)
            .attach_printable_lazy(|| format!("block not found: {hash:#x}"))
    }

    pub async fn get_light_block_by_hash(&self, hash: B256) -> Result<LightBlock, DispatchError> {
        Ok(self.get_block_by_hash(hash, false).await?.light())
    }

    pub async fn get_latest_block(&self) -> Result<LightBlock, DispatchError> {
        Ok(self
            .get_block_by_number(BlockTag::Latest, false)
            .await?
            .light())
    }
}

impl DispatchWorker {
    async fn start(self, rx: async_channel::Receiver<DispatchRequest>, ct: CancellationToken) {
        trace!(network = %self.network, index = self.worker_index, "starting rpc worker");

        loop {
            tokio::select! {
                biased;

                _ = ct.cancelled() => break,

                request = rx.recv() => {
                    match request {
                        Err(_) => break,
                        Ok(request) => self.handle_request(request, &ct).await,
                    }
                }
            }
        }

        trace!(network = %self.network, index = self.worker_index, "rpc worker finished");
    }

    async fn handle_request(&self, request: DispatchRequest, ct: &CancellationToken) {
        let attributes = [
            KeyValue::new("network", self.network.to_string()),
            KeyValue::new("method", request.method),
        ];

        self.metrics
            .queue_lag
            .record(request.enqueued_at.elapsed().as_secs_f64(), &attributes);

        // A request already picked up runs to completion, but is not retried
        // after shutdown.
        let response = self
            .send_with_retry(request.method, &request.params, &attributes, ct)
            .await;

        // The caller may have given up on the request.
        let _ = request.reply.send(response);
    }

    async fn send_with_retry(
        &self,
        method: &'static str,
        params: &Value,
        attributes: &[KeyValue],
        ct: &CancellationToken,
    ) -> Result<Value, DispatchError> {
        let attempts = AtomicUsize::new(0);
        let attempts = &attempts;

        let response = (move || async move {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            self.limiter.until_ready().await;

            trace!(
                network = %self.network,
                index = self.worker_index,
                method,
                attempt,
                "sending rpc request"
            );

            let request = self
                .transport
                .request(method, params.clone())
                .record_request_with_attributes(self.metrics.rpc.clone(), attributes);

            match tokio::time::timeout(self.options.request_timeout, request).await {
                Ok(response) => response,
                Err(_) => Err(RpcFailure::Timeout),
            }
        })
        .retry(self.options.retry.backoff())
        .when(|failure: &RpcFailure| {
            !ct.is_cancelled() && classify(method, params, failure).is_retryable()
        })
        .notify(|failure: &RpcFailure, delay: Duration| {
            self.metrics.retries.add(1, attributes);
            debug!(
                network = %self.network,
                method,
                attempt = attempts.load(Ordering::Relaxed),
                delay = ?delay,
                error = %failure,
                "retrying rpc request"
            );
        })
        .await;

        let attempts = attempts.load(Ordering::Relaxed);

        response.map_err(|failure| {
            let context = match classify(method, params, &failure) {
                FailureClass::Terminal => DispatchError::Terminal,
                FailureClass::RangeTooLarge { suggested } => {
                    DispatchError::RangeTooLarge { suggested }
                }
                FailureClass::Retryable if ct.is_cancelled() => DispatchError::Closed,
                FailureClass::Retryable => DispatchError::RetriesExhausted,
            };

            if !matches!(context, DispatchError::RangeTooLarge { .. }) {
                warn!(
                    network = %self.network,
                    method,
                    attempts,
                    error = %failure,
                    "rpc request failed"
                );
            }

            Report::new(failure)
                .change_context(context)
                .attach_printable(format!("method: {method}"))
                .attach_printable(format!("attempts: {attempts}"))
        })
    }
}

fn new_limiter(max_requests_per_second: u32) -> DefaultDirectRateLimiter {
    let rate = NonZeroU32::new(max_requests_per_second).unwrap_or(NonZeroU32::MIN);
    // No bursts: requests are spread evenly over the second.
    let quota = Quota::per_second(rate).allow_burst(NonZeroU32::MIN);
    RateLimiter::direct(quota)
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            max_requests_per_second: 50,
            retry: RetryOptions::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatcherOptions {
    pub fn with_max_requests_per_second(mut self, max_requests_per_second: u32) -> Self {
        self.max_requests_per_second = max_requests_per_second;
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Number of requests in flight at the same time.
    pub fn concurrency(&self) -> usize {
        (self.max_requests_per_second as usize / 4).max(1)
    }
}

impl BlockTag {
    fn to_param(self) -> Value {
        match self {
            BlockTag::Latest => json!("latest"),
            BlockTag::Finalized => json!("finalized"),
            BlockTag::Number(number) => json!(format!("{number:#x}")),
        }
    }
}

impl LogQuery {
    pub fn blocks(from: u64, to: u64) -> Self {
        Self {
            addresses: None,
            topics: Topics::default(),
            range: LogRange::Blocks { from, to },
        }
    }

    pub fn block_hash(hash: B256) -> Self {
        Self {
            addresses: None,
            topics: Topics::default(),
            range: LogRange::BlockHash(hash),
        }
    }

    pub fn with_addresses(mut self, addresses: Vec<Address>) -> Self {
        self.addresses = Some(addresses);
        self
    }

    pub fn with_topics(mut self, topics: Topics) -> Self {
        self.topics = topics;
        self
    }

    pub fn to_params(&self) -> Value {
        let mut filter = Map::new();

        match self.addresses.as_deref() {
            None => {}
            Some([address]) => {
                filter.insert("address".to_string(), json!(address));
            }
            Some(addresses) => {
                filter.insert("address".to_string(), json!(addresses));
            }
        }

        let topics = self.topics.to_json();
        if topics.as_array().map_or(false, |t| !t.is_empty()) {
            filter.insert("topics".to_string(), topics);
        }

        match self.range {
            LogRange::Blocks { from, to } => {
                filter.insert("fromBlock".to_string(), json!(format!("{from:#x}")));
                filter.insert("toBlock".to_string(), json!(format!("{to:#x}")));
            }
            LogRange::BlockHash(hash) => {
                filter.insert("blockHash".to_string(), json!(hash));
            }
        }

        Value::Array(vec![Value::Object(filter)])
    }
}

impl Debug for DispatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRequest")
            .field("method", &self.method)
            .field("params", &self.params)
            .finish()
    }
}

impl error_stack::Context for DispatchError {}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Terminal => write!(f, "rpc request failed with a non-retryable error"),
            DispatchError::RangeTooLarge { suggested: None } => {
                write!(f, "eth_getLogs block range too large")
            }
            DispatchError::RangeTooLarge {
                suggested: Some((from, to)),
            } => write!(
                f,
                "eth_getLogs block range too large, suggested range [{from}, {to}]"
            ),
            DispatchError::RetriesExhausted => write!(f, "rpc request failed after all retries"),
            DispatchError::NotFound => write!(f, "not found"),
            DispatchError::Decode => write!(f, "failed to decode rpc response"),
            DispatchError::Closed => write!(f, "rpc dispatcher closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::address;

    use super::*;
    use crate::source::TopicFilter;

    #[test]
    fn test_concurrency_is_a_quarter_of_the_rate_limit() {
        let options = DispatcherOptions::default();
        assert_eq!(options.clone().with_max_requests_per_second(50).concurrency(), 12);
        assert_eq!(options.clone().with_max_requests_per_second(4).concurrency(), 1);
        assert_eq!(options.with_max_requests_per_second(1).concurrency(), 1);
    }

    #[test]
    fn test_log_query_params() {
        let a = address!("0000000000000000000000000000000000000001");
        let b = address!("0000000000000000000000000000000000000002");

        let params = LogQuery::blocks(100, 150).with_addresses(vec![a]).to_params();
        assert_eq!(
            params,
            json!([{
                "address": "0x0000000000000000000000000000000000000001",
                "fromBlock": "0x64",
                "toBlock": "0x96",
            }])
        );

        let mut topics = Topics::default();
        topics.0[1] = TopicFilter::Exact(B256::ZERO);
        let params = LogQuery::block_hash(B256::ZERO)
            .with_addresses(vec![a, b])
            .with_topics(topics)
            .to_params();
        assert_eq!(params[0]["address"].as_array().map(Vec::len), Some(2));
        assert_eq!(params[0]["topics"][0], Value::Null);
        assert!(params[0].get("fromBlock").is_none());
        assert!(params[0].get("blockHash").is_some());
    }

    #[test]
    fn test_dispatch_error_ext_finds_context_in_chain() {
        #[derive(Debug)]
        struct Outer;
        impl error_stack::Context for Outer {}
        impl fmt::Display for Outer {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("outer")
            }
        }

        let report = Report::new(DispatchError::RangeTooLarge {
            suggested: Some((1, 2)),
        })
        .change_context(Outer);

        assert!(report.is_range_too_large());
        assert_eq!(report.suggested_range(), Some((1, 2)));
        assert!(!report.is_terminal());
    }
}
