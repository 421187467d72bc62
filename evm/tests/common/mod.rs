#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy_primitives::{Address, Bloom, Bytes, B256, U256};
use evm_sync::{
    provider::{
        models::{Block, BlockTransactions, RawLog, Transaction},
        Dispatcher, DispatcherOptions, DispatcherService, RpcFailure, RpcTransport,
    },
    source::{
        AddressFilter, ChildAddressLocation, FactoryCriteria, LogFilterCriteria, SharedSource,
        Source, SourceCriteria, Topics,
    },
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wiremock::{http::Method, Match, Request, Respond, ResponseTemplate};

pub const CHAIN_ID: u64 = 1;

pub fn block_hash(number: u64, fork: u8) -> B256 {
    let mut hash = [0u8; 32];
    hash[0] = 0xbb;
    hash[1] = fork;
    hash[24..].copy_from_slice(&number.to_be_bytes());
    B256::from(hash)
}

pub fn transaction_hash(number: u64, fork: u8, index: u64) -> B256 {
    let mut hash = [0u8; 32];
    hash[0] = 0x77;
    hash[1] = fork;
    hash[8..16].copy_from_slice(&index.to_be_bytes());
    hash[24..].copy_from_slice(&number.to_be_bytes());
    B256::from(hash)
}

/// A request received by the [MockChain].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub params: Value,
    pub at: Instant,
}

/// An in memory chain answering JSON-RPC requests.
///
/// Blocks are identified by number and fork. Fork `0` is the initial chain.
#[derive(Clone, Default)]
pub struct MockChain {
    inner: Arc<Mutex<MockChainInner>>,
}

#[derive(Default)]
struct MockChainInner {
    chain_id: u64,
    blocks: HashMap<B256, Block>,
    canonical: BTreeMap<u64, B256>,
    logs: HashMap<B256, Vec<RawLog>>,
    pending_logs: Vec<RawLog>,
    failures: HashMap<String, VecDeque<RpcFailure>>,
    max_log_range: Option<u64>,
    delays: HashMap<String, Duration>,
    /// `eth_getLogs` delays by `fromBlock`.
    log_delays: HashMap<u64, Duration>,
    calls: Vec<RecordedCall>,
}

impl MockChain {
    /// A chain with blocks `0..=head` on fork 0.
    pub fn new(head: u64) -> Self {
        let chain = Self::default();
        {
            let mut inner = chain.lock();
            inner.chain_id = CHAIN_ID;
            for number in 0..=head {
                inner.push_block(number, 0);
            }
        }
        chain
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockChainInner> {
        self.inner.lock().expect("mock chain lock poisoned")
    }

    pub fn head(&self) -> Block {
        let inner = self.lock();
        let (_, hash) = inner.canonical.last_key_value().expect("empty chain");
        inner.blocks[hash].clone()
    }

    pub fn canonical_block(&self, number: u64) -> Block {
        let inner = self.lock();
        inner.blocks[&inner.canonical[&number]].clone()
    }

    /// Extend the canonical chain by one block on `fork`.
    pub fn mine(&self, fork: u8) -> Block {
        let mut inner = self.lock();
        let number = inner.canonical.keys().last().map_or(0, |n| n + 1);
        inner.push_block(number, fork)
    }

    /// Replace the canonical blocks from `from_number` with `count` blocks on `fork`.
    pub fn reorg(&self, from_number: u64, count: u64, fork: u8) {
        let mut inner = self.lock();
        inner.canonical.retain(|number, _| *number < from_number);
        for number in from_number..from_number + count {
            inner.push_block(number, fork);
        }
    }

    /// Add a log emitted by `address` in the canonical block `number`.
    ///
    /// The log's transaction is added to the block.
    pub fn add_log(&self, number: u64, address: Address, topics: Vec<B256>, tx_index: u64) -> RawLog {
        let mut inner = self.lock();
        let hash = inner.canonical[&number];
        let fork = hash[1];
        let tx_hash = transaction_hash(number, fork, tx_index);

        let block = inner.blocks.get_mut(&hash).expect("block exists");
        let BlockTransactions::Full(transactions) = &mut block.transactions else {
            panic!("mock blocks have full transactions");
        };
        if !transactions.iter().any(|tx| tx.hash == tx_hash) {
            transactions.push(Transaction {
                hash: tx_hash,
                block_hash: Some(hash),
                block_number: Some(number),
                transaction_index: Some(tx_index),
                from: Address::repeat_byte(0xee),
                to: Some(address),
                value: U256::ZERO,
                input: Bytes::new(),
                nonce: tx_index,
            });
        }

        let logs = inner.logs.entry(hash).or_default();
        let log = RawLog {
            address,
            topics,
            data: Bytes::new(),
            block_hash: Some(hash),
            block_number: Some(number),
            transaction_hash: Some(tx_hash),
            transaction_index: Some(tx_index),
            log_index: Some(logs.len() as u64),
            removed: false,
        };
        logs.push(log.clone());
        log
    }

    /// Add a log without block information, returned by every `eth_getLogs`.
    pub fn add_pending_log(&self, address: Address) {
        self.lock().pending_logs.push(RawLog {
            address,
            topics: vec![],
            data: Bytes::new(),
            block_hash: None,
            block_number: None,
            transaction_hash: None,
            transaction_index: None,
            log_index: None,
            removed: false,
        });
    }

    /// Fail the next `times` calls to `method`.
    pub fn fail_next(&self, method: &str, failure: RpcFailure, times: usize) {
        let mut inner = self.lock();
        let queue = inner.failures.entry(method.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(failure.clone());
        }
    }

    /// `eth_getLogs` over more than `max` blocks fails.
    pub fn set_max_log_range(&self, max: u64) {
        self.lock().max_log_range = Some(max);
    }

    /// Answer `method` only after `delay`.
    pub fn set_delay(&self, method: &str, delay: Duration) {
        self.lock().delays.insert(method.to_string(), delay);
    }

    /// Answer `eth_getLogs` starting at `from_block` only after `delay`.
    pub fn set_log_delay(&self, from_block: u64, delay: Duration) {
        self.lock().log_delays.insert(from_block, delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.method == method)
            .cloned()
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls_to(method).len()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn start_dispatcher(&self, ct: CancellationToken) -> Dispatcher {
        start_dispatcher(Arc::new(self.clone()), ct)
    }
}

impl MockChainInner {
    fn push_block(&mut self, number: u64, fork: u8) -> Block {
        let parent_hash = match number.checked_sub(1) {
            None => B256::ZERO,
            Some(parent) => self.canonical[&parent],
        };

        let block = Block {
            hash: block_hash(number, fork),
            parent_hash,
            number,
            timestamp: 1_000 + number * 12,
            logs_bloom: Bloom::ZERO,
            miner: Address::ZERO,
            gas_limit: 30_000_000,
            gas_used: 0,
            base_fee_per_gas: None,
            transactions: BlockTransactions::Full(Vec::new()),
        };

        self.canonical.insert(number, block.hash);
        self.blocks.insert(block.hash, block.clone());
        block
    }

    fn get_logs(&self, filter: &Value) -> Result<Value, RpcFailure> {
        let from = quantity(&filter["fromBlock"]);
        let to = quantity(&filter["toBlock"]);

        if let (Some(max), Some(from), Some(to)) = (self.max_log_range, from, to) {
            if to - from + 1 > max {
                return Err(RpcFailure::JsonRpc {
                    code: -32005,
                    message: "query returned more than 10000 results".to_string(),
                });
            }
        }

        let addresses = match &filter["address"] {
            Value::Null => None,
            Value::String(address) => Some(vec![address.parse::<Address>().expect("address")]),
            Value::Array(addresses) => Some(
                addresses
                    .iter()
                    .map(|a| a.as_str().expect("address").parse::<Address>().expect("address"))
                    .collect::<Vec<_>>(),
            ),
            other => panic!("invalid address filter: {other}"),
        };

        let topic0 = filter["topics"]
            .get(0)
            .and_then(Value::as_str)
            .map(|t| t.parse::<B256>().expect("topic"));

        let hashes: Vec<B256> = match (from, to, filter["blockHash"].as_str()) {
            (Some(from), Some(to), _) => self
                .canonical
                .range(from..=to)
                .map(|(_, hash)| *hash)
                .collect(),
            (_, _, Some(hash)) => vec![hash.parse::<B256>().expect("hash")],
            _ => panic!("invalid log filter: {filter}"),
        };

        let mut logs = hashes
            .iter()
            .flat_map(|hash| self.logs.get(hash).cloned().unwrap_or_default())
            .chain(self.pending_logs.iter().cloned())
            .filter(|log| {
                addresses
                    .as_ref()
                    .map_or(true, |addresses| addresses.contains(&log.address))
            })
            .filter(|log| {
                topic0.map_or(true, |topic| log.block_hash.is_none() || log.topics.first() == Some(&topic))
            })
            .collect::<Vec<_>>();
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        Ok(serde_json::to_value(logs).expect("serialize logs"))
    }

    fn block(&self, hash: &B256, full: bool) -> Value {
        match self.blocks.get(hash) {
            None => Value::Null,
            Some(block) => {
                let mut block = block.clone();
                if !full {
                    block.transactions = BlockTransactions::Hashes(block.transactions.hashes());
                }
                serde_json::to_value(block).expect("serialize block")
            }
        }
    }
}

#[async_trait::async_trait]
impl RpcTransport for MockChain {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcFailure> {
        let delay = {
            let mut inner = self.lock();
            inner.calls.push(RecordedCall {
                method: method.to_string(),
                params: params.clone(),
                at: Instant::now(),
            });
            let log_delay = match method {
                "eth_getLogs" => quantity(&params[0]["fromBlock"])
                    .and_then(|from| inner.log_delays.get(&from).copied()),
                _ => None,
            };
            log_delay.or_else(|| inner.delays.get(method).copied())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();

        if let Some(failure) = inner
            .failures
            .get_mut(method)
            .and_then(|queue| queue.pop_front())
        {
            return Err(failure);
        }

        match method {
            "eth_chainId" => Ok(json!(format!("{:#x}", inner.chain_id))),
            "eth_getLogs" => inner.get_logs(&params[0]),
            "eth_getBlockByHash" => {
                let hash = params[0].as_str().expect("hash").parse::<B256>().expect("hash");
                let full = params[1].as_bool().unwrap_or(false);
                Ok(inner.block(&hash, full))
            }
            "eth_getBlockByNumber" => {
                let full = params[1].as_bool().unwrap_or(false);
                let number = match params[0].as_str() {
                    Some("latest") | Some("finalized") => {
                        inner.canonical.keys().last().copied()
                    }
                    Some(number) => quantity(&json!(number)),
                    None => None,
                };
                match number.and_then(|n| inner.canonical.get(&n).copied()) {
                    None => Ok(Value::Null),
                    Some(hash) => Ok(inner.block(&hash, full)),
                }
            }
            _ => Err(RpcFailure::JsonRpc {
                code: -32601,
                message: format!("the method {method} does not exist"),
            }),
        }
    }
}

fn quantity(value: &Value) -> Option<u64> {
    let digits = value.as_str()?.strip_prefix("0x")?;
    u64::from_str_radix(digits, 16).ok()
}

pub fn start_dispatcher(transport: Arc<dyn RpcTransport>, ct: CancellationToken) -> Dispatcher {
    let options = DispatcherOptions::default().with_max_requests_per_second(1_000);
    let (dispatcher, fut) = DispatcherService::new("mainnet", transport)
        .with_options(options)
        .start(ct);
    tokio::spawn(fut);
    dispatcher
}

pub fn log_filter_source(
    name: &str,
    address: Address,
    start_block: u64,
    end_block: Option<u64>,
    max_block_range: Option<u64>,
) -> SharedSource {
    Arc::new(Source {
        name: name.to_string(),
        network: "mainnet".to_string(),
        chain_id: CHAIN_ID,
        criteria: SourceCriteria::LogFilter(LogFilterCriteria {
            address: Some(AddressFilter::Single(address)),
            topics: Topics::default(),
        }),
        start_block,
        end_block,
        max_block_range,
    })
}

/// A factory source whose event carries the child address in topic 1.
pub fn factory_source(
    name: &str,
    factory: Address,
    event_selector: B256,
    start_block: u64,
    max_block_range: Option<u64>,
) -> SharedSource {
    Arc::new(Source {
        name: name.to_string(),
        network: "mainnet".to_string(),
        chain_id: CHAIN_ID,
        criteria: SourceCriteria::Factory(FactoryCriteria {
            address: factory,
            event_selector,
            child_address_location: ChildAddressLocation::Topic(1),
            topics: Topics::default(),
        }),
        start_block,
        end_block: None,
        max_block_range,
    })
}

/// An address left padded to a topic.
pub fn address_topic(address: Address) -> B256 {
    address.into_word()
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    id: u64,
    method: String,
    params: Value,
}

pub struct RpcRequestMatcher {
    method: String,
}

pub struct RpcResponse {
    result: Value,
}

pub struct RpcErrorResponse {
    code: i64,
    message: String,
}

pub fn rpc_request(method: impl Into<String>) -> RpcRequestMatcher {
    RpcRequestMatcher {
        method: method.into(),
    }
}

impl RpcResponse {
    pub fn new(result: Value) -> Self {
        Self { result }
    }
}

impl RpcErrorResponse {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl Match for RpcRequestMatcher {
    fn matches(&self, req: &Request) -> bool {
        if req.method != Method::POST {
            return false;
        }

        if let Ok(rpc_req) = serde_json::from_slice::<RpcRequest>(&req.body) {
            rpc_req.method == self.method
        } else {
            false
        }
    }
}

impl Respond for RpcResponse {
    fn respond(&self, req: &Request) -> ResponseTemplate {
        if let Ok(rpc_req) = serde_json::from_slice::<RpcRequest>(&req.body) {
            ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": rpc_req.id,
                "result": self.result,
            }))
        } else {
            ResponseTemplate::new(400)
        }
    }
}

impl Respond for RpcErrorResponse {
    fn respond(&self, req: &Request) -> ResponseTemplate {
        if let Ok(rpc_req) = serde_json::from_slice::<RpcRequest>(&req.body) {
            ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": rpc_req.id,
                "error": {
                    "code": self.code,
                    "message": self.message,
                }
            }))
        } else {
            ResponseTemplate::new(400)
        }
    }
}
