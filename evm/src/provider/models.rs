pub use alloy_primitives::{Address, Bloom, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// A log as returned by `eth_getLogs`.
///
/// Pending logs have no block or transaction information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(default)]
    pub block_hash: Option<B256>,
    #[serde(default, with = "alloy_serde::quantity::opt")]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    #[serde(default, with = "alloy_serde::quantity::opt")]
    pub transaction_index: Option<u64>,
    #[serde(default, with = "alloy_serde::quantity::opt")]
    pub log_index: Option<u64>,
    #[serde(default)]
    pub removed: bool,
}

/// A log included in a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    pub chain_id: u64,
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_hash: B256,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: B256,
    #[serde(default)]
    pub block_hash: Option<B256>,
    #[serde(default, with = "alloy_serde::quantity::opt")]
    pub block_number: Option<u64>,
    #[serde(default, with = "alloy_serde::quantity::opt")]
    pub transaction_index: Option<u64>,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub value: U256,
    #[serde(default)]
    pub input: Bytes,
    #[serde(default, with = "alloy_serde::quantity")]
    pub nonce: u64,
}

/// Block transactions, either hashes only or full objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlockTransactions {
    Full(Vec<Transaction>),
    Hashes(Vec<B256>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub hash: B256,
    pub parent_hash: B256,
    #[serde(with = "alloy_serde::quantity")]
    pub number: u64,
    #[serde(with = "alloy_serde::quantity")]
    pub timestamp: u64,
    pub logs_bloom: Bloom,
    #[serde(default)]
    pub miner: Address,
    #[serde(default, with = "alloy_serde::quantity")]
    pub gas_limit: u64,
    #[serde(default, with = "alloy_serde::quantity")]
    pub gas_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub transactions: BlockTransactions,
}

/// The minimal block information used to track the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightBlock {
    pub hash: B256,
    pub parent_hash: B256,
    pub number: u64,
    pub timestamp: u64,
    pub logs_bloom: Bloom,
}

impl Default for BlockTransactions {
    fn default() -> Self {
        BlockTransactions::Hashes(Vec::new())
    }
}

impl BlockTransactions {
    pub fn len(&self) -> usize {
        match self {
            BlockTransactions::Full(txs) => txs.len(),
            BlockTransactions::Hashes(hashes) => hashes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hashes(&self) -> Vec<B256> {
        match self {
            BlockTransactions::Full(txs) => txs.iter().map(|tx| tx.hash).collect(),
            BlockTransactions::Hashes(hashes) => hashes.clone(),
        }
    }
}

impl Block {
    /// Splits the block into its header (with transaction hashes) and the
    /// full transactions, if any.
    pub fn split_transactions(mut self) -> (Block, Vec<Transaction>) {
        let transactions = match std::mem::take(&mut self.transactions) {
            BlockTransactions::Full(txs) => {
                self.transactions =
                    BlockTransactions::Hashes(txs.iter().map(|tx| tx.hash).collect());
                txs
            }
            BlockTransactions::Hashes(hashes) => {
                self.transactions = BlockTransactions::Hashes(hashes);
                Vec::new()
            }
        };
        (self, transactions)
    }

    pub fn light(&self) -> LightBlock {
        LightBlock {
            hash: self.hash,
            parent_hash: self.parent_hash,
            number: self.number,
            timestamp: self.timestamp,
            logs_bloom: self.logs_bloom,
        }
    }
}

impl Log {
    /// Converts a raw log, returning `None` if the log is still pending.
    pub fn from_raw(raw: RawLog, chain_id: u64) -> Option<Self> {
        Some(Log {
            chain_id,
            block_hash: raw.block_hash?,
            block_number: raw.block_number?,
            transaction_hash: raw.transaction_hash?,
            transaction_index: raw.transaction_index?,
            log_index: raw.log_index?,
            address: raw.address,
            topics: raw.topics,
            data: raw.data,
        })
    }
}

impl std::fmt::Display for LightBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:#x}", self.number, self.hash)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn bloom() -> String {
        format!("0x{}", "00".repeat(256))
    }

    #[test]
    fn test_decode_pending_log() {
        let raw: RawLog = serde_json::from_value(json!({
            "address": "0x0000000000000000000000000000000000000001",
            "topics": [],
            "data": "0x",
            "blockHash": null,
            "blockNumber": null,
            "transactionHash": null,
            "transactionIndex": null,
            "logIndex": null,
        }))
        .unwrap();

        assert_eq!(raw.block_number, None);
        assert_eq!(Log::from_raw(raw, 1), None);
    }

    #[test]
    fn test_decode_log() {
        let raw: RawLog = serde_json::from_value(json!({
            "address": "0x0000000000000000000000000000000000000001",
            "topics": ["0x0000000000000000000000000000000000000000000000000000000000000002"],
            "data": "0x1234",
            "blockHash": "0x0000000000000000000000000000000000000000000000000000000000000003",
            "blockNumber": "0x64",
            "transactionHash": "0x0000000000000000000000000000000000000000000000000000000000000004",
            "transactionIndex": "0x1",
            "logIndex": "0x2",
            "removed": false,
        }))
        .unwrap();

        let log = Log::from_raw(raw, 10).unwrap();
        assert_eq!(log.block_number, 100);
        assert_eq!(log.log_index, 2);
        assert_eq!(log.chain_id, 10);
        assert_eq!(log.data.as_ref(), &[0x12, 0x34]);
    }

    #[test]
    fn test_decode_block_transactions() {
        let block: Block = serde_json::from_value(json!({
            "hash": "0x0000000000000000000000000000000000000000000000000000000000000001",
            "parentHash": "0x0000000000000000000000000000000000000000000000000000000000000000",
            "number": "0x1",
            "timestamp": "0x5",
            "logsBloom": bloom(),
            "transactions": ["0x0000000000000000000000000000000000000000000000000000000000000009"],
        }))
        .unwrap();
        assert_matches!(block.transactions, BlockTransactions::Hashes(ref h) if h.len() == 1);

        let block: Block = serde_json::from_value(json!({
            "hash": "0x0000000000000000000000000000000000000000000000000000000000000001",
            "parentHash": "0x0000000000000000000000000000000000000000000000000000000000000000",
            "number": "0x1",
            "timestamp": "0x5",
            "logsBloom": bloom(),
            "transactions": [{
                "hash": "0x0000000000000000000000000000000000000000000000000000000000000009",
                "from": "0x0000000000000000000000000000000000000001",
                "to": null,
                "value": "0x0",
                "input": "0x",
                "nonce": "0x0",
            }],
        }))
        .unwrap();
        assert_matches!(block.transactions, BlockTransactions::Full(ref t) if t.len() == 1);

        let (header, transactions) = block.split_transactions();
        assert_eq!(transactions.len(), 1);
        assert_matches!(header.transactions, BlockTransactions::Hashes(ref h) if h.len() == 1);
    }
}
