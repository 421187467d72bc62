//! JSON configuration of the networks and sources to sync.
use std::{collections::HashSet, path::Path, sync::Arc, time::Duration};

use alloy_primitives::{Address, B256};
use error_stack::{Result, ResultExt};
use serde::Deserialize;
use url::Url;

use crate::{
    error::SyncError,
    ingestion::HeadTrackerOptions,
    provider::DispatcherOptions,
    service::NetworkOptions,
    source::{
        AddressFilter, ChildAddressLocation, FactoryCriteria, LogFilterCriteria, SharedSource,
        Source, SourceCriteria, TopicFilter, Topics,
    },
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SyncConfig {
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NetworkConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: u32,
    pub poll_interval_ms: Option<u64>,
    pub finality_block_count: Option<u64>,
    pub reorg_depth: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    pub network: String,
    pub address: Option<AddressConfig>,
    pub factory: Option<FactoryConfig>,
    /// Up to four topic slots. `null` matches any value.
    #[serde(default)]
    pub topics: Vec<Option<TopicConfig>>,
    #[serde(default)]
    pub start_block: u64,
    pub end_block: Option<u64>,
    pub max_block_range: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AddressConfig {
    Single(Address),
    Multiple(Vec<Address>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TopicConfig {
    Single(B256),
    Multiple(Vec<B256>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FactoryConfig {
    pub address: Address,
    /// Selector of the event announcing new children.
    pub event: B256,
    /// `topic1` to `topic3`, or `offsetN` for a word in the log data.
    pub child_address_location: String,
}

/// Everything needed to sync one network.
#[derive(Debug, Clone)]
pub struct NetworkPlan {
    pub options: NetworkOptions,
    pub rpc_url: Url,
    pub sources: Vec<SharedSource>,
}

fn default_max_requests_per_second() -> u32 {
    50
}

impl SyncConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .change_context(SyncError::Configuration)
            .attach_printable("failed to read configuration file")
            .attach_printable_lazy(|| format!("path: {}", path.display()))?;

        Self::from_json(&content)
            .attach_printable_lazy(|| format!("path: {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self, SyncError> {
        serde_json::from_str(content)
            .change_context(SyncError::Configuration)
            .attach_printable("failed to parse configuration")
    }

    /// Validate the configuration and group the sources by network.
    pub fn into_plans(self) -> Result<Vec<NetworkPlan>, SyncError> {
        let mut network_names = HashSet::new();
        for network in &self.networks {
            if !network_names.insert(network.name.as_str()) {
                return Err(SyncError::Configuration)
                    .attach_printable("duplicate network")
                    .attach_printable_lazy(|| format!("network: {}", network.name));
            }
        }

        let mut source_names = HashSet::new();
        for source in &self.sources {
            if !source_names.insert(source.name.as_str()) {
                return Err(SyncError::Configuration)
                    .attach_printable("duplicate source")
                    .attach_printable_lazy(|| format!("source: {}", source.name));
            }

            if !network_names.contains(source.network.as_str()) {
                return Err(SyncError::Configuration)
                    .attach_printable("source references an unknown network")
                    .attach_printable_lazy(|| format!("source: {}", source.name))
                    .attach_printable_lazy(|| format!("network: {}", source.network));
            }
        }

        let mut plans = Vec::with_capacity(self.networks.len());
        for network in &self.networks {
            let sources = self
                .sources
                .iter()
                .filter(|source| source.network == network.name)
                .map(|source| source.to_source(network.chain_id).map(Arc::new))
                .collect::<Result<Vec<_>, _>>()?;

            plans.push(NetworkPlan {
                options: network.to_options()?,
                rpc_url: network.rpc_url()?,
                sources,
            });
        }

        Ok(plans)
    }
}

impl NetworkConfig {
    pub fn rpc_url(&self) -> Result<Url, SyncError> {
        self.rpc_url
            .parse::<Url>()
            .change_context(SyncError::Configuration)
            .attach_printable("failed to parse RPC URL")
            .attach_printable_lazy(|| format!("network: {}", self.name))
    }

    pub fn to_options(&self) -> Result<NetworkOptions, SyncError> {
        if self.max_requests_per_second == 0 {
            return Err(SyncError::Configuration)
                .attach_printable("max requests per second must be positive")
                .attach_printable_lazy(|| format!("network: {}", self.name));
        }

        let mut head_tracker = HeadTrackerOptions::default();
        if let Some(poll_interval_ms) = self.poll_interval_ms {
            head_tracker = head_tracker.with_poll_interval(Duration::from_millis(poll_interval_ms));
        }
        if let Some(finality_block_count) = self.finality_block_count {
            head_tracker = head_tracker.with_finality_block_count(finality_block_count);
        }
        if let Some(reorg_depth) = self.reorg_depth {
            head_tracker = head_tracker.with_reorg_depth(reorg_depth);
        }

        // The finalized block must stay in the reorg window.
        if head_tracker.reorg_depth as u64 <= head_tracker.finality_block_count {
            return Err(SyncError::Configuration)
                .attach_printable("reorg depth must exceed the finality block count")
                .attach_printable_lazy(|| format!("network: {}", self.name))
                .attach_printable_lazy(|| format!("reorg depth: {}", head_tracker.reorg_depth))
                .attach_printable_lazy(|| {
                    format!("finality block count: {}", head_tracker.finality_block_count)
                });
        }

        let dispatcher =
            DispatcherOptions::default().with_max_requests_per_second(self.max_requests_per_second);

        Ok(NetworkOptions::new(self.name.clone(), self.chain_id)
            .with_dispatcher(dispatcher)
            .with_head_tracker(head_tracker))
    }
}

impl SourceConfig {
    pub fn to_source(&self, chain_id: u64) -> Result<Source, SyncError> {
        if let Some(end_block) = self.end_block {
            if end_block < self.start_block {
                return Err(SyncError::Configuration)
                    .attach_printable("start block is after end block")
                    .attach_printable_lazy(|| format!("source: {}", self.name));
            }
        }

        if self.max_block_range == Some(0) {
            return Err(SyncError::Configuration)
                .attach_printable("max block range must be positive")
                .attach_printable_lazy(|| format!("source: {}", self.name));
        }

        let topics = self.topics()?;

        let criteria = match (&self.address, &self.factory) {
            (Some(_), Some(_)) => {
                return Err(SyncError::Configuration)
                    .attach_printable("source has both an address and a factory")
                    .attach_printable_lazy(|| format!("source: {}", self.name));
            }
            (None, Some(factory)) => {
                let child_address_location = factory
                    .child_address_location
                    .parse::<ChildAddressLocation>()
                    .change_context(SyncError::Configuration)
                    .attach_printable_lazy(|| format!("source: {}", self.name))?;

                SourceCriteria::Factory(FactoryCriteria {
                    address: factory.address,
                    event_selector: factory.event,
                    child_address_location,
                    topics,
                })
            }
            (address, None) => {
                let address = match address {
                    None => None,
                    Some(AddressConfig::Single(address)) => Some(AddressFilter::Single(*address)),
                    Some(AddressConfig::Multiple(addresses)) if addresses.is_empty() => {
                        return Err(SyncError::Configuration)
                            .attach_printable("address list is empty")
                            .attach_printable_lazy(|| format!("source: {}", self.name));
                    }
                    Some(AddressConfig::Multiple(addresses)) => {
                        Some(AddressFilter::Multiple(addresses.clone()))
                    }
                };

                SourceCriteria::LogFilter(LogFilterCriteria { address, topics })
            }
        };

        Ok(Source {
            name: self.name.clone(),
            network: self.network.clone(),
            chain_id,
            criteria,
            start_block: self.start_block,
            end_block: self.end_block,
            max_block_range: self.max_block_range,
        })
    }

    fn topics(&self) -> Result<Topics, SyncError> {
        if self.topics.len() > 4 {
            return Err(SyncError::Configuration)
                .attach_printable("a log filter has at most 4 topics")
                .attach_printable_lazy(|| format!("source: {}", self.name));
        }

        let mut topics = Topics::default();
        for (slot, topic) in self.topics.iter().enumerate() {
            topics.0[slot] = match topic {
                None => TopicFilter::Any,
                Some(TopicConfig::Single(value)) => TopicFilter::Exact(*value),
                Some(TopicConfig::Multiple(values)) if values.is_empty() => TopicFilter::Any,
                Some(TopicConfig::Multiple(values)) => TopicFilter::OneOf(values.clone()),
            };
        }

        Ok(topics)
    }
}
