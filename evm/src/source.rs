//! Sources describe which logs to sync, on which chain and over which blocks.
use std::{fmt, str::FromStr, sync::Arc};

use alloy_primitives::{Address, B256};
use serde_json::{json, Value};

use crate::provider::models::Log;

/// Filter for a single topic slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TopicFilter {
    /// Matches any value.
    #[default]
    Any,
    Exact(B256),
    /// Matches any of the values.
    OneOf(Vec<B256>),
}

/// The four topic slots of an `eth_getLogs` filter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Topics(pub [TopicFilter; 4]);

/// Log filter addresses. `None` means any address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressFilter {
    Single(Address),
    Multiple(Vec<Address>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilterCriteria {
    pub address: Option<AddressFilter>,
    pub topics: Topics,
}

/// Where the child contract address is stored in a factory event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildAddressLocation {
    /// Indexed topic, 1 to 3.
    Topic(u8),
    /// Byte offset of the 32 bytes word in the log data.
    Offset(usize),
}

/// A factory contract whose events announce the child contracts to index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryCriteria {
    pub address: Address,
    pub event_selector: B256,
    pub child_address_location: ChildAddressLocation,
    /// Topics filter applied to the child contracts' logs.
    pub topics: Topics,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceCriteria {
    LogFilter(LogFilterCriteria),
    Factory(FactoryCriteria),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub name: String,
    pub network: String,
    pub chain_id: u64,
    pub criteria: SourceCriteria,
    pub start_block: u64,
    /// Last block to sync, inclusive. `None` follows the chain head.
    pub end_block: Option<u64>,
    pub max_block_range: Option<u64>,
}

pub type SharedSource = Arc<Source>;

impl Topics {
    pub fn event(selector: B256) -> Self {
        let mut topics = Topics::default();
        topics.0[0] = TopicFilter::Exact(selector);
        topics
    }

    /// Returns the `topics` field of an `eth_getLogs` filter.
    ///
    /// Trailing wildcards are omitted.
    pub fn to_json(&self) -> Value {
        let used = self
            .0
            .iter()
            .rposition(|t| *t != TopicFilter::Any)
            .map(|i| i + 1)
            .unwrap_or(0);

        let topics = self.0[..used]
            .iter()
            .map(|topic| match topic {
                TopicFilter::Any => Value::Null,
                TopicFilter::Exact(value) => json!(value),
                TopicFilter::OneOf(values) => json!(values),
            })
            .collect::<Vec<_>>();

        Value::Array(topics)
    }

    pub fn matches(&self, topics: &[B256]) -> bool {
        self.0.iter().enumerate().all(|(i, filter)| match filter {
            TopicFilter::Any => true,
            TopicFilter::Exact(value) => topics.get(i) == Some(value),
            TopicFilter::OneOf(values) => topics.get(i).map_or(false, |t| values.contains(t)),
        })
    }
}

impl fmt::Display for Topics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, topic) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "_")?;
            }
            match topic {
                TopicFilter::Any => write!(f, "null")?,
                TopicFilter::Exact(value) => write!(f, "{value:#x}")?,
                TopicFilter::OneOf(values) => {
                    let values = values
                        .iter()
                        .map(|v| format!("{v:#x}"))
                        .collect::<Vec<_>>()
                        .join("|");
                    write!(f, "{values}")?
                }
            }
        }
        Ok(())
    }
}

impl AddressFilter {
    pub fn addresses(&self) -> Vec<Address> {
        match self {
            AddressFilter::Single(address) => vec![*address],
            AddressFilter::Multiple(addresses) => addresses.clone(),
        }
    }
}

impl ChildAddressLocation {
    /// Extracts the child address from a factory log.
    pub fn extract(&self, log: &Log) -> Option<Address> {
        match *self {
            ChildAddressLocation::Topic(index) => log
                .topics
                .get(index as usize)
                .map(|topic| Address::from_slice(&topic[12..])),
            ChildAddressLocation::Offset(offset) => {
                let word = log.data.get(offset..offset.checked_add(32)?)?;
                Some(Address::from_slice(&word[12..]))
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidChildAddressLocation(pub String);

impl FromStr for ChildAddressLocation {
    type Err = InvalidChildAddressLocation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidChildAddressLocation(s.to_string());

        if let Some(index) = s.strip_prefix("topic") {
            let index = index.parse::<u8>().map_err(|_| invalid())?;
            if !(1..=3).contains(&index) {
                return Err(invalid());
            }
            return Ok(ChildAddressLocation::Topic(index));
        }

        if let Some(offset) = s.strip_prefix("offset") {
            let offset = offset.parse::<usize>().map_err(|_| invalid())?;
            return Ok(ChildAddressLocation::Offset(offset));
        }

        Err(invalid())
    }
}

impl fmt::Display for ChildAddressLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildAddressLocation::Topic(index) => write!(f, "topic{index}"),
            ChildAddressLocation::Offset(offset) => write!(f, "offset{offset}"),
        }
    }
}

impl std::error::Error for InvalidChildAddressLocation {}

impl fmt::Display for InvalidChildAddressLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid child address location `{}`: expected topic1..topic3 or offsetN",
            self.0
        )
    }
}

impl Source {
    /// Cache keys tracking this source's completed intervals.
    ///
    /// Log filters get one key per address so that sources sharing an
    /// address reuse each other's progress. The wildcard address is `*`.
    pub fn interval_keys(&self) -> Vec<String> {
        match &self.criteria {
            SourceCriteria::LogFilter(criteria) => match &criteria.address {
                None => vec![format!("{}_*_{}", self.chain_id, criteria.topics)],
                Some(filter) => filter
                    .addresses()
                    .iter()
                    .map(|address| {
                        format!(
                            "{}_0x{}_{}",
                            self.chain_id,
                            hex::encode(address),
                            criteria.topics
                        )
                    })
                    .collect(),
            },
            SourceCriteria::Factory(criteria) => vec![format!(
                "{}_factory_0x{}_{:#x}_{}_{}",
                self.chain_id,
                hex::encode(criteria.address),
                criteria.event_selector,
                criteria.child_address_location,
                criteria.topics
            )],
        }
    }

    /// Cache key of the factory events, for factory sources.
    ///
    /// Same as the key of a log filter on the factory address and event, so
    /// factory sources sharing a factory reuse each other's events.
    pub fn factory_interval_key(&self) -> Option<String> {
        let SourceCriteria::Factory(criteria) = &self.criteria else {
            return None;
        };

        Some(format!(
            "{}_0x{}_{}",
            self.chain_id,
            hex::encode(criteria.address),
            Topics::event(criteria.event_selector)
        ))
    }

    /// Clamps `[from, to]` to the source's block range.
    pub fn clamp(&self, from: u64, to: u64) -> Option<(u64, u64)> {
        let from = from.max(self.start_block);
        let to = match self.end_block {
            Some(end) => to.min(end),
            None => to,
        };
        (from <= to).then_some((from, to))
    }

    /// Returns true if the source still needs blocks after `block_number`.
    pub fn is_live_after(&self, block_number: u64) -> bool {
        self.end_block.map_or(true, |end| end > block_number)
    }
}
