//! Sync EVM logs, blocks and transactions into a local cache.
pub mod cli;
pub mod error;
pub mod ingestion;
pub mod interval;
pub mod provider;
pub mod service;
pub mod source;
pub mod store;
