//! Configuration loading
//!
//! The service reads one JSON file with three sections: the ledger backend,
//! the fetcher pipeline, and the list of indexers to run. Missing fetcher
//! fields fall back to defaults; durations are human strings such as
//! `"5m"` or `"500ms"`.

use crate::indexer::IndexerKind;
use crate::store::StoreDriver;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub db: StoreConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub indexers: Vec<IndexerConfig>,
}

/// Ledger backend selection.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub driver: StoreDriver,
    pub url: String,
}

/// Raw fetcher section as written in the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub ethereum_rpc_url: String,
    pub pull_interval_ms: u64,
    pub retry_interval_ms: u64,
    pub begin_block: u64,
    pub block_cache_size: usize,
    pub poll_thread: usize,
    pub block_max_retry: u64,
    pub max_processing_time: String,
    pub stale_check_interval: String,
    pub indexer_timeout: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            ethereum_rpc_url: "http://localhost:8545".to_string(),
            pull_interval_ms: 300,
            retry_interval_ms: 200,
            begin_block: 1,
            block_cache_size: 100,
            poll_thread: 10,
            block_max_retry: 3,
            max_processing_time: "5m".to_string(),
            stale_check_interval: "1m".to_string(),
            indexer_timeout: "30s".to_string(),
        }
    }
}

/// One indexer entry.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    #[serde(rename = "type")]
    pub kind: IndexerKind,
    /// Worker tasks for indexers that process events in parallel.
    #[serde(default)]
    pub thread: Option<usize>,
    /// Contract address for contract-scoped indexers.
    #[serde(default)]
    pub contract: Option<String>,
}

/// Validated, immutable pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub rpc_url: String,
    pub poll_interval: Duration,
    pub retry_interval: Duration,
    pub first_block: u64,
    /// In-flight capacity: bounds the listener window and both queues.
    pub cache_capacity: usize,
    /// Number of fetch workers, and of dispatcher tasks.
    pub workers: usize,
    pub max_retry: u64,
    pub max_processing_time: Duration,
    pub stale_check_interval: Duration,
    pub indexer_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            poll_interval: Duration::from_millis(300),
            retry_interval: Duration::from_millis(200),
            first_block: 1,
            cache_capacity: 100,
            workers: 10,
            max_retry: 3,
            max_processing_time: Duration::from_secs(300),
            stale_check_interval: Duration::from_secs(60),
            indexer_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        reqwest::Url::parse(&self.rpc_url)
            .with_context(|| format!("Invalid RPC url: {}", self.rpc_url))?;
        if self.cache_capacity == 0 {
            anyhow::bail!("block_cache_size must be at least 1");
        }
        if self.workers == 0 {
            anyhow::bail!("poll_thread must be at least 1");
        }
        if self.stale_check_interval.is_zero() {
            anyhow::bail!("stale_check_interval must be positive");
        }
        if self.indexer_timeout.is_zero() {
            anyhow::bail!("indexer_timeout must be positive");
        }
        Ok(())
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    duration_str::parse_std(value)
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("Invalid duration for {}: {:?}", field, value))
}

impl FetcherConfig {
    /// Parse durations and validate, producing the pipeline settings.
    pub fn resolve(&self) -> Result<PipelineConfig> {
        let config = PipelineConfig {
            rpc_url: self.ethereum_rpc_url.clone(),
            poll_interval: Duration::from_millis(self.pull_interval_ms),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            first_block: self.begin_block,
            cache_capacity: self.block_cache_size,
            workers: self.poll_thread,
            max_retry: self.block_max_retry,
            max_processing_time: parse_duration("max_processing_time", &self.max_processing_time)?,
            stale_check_interval: parse_duration(
                "stale_check_interval",
                &self.stale_check_interval,
            )?,
            indexer_timeout: parse_duration("indexer_timeout", &self.indexer_timeout)?,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Load the service configuration from a JSON file.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {:?}", path))
}
