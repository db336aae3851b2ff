//! JSON-RPC client for Ethereum nodes
//!
//! The pipeline only needs three read calls from a node: the current head,
//! a full block by number, and a transaction receipt. They are expressed as
//! the [`ChainClient`] trait so that every pipeline stage can share one
//! client and tests can substitute a scripted chain.

use crate::types::{Block, Header, Receipt};
use alloy_primitives::B256;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

/// Read-only view of a chain node.
///
/// Implementations must be safe to call concurrently from every fetch worker
/// and dispatcher task.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Header of block `number`, or of the latest block when `None`.
    async fn header_by_number(&self, number: Option<u64>) -> Result<Header>;

    /// Full block with transaction objects.
    async fn block_by_number(&self, number: u64) -> Result<Block>;

    /// Receipt of a mined transaction.
    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Receipt>;
}

/// JSON-RPC client for Ethereum nodes.
pub struct RpcClient {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl RpcClient {
    /// Create a new RPC client.
    ///
    /// Fails if `url` is not a valid absolute URL.
    pub fn new(url: &str) -> Result<Self> {
        let url = reqwest::Url::parse(url)
            .with_context(|| format!("Invalid RPC url: {}", url))?;
        Ok(Self {
            client: reqwest::Client::new(),
            url,
        })
    }

    /// Make a JSON-RPC call.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", method))?;

        let json: Value = response
            .json()
            .await
            .context("Failed to parse RPC response")?;

        if let Some(error) = json.get("error") {
            anyhow::bail!("RPC error from {}: {}", method, error);
        }

        let result = json
            .get("result")
            .cloned()
            .context("RPC response missing 'result' field")?;
        if result.is_null() {
            anyhow::bail!("{} returned null", method);
        }
        Ok(result)
    }
}

fn block_tag(number: Option<u64>) -> String {
    match number {
        Some(n) => format!("0x{:x}", n),
        None => "latest".to_string(),
    }
}

#[async_trait]
impl ChainClient for RpcClient {
    async fn header_by_number(&self, number: Option<u64>) -> Result<Header> {
        let result = self
            .call("eth_getBlockByNumber", json!([block_tag(number), false]))
            .await?;
        serde_json::from_value(result).context("Failed to deserialize block header")
    }

    async fn block_by_number(&self, number: u64) -> Result<Block> {
        let result = self
            .call("eth_getBlockByNumber", json!([block_tag(Some(number)), true]))
            .await?;
        serde_json::from_value(result)
            .with_context(|| format!("Failed to deserialize block {}", number))
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Receipt> {
        let result = self
            .call("eth_getTransactionReceipt", json!([format!("0x{:x}", tx_hash)]))
            .await?;
        serde_json::from_value(result).context("Failed to deserialize receipt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_tag_formatting() {
        assert_eq!(block_tag(None), "latest");
        assert_eq!(block_tag(Some(0)), "0x0");
        assert_eq!(block_tag(Some(100)), "0x64");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(RpcClient::new("not a url").is_err());
        assert!(RpcClient::new("http://127.0.0.1:8545").is_ok());
    }

    #[test]
    fn test_hash_formatting() {
        let hash = B256::repeat_byte(0xab);
        assert_eq!(format!("0x{:x}", hash), format!("0x{}", "ab".repeat(32)));
    }
}
