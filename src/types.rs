//! Ethereum JSON-RPC types
//!
//! Only the fields the pipeline and its indexers read are decoded; the node
//! sends many more and they are ignored. Hashes, addresses and 256-bit values
//! use the alloy hex serde impls; 64-bit quantities and byte strings go
//! through the small codecs at the bottom of this file.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Deserializer};

/// Header fields of `eth_getBlockByNumber`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    #[serde(with = "quantity")]
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    /// Unix seconds.
    #[serde(with = "quantity")]
    pub timestamp: u64,
}

/// Block with full transaction objects.
#[derive(Debug, Clone, Deserialize)]
pub struct Block {
    #[serde(flatten)]
    pub header: Header,
    /// In block order.
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn number(&self) -> u64 {
        self.header.number
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: B256,
    pub from: Address,
    /// `None` for contract creation.
    #[serde(default)]
    pub to: Option<Address>,
    pub value: U256,
    #[serde(with = "hex_bytes")]
    pub input: Vec<u8>,
    #[serde(with = "quantity")]
    pub nonce: u64,
}

impl Transaction {
    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }
}

/// Log entry emitted during transaction execution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Log {
    /// Emitting contract.
    pub address: Address,
    /// `topics[0]` is the event signature hash for non-anonymous events.
    #[serde(default)]
    pub topics: Vec<B256>,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: B256,
    /// 1 on success, 0 when reverted.
    #[serde(with = "quantity")]
    pub status: u64,
    pub gas_used: U256,
    #[serde(default)]
    pub logs: Vec<Log>,
}

impl Receipt {
    pub fn is_success(&self) -> bool {
        self.status == 1
    }
}

/// Parse a `0x`-prefixed (or bare) hex quantity into a u64.
pub fn parse_hex_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16)
}

/// Hex-encoded 64-bit quantities (`"0x1b4"`).
mod quantity {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_hex_u64(&s).map_err(serde::de::Error::custom)
    }
}

/// Hex-encoded byte strings, `"0x"` being empty.
mod hex_bytes {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let digits = s.strip_prefix("0x").unwrap_or(&s);
        let decoded = if digits.len() % 2 == 1 {
            hex::decode(format!("0{}", digits))
        } else {
            hex::decode(digits)
        };
        decoded.map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn block_json(to: serde_json::Value) -> serde_json::Value {
        json!({
            "number": "0x64",
            "hash": format!("0x{}", "11".repeat(32)),
            "parentHash": format!("0x{}", "22".repeat(32)),
            "timestamp": "0x65f0a1b2",
            "miner": "0x0000000000000000000000000000000000000000",
            "transactions": [{
                "hash": format!("0x{}", "33".repeat(32)),
                "from": "0x0742d35cc6634c0532925a3b844bc9e7595f0beb",
                "to": to,
                "value": "0xde0b6b3a7640000",
                "input": "0x",
                "nonce": "0x7"
            }]
        })
    }

    #[test]
    fn test_block_deserializes_header_and_transactions() {
        let block: Block = serde_json::from_value(block_json(json!(
            "0xdac17f958d2ee523a2206206994597c13d831ec7"
        )))
        .unwrap();

        assert_eq!(block.number(), 100);
        assert_eq!(block.header.timestamp, 0x65f0a1b2);
        assert_eq!(block.header.parent_hash, B256::repeat_byte(0x22));
        assert_eq!(block.transactions.len(), 1);

        let tx = &block.transactions[0];
        assert_eq!(tx.nonce, 7);
        assert_eq!(tx.value, U256::from(1_000_000_000_000_000_000u64));
        assert!(!tx.is_contract_creation());
        assert!(tx.input.is_empty());
    }

    #[test]
    fn test_null_recipient_is_contract_creation() {
        let block: Block = serde_json::from_value(block_json(serde_json::Value::Null)).unwrap();
        assert!(block.transactions[0].is_contract_creation());
    }

    #[test]
    fn test_receipt_with_logs() {
        let receipt: Receipt = serde_json::from_value(json!({
            "transactionHash": format!("0x{}", "33".repeat(32)),
            "status": "0x1",
            "gasUsed": "0x5208",
            "logs": [{
                "address": "0xdac17f958d2ee523a2206206994597c13d831ec7",
                "topics": [format!("0x{}", "44".repeat(32))],
                "data": "0x01"
            }]
        }))
        .unwrap();

        assert!(receipt.is_success());
        assert_eq!(receipt.gas_used, U256::from(21_000u64));
        assert_eq!(receipt.logs[0].topics[0], B256::repeat_byte(0x44));
        assert_eq!(receipt.logs[0].data, vec![0x01]);
    }

    #[test]
    fn test_parse_hex_u64() {
        assert_eq!(parse_hex_u64("0x0").unwrap(), 0);
        assert_eq!(parse_hex_u64("0xff").unwrap(), 255);
        assert_eq!(parse_hex_u64("1234").unwrap(), 0x1234);
        assert!(parse_hex_u64("0xzz").is_err());
    }
}
