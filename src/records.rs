//! Record types for the block ledger
//!
//! `BlockRecord` is the one row kept per block number. The RocksDB backend
//! stores it with postcard; the relational backends map it to columns.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ingestion state of a block.
///
/// The integer codes are persisted and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockStatus {
    /// Admitted by the listener, not yet claimed by a dispatcher.
    Unprocessed,
    /// Claimed by a dispatcher.
    Processing,
    /// Every indexer accepted every transaction. Terminal.
    Processed,
    /// At least one indexer rejected a transaction; eligible for re-queue
    /// while `retry_count < max_retry`.
    Retry,
}

impl BlockStatus {
    pub const ALL: [BlockStatus; 4] = [
        BlockStatus::Unprocessed,
        BlockStatus::Processing,
        BlockStatus::Processed,
        BlockStatus::Retry,
    ];

    /// Persisted integer code.
    pub fn code(self) -> i32 {
        match self {
            BlockStatus::Unprocessed => 0,
            BlockStatus::Processing => 1,
            BlockStatus::Processed => 2,
            BlockStatus::Retry => 3,
        }
    }

    /// Decode a persisted integer code.
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(BlockStatus::Unprocessed),
            1 => Ok(BlockStatus::Processing),
            2 => Ok(BlockStatus::Processed),
            3 => Ok(BlockStatus::Retry),
            other => anyhow::bail!("Unknown block status code {}", other),
        }
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockStatus::Unprocessed => write!(f, "unprocessed"),
            BlockStatus::Processing => write!(f, "processing"),
            BlockStatus::Processed => write!(f, "processed"),
            BlockStatus::Retry => write!(f, "retry"),
        }
    }
}

impl FromStr for BlockStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "unprocessed" => Ok(BlockStatus::Unprocessed),
            "processing" => Ok(BlockStatus::Processing),
            "processed" => Ok(BlockStatus::Processed),
            "retry" => Ok(BlockStatus::Retry),
            other => anyhow::bail!("Unknown block status '{}'", other),
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub block_number: u64,
    pub status: BlockStatus,
    /// Incremented only on transition into `Retry`.
    pub retry_count: u64,
    /// Unix millis of the most recent counted transition into `Retry`.
    pub last_retry_at: Option<i64>,
    /// Unix millis of the most recent status write.
    pub updated_at: Option<i64>,
}

impl BlockRecord {
    /// A freshly admitted row.
    pub fn new(block_number: u64, status: BlockStatus) -> Self {
        Self {
            block_number,
            status,
            retry_count: 0,
            last_retry_at: None,
            updated_at: None,
        }
    }

    /// Whether a fetch worker may materialize this block.
    pub fn is_fetchable(&self, max_retry: u64) -> bool {
        match self.status {
            BlockStatus::Unprocessed => true,
            BlockStatus::Retry => self.retry_count < max_retry,
            BlockStatus::Processing | BlockStatus::Processed => false,
        }
    }

    /// Last activity used by the stale-processing sweep.
    pub fn last_activity(&self) -> Option<i64> {
        self.updated_at.or(self.last_retry_at)
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
