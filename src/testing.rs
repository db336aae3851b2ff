//! Test fixtures: sample chain objects and a scripted chain client.

use crate::rpc::ChainClient;
use crate::types::{Block, Header, Log, Receipt, Transaction};
use alloy_primitives::{Address, B256, U256};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub fn target() -> Address {
    Address::repeat_byte(0x42)
}

pub fn hash_of(n: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    B256::from(bytes)
}

/// Transaction hash for the `index`-th transaction of `block`.
pub fn tx_hash(block: u64, index: u64) -> B256 {
    hash_of(block * 1_000 + index + 1)
}

pub fn sample_header(number: u64) -> Header {
    Header {
        number,
        hash: hash_of(number),
        parent_hash: hash_of(number.saturating_sub(1)),
        timestamp: 1_700_000_000 + number * 12,
    }
}

pub fn sample_tx(hash: B256, to: Option<Address>) -> Transaction {
    Transaction {
        hash,
        from: Address::repeat_byte(0x11),
        to,
        value: U256::ZERO,
        input: vec![],
        nonce: 0,
    }
}

pub fn sample_receipt(logs: Vec<Log>) -> Receipt {
    Receipt {
        transaction_hash: B256::ZERO,
        status: 1,
        gas_used: U256::from(21_000u64),
        logs,
    }
}

/// Header and single transaction for indexer tests.
pub fn event_parts(block: u64) -> (Arc<Header>, Arc<Transaction>) {
    (
        Arc::new(sample_header(block)),
        Arc::new(sample_tx(tx_hash(block, 0), Some(target()))),
    )
}

/// ABI-encoded `(player, score)` payload of a `Scored` log.
pub fn scored_data(player: Address, score: u64) -> Vec<u8> {
    let mut data = vec![0u8; 12];
    data.extend_from_slice(player.as_slice());
    data.extend_from_slice(&U256::from(score).to_be_bytes::<32>());
    data
}

pub fn scored_log(emitter: Address, player: Address, score: u64) -> Log {
    Log {
        address: emitter,
        topics: vec![crate::indexer_scored::scored_topic()],
        data: scored_data(player, score),
    }
}

/// In-memory chain. Every block carries one call to [`target`] unless
/// scripted otherwise.
pub struct ScriptedChain {
    head: AtomicU64,
    head_unavailable: AtomicBool,
    transactions: Mutex<HashMap<u64, Vec<Transaction>>>,
    logs: Mutex<HashMap<B256, Vec<Log>>>,
    failing_receipts: Mutex<Vec<B256>>,
    fetched: Mutex<Vec<u64>>,
}

impl ScriptedChain {
    pub fn new(head: u64) -> Self {
        Self {
            head: AtomicU64::new(head),
            head_unavailable: AtomicBool::new(false),
            transactions: Mutex::new(HashMap::new()),
            logs: Mutex::new(HashMap::new()),
            failing_receipts: Mutex::new(Vec::new()),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// While set, head lookups fail as if the node were unreachable.
    pub fn set_head_unavailable(&self, unavailable: bool) {
        self.head_unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_transactions(&self, block: u64, transactions: Vec<Transaction>) {
        self.transactions.lock().unwrap().insert(block, transactions);
    }

    pub fn set_logs(&self, tx: B256, logs: Vec<Log>) {
        self.logs.lock().unwrap().insert(tx, logs);
    }

    pub fn fail_receipt(&self, tx: B256) {
        self.failing_receipts.lock().unwrap().push(tx);
    }

    /// Block numbers passed to `block_by_number`, in call order.
    pub fn fetched(&self) -> Vec<u64> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn header_by_number(&self, number: Option<u64>) -> Result<Header> {
        if number.is_none() && self.head_unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("node unreachable");
        }
        let head = self.head.load(Ordering::SeqCst);
        let number = number.unwrap_or(head);
        if number > head {
            anyhow::bail!("header {} not found", number);
        }
        Ok(sample_header(number))
    }

    async fn block_by_number(&self, number: u64) -> Result<Block> {
        if number > self.head.load(Ordering::SeqCst) {
            anyhow::bail!("block {} not found", number);
        }
        self.fetched.lock().unwrap().push(number);
        let transactions = self
            .transactions
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .unwrap_or_else(|| vec![sample_tx(tx_hash(number, 0), Some(target()))]);
        Ok(Block {
            header: sample_header(number),
            transactions,
        })
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Receipt> {
        if self.failing_receipts.lock().unwrap().contains(&tx_hash) {
            anyhow::bail!("receipt {} unavailable", tx_hash);
        }
        let logs = self
            .logs
            .lock()
            .unwrap()
            .get(&tx_hash)
            .cloned()
            .unwrap_or_default();
        Ok(Receipt {
            transaction_hash: tx_hash,
            ..sample_receipt(logs)
        })
    }
}
