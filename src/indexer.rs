//! Indexer contract and the built-in indexers.
//!
//! An indexer owns an input queue of [`EventContext`]s and a pool of worker
//! tasks draining it. For every context it receives it must reply exactly
//! once with a [`Verdict`]. The dispatcher bounds the wait for that reply.

use crate::config::IndexerConfig;
use crate::indexer_scored::ScoredEventIndexer;
use crate::store::PlayerStore;
use crate::types::{Header, Receipt, Transaction};
use alloy_primitives::Address;
use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of each indexer's input queue.
pub const INDEXER_INPUT_CAPACITY: usize = 100;

/// An indexer's answer for one event. `Err` rejects the event.
pub type Verdict = Result<()>;

/// Outcome of handing a verdict back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The dispatcher stopped waiting (timeout or shutdown).
    Dropped,
}

/// One (header, transaction, receipt) triple handed to a single indexer.
pub struct EventContext {
    pub header: Arc<Header>,
    pub transaction: Arc<Transaction>,
    pub receipt: Arc<Receipt>,
    reply: tokio::sync::oneshot::Sender<Verdict>,
}

impl EventContext {
    pub fn new(
        header: Arc<Header>,
        transaction: Arc<Transaction>,
        receipt: Arc<Receipt>,
    ) -> (Self, tokio::sync::oneshot::Receiver<Verdict>) {
        let (reply, receiver) = tokio::sync::oneshot::channel();
        let context = Self {
            header,
            transaction,
            receipt,
            reply,
        };
        (context, receiver)
    }

    pub fn block_number(&self) -> u64 {
        self.header.number
    }

    /// Send the verdict. Consumes the context so a second reply is impossible.
    pub fn reply(self, verdict: Verdict) -> Delivery {
        match self.reply.send(verdict) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Dropped,
        }
    }
}

impl fmt::Debug for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("block", &self.header.number)
            .field("tx", &self.transaction.hash)
            .finish()
    }
}

/// A running indexer.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Unique name, used as the registration key.
    fn name(&self) -> &str;

    /// Producer side of the indexer's input queue.
    fn input(&self) -> Sender<EventContext>;

    /// Health and counters for the metrics surface.
    async fn metrics(&self) -> serde_json::Value;
}

/// Per-event logic run by the workers of [`spawn_workers`].
#[async_trait]
pub(crate) trait EventHandler: Send + Sync {
    async fn handle(&self, event: &EventContext) -> Verdict;
}

/// Built-in indexer types selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexerKind {
    #[serde(alias = "Noop")]
    Noop,
    #[serde(alias = "Fail")]
    Fail,
    #[serde(alias = "ScoredEvent")]
    ScoredEvent,
}

impl IndexerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexerKind::Noop => "noop",
            IndexerKind::Fail => "fail",
            IndexerKind::ScoredEvent => "scored_event",
        }
    }
}

impl fmt::Display for IndexerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start every configured indexer. Indexers that keep results write them
/// to `players`.
pub fn build_indexers(
    configs: &[IndexerConfig],
    players: &Arc<dyn PlayerStore>,
    cancel: &CancellationToken,
) -> Result<Vec<Arc<dyn Indexer>>> {
    let mut seen = HashSet::new();
    let mut indexers: Vec<Arc<dyn Indexer>> = Vec::with_capacity(configs.len());

    for config in configs {
        if !seen.insert(config.kind) {
            anyhow::bail!("Indexer {} configured more than once", config.kind);
        }

        let indexer: Arc<dyn Indexer> = match config.kind {
            IndexerKind::Noop => Arc::new(NoopIndexer::spawn(cancel.clone())),
            IndexerKind::Fail => Arc::new(FailIndexer::spawn(cancel.clone())),
            IndexerKind::ScoredEvent => {
                let contract = config
                    .contract
                    .as_deref()
                    .context("scored_event indexer requires a contract address")?;
                let contract = Address::from_str(contract)
                    .with_context(|| format!("Invalid contract address: {}", contract))?;
                let threads = config.thread.unwrap_or_else(default_threads);
                Arc::new(ScoredEventIndexer::spawn(
                    contract,
                    threads,
                    players.clone(),
                    cancel.clone(),
                ))
            }
        };

        info!(indexer = indexer.name(), "indexer started");
        indexers.push(indexer);
    }

    Ok(indexers)
}

/// Two workers per core plus one.
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
        + 1
}

/// Spawn `threads` tasks that drain `input`, run `handler` and reply.
///
/// Tasks exit when `cancel` fires or every sender is gone.
pub(crate) fn spawn_workers<H>(
    name: &'static str,
    input: Receiver<EventContext>,
    threads: usize,
    cancel: CancellationToken,
    handler: Arc<H>,
) where
    H: EventHandler + 'static,
{
    for worker in 0..threads.max(1) {
        let input = input.clone();
        let cancel = cancel.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = input.recv() => match event {
                        Ok(event) => event,
                        Err(_) => break,
                    },
                };

                let block = event.block_number();
                let tx = event.transaction.hash;
                let verdict = tokio::select! {
                    _ = cancel.cancelled() => break,
                    verdict = handler.handle(&event) => verdict,
                };
                if event.reply(verdict) == Delivery::Dropped {
                    warn!(indexer = name, block, %tx, "verdict dropped, dispatcher gone");
                } else {
                    debug!(indexer = name, block, %tx, "event processed");
                }
            }
            debug!(indexer = name, worker, "indexer worker stopped");
        });
    }
}

/// Accepts every event.
pub struct NoopIndexer {
    input: Sender<EventContext>,
    handler: Arc<Accept>,
}

#[derive(Default)]
struct Accept {
    accepted: AtomicU64,
}

#[async_trait]
impl EventHandler for Accept {
    async fn handle(&self, _event: &EventContext) -> Verdict {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl NoopIndexer {
    pub fn spawn(cancel: CancellationToken) -> Self {
        let (input, receiver) = async_channel::bounded(INDEXER_INPUT_CAPACITY);
        let handler = Arc::new(Accept::default());
        spawn_workers("noop", receiver, 1, cancel, handler.clone());
        Self { input, handler }
    }
}

#[async_trait]
impl Indexer for NoopIndexer {
    fn name(&self) -> &str {
        IndexerKind::Noop.as_str()
    }

    fn input(&self) -> Sender<EventContext> {
        self.input.clone()
    }

    async fn metrics(&self) -> serde_json::Value {
        json!({
            "waiting_tx": self.input.len(),
            "accepted": self.handler.accepted.load(Ordering::Relaxed),
        })
    }
}

/// Rejects every event.
pub struct FailIndexer {
    input: Sender<EventContext>,
    handler: Arc<Reject>,
}

#[derive(Default)]
struct Reject {
    rejected: AtomicU64,
}

#[async_trait]
impl EventHandler for Reject {
    async fn handle(&self, event: &EventContext) -> Verdict {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        anyhow::bail!(
            "fail indexer rejects tx {} in block {}",
            event.transaction.hash,
            event.block_number()
        )
    }
}

impl FailIndexer {
    pub fn spawn(cancel: CancellationToken) -> Self {
        let (input, receiver) = async_channel::bounded(INDEXER_INPUT_CAPACITY);
        let handler = Arc::new(Reject::default());
        spawn_workers("fail", receiver, 1, cancel, handler.clone());
        Self { input, handler }
    }
}

#[async_trait]
impl Indexer for FailIndexer {
    fn name(&self) -> &str {
        IndexerKind::Fail.as_str()
    }

    fn input(&self) -> Sender<EventContext> {
        self.input.clone()
    }

    async fn metrics(&self) -> serde_json::Value {
        json!({
            "waiting_tx": self.input.len(),
            "rejected": self.handler.rejected.load(Ordering::Relaxed),
        })
    }
}
