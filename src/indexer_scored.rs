//! Scored event indexer
//!
//! Watches `Scored(address player, uint256 score)` logs emitted by one
//! contract and records every player that reaches the finishing score.
//! Both event fields are non-indexed, so they live in the 64-byte log data.
//! Finished players go to the configured store, so they outlive the process
//! that saw their blocks.

use crate::indexer::{spawn_workers, EventContext, EventHandler, Indexer, IndexerKind, Verdict};
use crate::store::PlayerStore;
use crate::types::Log;
use alloy_primitives::{keccak256, Address, B256, U256};
use anyhow::Context;
use async_channel::Sender;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const SCORED_SIGNATURE: &str = "Scored(address,uint256)";
const FINISHING_SCORE: u64 = 5;
const BACKLOG_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Decoded `Scored` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scored {
    pub player: Address,
    pub score: U256,
}

/// topic0 of every `Scored` log.
pub fn scored_topic() -> B256 {
    keccak256(SCORED_SIGNATURE.as_bytes())
}

/// Decode the ABI-encoded `(address, uint256)` payload of a `Scored` log.
pub fn decode_scored(data: &[u8]) -> anyhow::Result<Scored> {
    if data.len() != 64 {
        anyhow::bail!("Scored data must be 64 bytes, got {}", data.len());
    }
    if data[..12].iter().any(|b| *b != 0) {
        anyhow::bail!("Scored player word has dirty high bytes");
    }
    let player = Address::from_slice(&data[12..32]);
    let score = U256::try_from_be_slice(&data[32..64]).context("Invalid score word")?;
    Ok(Scored { player, score })
}

struct ScoredHandler {
    contract: Address,
    topic: B256,
    players: Arc<dyn PlayerStore>,
}

#[async_trait]
impl EventHandler for ScoredHandler {
    async fn handle(&self, event: &EventContext) -> Verdict {
        for log in &event.receipt.logs {
            if let Some(scored) = self.match_log(log)? {
                self.record(event, scored).await?;
            }
        }
        Ok(())
    }
}

impl ScoredHandler {
    fn match_log(&self, log: &Log) -> anyhow::Result<Option<Scored>> {
        if log.address != self.contract {
            return Ok(None);
        }
        if log.topics.first() != Some(&self.topic) {
            return Ok(None);
        }
        decode_scored(&log.data).map(Some)
    }

    async fn record(&self, event: &EventContext, scored: Scored) -> anyhow::Result<()> {
        let block = event.block_number();
        if scored.player == Address::ZERO {
            debug!(block, score = %scored.score, "npc scored, ignored");
            return Ok(());
        }
        if scored.score < U256::from(FINISHING_SCORE) {
            debug!(block, player = %scored.player, score = %scored.score, "below finishing score");
            return Ok(());
        }

        // Logs can be delivered again on retry; the store ignores repeats.
        if self
            .players
            .add_finished_player(scored.player)
            .await
            .with_context(|| format!("Failed to record finished player {}", scored.player))?
        {
            info!(block, player = %scored.player, score = %scored.score, "player finished");
        }
        Ok(())
    }
}

/// Indexer recording players whose score reaches the finishing threshold.
pub struct ScoredEventIndexer {
    input: Sender<EventContext>,
    players: Arc<dyn PlayerStore>,
}

impl ScoredEventIndexer {
    /// Start `threads` workers filtering logs from `contract` and recording
    /// finished players in `players`.
    pub fn spawn(
        contract: Address,
        threads: usize,
        players: Arc<dyn PlayerStore>,
        cancel: CancellationToken,
    ) -> Self {
        let (input, receiver) = async_channel::bounded(crate::indexer::INDEXER_INPUT_CAPACITY);
        let handler = Arc::new(ScoredHandler {
            contract,
            topic: scored_topic(),
            players: players.clone(),
        });
        spawn_workers("scored_event", receiver, threads, cancel.clone(), handler);

        let backlog = input.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BACKLOG_LOG_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!(waiting = backlog.len(), "scored event backlog");
                    }
                }
            }
        });

        info!(%contract, threads, "scored event indexer running");
        Self { input, players }
    }

    /// Players recorded so far, in address order.
    pub async fn finished_players(&self) -> anyhow::Result<Vec<Address>> {
        self.players.finished_players().await
    }
}

#[async_trait]
impl Indexer for ScoredEventIndexer {
    fn name(&self) -> &str {
        IndexerKind::ScoredEvent.as_str()
    }

    fn input(&self) -> Sender<EventContext> {
        self.input.clone()
    }

    async fn metrics(&self) -> serde_json::Value {
        match self.finished_players().await {
            Ok(players) => json!({
                "waiting_tx": self.input.len(),
                "finished_player_count": players.len(),
                "finished_players": players,
            }),
            Err(e) => {
                error!("failed to load finished players: {:#}", e);
                json!({
                    "waiting_tx": self.input.len(),
                    "error": format!("{:#}", e),
                })
            }
        }
    }
}
