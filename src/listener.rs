//! Block listener
//!
//! Polls the chain head, admits new block numbers into the ledger and feeds
//! the fetch-task queue. The admission window never reaches further than
//! `cache_capacity` blocks past the resume cursor.

use crate::config::PipelineConfig;
use crate::records::BlockStatus;
use crate::rpc::ChainClient;
use crate::store::Ledger;
use anyhow::{Context, Result};
use async_channel::Sender;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Last processed block, floored so the first admitted block is `first_block`.
pub fn resume_cursor(latest_processed: u64, first_block: u64) -> u64 {
    latest_processed.max(first_block.saturating_sub(1))
}

/// Block numbers to admit this tick, or `None` when caught up.
pub fn fetch_window(cursor: u64, head: u64, capacity: usize) -> Option<RangeInclusive<u64>> {
    let start = cursor.checked_add(1)?;
    let end = head.min(cursor.saturating_add(capacity as u64));
    (start <= end).then(|| start..=end)
}

/// What one listener tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub head: u64,
    pub admitted: u64,
    pub queued: usize,
}

pub struct Listener {
    config: Arc<PipelineConfig>,
    client: Arc<dyn ChainClient>,
    ledger: Arc<dyn Ledger>,
    tasks: Sender<u64>,
    cancel: CancellationToken,
}

impl Listener {
    pub fn new(
        config: Arc<PipelineConfig>,
        client: Arc<dyn ChainClient>,
        ledger: Arc<dyn Ledger>,
        tasks: Sender<u64>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            client,
            ledger,
            tasks,
            cancel,
        }
    }

    /// Run ticks until cancelled, pacing each one to `poll_interval`.
    pub async fn run(self) {
        info!(
            first_block = self.config.first_block,
            capacity = self.config.cache_capacity,
            "listener started"
        );

        loop {
            let started = Instant::now();
            let pause = match self.tick().await {
                Ok(summary) => {
                    debug!(
                        head = summary.head,
                        admitted = summary.admitted,
                        queued = summary.queued,
                        "listener tick"
                    );
                    self.config.poll_interval.saturating_sub(started.elapsed())
                }
                Err(e) => {
                    warn!("listener tick failed: {:#}", e);
                    self.config.retry_interval
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("listener stopped");
    }

    /// One pass: read head, admit the window, queue fetchable blocks.
    pub async fn tick(&self) -> Result<TickSummary> {
        let head = self
            .client
            .header_by_number(None)
            .await
            .context("Failed to fetch chain head")?
            .number;

        let latest = self.ledger.get_latest_processed_block().await?;
        let cursor = resume_cursor(latest, self.config.first_block);

        let mut summary = TickSummary {
            head,
            ..TickSummary::default()
        };

        if let Some(window) = fetch_window(cursor, head, self.config.cache_capacity) {
            for block in window {
                if self.ledger.add_block(block, BlockStatus::Unprocessed).await? {
                    summary.admitted += 1;
                }
            }
        }

        let mut pending = self.ledger.get_unprocessed_blocks().await?;
        pending.extend(
            self.ledger
                .get_retry_blocks(self.config.max_retry, self.config.retry_interval)
                .await?,
        );

        for block in pending {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(summary),
                sent = self.tasks.send(block) => {
                    sent.context("Fetch-task queue closed")?;
                    summary.queued += 1;
                }
            }
        }

        Ok(summary)
    }
}
