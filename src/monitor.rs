//! Background sweeps that run beside the pipeline.

use crate::store::Ledger;
use crate::types::Block;
use anyhow::Result;
use async_channel::Sender;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const QUEUE_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Returns blocks stuck in `Processing` longer than `threshold` to `Unprocessed`.
pub struct StaleMonitor {
    ledger: Arc<dyn Ledger>,
    every: Duration,
    threshold: Duration,
    cancel: CancellationToken,
}

impl StaleMonitor {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        every: Duration,
        threshold: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ledger,
            every,
            threshold,
            cancel,
        }
    }

    pub async fn run(self) {
        info!(every = ?self.every, threshold = ?self.threshold, "stale monitor started");
        let mut ticker = interval_at(Instant::now() + self.every, self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("stale sweep failed: {:#}", e);
                    }
                }
            }
        }

        info!("stale monitor stopped");
    }

    pub async fn sweep(&self) -> Result<u64> {
        let reset = self
            .ledger
            .reset_stale_processing_blocks(self.threshold)
            .await?;
        if reset > 0 {
            warn!(reset, "reclaimed stale processing blocks");
        } else {
            debug!("no stale processing blocks");
        }
        Ok(reset)
    }
}

/// Periodically logs the depth of both pipeline queues.
pub async fn report_queue_depths(
    tasks: Sender<u64>,
    ready: Sender<Block>,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + QUEUE_REPORT_INTERVAL, QUEUE_REPORT_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                info!(
                    fetch_tasks = tasks.len(),
                    ready_blocks = ready.len(),
                    "pipeline queue depths"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::BlockStatus;
    use crate::store_sqlite::SqliteLedger;

    #[tokio::test]
    async fn test_sweep_resets_only_stale_rows() {
        let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());
        ledger.add_block(1, BlockStatus::Unprocessed).await.unwrap();
        ledger
            .migrate_block_status(1, BlockStatus::Unprocessed, BlockStatus::Processing)
            .await
            .unwrap();
        ledger.add_block(2, BlockStatus::Processed).await.unwrap();

        let fresh = StaleMonitor::new(
            ledger.clone(),
            Duration::from_secs(60),
            Duration::from_secs(60),
            CancellationToken::new(),
        );
        assert_eq!(fresh.sweep().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let eager = StaleMonitor::new(
            ledger.clone(),
            Duration::from_secs(60),
            Duration::from_millis(5),
            CancellationToken::new(),
        );
        assert_eq!(eager.sweep().await.unwrap(), 1);
        assert_eq!(
            ledger.get_block_status(1).await.unwrap(),
            Some(BlockStatus::Unprocessed)
        );
        assert_eq!(
            ledger.get_block_status(2).await.unwrap(),
            Some(BlockStatus::Processed)
        );
    }

    #[tokio::test]
    async fn test_run_sweeps_on_interval() {
        let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());
        ledger.add_block(7, BlockStatus::Unprocessed).await.unwrap();
        ledger
            .migrate_block_status(7, BlockStatus::Unprocessed, BlockStatus::Processing)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let monitor = StaleMonitor::new(
            ledger.clone(),
            Duration::from_millis(20),
            Duration::ZERO,
            cancel.clone(),
        );
        let handle = tokio::spawn(monitor.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(
            ledger.get_block_status(7).await.unwrap(),
            Some(BlockStatus::Unprocessed)
        );
    }
}
