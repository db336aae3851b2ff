//! Fetch workers: block number in, materialized block out.

use crate::rpc::ChainClient;
use crate::store::Ledger;
use crate::types::Block;
use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct FetchWorker {
    id: usize,
    client: Arc<dyn ChainClient>,
    ledger: Arc<dyn Ledger>,
    tasks: Receiver<u64>,
    ready: Sender<Block>,
    max_retry: u64,
    cancel: CancellationToken,
}

impl FetchWorker {
    pub fn new(
        id: usize,
        client: Arc<dyn ChainClient>,
        ledger: Arc<dyn Ledger>,
        tasks: Receiver<u64>,
        ready: Sender<Block>,
        max_retry: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            client,
            ledger,
            tasks,
            ready,
            max_retry,
            cancel,
        }
    }

    pub async fn run(self) {
        debug!(worker = self.id, "fetch worker started");

        loop {
            let block = tokio::select! {
                _ = self.cancel.cancelled() => break,
                task = self.tasks.recv() => match task {
                    Ok(block) => block,
                    Err(_) => break,
                },
            };

            let fetched = match self.fetch(block).await {
                Ok(Some(fetched)) => fetched,
                Ok(None) => continue,
                Err(e) => {
                    warn!(worker = self.id, block, "block fetch failed: {:#}", e);
                    continue;
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                sent = self.ready.send(fetched) => {
                    if sent.is_err() {
                        warn!(worker = self.id, "block-ready queue closed");
                        break;
                    }
                }
            }
        }

        info!(worker = self.id, "fetch worker stopped");
    }

    /// Fetch `block` unless another worker already claimed or finished it,
    /// or its retries are exhausted.
    pub async fn fetch(&self, block: u64) -> Result<Option<Block>> {
        let Some(record) = self.ledger.get_block(block).await? else {
            debug!(worker = self.id, block, "block not in ledger, skipping");
            return Ok(None);
        };
        if !record.is_fetchable(self.max_retry) {
            debug!(
                worker = self.id,
                block,
                status = %record.status,
                retries = record.retry_count,
                "skipping block"
            );
            return Ok(None);
        }

        let fetched = self
            .client
            .block_by_number(block)
            .await
            .with_context(|| format!("Failed to fetch block {}", block))?;
        debug!(
            worker = self.id,
            block,
            transactions = fetched.transactions.len(),
            "block fetched"
        );
        Ok(Some(fetched))
    }
}
