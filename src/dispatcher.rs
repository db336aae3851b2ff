//! Event dispatcher
//!
//! Takes materialized blocks off the block-ready queue, fans every
//! transaction out to all registered indexers and settles the block in the
//! ledger: `Processed` when every indexer accepted every transaction,
//! `Retry` otherwise. Transactions are confirmed in block order; indexers
//! for one transaction run concurrently.

use crate::indexer::{EventContext, Indexer};
use crate::records::BlockStatus;
use crate::rpc::ChainClient;
use crate::store::Ledger;
use crate::types::{Block, Header, Receipt, Transaction};
use alloy_primitives::B256;
use anyhow::Result;
use async_channel::Receiver;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a transaction could not be confirmed.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to fetch receipt for tx {tx}: {reason}")]
    Receipt { tx: B256, reason: String },

    #[error("indexer {indexer} rejected the event: {reason}")]
    Rejected { indexer: String, reason: String },

    #[error("indexer {indexer} dropped the event")]
    Dropped { indexer: String },

    #[error("indexer {indexer} did not reply within {after:?}")]
    TimedOut { indexer: String, after: Duration },

    #[error("dispatch cancelled")]
    Cancelled,
}

/// Hand one transaction to every indexer and collect one result from each.
///
/// Results come back in registration order. Only cancellation short-circuits
/// the wait.
pub async fn fan_out(
    indexers: &[Arc<dyn Indexer>],
    header: &Arc<Header>,
    transaction: &Arc<Transaction>,
    receipt: &Arc<Receipt>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<Result<(), DispatchError>>, DispatchError> {
    let deliveries = indexers.iter().map(|indexer| {
        let (context, reply) =
            EventContext::new(header.clone(), transaction.clone(), receipt.clone());
        let input = indexer.input();
        let name = indexer.name().to_string();

        async move {
            let outcome = tokio::time::timeout(timeout, async {
                if input.send(context).await.is_err() {
                    return Err(DispatchError::Dropped {
                        indexer: name.clone(),
                    });
                }
                match reply.await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(DispatchError::Rejected {
                        indexer: name.clone(),
                        reason: format!("{:#}", e),
                    }),
                    Err(_) => Err(DispatchError::Dropped {
                        indexer: name.clone(),
                    }),
                }
            })
            .await;

            match outcome {
                Ok(result) => result,
                Err(_) => Err(DispatchError::TimedOut {
                    indexer: name,
                    after: timeout,
                }),
            }
        }
    });

    tokio::select! {
        _ = cancel.cancelled() => Err(DispatchError::Cancelled),
        results = join_all(deliveries) => Ok(results),
    }
}

pub struct Dispatcher {
    id: usize,
    client: Arc<dyn ChainClient>,
    ledger: Arc<dyn Ledger>,
    indexers: Arc<[Arc<dyn Indexer>]>,
    max_retry: u64,
    indexer_timeout: Duration,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        id: usize,
        client: Arc<dyn ChainClient>,
        ledger: Arc<dyn Ledger>,
        indexers: Arc<[Arc<dyn Indexer>]>,
        max_retry: u64,
        indexer_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            client,
            ledger,
            indexers,
            max_retry,
            indexer_timeout,
            cancel,
        }
    }

    pub async fn run(self, ready: Receiver<Block>) {
        debug!(dispatcher = self.id, "dispatcher started");

        loop {
            let block = tokio::select! {
                _ = self.cancel.cancelled() => break,
                block = ready.recv() => match block {
                    Ok(block) => block,
                    Err(_) => break,
                },
            };

            let number = block.number();
            if let Err(e) = self.process_block(block).await {
                warn!(dispatcher = self.id, block = number, "failed to settle block: {:#}", e);
            }
        }

        info!(dispatcher = self.id, "dispatcher stopped");
    }

    /// Claim the block, dispatch its transactions and record the outcome.
    pub async fn process_block(&self, block: Block) -> Result<()> {
        let number = block.number();
        self.claim(number).await?;

        match self.dispatch_transactions(&block).await {
            Ok(()) => {
                self.ledger
                    .update_block_status(number, BlockStatus::Processed)
                    .await?;
                info!(
                    block = number,
                    transactions = block.transactions.len(),
                    "block processed"
                );
            }
            Err(DispatchError::Cancelled) => {
                // Left in Processing; the stale monitor reclaims it after restart.
                debug!(block = number, "dispatch cancelled");
            }
            Err(e) => {
                warn!(block = number, "block failed: {}", e);
                self.ledger.mark_for_retry(number, self.max_retry).await?;
            }
        }
        Ok(())
    }

    async fn claim(&self, block: u64) -> Result<()> {
        let claimed = self
            .ledger
            .migrate_block_status(block, BlockStatus::Unprocessed, BlockStatus::Processing)
            .await?;
        if claimed > 0 {
            return Ok(());
        }

        let claimed = self
            .ledger
            .migrate_block_status(block, BlockStatus::Retry, BlockStatus::Processing)
            .await?;
        if claimed == 0 {
            debug!(block, "block already claimed, dispatching anyway");
        }
        Ok(())
    }

    async fn dispatch_transactions(&self, block: &Block) -> Result<(), DispatchError> {
        let header = Arc::new(block.header.clone());

        for transaction in &block.transactions {
            if transaction.is_contract_creation() {
                debug!(block = header.number, tx = %transaction.hash, "skipping contract creation");
                continue;
            }

            let receipt = self
                .client
                .transaction_receipt(transaction.hash)
                .await
                .map_err(|e| DispatchError::Receipt {
                    tx: transaction.hash,
                    reason: format!("{:#}", e),
                })?;

            let transaction = Arc::new(transaction.clone());
            let results = fan_out(
                &self.indexers,
                &header,
                &transaction,
                &Arc::new(receipt),
                self.indexer_timeout,
                &self.cancel,
            )
            .await?;

            for result in results {
                result?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::{FailIndexer, NoopIndexer, Verdict};
    use crate::store_sqlite::SqliteLedger;
    use crate::testing::{event_parts, sample_receipt, sample_tx, target, tx_hash, ScriptedChain};
    use async_channel::Sender;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records the transactions it sees; never replies when `silent`.
    struct Recorder {
        name: String,
        input: Sender<EventContext>,
        seen: Arc<Mutex<Vec<B256>>>,
    }

    impl Recorder {
        fn spawn(name: &str, silent: bool) -> Arc<Self> {
            let (input, receiver) = async_channel::bounded::<EventContext>(16);
            let seen = Arc::new(Mutex::new(Vec::new()));
            let log = seen.clone();
            tokio::spawn(async move {
                let mut parked = Vec::new();
                while let Ok(event) = receiver.recv().await {
                    log.lock().unwrap().push(event.transaction.hash);
                    if silent {
                        parked.push(event);
                    } else {
                        let verdict: Verdict = Ok(());
                        event.reply(verdict);
                    }
                }
            });
            Arc::new(Self {
                name: name.to_string(),
                input,
                seen,
            })
        }
    }

    #[async_trait::async_trait]
    impl Indexer for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn input(&self) -> Sender<EventContext> {
            self.input.clone()
        }

        async fn metrics(&self) -> serde_json::Value {
            json!({})
        }
    }

    fn parts() -> (Arc<Header>, Arc<Transaction>, Arc<Receipt>) {
        let (header, tx) = event_parts(1);
        (header, tx, Arc::new(sample_receipt(vec![])))
    }

    #[tokio::test]
    async fn test_fan_out_collects_one_result_per_indexer() {
        let cancel = CancellationToken::new();
        let recorders: Vec<Arc<Recorder>> = (0..3)
            .map(|i| Recorder::spawn(&format!("r{}", i), false))
            .collect();
        let indexers: Vec<Arc<dyn Indexer>> = recorders
            .iter()
            .map(|r| r.clone() as Arc<dyn Indexer>)
            .collect();
        let (header, tx, receipt) = parts();

        let results = fan_out(&indexers, &header, &tx, &receipt, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_ok()));
        for recorder in &recorders {
            assert_eq!(recorder.seen.lock().unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_fan_out_times_out_silent_indexer() {
        let cancel = CancellationToken::new();
        let indexers: Vec<Arc<dyn Indexer>> = vec![
            Recorder::spawn("fast", false),
            Recorder::spawn("silent", true),
        ];
        let (header, tx, receipt) = parts();

        let results = fan_out(
            &indexers,
            &header,
            &tx,
            &receipt,
            Duration::from_millis(50),
            &cancel,
        )
        .await
        .unwrap();
        assert!(results[0].is_ok());
        assert!(matches!(
            &results[1],
            Err(DispatchError::TimedOut { indexer, .. }) if indexer == "silent"
        ));
    }

    #[tokio::test]
    async fn test_fan_out_reports_rejection() {
        let cancel = CancellationToken::new();
        let indexers: Vec<Arc<dyn Indexer>> = vec![
            Arc::new(NoopIndexer::spawn(cancel.clone())),
            Arc::new(FailIndexer::spawn(cancel.clone())),
        ];
        let (header, tx, receipt) = parts();

        let results = fan_out(&indexers, &header, &tx, &receipt, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert!(results[0].is_ok());
        assert!(matches!(
            &results[1],
            Err(DispatchError::Rejected { indexer, .. }) if indexer == "fail"
        ));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_fan_out_cancelled() {
        let cancel = CancellationToken::new();
        let indexers: Vec<Arc<dyn Indexer>> = vec![Recorder::spawn("silent", true)];
        let (header, tx, receipt) = parts();
        cancel.cancel();

        let result = fan_out(&indexers, &header, &tx, &receipt, Duration::from_secs(5), &cancel).await;
        assert!(matches!(result, Err(DispatchError::Cancelled)));
    }

    async fn dispatcher_with(
        chain: Arc<ScriptedChain>,
        indexers: Vec<Arc<dyn Indexer>>,
    ) -> (Dispatcher, Arc<dyn Ledger>) {
        let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());
        let dispatcher = Dispatcher::new(
            0,
            chain,
            ledger.clone(),
            indexers.into(),
            2,
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        (dispatcher, ledger)
    }

    #[tokio::test]
    async fn test_block_processed_in_transaction_order() {
        let chain = Arc::new(ScriptedChain::new(10));
        chain.set_transactions(
            4,
            vec![
                sample_tx(tx_hash(4, 0), Some(target())),
                sample_tx(tx_hash(4, 1), None),
                sample_tx(tx_hash(4, 2), Some(target())),
            ],
        );
        let recorder = Recorder::spawn("recorder", false);
        let (dispatcher, ledger) = dispatcher_with(chain.clone(), vec![recorder.clone()]).await;
        ledger.add_block(4, BlockStatus::Unprocessed).await.unwrap();

        let block = chain.block_by_number(4).await.unwrap();
        dispatcher.process_block(block).await.unwrap();

        assert_eq!(
            ledger.get_block_status(4).await.unwrap(),
            Some(BlockStatus::Processed)
        );
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![tx_hash(4, 0), tx_hash(4, 2)]
        );
    }

    #[tokio::test]
    async fn test_rejection_marks_block_for_retry() {
        let cancel = CancellationToken::new();
        let chain = Arc::new(ScriptedChain::new(10));
        let (dispatcher, ledger) =
            dispatcher_with(chain.clone(), vec![Arc::new(FailIndexer::spawn(cancel.clone()))])
                .await;
        ledger.add_block(3, BlockStatus::Unprocessed).await.unwrap();

        let block = chain.block_by_number(3).await.unwrap();
        dispatcher.process_block(block).await.unwrap();

        let record = ledger.get_block(3).await.unwrap().unwrap();
        assert_eq!(record.status, BlockStatus::Retry);
        assert_eq!(record.retry_count, 1);
        assert!(record.last_retry_at.is_some());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_receipt_failure_stops_block() {
        let chain = Arc::new(ScriptedChain::new(10));
        chain.set_transactions(
            6,
            vec![
                sample_tx(tx_hash(6, 0), Some(target())),
                sample_tx(tx_hash(6, 1), Some(target())),
            ],
        );
        chain.fail_receipt(tx_hash(6, 0));
        let recorder = Recorder::spawn("recorder", false);
        let (dispatcher, ledger) = dispatcher_with(chain.clone(), vec![recorder.clone()]).await;
        ledger.add_block(6, BlockStatus::Unprocessed).await.unwrap();

        let block = chain.block_by_number(6).await.unwrap();
        dispatcher.process_block(block).await.unwrap();

        assert_eq!(
            ledger.get_block_status(6).await.unwrap(),
            Some(BlockStatus::Retry)
        );
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_block_is_reclaimed() {
        let chain = Arc::new(ScriptedChain::new(10));
        let (dispatcher, ledger) =
            dispatcher_with(chain.clone(), vec![Recorder::spawn("recorder", false)]).await;
        ledger.add_block(8, BlockStatus::Processing).await.unwrap();
        ledger.mark_for_retry(8, 2).await.unwrap();

        let block = chain.block_by_number(8).await.unwrap();
        dispatcher.process_block(block).await.unwrap();

        let record = ledger.get_block(8).await.unwrap().unwrap();
        assert_eq!(record.status, BlockStatus::Processed);
        assert_eq!(record.retry_count, 1);
    }
}
