//! Pipeline assembly
//!
//! `Fetcher` owns the two bounded queues and starts every stage:
//!
//! ```text
//! listener -> fetch-task queue -> fetch workers -> block-ready queue -> dispatchers -> indexers
//! ```
//!
//! The stale monitor and the queue reporter run beside the stages. One
//! cancellation token stops all of them.

use crate::config::PipelineConfig;
use crate::dispatcher::Dispatcher;
use crate::indexer::Indexer;
use crate::listener::Listener;
use crate::monitor::{report_queue_depths, StaleMonitor};
use crate::records::BlockStatus;
use crate::rpc::ChainClient;
use crate::store::Ledger;
use crate::types::Block;
use crate::worker::FetchWorker;
use anyhow::Result;
use async_channel::{Receiver, Sender};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Snapshot served to the metrics surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineMetrics {
    pub latest_block: u64,
    pub highest_synced_block: u64,
    pub waiting_blocks: u64,
    pub processing_blocks: u64,
    pub processed_blocks: u64,
    pub retry_blocks: u64,
    pub blocks_will_be_retried: Vec<u64>,
    pub block_cache_queue_size: usize,
    pub block_fetch_task_queue_size: usize,
    pub indexers: BTreeMap<String, serde_json::Value>,
}

pub struct Fetcher {
    config: Arc<PipelineConfig>,
    client: Arc<dyn ChainClient>,
    ledger: Arc<dyn Ledger>,
    indexers: Vec<Arc<dyn Indexer>>,
    tasks: (Sender<u64>, Receiver<u64>),
    ready: (Sender<Block>, Receiver<Block>),
    cancel: CancellationToken,
    started: bool,
}

impl Fetcher {
    pub fn new(
        config: PipelineConfig,
        client: Arc<dyn ChainClient>,
        ledger: Arc<dyn Ledger>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let tasks = async_channel::bounded(config.cache_capacity);
        let ready = async_channel::bounded(config.cache_capacity);
        Ok(Self {
            config: Arc::new(config),
            client,
            ledger,
            indexers: Vec::new(),
            tasks,
            ready,
            cancel,
            started: false,
        })
    }

    /// Add an indexer. Names must be unique and registration closes at `start`.
    pub fn register_indexer(&mut self, indexer: Arc<dyn Indexer>) -> Result<()> {
        if self.started {
            anyhow::bail!("Cannot register indexer {} after start", indexer.name());
        }
        if self.indexers.iter().any(|i| i.name() == indexer.name()) {
            anyhow::bail!("Indexer {} already registered", indexer.name());
        }
        info!(indexer = indexer.name(), "indexer registered");
        self.indexers.push(indexer);
        Ok(())
    }

    pub fn register_indexers(
        &mut self,
        indexers: impl IntoIterator<Item = Arc<dyn Indexer>>,
    ) -> Result<()> {
        for indexer in indexers {
            self.register_indexer(indexer)?;
        }
        Ok(())
    }

    pub fn indexer_names(&self) -> Vec<&str> {
        self.indexers.iter().map(|i| i.name()).collect()
    }

    /// Spawn every stage. The returned set completes once the token is cancelled.
    pub fn start(&mut self) -> Result<JoinSet<()>> {
        if self.started {
            anyhow::bail!("Fetcher already started");
        }
        if self.indexers.is_empty() {
            warn!("no indexers registered, blocks will be marked processed unchecked");
        }
        self.started = true;

        let config = self.config.clone();
        let indexers: Arc<[Arc<dyn Indexer>]> = self.indexers.clone().into();
        let mut set = JoinSet::new();

        for id in 0..config.workers {
            let worker = FetchWorker::new(
                id,
                self.client.clone(),
                self.ledger.clone(),
                self.tasks.1.clone(),
                self.ready.0.clone(),
                config.max_retry,
                self.cancel.clone(),
            );
            set.spawn(worker.run());
        }

        for id in 0..config.workers {
            let dispatcher = Dispatcher::new(
                id,
                self.client.clone(),
                self.ledger.clone(),
                indexers.clone(),
                config.max_retry,
                config.indexer_timeout,
                self.cancel.clone(),
            );
            set.spawn(dispatcher.run(self.ready.1.clone()));
        }

        let listener = Listener::new(
            config.clone(),
            self.client.clone(),
            self.ledger.clone(),
            self.tasks.0.clone(),
            self.cancel.clone(),
        );
        set.spawn(listener.run());

        let monitor = StaleMonitor::new(
            self.ledger.clone(),
            config.stale_check_interval,
            config.max_processing_time,
            self.cancel.clone(),
        );
        set.spawn(monitor.run());

        set.spawn(report_queue_depths(
            self.tasks.0.clone(),
            self.ready.0.clone(),
            self.cancel.clone(),
        ));

        info!(
            workers = config.workers,
            capacity = config.cache_capacity,
            indexers = self.indexers.len(),
            "fetcher started"
        );
        Ok(set)
    }

    pub async fn metrics(&self) -> Result<PipelineMetrics> {
        let latest_block = self.client.header_by_number(None).await?.number;
        let ledger = &self.ledger;

        let mut indexers = BTreeMap::new();
        for indexer in self.indexers.iter() {
            indexers.insert(indexer.name().to_string(), indexer.metrics().await);
        }

        Ok(PipelineMetrics {
            latest_block,
            highest_synced_block: ledger.get_latest_processed_block().await?,
            waiting_blocks: ledger.get_count_by_status(BlockStatus::Unprocessed).await?,
            processing_blocks: ledger.get_count_by_status(BlockStatus::Processing).await?,
            processed_blocks: ledger.get_count_by_status(BlockStatus::Processed).await?,
            retry_blocks: ledger.get_count_by_status(BlockStatus::Retry).await?,
            blocks_will_be_retried: ledger
                .get_retry_blocks(self.config.max_retry, self.config.retry_interval)
                .await?,
            block_cache_queue_size: self.ready.0.len(),
            block_fetch_task_queue_size: self.tasks.0.len(),
            indexers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::{FailIndexer, NoopIndexer};
    use crate::indexer_scored::ScoredEventIndexer;
    use crate::store::Store;
    use crate::store_sqlite::SqliteLedger;
    use crate::testing::{scored_log, tx_hash, ScriptedChain};
    use alloy_primitives::Address;
    use std::future::Future;
    use std::time::Duration;

    fn fast_config(first_block: u64, max_retry: u64) -> PipelineConfig {
        PipelineConfig {
            first_block,
            cache_capacity: 10,
            workers: 2,
            max_retry,
            poll_interval: Duration::from_millis(20),
            retry_interval: Duration::from_millis(10),
            ..PipelineConfig::default()
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..250 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    async fn all_have<F>(ledger: &Arc<dyn Ledger>, blocks: std::ops::RangeInclusive<u64>, pred: F) -> bool
    where
        F: Fn(&crate::records::BlockRecord) -> bool,
    {
        for block in blocks {
            match ledger.get_block(block).await.unwrap() {
                Some(record) if pred(&record) => {}
                _ => return false,
            }
        }
        true
    }

    #[tokio::test]
    async fn test_noop_pipeline_processes_window() {
        let cancel = CancellationToken::new();
        let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());
        let chain = Arc::new(ScriptedChain::new(103));
        let mut fetcher =
            Fetcher::new(fast_config(100, 3), chain, ledger.clone(), cancel.clone()).unwrap();
        fetcher
            .register_indexer(Arc::new(NoopIndexer::spawn(cancel.clone())))
            .unwrap();
        let mut tasks = fetcher.start().unwrap();

        eventually(|| {
            let ledger = ledger.clone();
            async move {
                all_have(&ledger, 100..=103, |r| r.status == BlockStatus::Processed).await
            }
        })
        .await;

        assert_eq!(ledger.get_latest_processed_block().await.unwrap(), 103);
        assert!(ledger.get_block(99).await.unwrap().is_none());
        assert!(ledger.get_block(104).await.unwrap().is_none());

        let metrics = fetcher.metrics().await.unwrap();
        assert_eq!(metrics.latest_block, 103);
        assert_eq!(metrics.highest_synced_block, 103);
        assert_eq!(metrics.processed_blocks, 4);
        assert!(metrics.indexers.contains_key("noop"));

        cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
    }

    #[tokio::test]
    async fn test_failing_indexer_exhausts_retries() {
        let cancel = CancellationToken::new();
        let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());
        let chain = Arc::new(ScriptedChain::new(103));
        let mut fetcher =
            Fetcher::new(fast_config(100, 2), chain, ledger.clone(), cancel.clone()).unwrap();
        fetcher
            .register_indexer(Arc::new(FailIndexer::spawn(cancel.clone())))
            .unwrap();
        let mut tasks = fetcher.start().unwrap();

        let exhausted =
            |r: &crate::records::BlockRecord| r.status == BlockStatus::Retry && r.retry_count == 2;
        eventually(|| {
            let ledger = ledger.clone();
            async move { all_have(&ledger, 100..=103, exhausted).await }
        })
        .await;

        // Exhausted blocks are never picked up again.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(all_have(&ledger, 100..=103, exhausted).await);
        assert_eq!(ledger.get_latest_processed_block().await.unwrap(), 0);

        let metrics = fetcher.metrics().await.unwrap();
        assert_eq!(metrics.retry_blocks, 4);
        assert!(metrics.blocks_will_be_retried.is_empty());

        cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
    }

    async fn start_scored(
        path: &str,
        chain: Arc<ScriptedChain>,
        contract: Address,
    ) -> (Fetcher, Arc<ScoredEventIndexer>, Store, CancellationToken, JoinSet<()>) {
        let cancel = CancellationToken::new();
        let store = Store::new(SqliteLedger::open(path).await.unwrap());
        let indexer = Arc::new(ScoredEventIndexer::spawn(
            contract,
            2,
            store.players.clone(),
            cancel.clone(),
        ));
        let mut fetcher =
            Fetcher::new(fast_config(1, 3), chain, store.ledger.clone(), cancel.clone()).unwrap();
        fetcher.register_indexer(indexer.clone()).unwrap();
        let tasks = fetcher.start().unwrap();
        (fetcher, indexer, store, cancel, tasks)
    }

    #[tokio::test]
    async fn test_finished_players_survive_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");
        let path = path.to_str().unwrap();
        let contract = Address::repeat_byte(0xc0);
        let alice = Address::repeat_byte(0xaa);

        let chain = Arc::new(ScriptedChain::new(1));
        chain.set_logs(tx_hash(1, 0), vec![scored_log(contract, alice, 9)]);

        {
            let (_fetcher, indexer, store, cancel, mut tasks) =
                start_scored(path, chain.clone(), contract).await;
            eventually(|| {
                let ledger = store.ledger.clone();
                async move { all_have(&ledger, 1..=1, |r| r.status == BlockStatus::Processed).await }
            })
            .await;
            assert_eq!(indexer.finished_players().await.unwrap(), vec![alice]);

            cancel.cancel();
            while let Some(joined) = tasks.join_next().await {
                joined.unwrap();
            }
        }

        // Block 1 is done, so the new process never sees its log again.
        let fetched = chain.fetched().len();
        let (fetcher, indexer, _store, cancel, mut tasks) =
            start_scored(path, chain.clone(), contract).await;
        assert_eq!(indexer.finished_players().await.unwrap(), vec![alice]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(chain.fetched().len(), fetched);
        let metrics = fetcher.metrics().await.unwrap();
        assert_eq!(metrics.highest_synced_block, 1);
        assert_eq!(metrics.indexers["scored_event"]["finished_player_count"], 1);

        cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
    }

    #[tokio::test]
    async fn test_registration_rules() {
        let cancel = CancellationToken::new();
        let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());
        let chain = Arc::new(ScriptedChain::new(0));
        let mut fetcher =
            Fetcher::new(fast_config(1, 3), chain, ledger, cancel.clone()).unwrap();

        fetcher
            .register_indexer(Arc::new(NoopIndexer::spawn(cancel.clone())))
            .unwrap();
        assert!(fetcher
            .register_indexer(Arc::new(NoopIndexer::spawn(cancel.clone())))
            .is_err());
        assert_eq!(fetcher.indexer_names(), vec!["noop"]);

        let mut tasks = fetcher.start().unwrap();
        assert!(fetcher.start().is_err());
        assert!(fetcher
            .register_indexer(Arc::new(FailIndexer::spawn(cancel.clone())))
            .is_err());

        cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());
        let config = PipelineConfig {
            workers: 0,
            ..PipelineConfig::default()
        };
        let result = Fetcher::new(
            config,
            Arc::new(ScriptedChain::new(0)),
            ledger,
            CancellationToken::new(),
        );
        assert!(result.is_err());
    }
}
