//! Quest indexer - resumable block ingestion pipeline
//!
//! Blocks move through a persisted ledger (`Unprocessed`, `Processing`,
//! `Processed`, `Retry`) while a listener, a pool of fetch workers and a set
//! of dispatchers hand every transaction to the registered indexers. The
//! ledger is the only source of truth, so the pipeline resumes where it left
//! off after a restart.

pub mod cli;
pub mod config;
pub mod keys;
pub mod records;
pub mod rpc;
pub mod store;
pub mod store_postgres;
pub mod store_sqlite;
pub mod types;

// Pipeline modules
pub mod dispatcher;
pub mod fetcher;
pub mod indexer;
pub mod indexer_scored;
pub mod listener;
pub mod monitor;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

// Re-export the main types for convenience
pub use config::{Config, PipelineConfig};
pub use fetcher::{Fetcher, PipelineMetrics};
pub use indexer::{build_indexers, Delivery, EventContext, Indexer, Verdict};
pub use records::{BlockRecord, BlockStatus};
pub use rpc::{ChainClient, RpcClient};
pub use store::{open_store, Ledger, PlayerStore, RocksLedger, Store, StoreDriver};
