//! ledgerctl - block ledger CLI tool
//!
//! Inspect block states, list retry candidates and repair stuck rows in the
//! ledger used by the ingestion pipeline.

use quest_indexer::cli;

#[tokio::main]
async fn main() {
    if let Err(e) = cli::run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
