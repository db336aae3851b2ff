//! CLI implementation for ledgerctl
//!
//! Inspects and repairs a block ledger from the command line. All commands
//! output pretty JSON.

use crate::records::{BlockRecord, BlockStatus};
use crate::store::{open_store, Ledger, PlayerStore, StoreDriver};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::time::Duration;

/// Block ledger CLI tool
#[derive(Parser)]
#[command(name = "ledgerctl")]
#[command(about = "Inspect and repair the block ingestion ledger")]
pub struct Cli {
    /// Ledger backend (rocksdb, sqlite, postgres)
    #[arg(long, default_value = "rocksdb")]
    driver: StoreDriver,

    /// Database directory, file or connection URL
    #[arg(short, long, default_value = "./ledger_db")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the ledger row of a block
    Status {
        /// Block number
        block: u64,
    },
    /// Show rows for a range of blocks
    Range {
        /// First block number
        from: u64,
        /// Last block number (inclusive)
        to: u64,
    },
    /// Highest processed block
    Latest,
    /// Number of blocks in each status
    Counts,
    /// Blocks currently eligible for retry
    RetryList {
        /// Retry bound used by the pipeline
        #[arg(long, default_value_t = 3)]
        max_retry: u64,
        /// Minimum time since the last retry (e.g. 200ms, 1m)
        #[arg(long, default_value = "200ms")]
        threshold: String,
    },
    /// Return blocks stuck in processing to unprocessed
    ResetStale {
        /// Minimum time since the last status change (e.g. 5m)
        #[arg(long, default_value = "5m")]
        threshold: String,
    },
    /// Admit a block
    Add {
        /// Block number
        block: u64,
        /// Initial status
        #[arg(long, default_value = "unprocessed")]
        status: BlockStatus,
    },
    /// Send a block in retry back to unprocessed for another round
    Requeue {
        /// Block number
        block: u64,
    },
    /// Players recorded by the scored_event indexer
    Players,
}

fn parse_threshold(s: &str) -> Result<Duration> {
    duration_str::parse_std(s)
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("Invalid duration: {}", s))
}

fn record_json(record: &BlockRecord) -> serde_json::Value {
    json!({
        "block": record.block_number,
        "status": record.status.to_string(),
        "retry_count": record.retry_count,
        "last_retry_at": record.last_retry_at,
        "updated_at": record.updated_at,
    })
}

/// Run one command against an open store.
pub async fn execute(
    ledger: &dyn Ledger,
    players: &dyn PlayerStore,
    command: Commands,
) -> Result<serde_json::Value> {
    let result = match command {
        Commands::Status { block } => match ledger.get_block(block).await? {
            Some(record) => record_json(&record),
            None => json!({ "block": block, "status": null }),
        },
        Commands::Range { from, to } => {
            if from > to {
                anyhow::bail!("Empty range {}..={}", from, to);
            }
            let records = ledger.get_blocks(from, to).await?;
            json!({
                "from": from,
                "to": to,
                "blocks": records.iter().map(record_json).collect::<Vec<_>>(),
            })
        }
        Commands::Latest => {
            json!({ "latest_processed_block": ledger.get_latest_processed_block().await? })
        }
        Commands::Counts => {
            let mut counts = serde_json::Map::new();
            for status in BlockStatus::ALL {
                let count = ledger.get_count_by_status(status).await?;
                counts.insert(status.to_string(), json!(count));
            }
            serde_json::Value::Object(counts)
        }
        Commands::RetryList {
            max_retry,
            threshold,
        } => {
            let blocks = ledger
                .get_retry_blocks(max_retry, parse_threshold(&threshold)?)
                .await?;
            json!({ "max_retry": max_retry, "blocks": blocks })
        }
        Commands::ResetStale { threshold } => {
            let reset = ledger
                .reset_stale_processing_blocks(parse_threshold(&threshold)?)
                .await?;
            json!({ "status": "ok", "reset": reset })
        }
        Commands::Add { block, status } => {
            let added = ledger.add_block(block, status).await?;
            json!({ "status": "ok", "block": block, "added": added })
        }
        Commands::Requeue { block } => {
            let moved = ledger
                .migrate_block_status(block, BlockStatus::Retry, BlockStatus::Unprocessed)
                .await?;
            if moved == 0 {
                anyhow::bail!("Block {} is not in retry", block);
            }
            json!({ "status": "ok", "block": block })
        }
        Commands::Players => {
            let finished = players.finished_players().await?;
            json!({ "finished_player_count": finished.len(), "finished_players": finished })
        }
    };
    Ok(result)
}

/// Parse arguments, run the command and print JSON output.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let store = open_store(cli.driver, &cli.url)
        .await
        .with_context(|| format!("Failed to open {} ledger at {}", cli.driver, cli.url))?;

    let result = execute(store.ledger.as_ref(), store.players.as_ref(), cli.command).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
