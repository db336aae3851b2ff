//! Quest indexer service binary
//!
//! Follows the chain from the configured begin block, hands every
//! transaction to the configured indexers and records progress in the
//! ledger so a restart resumes where it stopped.

use anyhow::{Context, Result};
use clap::Parser;
use quest_indexer::config::load_config;
use quest_indexer::indexer::build_indexers;
use quest_indexer::store::open_store;
use quest_indexer::{Fetcher, RpcClient};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Block ingestion service
#[derive(Parser)]
#[command(name = "quest-indexer")]
#[command(about = "Ingest blocks and dispatch transactions to indexers")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Seconds between pipeline metrics reports (0 disables)
    #[arg(long, default_value_t = 30)]
    metrics_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("Starting quest indexer");
    info!("Config: {:?}", args.config);

    let config = load_config(&args.config)?;
    let pipeline = config
        .fetcher
        .resolve()
        .context("Invalid fetcher configuration")?;
    info!("RPC URL: {}", pipeline.rpc_url);
    info!("Ledger: {} at {}", config.db.driver, config.db.url);

    let client = Arc::new(RpcClient::new(&pipeline.rpc_url)?);
    let store = open_store(config.db.driver, &config.db.url)
        .await
        .with_context(|| format!("Failed to open ledger at {}", config.db.url))?;

    let cancel = CancellationToken::new();
    let indexers = build_indexers(&config.indexers, &store.players, &cancel)?;

    let mut fetcher = Fetcher::new(pipeline, client, store.ledger.clone(), cancel.clone())?;
    fetcher.register_indexers(indexers)?;
    let mut tasks = fetcher.start()?;

    let report_every = Duration::from_secs(args.metrics_interval);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
            _ = tokio::time::sleep(report_every), if !report_every.is_zero() => {
                match fetcher.metrics().await {
                    Ok(metrics) => info!("metrics: {}", serde_json::to_string(&metrics)?),
                    Err(e) => error!("failed to collect metrics: {:#}", e),
                }
            }
        }
    }

    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("pipeline task failed: {}", e);
        }
    }

    info!("Quest indexer stopped");
    Ok(())
}
