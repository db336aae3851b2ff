//! PostgreSQL ledger backend.
//!
//! Same table and semantics as the SQLite backend, with a connection pool
//! sized for several fetch workers and dispatchers writing concurrently.
//! The schema is created on first connect.

use crate::records::{now_millis, BlockRecord, BlockStatus};
use crate::store::{parse_player, player_text, retry_bound, threshold_millis, Ledger, PlayerStore};
use alloy_primitives::Address;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info};

/// Connection options for the Postgres ledger.
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: u32,
    /// Connection timeout (default: 5s)
    pub connect_timeout: Duration,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// PostgreSQL-backed ledger.
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Connect with default options and initialize the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with(database_url, PostgresOptions::default()).await
    }

    /// Connect with explicit pool options and initialize the schema.
    pub async fn connect_with(database_url: &str, opts: PostgresOptions) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(opts.max_connections)
            .acquire_timeout(opts.connect_timeout)
            .connect(database_url)
            .await
            .context("Failed to connect to Postgres ledger")?;

        let ledger = Self { pool };
        ledger.init_schema().await?;
        info!(max_connections = opts.max_connections, "postgres ledger ready");
        Ok(ledger)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS block_status (
                id            BIGSERIAL PRIMARY KEY,
                block_number  BIGINT  NOT NULL UNIQUE,
                status        INTEGER NOT NULL,
                retry_count   BIGINT  NOT NULL DEFAULT 0,
                last_retry_at BIGINT,
                updated_at    BIGINT
            );",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create block_status table")?;

        for (index, column) in [
            ("status_index", "status"),
            ("last_retry_at_index", "last_retry_at"),
        ] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {index} ON block_status ({column});"
            ))
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to create index {}", index))?;
            debug!(index, "index ensured");
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS scored_players (
                id     SERIAL PRIMARY KEY,
                player VARCHAR(42) NOT NULL UNIQUE
            );",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create scored_players table")?;

        Ok(())
    }
}

fn block_numbers(rows: &[PgRow]) -> Result<Vec<u64>> {
    rows.iter()
        .map(|row| {
            row.try_get::<i64, _>("block_number")
                .map(|n| n as u64)
                .context("Failed to decode block_number")
        })
        .collect()
}

fn record_from_row(row: &PgRow) -> Result<BlockRecord> {
    Ok(BlockRecord {
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        status: BlockStatus::from_code(row.try_get::<i32, _>("status")?)?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u64,
        last_retry_at: row.try_get("last_retry_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn add_block(&self, block: u64, status: BlockStatus) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO block_status (block_number, status) VALUES ($1, $2)
             ON CONFLICT (block_number) DO NOTHING",
        )
        .bind(block as i64)
        .bind(status.code())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to add block {}", block))?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_block_status(&self, block: u64, status: BlockStatus) -> Result<()> {
        sqlx::query("UPDATE block_status SET status = $1, updated_at = $2 WHERE block_number = $3")
            .bind(status.code())
            .bind(now_millis())
            .bind(block as i64)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to update status of block {}", block))?;
        Ok(())
    }

    async fn migrate_block_status(
        &self,
        block: u64,
        from: BlockStatus,
        to: BlockStatus,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE block_status SET status = $1, updated_at = $2
             WHERE block_number = $3 AND status = $4",
        )
        .bind(to.code())
        .bind(now_millis())
        .bind(block as i64)
        .bind(from.code())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to migrate block {} from {} to {}", block, from, to))?;
        Ok(result.rows_affected())
    }

    async fn mark_for_retry(&self, block: u64, max_retry: u64) -> Result<()> {
        sqlx::query(
            "UPDATE block_status SET
                status        = $1,
                updated_at    = $2,
                retry_count   = CASE WHEN retry_count < $3 THEN retry_count + 1 ELSE retry_count END,
                last_retry_at = CASE WHEN retry_count < $3 THEN $2 ELSE last_retry_at END
             WHERE block_number = $4",
        )
        .bind(BlockStatus::Retry.code())
        .bind(now_millis())
        .bind(retry_bound(max_retry))
        .bind(block as i64)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to mark block {} for retry", block))?;
        Ok(())
    }

    async fn get_unprocessed_blocks(&self) -> Result<Vec<u64>> {
        let rows = sqlx::query(
            "SELECT block_number FROM block_status WHERE status = $1 ORDER BY block_number",
        )
        .bind(BlockStatus::Unprocessed.code())
        .fetch_all(&self.pool)
        .await
        .context("Failed to load unprocessed blocks")?;
        block_numbers(&rows)
    }

    async fn get_retry_blocks(&self, max_retry: u64, threshold: Duration) -> Result<Vec<u64>> {
        let rows = sqlx::query(
            "SELECT block_number FROM block_status
             WHERE status = $1 AND retry_count < $2 AND last_retry_at IS NOT NULL
               AND last_retry_at < $3
             ORDER BY block_number",
        )
        .bind(BlockStatus::Retry.code())
        .bind(retry_bound(max_retry))
        .bind(now_millis().saturating_sub(threshold_millis(threshold)))
        .fetch_all(&self.pool)
        .await
        .context("Failed to load retry blocks")?;
        block_numbers(&rows)
    }

    async fn get_latest_processed_block(&self) -> Result<u64> {
        let row = sqlx::query(
            "SELECT block_number FROM block_status WHERE status = $1
             ORDER BY block_number DESC LIMIT 1",
        )
        .bind(BlockStatus::Processed.code())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load latest processed block")?;

        match row {
            Some(row) => Ok(row.try_get::<i64, _>("block_number")? as u64),
            None => Ok(0),
        }
    }

    async fn get_block_status(&self, block: u64) -> Result<Option<BlockStatus>> {
        Ok(self.get_block(block).await?.map(|record| record.status))
    }

    async fn get_block(&self, block: u64) -> Result<Option<BlockRecord>> {
        let row = sqlx::query(
            "SELECT block_number, status, retry_count, last_retry_at, updated_at
             FROM block_status WHERE block_number = $1",
        )
        .bind(block as i64)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to load block {}", block))?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn get_blocks(&self, from: u64, to: u64) -> Result<Vec<BlockRecord>> {
        let rows = sqlx::query(
            "SELECT block_number, status, retry_count, last_retry_at, updated_at
             FROM block_status WHERE block_number BETWEEN $1 AND $2
             ORDER BY block_number",
        )
        .bind(from as i64)
        .bind(to as i64)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to load blocks {}..={}", from, to))?;

        rows.iter().map(record_from_row).collect()
    }

    async fn reset_stale_processing_blocks(&self, threshold: Duration) -> Result<u64> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE block_status SET status = $1, updated_at = $2
             WHERE status = $3 AND COALESCE(updated_at, last_retry_at) < $4",
        )
        .bind(BlockStatus::Unprocessed.code())
        .bind(now)
        .bind(BlockStatus::Processing.code())
        .bind(now.saturating_sub(threshold_millis(threshold)))
        .execute(&self.pool)
        .await
        .context("Failed to reset stale processing blocks")?;
        Ok(result.rows_affected())
    }

    async fn get_count_by_status(&self, status: BlockStatus) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM block_status WHERE status = $1")
            .bind(status.code())
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to count {} blocks", status))?;
        Ok(row.try_get::<i64, _>("cnt")? as u64)
    }
}

#[async_trait]
impl PlayerStore for PostgresLedger {
    async fn add_finished_player(&self, player: Address) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO scored_players (player) VALUES ($1) ON CONFLICT (player) DO NOTHING",
        )
        .bind(player_text(&player))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to record player {}", player))?;
        Ok(result.rows_affected() > 0)
    }

    async fn finished_players(&self) -> Result<Vec<Address>> {
        let rows = sqlx::query("SELECT player FROM scored_players ORDER BY lower(player)")
            .fetch_all(&self.pool)
            .await
            .context("Failed to load finished players")?;
        rows.iter()
            .map(|row| parse_player(&row.try_get::<String, _>("player")?))
            .collect()
    }

    async fn finished_player_count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM scored_players")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count finished players")?;
        Ok(row.try_get::<i64, _>("cnt")? as u64)
    }
}
