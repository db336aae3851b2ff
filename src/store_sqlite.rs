//! SQLite ledger backend.
//!
//! Persists the `block_status` table to a single SQLite file through `sqlx`.
//! Timestamps are stored as unix milliseconds so that every backend shares
//! one clock (the process) and one comparison rule.

use crate::records::{now_millis, BlockRecord, BlockStatus};
use crate::store::{parse_player, player_text, retry_bound, threshold_millis, Ledger, PlayerStore};
use alloy_primitives::Address;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::time::Duration;
use tracing::debug;

/// SQLite-backed ledger.
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Open (or create) a SQLite ledger at `path`.
    ///
    /// The path may be a plain file path (`"./quest.db"`), a full SQLite URL
    /// (`"sqlite:./quest.db?mode=rwc"`), or `"sqlite::memory:"`.
    pub async fn open(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        // Every connection to `:memory:` is a distinct database, so an
        // in-memory ledger is pinned to one connection that never expires.
        let options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };

        let pool = options
            .connect(&url)
            .await
            .with_context(|| format!("Failed to open SQLite ledger at {}", path))?;

        let ledger = Self { pool };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    /// Open an in-memory SQLite ledger. All data is lost when dropped.
    pub async fn in_memory() -> Result<Self> {
        Self::open("sqlite::memory:").await
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .context("Failed to enable WAL mode")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS block_status (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                block_number  INTEGER NOT NULL UNIQUE,
                status        INTEGER NOT NULL,
                retry_count   INTEGER NOT NULL DEFAULT 0,
                last_retry_at INTEGER,
                updated_at    INTEGER
            );",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create block_status table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_block_status_status ON block_status (status);")
            .execute(&self.pool)
            .await
            .context("Failed to create status index")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS scored_players (
                id     INTEGER PRIMARY KEY AUTOINCREMENT,
                player TEXT NOT NULL UNIQUE
            );",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create scored_players table")?;

        Ok(())
    }
}

fn block_numbers(rows: &[SqliteRow]) -> Result<Vec<u64>> {
    rows.iter()
        .map(|row| {
            row.try_get::<i64, _>("block_number")
                .map(|n| n as u64)
                .context("Failed to decode block_number")
        })
        .collect()
}

fn record_from_row(row: &SqliteRow) -> Result<BlockRecord> {
    Ok(BlockRecord {
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        status: BlockStatus::from_code(row.try_get::<i32, _>("status")?)?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u64,
        last_retry_at: row.try_get("last_retry_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn add_block(&self, block: u64, status: BlockStatus) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO block_status (block_number, status) VALUES (?, ?)",
        )
        .bind(block as i64)
        .bind(status.code())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to add block {}", block))?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_block_status(&self, block: u64, status: BlockStatus) -> Result<()> {
        sqlx::query("UPDATE block_status SET status = ?, updated_at = ? WHERE block_number = ?")
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
            "UPDATE block_status SET status = ?, updated_at = ?
             WHERE block_number = ? AND status = ?",
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
        let now = now_millis();
        sqlx::query(
            "UPDATE block_status SET
                status        = ?,
                updated_at    = ?,
                retry_count   = CASE WHEN retry_count < ? THEN retry_count + 1 ELSE retry_count END,
                last_retry_at = CASE WHEN retry_count < ? THEN ? ELSE last_retry_at END
             WHERE block_number = ?",
        )
        .bind(BlockStatus::Retry.code())
        .bind(now)
        .bind(retry_bound(max_retry))
        .bind(retry_bound(max_retry))
        .bind(now)
        .bind(block as i64)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to mark block {} for retry", block))?;
        Ok(())
    }

    async fn get_unprocessed_blocks(&self) -> Result<Vec<u64>> {
        let rows = sqlx::query(
            "SELECT block_number FROM block_status WHERE status = ? ORDER BY block_number",
        )
        .bind(BlockStatus::Unprocessed.code())
        .fetch_all(&self.pool)
        .await
        .context("Failed to load unprocessed blocks")?;
        block_numbers(&rows)
    }

    async fn get_retry_blocks(&self, max_retry: u64, threshold: Duration) -> Result<Vec<u64>> {
        let cutoff = now_millis().saturating_sub(threshold_millis(threshold));
        let rows = sqlx::query(
            "SELECT block_number FROM block_status
             WHERE status = ? AND retry_count < ? AND last_retry_at IS NOT NULL
               AND last_retry_at < ?
             ORDER BY block_number",
        )
        .bind(BlockStatus::Retry.code())
        .bind(retry_bound(max_retry))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load retry blocks")?;
        block_numbers(&rows)
    }

    async fn get_latest_processed_block(&self) -> Result<u64> {
        let row = sqlx::query(
            "SELECT block_number FROM block_status WHERE status = ?
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
             FROM block_status WHERE block_number = ?",
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
             FROM block_status WHERE block_number BETWEEN ? AND ?
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
            "UPDATE block_status SET status = ?, updated_at = ?
             WHERE status = ? AND COALESCE(updated_at, last_retry_at) < ?",
        )
        .bind(BlockStatus::Unprocessed.code())
        .bind(now)
        .bind(BlockStatus::Processing.code())
        .bind(now.saturating_sub(threshold_millis(threshold)))
        .execute(&self.pool)
        .await
        .context("Failed to reset stale processing blocks")?;

        debug!(reset = result.rows_affected(), "stale processing blocks reset");
        Ok(result.rows_affected())
    }

    async fn get_count_by_status(&self, status: BlockStatus) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM block_status WHERE status = ?")
            .bind(status.code())
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to count {} blocks", status))?;
        Ok(row.try_get::<i64, _>("cnt")? as u64)
    }
}

#[async_trait]
impl PlayerStore for SqliteLedger {
    async fn add_finished_player(&self, player: Address) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO scored_players (player) VALUES (?) ON CONFLICT (player) DO NOTHING",
        )
        .bind(player_text(&player))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to record player {}", player))?;
        Ok(result.rows_affected() > 0)
    }

    async fn finished_players(&self) -> Result<Vec<Address>> {
        let rows = sqlx::query("SELECT player FROM scored_players ORDER BY player")
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
