//! Ledger trait and RocksDB implementation
//!
//! The ledger is the durable table of which blocks have been seen and in
//! which state. It is the only arbiter of truth for the pipeline: racing
//! workers are kept apart by the conditional `migrate_block_status` write,
//! never by in-memory state.
//!
//! State machine:
//!
//! ```text
//! Unprocessed ──► Processing ──► Processed
//!      ▲              │
//!      │ stale sweep  ▼
//!      └──────── Processing ──► Retry ──► Processing (while retry_count < max)
//! ```
//!
//! Indexer output that must survive a restart lives in the same database,
//! behind [`PlayerStore`].

use crate::keys::{
    decode_block_status_key, decode_player_key, decode_status_index_key, encode_block_status_key,
    encode_player_key, encode_status_index_key, status_prefix,
};
use crate::records::{now_millis, BlockRecord, BlockStatus};
use alloy_primitives::Address;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Operations the pipeline needs from a persisted block ledger.
///
/// Every write is a single statement; on error the caller logs and tries
/// again on its next tick.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert a row if none exists for `block`. Never overwrites.
    ///
    /// Returns `true` when a row was inserted.
    async fn add_block(&self, block: u64, status: BlockStatus) -> Result<bool>;

    /// Unconditional status write.
    async fn update_block_status(&self, block: u64, status: BlockStatus) -> Result<()>;

    /// Compare-and-swap status write. Affects zero rows unless the current
    /// status is `from`. Returns the number of rows affected.
    async fn migrate_block_status(
        &self,
        block: u64,
        from: BlockStatus,
        to: BlockStatus,
    ) -> Result<u64>;

    /// Move `block` to `Retry`. The retry counter and `last_retry_at` only
    /// advance while `retry_count < max_retry`.
    async fn mark_for_retry(&self, block: u64, max_retry: u64) -> Result<()>;

    /// All `Unprocessed` blocks in ascending order.
    async fn get_unprocessed_blocks(&self) -> Result<Vec<u64>>;

    /// `Retry` blocks with `retry_count < max_retry` whose last retry is
    /// older than `threshold`, in ascending order.
    async fn get_retry_blocks(&self, max_retry: u64, threshold: Duration) -> Result<Vec<u64>>;

    /// Highest `Processed` block number, or 0 when nothing has completed.
    async fn get_latest_processed_block(&self) -> Result<u64>;

    /// Status of `block`, `None` if it was never admitted.
    async fn get_block_status(&self, block: u64) -> Result<Option<BlockStatus>>;

    /// Full row for `block`.
    async fn get_block(&self, block: u64) -> Result<Option<BlockRecord>>;

    /// Rows with block numbers in `[from, to]`, ascending.
    async fn get_blocks(&self, from: u64, to: u64) -> Result<Vec<BlockRecord>>;

    /// Move every `Processing` row whose last activity is older than
    /// `threshold` back to `Unprocessed`. Returns the number of rows reset.
    async fn reset_stale_processing_blocks(&self, threshold: Duration) -> Result<u64>;

    /// Number of rows in `status`.
    async fn get_count_by_status(&self, status: BlockStatus) -> Result<u64>;
}

/// Durable set of players that reached the finishing score.
#[async_trait]
pub trait PlayerStore: Send + Sync {
    /// Record `player`. Returns `true` when it was not recorded before.
    async fn add_finished_player(&self, player: Address) -> Result<bool>;

    /// Every recorded player in address order.
    async fn finished_players(&self) -> Result<Vec<Address>>;

    async fn finished_player_count(&self) -> Result<u64>;
}

/// Supported ledger backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreDriver {
    Rocksdb,
    Sqlite,
    Postgres,
}

impl fmt::Display for StoreDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreDriver::Rocksdb => write!(f, "rocksdb"),
            StoreDriver::Sqlite => write!(f, "sqlite"),
            StoreDriver::Postgres => write!(f, "postgres"),
        }
    }
}

impl FromStr for StoreDriver {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rocksdb" | "rocks" => Ok(StoreDriver::Rocksdb),
            "sqlite" | "sqlite3" => Ok(StoreDriver::Sqlite),
            "postgres" | "postgresql" => Ok(StoreDriver::Postgres),
            other => anyhow::bail!("Unsupported store driver '{}'", other),
        }
    }
}

/// One open database seen through both of its roles.
#[derive(Clone)]
pub struct Store {
    pub ledger: Arc<dyn Ledger>,
    pub players: Arc<dyn PlayerStore>,
}

impl Store {
    pub fn new<S: Ledger + PlayerStore + 'static>(backend: S) -> Self {
        let backend = Arc::new(backend);
        Self {
            ledger: backend.clone(),
            players: backend,
        }
    }
}

/// Open the store selected by `driver`.
///
/// `url` is a directory for RocksDB, a file path or `sqlite:` URL for SQLite,
/// and a libpq URL for Postgres.
pub async fn open_store(driver: StoreDriver, url: &str) -> Result<Store> {
    let store = match driver {
        StoreDriver::Rocksdb => Store::new(RocksLedger::open(url)?),
        StoreDriver::Sqlite => Store::new(crate::store_sqlite::SqliteLedger::open(url).await?),
        StoreDriver::Postgres => {
            Store::new(crate::store_postgres::PostgresLedger::connect(url).await?)
        }
    };
    tracing::info!(%driver, "ledger opened");
    Ok(store)
}

pub(crate) fn threshold_millis(threshold: Duration) -> i64 {
    i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX)
}

/// Retry bound as a SQL integer. Bounds past `i64::MAX` mean "unbounded".
pub(crate) fn retry_bound(max_retry: u64) -> i64 {
    i64::try_from(max_retry).unwrap_or(i64::MAX)
}

/// Text form of a player address in the relational backends.
pub(crate) fn player_text(player: &Address) -> String {
    format!("0x{}", hex::encode(player.as_slice()))
}

pub(crate) fn parse_player(text: &str) -> Result<Address> {
    Address::from_str(text).with_context(|| format!("Invalid player address {}", text))
}

const BLOCK_STATUS_CF: &str = "block_status";
const STATUS_INDEX_CF: &str = "status_index";
const STATUS_COUNT_CF: &str = "status_count";
const SCORED_PLAYERS_CF: &str = "scored_players";

/// RocksDB-backed ledger.
///
/// Rows are postcard-encoded `BlockRecord`s in `block_status`. Two derived
/// column families keep status queries off the full table: `status_index`
/// holds one empty-valued key per row (status code + block number) and
/// `status_count` one big-endian counter per status. Row, index and counter
/// change in a single `WriteBatch` under `write_lock`, which also makes
/// insert-if-absent and compare-and-swap atomic within the process.
///
/// RocksDB calls block, so every operation runs on the blocking pool.
#[derive(Clone)]
pub struct RocksLedger {
    inner: Arc<RocksInner>,
}

struct RocksInner {
    db: DB,
    write_lock: Mutex<()>,
}

impl RocksLedger {
    /// Open or create a RocksDB ledger at the given path.
    ///
    /// Ledgers written before the status index existed are indexed on open.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let column_families = [
            BLOCK_STATUS_CF,
            STATUS_INDEX_CF,
            STATUS_COUNT_CF,
            SCORED_PLAYERS_CF,
        ]
        .into_iter()
        .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
        .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, column_families)
            .context("Failed to open RocksDB ledger")?;

        let inner = RocksInner {
            db,
            write_lock: Mutex::new(()),
        };
        inner.ensure_index()?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&RocksInner) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .context("RocksDB ledger task failed")?
    }
}

/// Pending row writes plus the counter deltas they imply.
struct LedgerBatch<'a> {
    inner: &'a RocksInner,
    batch: WriteBatch,
    deltas: [i64; 4],
}

impl<'a> LedgerBatch<'a> {
    fn new(inner: &'a RocksInner) -> Self {
        Self {
            inner,
            batch: WriteBatch::default(),
            deltas: [0; 4],
        }
    }

    /// Stage `record`, replacing a row that was in `previous` (if any).
    fn put(&mut self, previous: Option<BlockStatus>, record: &BlockRecord) -> Result<()> {
        let rows = self.inner.cf(BLOCK_STATUS_CF)?;
        let index = self.inner.cf(STATUS_INDEX_CF)?;
        let value = postcard::to_allocvec(record).context("Failed to serialize block record")?;
        self.batch
            .put_cf(rows, encode_block_status_key(record.block_number), value);

        if previous == Some(record.status) {
            return Ok(());
        }
        if let Some(previous) = previous {
            self.batch
                .delete_cf(index, encode_status_index_key(previous, record.block_number));
            self.deltas[usize::from(status_prefix(previous))] -= 1;
        }
        self.batch
            .put_cf(index, encode_status_index_key(record.status, record.block_number), b"");
        self.deltas[usize::from(status_prefix(record.status))] += 1;
        Ok(())
    }

    fn commit(mut self) -> Result<()> {
        let counts = self.inner.cf(STATUS_COUNT_CF)?;
        for status in BlockStatus::ALL {
            let delta = self.deltas[usize::from(status_prefix(status))];
            if delta == 0 {
                continue;
            }
            let current = self.inner.count(status)?;
            let updated = if delta < 0 {
                current.saturating_sub(delta.unsigned_abs())
            } else {
                current.saturating_add(delta.unsigned_abs())
            };
            self.batch
                .put_cf(counts, [status_prefix(status)], updated.to_be_bytes());
        }
        self.inner
            .db
            .write(self.batch)
            .context("Failed to write ledger batch")
    }
}

impl RocksInner {
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .with_context(|| format!("Column family '{}' not found", name))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Ledger write lock poisoned"))
    }

    fn read(&self, block: u64) -> Result<Option<BlockRecord>> {
        let cf = self.cf(BLOCK_STATUS_CF)?;
        match self
            .db
            .get_cf(cf, encode_block_status_key(block))
            .context("Failed to get block record")?
        {
            Some(bytes) => {
                let record = postcard::from_bytes(&bytes)
                    .context("Failed to deserialize block record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Write one row and its index entries.
    fn write(&self, previous: Option<BlockStatus>, record: &BlockRecord) -> Result<()> {
        let mut batch = LedgerBatch::new(self);
        batch.put(previous, record)?;
        batch.commit()
    }

    fn count(&self, status: BlockStatus) -> Result<u64> {
        let cf = self.cf(STATUS_COUNT_CF)?;
        match self
            .db
            .get_cf(cf, [status_prefix(status)])
            .context("Failed to read status count")?
        {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .context("Corrupt status count")?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    /// Block numbers currently in `status`, ascending.
    fn blocks_in(&self, status: BlockStatus) -> Result<Vec<u64>> {
        let cf = self.cf(STATUS_INDEX_CF)?;
        let start = encode_status_index_key(status, 0);
        let mut blocks = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, _) = item.context("Failed to iterate status index")?;
            let (found, block) = decode_status_index_key(&key)?;
            if found != status {
                break;
            }
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Rows currently in `status`, ascending.
    fn records_in(&self, status: BlockStatus) -> Result<Vec<BlockRecord>> {
        let mut records = Vec::new();
        for block in self.blocks_in(status)? {
            let record = self
                .read(block)?
                .with_context(|| format!("Status index points at missing block {}", block))?;
            records.push(record);
        }
        Ok(records)
    }

    fn latest_in(&self, status: BlockStatus) -> Result<Option<u64>> {
        let cf = self.cf(STATUS_INDEX_CF)?;
        let end = encode_status_index_key(status, u64::MAX);
        match self
            .db
            .iterator_cf(cf, IteratorMode::From(&end, Direction::Reverse))
            .next()
        {
            Some(item) => {
                let (key, _) = item.context("Failed to iterate status index")?;
                let (found, block) = decode_status_index_key(&key)?;
                Ok((found == status).then_some(block))
            }
            None => Ok(None),
        }
    }

    /// Build the status index and counters from the rows if they are absent.
    fn ensure_index(&self) -> Result<()> {
        let _guard = self.lock()?;
        let counts = self.cf(STATUS_COUNT_CF)?;
        if self.db.iterator_cf(counts, IteratorMode::Start).next().is_some() {
            return Ok(());
        }

        let rows = self.cf(BLOCK_STATUS_CF)?;
        let mut batch = LedgerBatch::new(self);
        let mut indexed = 0u64;
        for item in self.db.iterator_cf(rows, IteratorMode::Start) {
            let (key, value) = item.context("Failed to iterate ledger")?;
            let record: BlockRecord = postcard::from_bytes(&value).with_context(|| {
                format!(
                    "Failed to deserialize block record for key {:?}",
                    decode_block_status_key(&key).ok()
                )
            })?;
            batch.put(None, &record)?;
            indexed += 1;
        }
        if indexed > 0 {
            batch.commit()?;
            tracing::info!(rows = indexed, "ledger status index rebuilt");
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for RocksLedger {
    async fn add_block(&self, block: u64, status: BlockStatus) -> Result<bool> {
        self.blocking(move |db| {
            let _guard = db.lock()?;
            if db.read(block)?.is_some() {
                return Ok(false);
            }
            db.write(None, &BlockRecord::new(block, status))?;
            Ok(true)
        })
        .await
    }

    async fn update_block_status(&self, block: u64, status: BlockStatus) -> Result<()> {
        self.blocking(move |db| {
            let _guard = db.lock()?;
            if let Some(mut record) = db.read(block)? {
                let previous = record.status;
                record.status = status;
                record.updated_at = Some(now_millis());
                db.write(Some(previous), &record)?;
            }
            Ok(())
        })
        .await
    }

    async fn migrate_block_status(
        &self,
        block: u64,
        from: BlockStatus,
        to: BlockStatus,
    ) -> Result<u64> {
        self.blocking(move |db| {
            let _guard = db.lock()?;
            match db.read(block)? {
                Some(mut record) if record.status == from => {
                    record.status = to;
                    record.updated_at = Some(now_millis());
                    db.write(Some(from), &record)?;
                    Ok(1)
                }
                _ => Ok(0),
            }
        })
        .await
    }

    async fn mark_for_retry(&self, block: u64, max_retry: u64) -> Result<()> {
        self.blocking(move |db| {
            let _guard = db.lock()?;
            if let Some(mut record) = db.read(block)? {
                let previous = record.status;
                let now = now_millis();
                if record.retry_count < max_retry {
                    record.retry_count += 1;
                    record.last_retry_at = Some(now);
                }
                record.status = BlockStatus::Retry;
                record.updated_at = Some(now);
                db.write(Some(previous), &record)?;
            }
            Ok(())
        })
        .await
    }

    async fn get_unprocessed_blocks(&self) -> Result<Vec<u64>> {
        self.blocking(|db| db.blocks_in(BlockStatus::Unprocessed))
            .await
    }

    async fn get_retry_blocks(&self, max_retry: u64, threshold: Duration) -> Result<Vec<u64>> {
        let cutoff = now_millis().saturating_sub(threshold_millis(threshold));
        let records = self
            .blocking(|db| db.records_in(BlockStatus::Retry))
            .await?;
        Ok(records
            .into_iter()
            .filter(|record| record.retry_count < max_retry)
            .filter(|record| record.last_retry_at.map_or(false, |at| at < cutoff))
            .map(|record| record.block_number)
            .collect())
    }

    async fn get_latest_processed_block(&self) -> Result<u64> {
        let latest = self
            .blocking(|db| db.latest_in(BlockStatus::Processed))
            .await?;
        Ok(latest.unwrap_or(0))
    }

    async fn get_block_status(&self, block: u64) -> Result<Option<BlockStatus>> {
        Ok(self.get_block(block).await?.map(|record| record.status))
    }

    async fn get_block(&self, block: u64) -> Result<Option<BlockRecord>> {
        self.blocking(move |db| db.read(block)).await
    }

    async fn get_blocks(&self, from: u64, to: u64) -> Result<Vec<BlockRecord>> {
        self.blocking(move |db| {
            let cf = db.cf(BLOCK_STATUS_CF)?;
            let start = encode_block_status_key(from);
            let mut records = Vec::new();
            for item in db
                .db
                .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
            {
                let (key, value) = item.context("Failed to iterate ledger")?;
                if decode_block_status_key(&key)? > to {
                    break;
                }
                records.push(
                    postcard::from_bytes(&value).context("Failed to deserialize block record")?,
                );
            }
            Ok(records)
        })
        .await
    }

    async fn reset_stale_processing_blocks(&self, threshold: Duration) -> Result<u64> {
        self.blocking(move |db| {
            let _guard = db.lock()?;
            let now = now_millis();
            let cutoff = now.saturating_sub(threshold_millis(threshold));

            let mut batch = LedgerBatch::new(db);
            let mut reset = 0u64;
            for mut record in db.records_in(BlockStatus::Processing)? {
                if !record.last_activity().map_or(false, |at| at < cutoff) {
                    continue;
                }
                record.status = BlockStatus::Unprocessed;
                record.updated_at = Some(now);
                batch.put(Some(BlockStatus::Processing), &record)?;
                reset += 1;
            }
            if reset > 0 {
                batch.commit()?;
            }
            Ok(reset)
        })
        .await
    }

    async fn get_count_by_status(&self, status: BlockStatus) -> Result<u64> {
        self.blocking(move |db| db.count(status)).await
    }
}

#[async_trait]
impl PlayerStore for RocksLedger {
    async fn add_finished_player(&self, player: Address) -> Result<bool> {
        self.blocking(move |db| {
            let _guard = db.lock()?;
            let cf = db.cf(SCORED_PLAYERS_CF)?;
            let key = encode_player_key(&player);
            if db
                .db
                .get_cf(cf, &key)
                .context("Failed to read player")?
                .is_some()
            {
                return Ok(false);
            }
            db.db
                .put_cf(cf, key, b"")
                .context("Failed to record player")?;
            Ok(true)
        })
        .await
    }

    async fn finished_players(&self) -> Result<Vec<Address>> {
        self.blocking(|db| {
            let cf = db.cf(SCORED_PLAYERS_CF)?;
            db.db
                .iterator_cf(cf, IteratorMode::Start)
                .map(|item| {
                    let (key, _) = item.context("Failed to iterate players")?;
                    decode_player_key(&key)
                })
                .collect()
        })
        .await
    }

    async fn finished_player_count(&self) -> Result<u64> {
        Ok(self.finished_players().await?.len() as u64)
    }
}
