//! Background sync worker and local store
//!
//! Agents whose upstream source is slow or rate-limited keep a durable
//! local copy of upstream records and serve reads from it. A single
//! background task per agent performs an initial backfill and then
//! incremental cycles driven by per-collection watermarks. One collection's
//! failure never stops the others, and reads are pure local queries.

use crate::domain_types::AgentId;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Wait applied after a cycle that errored before the next attempt
const ERROR_COOLDOWN: Duration = Duration::from_secs(60);

/// Grace period an in-flight cycle gets when the worker is stopped
const STOP_GRACE: Duration = Duration::from_secs(10);

/// One record fetched from an upstream source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Upstream identifier, unique within the source
    pub source_id: String,
    /// Collection the record belongs to (e.g. `inbox`)
    pub collection: String,
    /// Raw record payload
    pub payload: Value,
    /// Upstream timestamp
    pub received_at: DateTime<Utc>,
}

/// A record read back from the local store
#[derive(Debug, Clone, Serialize)]
pub struct SyncedRecord {
    /// Upstream identifier
    pub source_id: String,
    /// Collection name
    pub collection: String,
    /// Raw record payload
    pub payload: Value,
    /// Upstream timestamp, unix milliseconds
    pub received_at_ms: i64,
    /// Local sync timestamp, unix milliseconds
    pub synced_at_ms: i64,
}

/// Upstream data source seam
///
/// Live agents implement this over their host adapters; demo mode wires a
/// fixture adapter.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Fetches up to `limit` records of `collection` with a timestamp
    /// strictly after `since`, oldest first
    async fn fetch_since(
        &self,
        collection: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>>;
}

/// Deterministic in-memory source used in demo mode and tests
#[derive(Default)]
pub struct FixtureAdapter {
    records: Mutex<Vec<SourceRecord>>,
}

impl FixtureAdapter {
    /// Creates an adapter preloaded with `records`
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    /// Appends a record (tests use this to simulate upstream changes)
    pub fn push(&self, record: SourceRecord) {
        self.records.lock().expect("fixture lock poisoned").push(record);
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    async fn fetch_since(
        &self,
        collection: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>> {
        let records = self.records.lock().expect("fixture lock poisoned");
        let mut matching: Vec<SourceRecord> = records
            .iter()
            .filter(|r| r.collection == collection)
            .filter(|r| since.is_none_or(|s| r.received_at > s))
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.received_at);
        matching.truncate(limit);
        Ok(matching)
    }
}

/// Pure SQL for the sync store
mod sql {
    pub(super) fn create_records_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS records (
            source_id TEXT PRIMARY KEY,
            collection TEXT NOT NULL,
            payload TEXT NOT NULL,
            received_at INTEGER NOT NULL,
            synced_at INTEGER NOT NULL
        )"
    }

    pub(super) fn create_sync_status_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS sync_status (
            collection TEXT PRIMARY KEY,
            last_sync_at INTEGER NOT NULL,
            last_success INTEGER NOT NULL DEFAULT 1,
            record_count INTEGER NOT NULL DEFAULT 0
        )"
    }

    pub(super) fn create_records_index() -> &'static str {
        "CREATE INDEX IF NOT EXISTS idx_records_collection_received
         ON records(collection, received_at DESC)"
    }

    pub(super) fn upsert_record() -> &'static str {
        "INSERT OR REPLACE INTO records (source_id, collection, payload, received_at, synced_at)
         VALUES (?, ?, ?, ?, ?)"
    }

    pub(super) fn select_records() -> &'static str {
        "SELECT source_id, collection, payload, received_at, synced_at
         FROM records WHERE collection = ?
         ORDER BY received_at DESC LIMIT ? OFFSET ?"
    }

    pub(super) fn select_records_since() -> &'static str {
        "SELECT source_id, collection, payload, received_at, synced_at
         FROM records WHERE collection = ? AND received_at >= ?
         ORDER BY received_at DESC LIMIT ? OFFSET ?"
    }

    pub(super) fn count_records_in_collection() -> &'static str {
        "SELECT COUNT(*) AS n FROM records WHERE collection = ?"
    }

    pub(super) fn delete_older_than() -> &'static str {
        "DELETE FROM records WHERE received_at < ?"
    }

    pub(super) fn select_last_sync() -> &'static str {
        "SELECT last_sync_at FROM sync_status WHERE collection = ? AND last_success = 1"
    }

    pub(super) fn upsert_sync_status() -> &'static str {
        "INSERT OR REPLACE INTO sync_status (collection, last_sync_at, last_success, record_count)
         VALUES (?, ?, ?, ?)"
    }

    pub(super) fn select_collection_stats() -> &'static str {
        "SELECT collection, COUNT(*) AS n, MAX(received_at) AS newest, MIN(received_at) AS oldest
         FROM records GROUP BY collection"
    }

    pub(super) fn select_sync_status() -> &'static str {
        "SELECT collection, last_sync_at, last_success, record_count FROM sync_status"
    }

    pub(super) fn count_all_records() -> &'static str {
        "SELECT COUNT(*) AS n FROM records"
    }
}

/// Per-collection store statistics
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    /// Records held locally
    pub count: u64,
    /// Newest upstream timestamp, unix milliseconds
    pub newest_ms: Option<i64>,
    /// Oldest upstream timestamp, unix milliseconds
    pub oldest_ms: Option<i64>,
}

/// Sync status snapshot for one collection
#[derive(Debug, Clone, Serialize)]
pub struct CollectionSyncStatus {
    /// Last sync watermark, unix milliseconds
    pub last_sync_at_ms: i64,
    /// Whether the last cycle succeeded
    pub last_success: bool,
    /// Records applied in the last cycle
    pub record_count: u64,
}

/// Store-wide statistics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    /// Total locally held records
    pub total_records: u64,
    /// Per-collection record stats
    pub collections: BTreeMap<String, CollectionStats>,
    /// Per-collection sync status
    pub sync_status: BTreeMap<String, CollectionSyncStatus>,
}

/// Durable local store of upstream records
pub struct SyncStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SyncStore {
    /// Opens (creating if necessary) `<cache_dir>/<agent_id>/<source>_sync.db`
    ///
    /// # Errors
    /// Returns an error when the file cannot be opened — an unrecoverable
    /// startup failure for the owning agent.
    pub async fn open(cache_dir: &Path, agent_id: &AgentId, source: &str) -> Result<Self> {
        let dir = cache_dir.join(agent_id.as_str());
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::internal(format!("cannot create sync dir: {e}")))?;
        let path = dir.join(format!("{source}_sync.db"));

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(250));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(sql::create_records_table()).execute(&pool).await?;
        sqlx::query(sql::create_sync_status_table()).execute(&pool).await?;
        sqlx::query(sql::create_records_index()).execute(&pool).await?;

        info!(agent_id = %agent_id, path = %path.display(), "sync store opened");
        Ok(Self { pool, path })
    }

    /// Upserts a batch of records; returns how many were written
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn upsert_records(&self, records: &[SourceRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let now_ms = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(sql::upsert_record())
                .bind(&record.source_id)
                .bind(&record.collection)
                .bind(serde_json::to_string(&record.payload)?)
                .bind(record.received_at.timestamp_millis())
                .bind(now_ms)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(records.len() as u64)
    }

    /// Pure local read, newest first, paginated by `limit × page`
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn get_records(
        &self,
        collection: &str,
        limit: u32,
        page: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SyncedRecord>> {
        let offset = i64::from(limit) * i64::from(page);
        let rows = match since {
            Some(since) => {
                sqlx::query(sql::select_records_since())
                    .bind(collection)
                    .bind(since.timestamp_millis())
                    .bind(i64::from(limit))
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(sql::select_records())
                    .bind(collection)
                    .bind(i64::from(limit))
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter()
            .map(|row| {
                let payload: String = row.get("payload");
                Ok(SyncedRecord {
                    source_id: row.get("source_id"),
                    collection: row.get("collection"),
                    payload: serde_json::from_str(&payload)?,
                    received_at_ms: row.get("received_at"),
                    synced_at_ms: row.get("synced_at"),
                })
            })
            .collect()
    }

    /// Number of records held for `collection`
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn record_count(&self, collection: &str) -> Result<u64> {
        let row = sqlx::query(sql::count_records_in_collection())
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.get("n");
        Ok(u64::try_from(n).unwrap_or(0))
    }

    /// Last successful sync watermark for `collection`
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn last_sync(&self, collection: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(sql::select_last_sync())
            .bind(collection)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| {
            let ms: i64 = r.get("last_sync_at");
            DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
        }))
    }

    /// Records the outcome of a sync cycle for `collection`
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn update_sync_status(
        &self,
        collection: &str,
        success: bool,
        record_count: u64,
    ) -> Result<()> {
        sqlx::query(sql::upsert_sync_status())
            .bind(collection)
            .bind(Utc::now().timestamp_millis())
            .bind(i64::from(success))
            .bind(i64::try_from(record_count).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes records older than `days_to_keep`; returns how many
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn cleanup(&self, days_to_keep: u32) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days_to_keep));
        let result = sqlx::query(sql::delete_older_than())
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, "cleaned up old records");
        }
        Ok(deleted)
    }

    /// Store-wide statistics
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn stats(&self) -> Result<StoreStats> {
        let total_row = sqlx::query(sql::count_all_records())
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = total_row.get("n");

        let mut collections = BTreeMap::new();
        for row in sqlx::query(sql::select_collection_stats())
            .fetch_all(&self.pool)
            .await?
        {
            let n: i64 = row.get("n");
            collections.insert(
                row.get::<String, _>("collection"),
                CollectionStats {
                    count: u64::try_from(n).unwrap_or(0),
                    newest_ms: row.get("newest"),
                    oldest_ms: row.get("oldest"),
                },
            );
        }

        let mut sync_status = BTreeMap::new();
        for row in sqlx::query(sql::select_sync_status())
            .fetch_all(&self.pool)
            .await?
        {
            let success: i64 = row.get("last_success");
            let count: i64 = row.get("record_count");
            sync_status.insert(
                row.get::<String, _>("collection"),
                CollectionSyncStatus {
                    last_sync_at_ms: row.get("last_sync_at"),
                    last_success: success != 0,
                    record_count: u64::try_from(count).unwrap_or(0),
                },
            );
        }

        Ok(StoreStats {
            total_records: u64::try_from(total).unwrap_or(0),
            collections,
            sync_status,
        })
    }

    /// Path of the backing database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the underlying pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Worker tuning
#[derive(Debug, Clone)]
pub struct SyncWorkerConfig {
    /// Seconds between incremental cycles
    pub interval: Duration,
    /// Window fetched on first run
    pub initial_backfill: Duration,
    /// Cap on records fetched per collection per cycle
    pub max_records_per_cycle: usize,
    /// Collections to synchronize
    pub collections: Vec<String>,
}

impl Default for SyncWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            initial_backfill: Duration::from_secs(7 * 24 * 3600),
            max_records_per_cycle: 100,
            collections: vec!["inbox".to_string(), "sent".to_string()],
        }
    }
}

/// Worker lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "collection")]
pub enum WorkerState {
    Idle,
    Syncing(String),
    Stopped,
}

/// Cumulative worker counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    /// Cycles attempted
    pub total_syncs: u64,
    /// Cycles with every collection succeeding
    pub successful_syncs: u64,
    /// Cycles with at least one collection failing
    pub failed_syncs: u64,
    /// Records applied across all cycles
    pub records_synced: u64,
    /// Last error message observed
    pub last_error: Option<String>,
    /// End of the last cycle, unix milliseconds
    pub last_sync_at_ms: Option<i64>,
}

/// Outcome of a forced cycle
#[derive(Debug, Clone, Serialize)]
pub struct ForceSyncOutcome {
    /// Collections attempted
    pub collections: Vec<String>,
    /// Records applied
    pub records_synced: u64,
    /// Collections that failed, with reasons
    pub errors: BTreeMap<String, String>,
    /// Completion time, unix milliseconds
    pub timestamp_ms: i64,
}

struct WorkerShared {
    state: WorkerState,
    stats: SyncStats,
}

/// Background synchronizer decoupling slow upstreams from local reads
pub struct SyncWorker {
    store: Arc<SyncStore>,
    adapter: Arc<dyn SourceAdapter>,
    config: SyncWorkerConfig,
    shared: Arc<Mutex<WorkerShared>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncWorker {
    /// Creates a worker over `store` fed by `adapter`
    pub fn new(
        store: Arc<SyncStore>,
        adapter: Arc<dyn SourceAdapter>,
        config: SyncWorkerConfig,
    ) -> Self {
        Self {
            store,
            adapter,
            config,
            shared: Arc::new(Mutex::new(WorkerShared {
                state: WorkerState::Idle,
                stats: SyncStats::default(),
            })),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Starts the background loop; starting twice is a no-op
    pub fn start(&self) {
        let mut task = self.task.lock().expect("worker lock poisoned");
        if task.is_some() {
            warn!("sync worker already running");
            return;
        }

        let store = self.store.clone();
        let adapter = self.adapter.clone();
        let config = self.config.clone();
        let shared = self.shared.clone();
        let cancel = self.cancel.clone();

        *task = Some(tokio::spawn(async move {
            info!(interval_s = config.interval.as_secs(), "sync worker started");
            let mut initial = true;
            loop {
                let outcome = run_cycle(&store, &adapter, &config, &shared, initial).await;
                initial = false;
                let wait = if outcome.errors.is_empty() {
                    config.interval
                } else {
                    ERROR_COOLDOWN
                };
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(wait) => {}
                }
            }
            shared.lock().expect("worker lock poisoned").state = WorkerState::Stopped;
            info!("sync worker stopped");
        }));
    }

    /// Stops the worker, letting an in-flight cycle finish within the grace
    /// period before forcing termination
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().expect("worker lock poisoned").take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(STOP_GRACE, task).await.is_err() {
                warn!("sync worker did not stop within grace period; aborting");
                abort.abort();
            }
        }
        self.shared.lock().expect("worker lock poisoned").state = WorkerState::Stopped;
    }

    /// Runs one cycle immediately for one collection or all of them
    ///
    /// # Errors
    /// Never errors at this level; per-collection failures are reported in
    /// the outcome.
    pub async fn force_sync(&self, collection: Option<&str>) -> ForceSyncOutcome {
        let collections: Vec<String> = match collection {
            Some(c) => vec![c.to_string()],
            None => self.config.collections.clone(),
        };
        let scoped = SyncWorkerConfig {
            collections: collections.clone(),
            ..self.config.clone()
        };
        let outcome = run_cycle(&self.store, &self.adapter, &scoped, &self.shared, false).await;
        ForceSyncOutcome {
            collections,
            records_synced: outcome.records,
            errors: outcome.errors,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Current worker state
    pub fn state(&self) -> WorkerState {
        self.shared.lock().expect("worker lock poisoned").state.clone()
    }

    /// Cumulative counters
    pub fn stats(&self) -> SyncStats {
        self.shared.lock().expect("worker lock poisoned").stats.clone()
    }

    /// Combined worker and store status snapshot
    ///
    /// # Errors
    /// Returns an error when store statistics cannot be read.
    pub async fn status(&self) -> Result<Value> {
        let store_stats = self.store.stats().await?;
        let shared = self.shared.lock().expect("worker lock poisoned");
        Ok(serde_json::json!({
            "worker": {
                "state": shared.state,
                "interval_s": self.config.interval.as_secs(),
                "collections": self.config.collections,
            },
            "statistics": shared.stats,
            "store": store_stats,
        }))
    }
}

struct CycleOutcome {
    records: u64,
    errors: BTreeMap<String, String>,
}

/// One pass over every configured collection, failures isolated
async fn run_cycle(
    store: &Arc<SyncStore>,
    adapter: &Arc<dyn SourceAdapter>,
    config: &SyncWorkerConfig,
    shared: &Arc<Mutex<WorkerShared>>,
    initial: bool,
) -> CycleOutcome {
    shared.lock().expect("worker lock poisoned").stats.total_syncs += 1;

    let mut records_applied = 0u64;
    let mut errors = BTreeMap::new();

    for collection in &config.collections {
        shared.lock().expect("worker lock poisoned").state =
            WorkerState::Syncing(collection.clone());

        match sync_collection(store, adapter, config, collection, initial).await {
            Ok(count) => {
                debug!(collection = %collection, count, "collection synced");
                records_applied += count;
            }
            Err(err) => {
                error!(collection = %collection, error = %err, "collection sync failed");
                errors.insert(collection.clone(), err.to_string());
                let _ = store.update_sync_status(collection, false, 0).await;
            }
        }
    }

    let mut shared = shared.lock().expect("worker lock poisoned");
    shared.state = WorkerState::Idle;
    shared.stats.records_synced += records_applied;
    shared.stats.last_sync_at_ms = Some(Utc::now().timestamp_millis());
    if errors.is_empty() {
        shared.stats.successful_syncs += 1;
    } else {
        shared.stats.failed_syncs += 1;
        shared.stats.last_error = errors.values().next().cloned();
    }

    CycleOutcome {
        records: records_applied,
        errors,
    }
}

/// Fetches and applies one collection's delta
async fn sync_collection(
    store: &Arc<SyncStore>,
    adapter: &Arc<dyn SourceAdapter>,
    config: &SyncWorkerConfig,
    collection: &str,
    initial: bool,
) -> Result<u64> {
    let since = if initial {
        let backfill = ChronoDuration::from_std(config.initial_backfill)
            .unwrap_or_else(|_| ChronoDuration::days(7));
        Some(Utc::now() - backfill)
    } else {
        match store.last_sync(collection).await? {
            Some(watermark) => Some(watermark),
            // Never synced: treat as a one-day backfill.
            None => Some(Utc::now() - ChronoDuration::days(1)),
        }
    };

    let records = adapter
        .fetch_since(collection, since, config.max_records_per_cycle)
        .await?;
    let applied = store.upsert_records(&records).await?;
    store.update_sync_status(collection, true, applied).await?;
    Ok(applied)
}
