//! L3: local durable cache store
//!
//! A single-file embedded SQLite database holding interpretation results
//! (`query_cache`) and cross-platform entity relationships
//! (`relationship_cache`). Long TTL; survives restarts. Writes go through a
//! small connection pool so the critical section stays short.

use crate::domain_types::{AgentId, Confidence};
use crate::error::{Error, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Pure SQL for the L3 schema and queries
mod sql {
    pub(super) fn create_query_cache_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS query_cache (
            query_hash TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            query_text TEXT NOT NULL,
            blob TEXT NOT NULL,
            confidence REAL NOT NULL,
            stored_at INTEGER NOT NULL,
            hits INTEGER NOT NULL DEFAULT 0
        )"
    }

    pub(super) fn create_relationship_cache_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS relationship_cache (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            related_type TEXT NOT NULL,
            related_id TEXT NOT NULL,
            blob TEXT NOT NULL,
            confidence REAL NOT NULL,
            stored_at INTEGER NOT NULL,
            PRIMARY KEY (entity_type, entity_id, related_type, related_id)
        )"
    }

    pub(super) fn create_query_text_index() -> &'static str {
        "CREATE INDEX IF NOT EXISTS idx_query_cache_text ON query_cache(query_text)"
    }

    pub(super) fn select_interpretation() -> &'static str {
        "SELECT blob, confidence, stored_at FROM query_cache
         WHERE query_hash = ? AND stored_at >= ?"
    }

    pub(super) fn bump_hits() -> &'static str {
        "UPDATE query_cache SET hits = hits + 1 WHERE query_hash = ?"
    }

    pub(super) fn delete_expired() -> &'static str {
        "DELETE FROM query_cache WHERE query_hash = ? AND stored_at < ?"
    }

    pub(super) fn upsert_interpretation() -> &'static str {
        "INSERT INTO query_cache (query_hash, agent_id, query_text, blob, confidence, stored_at, hits)
         VALUES (?, ?, ?, ?, ?, ?, 0)
         ON CONFLICT(query_hash) DO UPDATE SET
             query_text = excluded.query_text,
             blob = excluded.blob,
             confidence = excluded.confidence,
             stored_at = excluded.stored_at"
    }

    pub(super) fn select_hashes_matching_pattern() -> &'static str {
        "SELECT query_hash FROM query_cache WHERE instr(query_text, ?) > 0"
    }

    pub(super) fn delete_hashes_matching_pattern() -> &'static str {
        "DELETE FROM query_cache WHERE instr(query_text, ?) > 0"
    }

    pub(super) fn upsert_relationship() -> &'static str {
        "INSERT INTO relationship_cache
             (entity_type, entity_id, related_type, related_id, blob, confidence, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(entity_type, entity_id, related_type, related_id) DO UPDATE SET
             blob = excluded.blob,
             confidence = excluded.confidence,
             stored_at = excluded.stored_at"
    }

    pub(super) fn select_relationships() -> &'static str {
        "SELECT entity_type, entity_id, related_type, related_id, blob, confidence, stored_at
         FROM relationship_cache WHERE entity_type = ? AND entity_id = ?"
    }

    pub(super) fn select_relationships_filtered() -> &'static str {
        "SELECT entity_type, entity_id, related_type, related_id, blob, confidence, stored_at
         FROM relationship_cache
         WHERE entity_type = ? AND entity_id = ? AND related_type = ?"
    }

    pub(super) fn count_query_entries() -> &'static str {
        "SELECT COUNT(*) AS n, COALESCE(SUM(hits), 0) AS total_hits FROM query_cache"
    }

    pub(super) fn count_relationship_entries() -> &'static str {
        "SELECT COUNT(*) AS n FROM relationship_cache"
    }
}

/// Conversions between domain types and row values
mod mapping {
    use super::{Confidence, Error, Result, Value};

    pub(super) fn blob_to_string(value: &Value) -> Result<String> {
        serde_json::to_string(value).map_err(Error::from)
    }

    pub(super) fn parse_blob(raw: &str) -> Result<Value> {
        serde_json::from_str(raw).map_err(Error::from)
    }

    pub(super) fn parse_confidence(raw: f64) -> Confidence {
        // Clamp rather than fail: a row written by a newer build must not
        // poison reads.
        Confidence::try_new(raw.clamp(0.0, 1.0)).unwrap_or_else(|_| Confidence::zero())
    }
}

/// An interpretation read back from the durable tier
#[derive(Debug, Clone)]
pub struct StoredInterpretation {
    /// Interpretation blob
    pub value: Value,
    /// Confidence recorded at store time
    pub confidence: Confidence,
    /// Store timestamp, unix milliseconds
    pub stored_at_ms: i64,
}

/// A relationship edge between entities observed across platforms
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RelationshipEdge {
    /// Kind of the source entity (e.g. `contact`)
    pub entity_type: String,
    /// Identifier of the source entity
    pub entity_id: String,
    /// Kind of the related entity (e.g. `email`)
    pub related_type: String,
    /// Identifier of the related entity
    pub related_id: String,
    /// Attributes describing the relationship
    pub attributes: Value,
    /// Confidence in the relationship
    pub confidence: Confidence,
    /// Store timestamp, unix milliseconds
    pub stored_at_ms: i64,
}

/// Counters over the durable tier
#[derive(Debug, Clone, serde::Serialize)]
pub struct DurableStats {
    /// Rows in `query_cache`
    pub query_entries: u64,
    /// Accumulated hit counter across rows
    pub total_hits: u64,
    /// Rows in `relationship_cache`
    pub relationship_entries: u64,
    /// Size of the database file in bytes, if known
    pub file_size_bytes: Option<u64>,
}

/// Durable cache store backed by `agent_cache.db`
pub struct DurableStore {
    pool: SqlitePool,
    path: PathBuf,
    agent_id: AgentId,
    ttl_ms: i64,
}

impl DurableStore {
    /// Opens (creating if necessary) the per-agent cache database at
    /// `<cache_dir>/<agent_id>/agent_cache.db`
    ///
    /// # Errors
    /// Returns an error when the directory cannot be created or the
    /// database cannot be opened — an unrecoverable startup failure.
    pub async fn open(cache_dir: &Path, agent_id: AgentId, ttl: Duration) -> Result<Self> {
        let dir = cache_dir.join(agent_id.as_str());
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::internal(format!("cannot create cache dir: {e}")))?;
        let path = dir.join("agent_cache.db");

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(250));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(sql::create_query_cache_table())
            .execute(&pool)
            .await?;
        sqlx::query(sql::create_relationship_cache_table())
            .execute(&pool)
            .await?;
        sqlx::query(sql::create_query_text_index())
            .execute(&pool)
            .await?;

        info!(agent_id = %agent_id, path = %path.display(), "durable cache opened");

        Ok(Self {
            pool,
            path,
            agent_id,
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
        })
    }

    /// Looks up a still-valid interpretation and bumps its hit counter
    ///
    /// # Errors
    /// Returns an error on database failure; expiry is not an error.
    pub async fn get(&self, query_hash: &str) -> Result<Option<StoredInterpretation>> {
        let cutoff = Utc::now().timestamp_millis() - self.ttl_ms;

        let row = sqlx::query(sql::select_interpretation())
            .bind(query_hash)
            .bind(cutoff)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            // Drop the expired row if one exists so the table stays lean.
            sqlx::query(sql::delete_expired())
                .bind(query_hash)
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
            return Ok(None);
        };

        sqlx::query(sql::bump_hits())
            .bind(query_hash)
            .execute(&self.pool)
            .await?;

        let blob: String = row.get("blob");
        let confidence: f64 = row.get("confidence");
        let stored_at_ms: i64 = row.get("stored_at");
        Ok(Some(StoredInterpretation {
            value: mapping::parse_blob(&blob)?,
            confidence: mapping::parse_confidence(confidence),
            stored_at_ms,
        }))
    }

    /// Upserts an interpretation (last writer wins, hit counter preserved)
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn put(
        &self,
        query_hash: &str,
        normalized_query: &str,
        value: &Value,
        confidence: Confidence,
    ) -> Result<()> {
        sqlx::query(sql::upsert_interpretation())
            .bind(query_hash)
            .bind(self.agent_id.as_str())
            .bind(normalized_query)
            .bind(mapping::blob_to_string(value)?)
            .bind(confidence.value())
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes every interpretation whose normalized query contains
    /// `pattern` (already lowercased); returns the removed hashes
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(sql::select_hashes_matching_pattern())
            .bind(pattern)
            .fetch_all(&self.pool)
            .await?;
        let hashes: Vec<String> = rows.iter().map(|r| r.get::<String, _>("query_hash")).collect();

        if !hashes.is_empty() {
            sqlx::query(sql::delete_hashes_matching_pattern())
                .bind(pattern)
                .execute(&self.pool)
                .await?;
        }
        Ok(hashes)
    }

    /// Upserts a relationship edge; updating overwrites attributes and
    /// timestamp
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn upsert_relationship(
        &self,
        entity_type: &str,
        entity_id: &str,
        related_type: &str,
        related_id: &str,
        attributes: &Value,
        confidence: Confidence,
    ) -> Result<()> {
        sqlx::query(sql::upsert_relationship())
            .bind(entity_type)
            .bind(entity_id)
            .bind(related_type)
            .bind(related_id)
            .bind(mapping::blob_to_string(attributes)?)
            .bind(confidence.value())
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetches relationship edges for an entity, optionally filtered by the
    /// related entity type
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn relationships(
        &self,
        entity_type: &str,
        entity_id: &str,
        related_type: Option<&str>,
    ) -> Result<Vec<RelationshipEdge>> {
        let rows = match related_type {
            Some(related) => {
                sqlx::query(sql::select_relationships_filtered())
                    .bind(entity_type)
                    .bind(entity_id)
                    .bind(related)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(sql::select_relationships())
                    .bind(entity_type)
                    .bind(entity_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter()
            .map(|row| {
                let blob: String = row.get("blob");
                let confidence: f64 = row.get("confidence");
                Ok(RelationshipEdge {
                    entity_type: row.get("entity_type"),
                    entity_id: row.get("entity_id"),
                    related_type: row.get("related_type"),
                    related_id: row.get("related_id"),
                    attributes: mapping::parse_blob(&blob)?,
                    confidence: mapping::parse_confidence(confidence),
                    stored_at_ms: row.get("stored_at"),
                })
            })
            .collect()
    }

    /// Counters over the durable tier
    ///
    /// # Errors
    /// Returns an error on database failure.
    pub async fn stats(&self) -> Result<DurableStats> {
        let query_row = sqlx::query(sql::count_query_entries())
            .fetch_one(&self.pool)
            .await?;
        let relationship_row = sqlx::query(sql::count_relationship_entries())
            .fetch_one(&self.pool)
            .await?;

        let query_entries: i64 = query_row.get("n");
        let total_hits: i64 = query_row.get("total_hits");
        let relationship_entries: i64 = relationship_row.get("n");

        Ok(DurableStats {
            query_entries: u64::try_from(query_entries).unwrap_or(0),
            total_hits: u64::try_from(total_hits).unwrap_or(0),
            relationship_entries: u64::try_from(relationship_entries).unwrap_or(0),
            file_size_bytes: std::fs::metadata(&self.path).ok().map(|m| m.len()),
        })
    }

    /// Closes the underlying pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
