//! Three-tier semantic cache
//!
//! Interpretation results flow through an in-process map (L1), an optional
//! remote key/value service (L2), and a local durable store (L3). Reads
//! promote lower-tier hits upward; writes fan out to every available tier.
//! Each tier failure degrades the cache without corrupting the response:
//! the caller always sees a consistent hit or a miss.

pub mod l1;
pub mod l2;
pub mod l3;

use crate::domain_types::{AgentId, Confidence, L1Capacity, TtlSeconds};
use crate::error::Result;
use l1::L1Cache;
use l2::{KvEntry, RemoteKv};
use l3::{DurableStats, DurableStore, RelationshipEdge};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Separator between the normalized query and the agent id in the digest
/// input (U+241F, symbol for unit separator)
const KEY_SEPARATOR: char = '\u{241F}';

/// Lowercases, trims, and collapses internal whitespace
pub fn normalize_query(query: &str) -> String {
    query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Derives the cache key: a SHA-256 digest over the normalized query and
/// the agent id
pub fn query_hash(query: &str, agent_id: &AgentId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_query(query).as_bytes());
    hasher.update(KEY_SEPARATOR.to_string().as_bytes());
    hasher.update(agent_id.as_str().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Which tier satisfied a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    L1,
    L2,
    L3,
}

/// Tagged result of a cache read
#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// A valid entry was found at `tier`
    Hit {
        /// Interpretation blob
        value: Value,
        /// Confidence to report to the caller (1.0 for L1 hits)
        confidence: Confidence,
        /// Tier that satisfied the read
        tier: CacheTier,
    },
    /// No tier holds a valid entry
    Miss,
}

impl CacheLookup {
    /// Whether this lookup found an entry
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit { .. })
    }
}

/// Tuning knobs for the tiered cache
#[derive(Debug, Clone)]
pub struct SemanticCacheConfig {
    /// L1 entry bound
    pub l1_capacity: L1Capacity,
    /// L1 time-to-live (short: tens of seconds)
    pub l1_ttl: TtlSeconds,
    /// L2 time-to-live (medium: minutes)
    pub l2_ttl: TtlSeconds,
    /// L3 time-to-live (long: hours)
    pub l3_ttl: TtlSeconds,
    /// Budget for any single L2 operation on the read path
    pub l2_budget: Duration,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: L1Capacity::try_new(500).expect("500 is a valid capacity"),
            l1_ttl: TtlSeconds::try_new(30).expect("30s is a valid ttl"),
            l2_ttl: TtlSeconds::try_new(300).expect("300s is a valid ttl"),
            l3_ttl: TtlSeconds::try_new(21_600).expect("6h is a valid ttl"),
            l2_budget: Duration::from_millis(50),
        }
    }
}

/// Counters and sizes across the tiers
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Live entries in L1
    pub l1_entries: usize,
    /// Configured L1 bound
    pub l1_capacity: usize,
    /// Reads satisfied by L1
    pub l1_hits: u64,
    /// Reads satisfied by L2
    pub l2_hits: u64,
    /// Reads satisfied by L3
    pub l3_hits: u64,
    /// Reads no tier could satisfy
    pub misses: u64,
    /// Write operations accepted
    pub sets: u64,
    /// Fraction of reads satisfied by any tier
    pub hit_rate: f64,
    /// Whether an L2 tier is configured
    pub l2_configured: bool,
    /// Rough L1 memory footprint in bytes
    pub approx_l1_bytes: usize,
    /// Durable tier counters
    pub durable: DurableStats,
}

#[derive(Default)]
struct Counters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    l3_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

/// The tiered semantic cache owned by one agent
pub struct SemanticCache {
    agent_id: AgentId,
    config: SemanticCacheConfig,
    l1: L1Cache,
    l2: Option<Arc<dyn RemoteKv>>,
    l3: DurableStore,
    counters: Counters,
}

impl SemanticCache {
    /// Opens the cache for `agent_id`, rooted at `cache_dir`
    ///
    /// # Errors
    /// Returns an error when the durable tier cannot be opened — an
    /// unrecoverable startup failure for the owning agent.
    pub async fn open(
        cache_dir: &Path,
        agent_id: AgentId,
        l2: Option<Arc<dyn RemoteKv>>,
        config: SemanticCacheConfig,
    ) -> Result<Self> {
        let l3 = DurableStore::open(cache_dir, agent_id.clone(), config.l3_ttl.as_duration()).await?;
        Ok(Self {
            l1: L1Cache::new(config.l1_capacity, config.l1_ttl),
            l2,
            l3,
            agent_id,
            config,
            counters: Counters::default(),
        })
    }

    /// The owning agent
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Tiered lookup with downward search and upward promotion
    ///
    /// Never returns an error: any tier failure is logged and treated as a
    /// miss at that tier.
    pub async fn get(&self, query: &str) -> CacheLookup {
        let normalized = normalize_query(query);
        let hash = query_hash(query, &self.agent_id);

        // L1 never suspends. A live hit is fully trusted: staleness is
        // bounded by the short TTL.
        if let Some(entry) = self.l1.get(&hash) {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            return CacheLookup::Hit {
                value: entry.value,
                confidence: Confidence::full(),
                tier: CacheTier::L1,
            };
        }

        // L2 within a strict budget; timeout or failure is a miss.
        if let Some(kv) = &self.l2 {
            match tokio::time::timeout(self.config.l2_budget, kv.get(&hash)).await {
                Ok(Ok(Some(entry))) => {
                    self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                    let confidence = entry.confidence();
                    self.l1.insert(
                        hash,
                        normalized,
                        entry.value.clone(),
                        confidence,
                    );
                    return CacheLookup::Hit {
                        value: entry.value,
                        confidence,
                        tier: CacheTier::L2,
                    };
                }
                Ok(Ok(None)) => {}
                Ok(Err(err)) => debug!(error = %err, "l2 read failed, treating as miss"),
                Err(_) => debug!("l2 read exceeded budget, treating as miss"),
            }
        }

        // L3 durable tier.
        match self.l3.get(&hash).await {
            Ok(Some(stored)) => {
                self.counters.l3_hits.fetch_add(1, Ordering::Relaxed);
                self.promote_to_l2(&hash, &stored.value, stored.confidence).await;
                self.l1.insert(
                    hash,
                    normalized,
                    stored.value.clone(),
                    stored.confidence,
                );
                CacheLookup::Hit {
                    value: stored.value,
                    confidence: stored.confidence,
                    tier: CacheTier::L3,
                }
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Miss
            }
            Err(err) => {
                warn!(error = %err, "l3 read failed, treating as miss");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Miss
            }
        }
    }

    /// Writes an interpretation to every available tier
    ///
    /// The L1 write always succeeds; L2 and L3 failures are logged as
    /// warnings without failing the call.
    pub async fn set(&self, query: &str, value: &Value, confidence: Confidence) {
        let normalized = normalize_query(query);
        let hash = query_hash(query, &self.agent_id);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);

        self.l1
            .insert(hash.clone(), normalized.clone(), value.clone(), confidence);

        self.promote_to_l2(&hash, value, confidence).await;

        if let Err(err) = self.l3.put(&hash, &normalized, value, confidence).await {
            warn!(error = %err, "l3 write failed; entry is cached in upper tiers only");
        }
    }

    /// Deletes from all tiers every entry whose normalized query contains
    /// `pattern` (case-insensitive); returns the number of distinct entries
    /// removed
    ///
    /// # Errors
    /// Returns an error only when the durable tier cannot be scanned.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<u64> {
        let pattern = pattern.to_lowercase();

        let mut hashes = self.l3.invalidate_pattern(&pattern).await?;
        let l1_removed = self.l1.invalidate_pattern(&pattern);
        for hash in l1_removed {
            if !hashes.contains(&hash) {
                hashes.push(hash);
            }
        }

        // L2 cannot be scanned by pattern; delete the union of hashes the
        // scannable tiers matched.
        if let Some(kv) = &self.l2 {
            for hash in &hashes {
                if let Err(err) = kv.delete(hash).await {
                    debug!(error = %err, "l2 delete failed during invalidation");
                }
            }
        }

        Ok(hashes.len() as u64)
    }

    /// Stores a relationship edge in the durable tier
    ///
    /// # Errors
    /// Returns an error on durable-tier failure.
    pub async fn cache_relationship(
        &self,
        entity_type: &str,
        entity_id: &str,
        related_type: &str,
        related_id: &str,
        attributes: &Value,
        confidence: Confidence,
    ) -> Result<()> {
        self.l3
            .upsert_relationship(
                entity_type,
                entity_id,
                related_type,
                related_id,
                attributes,
                confidence,
            )
            .await
    }

    /// Fetches relationship edges for an entity
    ///
    /// # Errors
    /// Returns an error on durable-tier failure.
    pub async fn relationships(
        &self,
        entity_type: &str,
        entity_id: &str,
        related_type: Option<&str>,
    ) -> Result<Vec<RelationshipEdge>> {
        self.l3.relationships(entity_type, entity_id, related_type).await
    }

    /// Counters and sizes across the tiers
    ///
    /// # Errors
    /// Returns an error when the durable tier cannot be counted.
    pub async fn stats(&self) -> Result<CacheStats> {
        let l1_hits = self.counters.l1_hits.load(Ordering::Relaxed);
        let l2_hits = self.counters.l2_hits.load(Ordering::Relaxed);
        let l3_hits = self.counters.l3_hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total_reads = l1_hits + l2_hits + l3_hits + misses;
        let hit_rate = if total_reads == 0 {
            0.0
        } else {
            (total_reads - misses) as f64 / total_reads as f64
        };

        Ok(CacheStats {
            l1_entries: self.l1.len(),
            l1_capacity: self.l1.capacity(),
            l1_hits,
            l2_hits,
            l3_hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            hit_rate,
            l2_configured: self.l2.is_some(),
            approx_l1_bytes: self.l1.approx_bytes(),
            durable: self.l3.stats().await?,
        })
    }

    /// Closes the durable tier
    pub async fn close(&self) {
        self.l3.close().await;
    }

    async fn promote_to_l2(&self, hash: &str, value: &Value, confidence: Confidence) {
        let Some(kv) = &self.l2 else { return };
        let entry = KvEntry {
            value: value.clone(),
            confidence: confidence.value(),
            stored_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        let write = kv.set(hash, &entry, self.config.l2_ttl.as_duration());
        match tokio::time::timeout(self.config.l2_budget, write).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "l2 write failed"),
            Err(_) => warn!("l2 write exceeded budget"),
        }
    }
}
