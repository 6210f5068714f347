//! L1: bounded in-process interpretation cache
//!
//! Smallest and hottest tier. Operations never suspend; the map is guarded
//! by a readers-writer lock and entries expire by a short TTL. A live hit is
//! fully trusted (confidence 1.0 at the orchestration layer) because
//! staleness is bounded by the TTL.

use crate::domain_types::{Confidence, L1Capacity, TtlSeconds};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

/// One cached interpretation in the in-process tier
#[derive(Debug, Clone)]
pub struct L1Entry {
    /// Interpretation blob
    pub value: Value,
    /// Confidence recorded at store time (kept for stats; hits report 1.0)
    pub confidence: Confidence,
    /// Normalized query text, used for pattern invalidation
    pub normalized_query: String,
    stored_at: Instant,
}

/// Bounded TTL map for interpretations, keyed by query hash
pub struct L1Cache {
    entries: RwLock<HashMap<String, L1Entry>>,
    capacity: L1Capacity,
    ttl: TtlSeconds,
}

impl L1Cache {
    /// Creates an empty tier with the given bounds
    pub fn new(capacity: L1Capacity, ttl: TtlSeconds) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
            ttl,
        }
    }

    /// Looks up a still-valid entry; expired entries are dropped lazily
    pub fn get(&self, query_hash: &str) -> Option<L1Entry> {
        {
            let entries = self.entries.read().expect("l1 lock poisoned");
            match entries.get(query_hash) {
                Some(entry) if entry.stored_at.elapsed() < self.ttl.as_duration() => {
                    return Some(entry.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: upgrade to a write lock and drop it.
        self.entries
            .write()
            .expect("l1 lock poisoned")
            .remove(query_hash);
        None
    }

    /// Inserts an entry, evicting the oldest when at capacity
    pub fn insert(
        &self,
        query_hash: String,
        normalized_query: String,
        value: Value,
        confidence: Confidence,
    ) {
        let mut entries = self.entries.write().expect("l1 lock poisoned");
        if !entries.contains_key(&query_hash) && entries.len() >= self.capacity.as_usize() {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                entries.remove(&key);
            }
        }
        entries.insert(
            query_hash,
            L1Entry {
                value,
                confidence,
                normalized_query,
                stored_at: Instant::now(),
            },
        );
    }

    /// Removes every entry whose normalized query contains `pattern`
    /// (callers pass an already-lowercased pattern); returns removed hashes
    pub fn invalidate_pattern(&self, pattern: &str) -> Vec<String> {
        let mut entries = self.entries.write().expect("l1 lock poisoned");
        let matching: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.normalized_query.contains(pattern))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &matching {
            entries.remove(key);
        }
        matching
    }

    /// All currently stored hashes (used to clear matching keys in L2)
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("l1 lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.read().expect("l1 lock poisoned").len()
    }

    /// Whether the tier is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity bound
    pub fn capacity(&self) -> usize {
        self.capacity.as_usize()
    }

    /// Drops all entries
    pub fn clear(&self) {
        self.entries.write().expect("l1 lock poisoned").clear();
    }

    /// Rough memory footprint of the tier in bytes
    ///
    /// Serialized blob length plus key/query text; good enough for the
    /// stats endpoint, not an allocator measurement.
    pub fn approx_bytes(&self) -> usize {
        let entries = self.entries.read().expect("l1 lock poisoned");
        entries
            .iter()
            .map(|(k, e)| k.len() + e.normalized_query.len() + e.value.to_string().len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(capacity: usize, ttl_secs: u64) -> L1Cache {
        L1Cache::new(
            L1Capacity::try_new(capacity).unwrap(),
            TtlSeconds::try_new(ttl_secs).unwrap(),
        )
    }

    fn conf(v: f64) -> Confidence {
        Confidence::try_new(v).unwrap()
    }

    #[test]
    fn insert_then_get_returns_entry() {
        let l1 = cache(10, 30);
        l1.insert(
            "h1".to_string(),
            "events today".to_string(),
            json!({"capability": "calendar.read"}),
            conf(0.9),
        );
        let entry = l1.get("h1").unwrap();
        assert_eq!(entry.value["capability"], "calendar.read");
        assert_eq!(entry.normalized_query, "events today");
    }

    #[test]
    fn miss_on_unknown_hash() {
        let l1 = cache(10, 30);
        assert!(l1.get("absent").is_none());
    }

    #[test]
    fn capacity_bound_evicts_oldest() {
        let l1 = cache(2, 30);
        l1.insert("h1".to_string(), "one".to_string(), json!(1), conf(0.5));
        l1.insert("h2".to_string(), "two".to_string(), json!(2), conf(0.5));
        l1.insert("h3".to_string(), "three".to_string(), json!(3), conf(0.5));
        assert_eq!(l1.len(), 2);
        assert!(l1.get("h1").is_none());
        assert!(l1.get("h3").is_some());
    }

    #[test]
    fn reinsert_does_not_evict_when_key_exists() {
        let l1 = cache(2, 30);
        l1.insert("h1".to_string(), "one".to_string(), json!(1), conf(0.5));
        l1.insert("h2".to_string(), "two".to_string(), json!(2), conf(0.5));
        l1.insert("h1".to_string(), "one".to_string(), json!(10), conf(0.6));
        assert_eq!(l1.len(), 2);
        assert_eq!(l1.get("h1").unwrap().value, json!(10));
    }

    #[test]
    fn pattern_invalidation_is_substring_match() {
        let l1 = cache(10, 30);
        l1.insert(
            "h1".to_string(),
            "events today".to_string(),
            json!(1),
            conf(0.5),
        );
        l1.insert(
            "h2".to_string(),
            "events tomorrow".to_string(),
            json!(2),
            conf(0.5),
        );
        let removed = l1.invalidate_pattern("today");
        assert_eq!(removed, vec!["h1".to_string()]);
        assert!(l1.get("h1").is_none());
        assert!(l1.get("h2").is_some());
    }
}
