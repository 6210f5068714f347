//! L2: optional remote key/value tier
//!
//! A medium-TTL shared tier between the in-process map and the durable
//! store. Strictly best-effort: absence of the backing service is a miss,
//! and the orchestration layer enforces a small time budget so a slow L2
//! never stalls a hot read.

use crate::domain_types::Confidence;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Wire payload stored per key in the remote tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvEntry {
    /// Interpretation blob
    pub value: Value,
    /// Confidence recorded at store time
    pub confidence: f64,
    /// Store timestamp, unix milliseconds
    pub stored_at_ms: i64,
}

impl KvEntry {
    /// Confidence as a validated domain value, clamped into range
    pub fn confidence(&self) -> Confidence {
        Confidence::try_new(self.confidence.clamp(0.0, 1.0))
            .unwrap_or_else(|_| Confidence::zero())
    }
}

/// Remote key/value abstraction for the middle cache tier
#[async_trait]
pub trait RemoteKv: Send + Sync {
    /// Fetches the entry stored under `key`, if any
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Stores `entry` under `key` with the given time-to-live
    async fn set(&self, key: &str, entry: &KvEntry, ttl: Duration) -> Result<()>;

    /// Removes the entry stored under `key`
    async fn delete(&self, key: &str) -> Result<()>;
}

/// HTTP implementation of the remote tier
///
/// Speaks a plain JSON KV protocol: `GET/PUT/DELETE {base}/kv/{key}`, with
/// the TTL passed as a query parameter on writes.
pub struct HttpKv {
    client: reqwest::Client,
    base_url: String,
}

impl HttpKv {
    /// Creates a client against `base_url`
    ///
    /// The connect timeout is kept tight: the orchestration layer treats
    /// anything slower than its budget as a miss anyway.
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(50))
            .timeout(Duration::from_millis(250))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/kv/{key}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl RemoteKv for HttpKv {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let response = self.client.get(self.key_url(key)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().map_err(crate::error::Error::from)?;
        let entry = response.json::<KvEntry>().await?;
        Ok(Some(entry))
    }

    async fn set(&self, key: &str, entry: &KvEntry, ttl: Duration) -> Result<()> {
        self.client
            .put(self.key_url(key))
            .query(&[("ttl_seconds", ttl.as_secs())])
            .json(entry)
            .send()
            .await?
            .error_for_status()
            .map_err(crate::error::Error::from)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self.client.delete(self.key_url(key)).send().await?;
        if response.status() != reqwest::StatusCode::NOT_FOUND {
            response.error_for_status().map_err(crate::error::Error::from)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory `RemoteKv` for tests
    #[derive(Default)]
    pub struct MemoryKv {
        pub entries: Mutex<HashMap<String, KvEntry>>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl RemoteKv for MemoryKv {
        async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
            if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(crate::error::Error::upstream_unavailable("kv down"));
            }
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn set(&self, key: &str, entry: &KvEntry, _ttl: Duration) -> Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(crate::error::Error::upstream_unavailable("kv down"));
            }
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), entry.clone());
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }
    }
}
