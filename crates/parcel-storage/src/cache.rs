//! Bounded TTL cache for connector query results.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// Cached payload of one logical query (all pages).
pub type CachedRows = Arc<Vec<JsonValue>>;

#[derive(Clone)]
pub struct ResponseCache {
    inner: Cache<String, CachedRows>,
    ttl: Duration,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        Self {
            inner: Cache::builder().max_capacity(max_entries).time_to_live(ttl).build(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, key: &str) -> Option<CachedRows> {
        self.inner.get(key).await
    }

    pub async fn insert(&self, key: String, rows: Vec<JsonValue>) -> CachedRows {
        let rows = Arc::new(rows);
        self.inner.insert(key, rows.clone()).await;
        rows
    }

    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }
}

/// Stable key for a query: namespace plus sorted parameters, hashed.
pub fn cache_key(namespace: &str, params: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    for (key, value) in params {
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    format!("{namespace}:{}", hex::encode(hasher.finalize()))
}
