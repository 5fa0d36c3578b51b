//! Async TTL cache for accounting-API lookups.
//!
//! Entries expire lazily on read. A per-key mutex makes concurrent misses
//! single-flight: exactly one caller runs the producer, the rest await and
//! read the stored value. Producer errors are never cached.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::trace;

use crate::domain::Result;

/// Default bound before a proactive expired-entry sweep
pub const DEFAULT_MAX_ENTRIES: usize = 1024;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

pub struct TtlCache<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    max_entries: usize,
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl<V: Clone> TtlCache<V> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            max_entries,
        }
    }

    /// Read a live entry, expiring it lazily if stale
    pub async fn get(&self, key: &str) -> Option<V> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.value.clone())
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Stale: drop it under the write lock
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if entry.expires_at <= Instant::now() {
                entries.remove(key);
            } else {
                return Some(entry.value.clone());
            }
        }
        None
    }

    /// Return the cached value or run `producer` exactly once per miss.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(key).await {
            trace!(key, "cache hit");
            return Ok(value);
        }

        let key_lock = {
            let mut locks = self.key_locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = key_lock.lock().await;

        // A concurrent caller may have produced while we waited on the key lock
        if let Some(value) = self.get(key).await {
            trace!(key, "cache hit after single-flight wait");
            return Ok(value);
        }

        let value = producer().await?;
        self.insert(key.to_string(), value.clone(), ttl).await;
        Ok(value)
    }

    pub async fn insert(&self, key: String, value: V, ttl: Duration) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries {
            let now = Instant::now();
            entries.retain(|_, e| e.expires_at > now);
        }
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub async fn invalidate(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
