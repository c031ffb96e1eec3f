//! In-memory TTL caches with per-key request coalescing.
//!
//! Every cache used by the scan engine follows the same shape: look the key
//! up, and on a miss run the fetch closure while holding a per-key lock so
//! concurrent misses for the same key collapse into one upstream call.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use crate::error::Result;

struct Entry<V> {
    value: V,
    inserted: Instant,
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, Entry<V>>>,
    flights: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        entries.get(key).and_then(|e| {
            if e.inserted.elapsed() < self.ttl {
                Some(e.value.clone())
            } else {
                None
            }
        })
    }

    pub async fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            Entry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn flight_lock(&self, key: &K) -> Arc<Mutex<()>> {
        let mut flights = self.flights.lock().await;
        flights.entry(key.clone()).or_default().clone()
    }

    /// Returns the cached value or runs `fetch` exactly once per key across
    /// concurrent callers. A failed fetch caches nothing; the next caller
    /// retries.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V>>,
    {
        if let Some(hit) = self.get(&key).await {
            return Ok(hit);
        }

        let lock = self.flight_lock(&key).await;
        let _guard = lock.lock().await;

        // A coalesced caller may have populated the entry while we waited.
        if let Some(hit) = self.get(&key).await {
            return Ok(hit);
        }

        let value = fetch().await?;
        self.insert(key.clone(), value.clone()).await;

        let mut flights = self.flights.lock().await;
        flights.remove(&key);
        Ok(value)
    }

    /// Drops expired entries. Called opportunistically; correctness does not
    /// depend on it.
    pub async fn evict_expired(&self) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.inserted.elapsed() < self.ttl);
    }
}
