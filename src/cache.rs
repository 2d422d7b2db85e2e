//! Snapshot cache on top of a [`KeyValueStore`].
//!
//! Every entry records when it was fetched so callers can decide whether a
//! snapshot is still inside its staleness window. Writes that would store
//! byte-identical content are skipped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::storage::KeyValueStore;

pub const COLLECTION_NAMESPACE: &str = "collection";
pub const STATS_NAMESPACE: &str = "stats";
pub const FILTERED_NAMESPACE: &str = "filtered";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_fetched_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            last_fetched_at: Utc::now(),
        }
    }

    /// Younger than `window`. Entries stamped in the future count as stale.
    pub fn is_fresh(&self, window: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.last_fetched_at);
        match age.to_std() {
            Ok(age) => age < window,
            Err(_) => false,
        }
    }
}

pub struct PersistentCache {
    store: Arc<dyn KeyValueStore>,
    /// blake3 of the last bytes written per composite key.
    written: Mutex<HashMap<String, blake3::Hash>>,
}

impl PersistentCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            written: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.store.backend_name()
    }

    pub async fn load<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<CacheEntry<T>>> {
        let Some(bytes) = self.store.get(namespace, key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<CacheEntry<T>>(&bytes) {
            Ok(entry) => {
                self.remember(namespace, key, blake3::hash(&bytes));
                Ok(Some(entry))
            }
            Err(e) => {
                // Corrupt or from an older schema; treat as a miss
                tracing::warn!("Discarding unreadable cache entry {}/{}: {}", namespace, key, e);
                Ok(None)
            }
        }
    }

    /// Persist `entry`. Returns false when the stored bytes were already identical.
    pub async fn save<T: Serialize>(
        &self,
        namespace: &str,
        key: &str,
        entry: &CacheEntry<T>,
    ) -> Result<bool> {
        let bytes = serde_json::to_vec(entry).context("Failed to serialize cache entry")?;
        let hash = blake3::hash(&bytes);
        if self.last_written(namespace, key) == Some(hash) {
            return Ok(false);
        }
        self.store.set(namespace, key, &bytes).await?;
        self.remember(namespace, key, hash);
        Ok(true)
    }

    pub async fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        self.store.remove(namespace, key).await?;
        if let Ok(mut written) = self.written.lock() {
            written.remove(&format!("{namespace}/{key}"));
        }
        Ok(())
    }

    fn last_written(&self, namespace: &str, key: &str) -> Option<blake3::Hash> {
        self.written
            .lock()
            .ok()
            .and_then(|w| w.get(&format!("{namespace}/{key}")).copied())
    }

    fn remember(&self, namespace: &str, key: &str, hash: blake3::Hash) {
        if let Ok(mut written) = self.written.lock() {
            written.insert(format!("{namespace}/{key}"), hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_freshness_window() {
        let mut entry = CacheEntry::new(1u32);
        assert!(entry.is_fresh(Duration::from_secs(60)));

        entry.last_fetched_at = Utc::now() - chrono::Duration::minutes(31);
        assert!(!entry.is_fresh(Duration::from_secs(30 * 60)));

        entry.last_fetched_at = Utc::now() + chrono::Duration::minutes(5);
        assert!(!entry.is_fresh(Duration::from_secs(30 * 60)));
    }

    #[tokio::test]
    async fn test_save_load_and_skip_identical() {
        let cache = PersistentCache::new(Arc::new(MemoryStore::new()));
        let entry = CacheEntry::new(vec!["a".to_string(), "b".to_string()]);

        assert!(cache.save(COLLECTION_NAMESPACE, "alice", &entry).await.unwrap());
        assert!(!cache.save(COLLECTION_NAMESPACE, "alice", &entry).await.unwrap());

        let loaded: CacheEntry<Vec<String>> =
            cache.load(COLLECTION_NAMESPACE, "alice").await.unwrap().unwrap();
        assert_eq!(loaded.value, entry.value);
        assert_eq!(
            loaded.last_fetched_at.timestamp_millis(),
            entry.last_fetched_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let store = Arc::new(MemoryStore::new());
        store.set(STATS_NAMESPACE, "alice", b"not json").await.unwrap();
        let cache = PersistentCache::new(store);

        let loaded: Option<CacheEntry<u32>> = cache.load(STATS_NAMESPACE, "alice").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_owners_are_keyed_separately() {
        let cache = PersistentCache::new(Arc::new(MemoryStore::new()));
        cache.save(STATS_NAMESPACE, "alice", &CacheEntry::new(1u32)).await.unwrap();
        cache.save(STATS_NAMESPACE, "bob", &CacheEntry::new(2u32)).await.unwrap();

        let a: CacheEntry<u32> = cache.load(STATS_NAMESPACE, "alice").await.unwrap().unwrap();
        let b: CacheEntry<u32> = cache.load(STATS_NAMESPACE, "bob").await.unwrap().unwrap();
        assert_eq!((a.value, b.value), (1, 2));

        cache.remove(STATS_NAMESPACE, "alice").await.unwrap();
        assert!(cache.load::<u32>(STATS_NAMESPACE, "alice").await.unwrap().is_none());
    }
}
