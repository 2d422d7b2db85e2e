use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::{composite_key, KeyValueStore};

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().map_err(|e| anyhow::anyhow!("lock poisoned: {e}"))?;
        Ok(entries.get(&composite_key(namespace, key)).cloned())
    }

    async fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|e| anyhow::anyhow!("lock poisoned: {e}"))?;
        entries.insert(composite_key(namespace, key), value.to_vec());
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|e| anyhow::anyhow!("lock poisoned: {e}"))?;
        entries.remove(&composite_key(namespace, key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = MemoryStore::new();
        store.set("collection", "alice", b"one").await.unwrap();
        store.set("stats", "alice", b"two").await.unwrap();

        assert_eq!(store.get("collection", "alice").await.unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(store.get("stats", "alice").await.unwrap().as_deref(), Some(&b"two"[..]));
        assert!(store.get("collection", "bob").await.unwrap().is_none());

        store.remove("stats", "alice").await.unwrap();
        assert!(store.get("stats", "alice").await.unwrap().is_none());
        assert_eq!(store.len(), 1);
    }
}
