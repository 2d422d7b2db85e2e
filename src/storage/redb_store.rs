//! redb-backed snapshot store.
//!
//! One table, keys are `{namespace}/{key}`, values are opaque bytes
//! (the cache layer writes JSON):
//!
//! ```text
//! collection/{owner}            → CacheEntry<OwnerCollection>
//! stats/{owner}                 → CacheEntry<StatsSnapshot>
//! filtered/{owner}:{filter}     → CacheEntry<OwnerCollection>
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use super::{composite_key, KeyValueStore};

const CACHE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshot_cache");

enum WriteOp {
    Put(String, Vec<u8>),
    Delete(String),
}

pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create cache directory")?;
        }
        let db = Database::create(path)
            .with_context(|| format!("failed to open cache redb at {}", path.display()))?;
        // Ensure table exists
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(CACHE_TABLE)?;
        }
        txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Commit one write off the async runtime; commits fsync.
    async fn write(&self, op: WriteOp) -> Result<()> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(CACHE_TABLE)?;
                match &op {
                    WriteOp::Put(key, value) => {
                        table.insert(key.as_str(), value.as_slice())?;
                    }
                    WriteOp::Delete(key) => {
                        table.remove(key.as_str())?;
                    }
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .context("cache write task panicked")?
    }
}

#[async_trait]
impl KeyValueStore for RedbStore {
    fn backend_name(&self) -> &str {
        "redb"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(CACHE_TABLE)?;
        let value = table
            .get(composite_key(namespace, key).as_str())?
            .map(|v| v.value().to_vec());
        Ok(value)
    }

    async fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        self.write(WriteOp::Put(composite_key(namespace, key), value.to_vec()))
            .await
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        self.write(WriteOp::Delete(composite_key(namespace, key))).await
    }
}
