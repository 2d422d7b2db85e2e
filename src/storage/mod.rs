//! Persistent key-value storage for cached snapshots.
//!
//! - [`RedbStore`]: embedded redb file (default, survives restarts)
//! - [`MemoryStore`]: process-local map (tests, ephemeral sessions)
//!
//! The sync engine is the only writer; everything else observes the
//! engine's published state instead of reading the store.

pub mod memory;
pub mod redb_store;

use anyhow::Result;
use async_trait::async_trait;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

/// Namespaced blob store.
///
/// All methods are async so remote-backed stores can implement it;
/// local backends just lock and call through.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Human-readable backend name (e.g., "redb", "memory").
    fn backend_name(&self) -> &str;

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()>;

    async fn remove(&self, namespace: &str, key: &str) -> Result<()>;
}

/// Flattened key used by backends with a single keyspace.
pub(crate) fn composite_key(namespace: &str, key: &str) -> String {
    format!("{namespace}/{key}")
}
