//! Remote store abstraction.
//!
//! - [`MemoryRemote`]: in-process store with lag/failure injection
//!
//! Real deployments implement [`RemoteStore`] against their hosted
//! database. All list queries order by `created_at` descending.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{MediaItem, MediaKind, ProbeRow};
use crate::stats::StatsSnapshot;

pub use memory::MemoryRemote;

/// Half-open row range `[offset, offset + limit)` in created-at-descending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub offset: usize,
    pub limit: usize,
}

impl PageRange {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }
}

/// Conjunctive row filter. Empty filter matches every row of the owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    /// "id is one of {...}"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    /// Matches either the primary or the thumbnail url.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favorite: Option<bool>,
}

impl QueryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: Some(ids.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, item: &MediaItem) -> bool {
        if let Some(ref ids) = self.ids {
            if !ids.iter().any(|id| *id == item.id) {
                return false;
            }
        }
        if let Some(ref url) = self.url {
            if !item.has_url(url) {
                return false;
            }
        }
        if let Some(ref model) = self.model_name {
            if item.model_label() != Some(model.as_str()) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if item.kind != kind {
                return false;
            }
        }
        if let Some(favorite) = self.favorite {
            if item.favorite != favorite {
                return false;
            }
        }
        true
    }

    pub fn is_by_identity(&self) -> bool {
        self.ids.is_some() || self.url.is_some()
    }
}

/// Hosted media table plus the aggregate-recompute procedure.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Human-readable backend name (e.g., "memory", "postgrest").
    fn backend_name(&self) -> &str;

    /// Full rows for `owner` matching `filter`, newest first, within `range`.
    async fn query(
        &self,
        owner: &str,
        filter: &QueryFilter,
        range: PageRange,
    ) -> Result<Vec<MediaItem>>;

    /// Only `{id, created_at}` for the same ordering as [`RemoteStore::query`].
    async fn query_probe(&self, owner: &str, range: PageRange) -> Result<Vec<ProbeRow>>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn update_favorite(&self, id: &str, favorite: bool) -> Result<()>;

    /// Single-row read of the stored aggregate snapshot, if one exists.
    async fn fetch_stats(&self, owner: &str) -> Result<Option<StatsSnapshot>>;

    /// Authoritative recount over all of the owner's media. Stores and
    /// returns the new snapshot.
    async fn recompute_stats(&self, owner: &str) -> Result<StatsSnapshot>;
}
