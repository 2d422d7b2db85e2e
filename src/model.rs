//! Core data model: media items and the per-owner ordered collection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account scope that partitions all media and statistics.
pub type OwnerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Image => write!(f, "image"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "image" | "img" | "photo" => Ok(MediaKind::Image),
            "video" | "vid" => Ok(MediaKind::Video),
            _ => Err(anyhow::anyhow!("Unknown media kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Success,
    Failed,
}

impl std::str::FromStr for ItemStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "success" | "succeeded" | "completed" => Ok(ItemStatus::Success),
            "failed" | "failure" | "error" => Ok(ItemStatus::Failed),
            _ => Err(anyhow::anyhow!("Unknown item status: {}", s)),
        }
    }
}

/// Parameters the item was generated with. All optional; older rows carry none.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub owner_id: OwnerId,
    pub created_at: DateTime<Utc>,
    pub kind: MediaKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    pub favorite: bool,
    pub status: ItemStatus,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<GenerationMetadata>,
}

impl MediaItem {
    /// An item can be rendered when at least one of its urls is well-formed.
    pub fn is_displayable(&self) -> bool {
        is_renderable_url(&self.url)
            || self.thumbnail_url.as_deref().is_some_and(is_renderable_url)
    }

    /// Model label, with empty strings treated as absent.
    pub fn model_label(&self) -> Option<&str> {
        self.model_name
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
    }

    pub fn has_url(&self, url: &str) -> bool {
        let url = url.trim();
        !url.is_empty()
            && (self.url == url || self.thumbnail_url.as_deref() == Some(url))
    }
}

/// Whether `raw` is a non-empty url with a scheme we can render from.
pub fn is_renderable_url(raw: &str) -> bool {
    let raw = raw.trim();
    if raw.is_empty() {
        return false;
    }
    match url::Url::parse(raw) {
        Ok(parsed) => match parsed.scheme() {
            "http" | "https" => parsed.host_str().is_some_and(|h| !h.is_empty()),
            "data" | "file" => true,
            _ => false,
        },
        Err(_) => false,
    }
}

/// Lightweight row returned by a probe query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRow {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl From<&MediaItem> for ProbeRow {
    fn from(item: &MediaItem) -> Self {
        Self {
            id: item.id.clone(),
            created_at: item.created_at,
        }
    }
}

/// Ordered media for one owner, newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OwnerCollection {
    pub items: Vec<MediaItem>,
    /// Number of rows consumed from the remote ordering so far.
    pub cursor: usize,
    pub has_more: bool,
}

impl OwnerCollection {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&MediaItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut MediaItem> {
        self.items.iter_mut().find(|i| i.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn find_by_url(&self, url: &str) -> Option<&MediaItem> {
        self.items.iter().find(|i| i.has_url(url))
    }

    /// Newest first; ties broken by id so the order is deterministic.
    pub fn sort(&mut self) {
        sort_newest_first(&mut self.items);
    }

    /// Replace the whole collection with a first page.
    pub fn replace_page(&mut self, page: Vec<MediaItem>, page_size: usize) {
        self.has_more = page.len() == page_size;
        self.cursor = page.len();
        self.items = page;
        dedup_by_id(&mut self.items);
        self.sort();
    }

    /// Append a subsequent page, skipping ids already held.
    /// Returns how many items were actually added.
    pub fn append_page(&mut self, page: Vec<MediaItem>, page_size: usize) -> usize {
        self.has_more = page.len() == page_size;
        self.cursor += page.len();
        let before = self.items.len();
        for item in page {
            if !self.contains(&item.id) {
                self.items.push(item);
            }
        }
        self.sort();
        self.items.len() - before
    }

    /// Remove the given ids. Returns the removed items.
    pub fn remove_ids(&mut self, ids: &[String]) -> Vec<MediaItem> {
        let mut removed = Vec::new();
        self.items.retain(|item| {
            if ids.contains(&item.id) {
                removed.push(item.clone());
                false
            } else {
                true
            }
        });
        self.cursor = self.cursor.saturating_sub(removed.len());
        removed
    }
}

pub fn sort_newest_first(items: &mut [MediaItem]) {
    items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

pub fn dedup_by_id(items: &mut Vec<MediaItem>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|i| seen.insert(i.id.clone()));
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::TimeZone;

    pub fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    pub fn item(id: &str, owner: &str, secs: i64) -> MediaItem {
        MediaItem {
            id: id.to_string(),
            owner_id: owner.to_string(),
            created_at: ts(secs),
            kind: MediaKind::Image,
            model_name: Some("flux".to_string()),
            favorite: false,
            status: ItemStatus::Success,
            url: format!("https://cdn.example.com/{id}.png"),
            thumbnail_url: None,
            metadata: None,
        }
    }

    pub fn placeholder(id: &str, owner: &str, secs: i64) -> MediaItem {
        MediaItem {
            url: String::new(),
            thumbnail_url: None,
            ..item(id, owner, secs)
        }
    }
}
