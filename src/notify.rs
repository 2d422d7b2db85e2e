//! Local notification bus payload.

use serde::{Deserialize, Serialize};

use crate::model::OwnerId;

/// "An item was just saved" hint from the generation side. Fired once per
/// generated item and races the realtime channel; either identifier may be
/// missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSaved {
    pub owner: OwnerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_url: Option<String>,
}

/// Which insert path a hint should take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SavedTarget {
    Id(String),
    Url(String),
    Latest,
}

impl ItemSaved {
    pub fn new(owner: impl Into<OwnerId>) -> Self {
        Self {
            owner: owner.into(),
            item_id: None,
            item_url: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.item_id = Some(id.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.item_url = Some(url.into());
        self
    }

    /// Prefer the id, then the url, then fall back to "newest row".
    pub fn target(&self) -> SavedTarget {
        let non_empty = |s: &Option<String>| {
            s.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        if let Some(id) = non_empty(&self.item_id) {
            SavedTarget::Id(id)
        } else if let Some(url) = non_empty(&self.item_url) {
            SavedTarget::Url(url)
        } else {
            SavedTarget::Latest
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_preference() {
        let hint = ItemSaved::new("alice").with_id("x").with_url("https://h/x.png");
        assert_eq!(hint.target(), SavedTarget::Id("x".into()));

        let hint = ItemSaved::new("alice").with_id("  ").with_url("https://h/x.png");
        assert_eq!(hint.target(), SavedTarget::Url("https://h/x.png".into()));

        assert_eq!(ItemSaved::new("alice").target(), SavedTarget::Latest);
    }

    #[test]
    fn test_deserialize_without_optional_fields() {
        let hint: ItemSaved = serde_json::from_str(r#"{"owner":"alice"}"#).unwrap();
        assert_eq!(hint, ItemSaved::new("alice"));
    }
}
