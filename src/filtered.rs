//! Filtered subsets of the active owner's media.
//!
//! Each subset (one model, one media kind, or favorites) is paged on its
//! own: separate cursor, `has_more` flag and fetch time. Subsets are only
//! queried when something asks for them, so they use a shorter staleness
//! window than the main collection. Concurrent requests for the same
//! subset page share a single remote query.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheEntry, PersistentCache, FILTERED_NAMESPACE};
use crate::coalesce::Coalescer;
use crate::error::{Result, SyncError};
use crate::model::{MediaItem, MediaKind, OwnerCollection, OwnerId};
use crate::remote::{PageRange, QueryFilter, RemoteStore};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterKey {
    Model(String),
    Kind(MediaKind),
    Favorites,
}

impl FilterKey {
    pub fn to_query(&self) -> QueryFilter {
        match self {
            FilterKey::Model(model) => QueryFilter {
                model_name: Some(model.clone()),
                ..QueryFilter::default()
            },
            FilterKey::Kind(kind) => QueryFilter {
                kind: Some(*kind),
                ..QueryFilter::default()
            },
            FilterKey::Favorites => QueryFilter {
                favorite: Some(true),
                ..QueryFilter::default()
            },
        }
    }

    pub fn matches(&self, item: &MediaItem) -> bool {
        self.to_query().matches(item)
    }

    fn storage_key(&self, owner: &str) -> String {
        match self {
            FilterKey::Model(model) => format!("{owner}:model:{model}"),
            FilterKey::Kind(kind) => format!("{owner}:kind:{kind}"),
            FilterKey::Favorites => format!("{owner}:favorites"),
        }
    }
}

impl std::fmt::Display for FilterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterKey::Model(model) => write!(f, "model:{model}"),
            FilterKey::Kind(kind) => write!(f, "kind:{kind}"),
            FilterKey::Favorites => write!(f, "favorites"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PageRequest {
    First,
    After(usize),
}

type FetchKey = (u64, FilterKey, PageRequest);
type FetchResult = std::result::Result<Vec<MediaItem>, String>;

struct ViewState {
    owner: Option<OwnerId>,
    epoch: u64,
    views: LruCache<FilterKey, CacheEntry<OwnerCollection>>,
}

pub struct FilteredViewCache {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<PersistentCache>,
    page_size: usize,
    staleness: Duration,
    state: Mutex<ViewState>,
    fetches: Coalescer<FetchKey, FetchResult>,
}

impl FilteredViewCache {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<PersistentCache>,
        page_size: usize,
        staleness: Duration,
        max_views: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(max_views).unwrap_or(NonZeroUsize::MIN);
        Self {
            remote,
            cache,
            page_size: page_size.max(1),
            staleness,
            state: Mutex::new(ViewState {
                owner: None,
                epoch: 0,
                views: LruCache::new(capacity),
            }),
            fetches: Coalescer::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ViewState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drop every in-memory view and scope the cache to `owner`.
    pub fn activate(&self, owner: Option<OwnerId>, epoch: u64) {
        let mut state = self.lock();
        state.owner = owner;
        state.epoch = epoch;
        state.views.clear();
    }

    fn session(&self) -> Result<(OwnerId, u64)> {
        let state = self.lock();
        let owner = state.owner.clone().ok_or(SyncError::NoActiveOwner)?;
        Ok((owner, state.epoch))
    }

    /// Current in-memory view, without touching the network.
    pub fn peek(&self, key: &FilterKey) -> Option<OwnerCollection> {
        self.lock().views.peek(key).map(|e| e.value.clone())
    }

    /// First page of a subset. Served from memory or the persistent cache
    /// while fresh unless `force` is set.
    pub async fn get(&self, key: &FilterKey, force: bool) -> Result<OwnerCollection> {
        let (owner, epoch) = self.session()?;

        if !force {
            let in_memory = {
                let mut state = self.lock();
                state
                    .views
                    .get(key)
                    .filter(|e| e.is_fresh(self.staleness))
                    .map(|e| e.value.clone())
            };
            if let Some(page) = in_memory {
                return Ok(page);
            }
            match self
                .cache
                .load::<OwnerCollection>(FILTERED_NAMESPACE, &key.storage_key(&owner))
                .await
            {
                Ok(Some(entry)) if entry.is_fresh(self.staleness) => {
                    let page = entry.value.clone();
                    let mut state = self.lock();
                    if state.epoch == epoch {
                        state.views.put(key.clone(), entry);
                    }
                    return Ok(page);
                }
                Ok(_) => {}
                Err(e) => warn!("Could not read cached {} view: {}", key, e),
            }
        }

        let items = self.fetch(&owner, epoch, key, PageRequest::First).await?;
        let mut page = OwnerCollection::default();
        page.replace_page(items, self.page_size);
        self.store(&owner, epoch, key, page.clone()).await?;
        Ok(page)
    }

    /// Append the next page of a subset that is already loaded.
    pub async fn load_more(&self, key: &FilterKey) -> Result<OwnerCollection> {
        let (owner, epoch) = self.session()?;
        let current = match self.peek(key) {
            Some(page) => page,
            None => return self.get(key, false).await,
        };
        if !current.has_more {
            return Ok(current);
        }

        let items = self
            .fetch(&owner, epoch, key, PageRequest::After(current.cursor))
            .await?;

        let page = {
            let mut state = self.lock();
            if state.epoch != epoch {
                return Err(SyncError::StaleOwner(owner));
            }
            let entry = state
                .views
                .get_or_insert_mut(key.clone(), || CacheEntry::new(current.clone()));
            entry.value.append_page(items, self.page_size);
            entry.last_fetched_at = chrono::Utc::now();
            entry.value.clone()
        };
        self.persist(&owner, key, &page).await;
        Ok(page)
    }

    async fn fetch(
        &self,
        owner: &str,
        epoch: u64,
        key: &FilterKey,
        request: PageRequest,
    ) -> Result<Vec<MediaItem>> {
        let remote = Arc::clone(&self.remote);
        let filter = key.to_query();
        let range = match request {
            PageRequest::First => PageRange::first(self.page_size),
            PageRequest::After(offset) => PageRange::new(offset, self.page_size),
        };
        let owner_id = owner.to_string();
        let joined = self
            .fetches
            .run((epoch, key.clone(), request), move || async move {
                remote
                    .query(&owner_id, &filter, range)
                    .await
                    .map_err(|e| format!("{e:#}"))
            })
            .await;
        if !joined.leader {
            debug!("Joined in-flight {} query", key);
        }
        joined
            .value
            .map_err(|msg| SyncError::Network(anyhow::anyhow!(msg)))
    }

    async fn store(
        &self,
        owner: &str,
        epoch: u64,
        key: &FilterKey,
        page: OwnerCollection,
    ) -> Result<()> {
        {
            let mut state = self.lock();
            if state.epoch != epoch {
                return Err(SyncError::StaleOwner(owner.to_string()));
            }
            state.views.put(key.clone(), CacheEntry::new(page.clone()));
        }
        self.persist(owner, key, &page).await;
        Ok(())
    }

    async fn persist(&self, owner: &str, key: &FilterKey, page: &OwnerCollection) {
        let entry = CacheEntry::new(page);
        if let Err(e) = self
            .cache
            .save(FILTERED_NAMESPACE, &key.storage_key(owner), &entry)
            .await
        {
            warn!("Could not persist {} view: {}", key, e);
        }
    }

    /// Remove ids from every loaded subset and persist the ones that changed.
    pub async fn purge(&self, ids: &[String]) {
        let changed = self.edit_views(|_, page| !page.remove_ids(ids).is_empty());
        self.persist_all(changed).await;
    }

    /// Put a newly merged item into every loaded subset it belongs to.
    pub async fn on_merged(&self, item: &MediaItem) {
        let changed = self.edit_views(|key, page| {
            if !key.matches(item) {
                return false;
            }
            match page.get_mut(&item.id) {
                Some(existing) => {
                    *existing = item.clone();
                }
                None => {
                    page.items.push(item.clone());
                    page.cursor += 1;
                }
            }
            page.sort();
            true
        });
        self.persist_all(changed).await;
    }

    /// Keep every loaded subset in step with an item whose fields changed
    /// (e.g. favorite toggled): update, add or drop it as the filter says.
    pub async fn on_updated(&self, item: &MediaItem) {
        let changed = self.edit_views(|key, page| {
            let held = page.contains(&item.id);
            match (held, key.matches(item)) {
                (true, true) => {
                    if let Some(existing) = page.get_mut(&item.id) {
                        *existing = item.clone();
                    }
                    true
                }
                (true, false) => !page.remove_ids(std::slice::from_ref(&item.id)).is_empty(),
                (false, true) => {
                    page.items.push(item.clone());
                    page.cursor += 1;
                    page.sort();
                    true
                }
                (false, false) => false,
            }
        });
        self.persist_all(changed).await;
    }

    fn edit_views(
        &self,
        mut edit: impl FnMut(&FilterKey, &mut OwnerCollection) -> bool,
    ) -> Vec<(OwnerId, FilterKey, OwnerCollection)> {
        let mut state = self.lock();
        let Some(owner) = state.owner.clone() else {
            return Vec::new();
        };
        let mut changed = Vec::new();
        for (key, entry) in state.views.iter_mut() {
            if edit(key, &mut entry.value) {
                changed.push((owner.clone(), key.clone(), entry.value.clone()));
            }
        }
        changed
    }

    async fn persist_all(&self, changed: Vec<(OwnerId, FilterKey, OwnerCollection)>) {
        for (owner, key, page) in changed {
            self.persist(&owner, &key, &page).await;
        }
    }
}
