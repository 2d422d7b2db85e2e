//! The sync engine: one in-memory, ordered collection for the active owner,
//! fed by pagination, probe refreshes, optimistic inserts, "item saved"
//! hints and realtime events.
//!
//! All mutations of the active session go through one async mutex, so a
//! page append and a reconciliation insert can never interleave. Network
//! calls are made with the mutex released; each one remembers the session
//! epoch it was issued under and its result is dropped if the epoch has
//! moved on (owner switched) by the time it completes.

mod insert;
mod mutate;
mod refresh;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, PersistentCache, COLLECTION_NAMESPACE};
use crate::coalesce::Coalescer;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::filtered::{FilterKey, FilteredViewCache};
use crate::model::{MediaItem, OwnerCollection, OwnerId};
use crate::notify::ItemSaved;
use crate::realtime::RealtimeChannel;
use crate::remote::RemoteStore;
use crate::retry::RetryPolicy;
use crate::stats::{DivergenceRule, StatsCheck, StatsReconciler, StatsSnapshot};
use crate::storage::{KeyValueStore, RedbStore};

pub use insert::{ClaimKey, InsertOutcome, RealtimeOutcome};
pub use mutate::DeleteReport;
pub use refresh::{FetchOutcome, RefreshReport};

/// What observers (UI) see. Published after every mutation.
#[derive(Debug, Clone, Default)]
pub struct GallerySnapshot {
    pub owner: Option<OwnerId>,
    pub items: Arc<Vec<MediaItem>>,
    pub has_more: bool,
    /// Only set while a network load runs with nothing cached to show.
    pub loading: bool,
    pub stats: Option<StatsSnapshot>,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

/// Mutable state of the active owner. Replaced wholesale on owner switch.
#[derive(Default)]
struct Session {
    owner: Option<OwnerId>,
    epoch: u64,
    collection: OwnerCollection,
    /// Ids deleted this session. Never merged back in.
    removed: HashSet<String>,
    /// Pushed rows (optimistic or realtime) not yet seen in a remote read.
    /// They take no slot in the cursor and are never judged by a probe.
    unconfirmed: HashSet<String>,
    /// Set when the collection came from (or has been written to) a remote read.
    last_fetched_at: Option<DateTime<Utc>>,
    stats: Option<StatsSnapshot>,
    loading: bool,
}

impl Session {
    fn is_current(&self, epoch: u64) -> bool {
        self.owner.is_some() && self.epoch == epoch
    }

    /// A remote read has seen `id`, so it now occupies a remote slot.
    fn confirm(&mut self, id: &str) {
        if self.unconfirmed.remove(id) {
            self.collection.cursor += 1;
        }
    }
}

struct Inner {
    config: SyncConfig,
    remote: Arc<dyn RemoteStore>,
    cache: Arc<PersistentCache>,
    stats: StatsReconciler,
    views: FilteredViewCache,
    retry: RetryPolicy,
    session: Mutex<Session>,
    epoch: AtomicU64,
    claims: Coalescer<(u64, ClaimKey), InsertOutcome>,
    published: watch::Sender<GallerySnapshot>,
    /// Listener tasks bound to the current owner.
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap-to-clone handle; clones share the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let cache = Arc::new(PersistentCache::new(store));
        let stats = StatsReconciler::new(
            Arc::clone(&remote),
            Arc::clone(&cache),
            DivergenceRule::from(&config.stats),
        );
        let views = FilteredViewCache::new(
            Arc::clone(&remote),
            Arc::clone(&cache),
            config.pagination.page_size,
            config.freshness.filtered_window(),
            config.filtered.max_views,
        );
        let (published, _) = watch::channel(GallerySnapshot::default());
        Self {
            inner: Arc::new(Inner {
                retry: RetryPolicy::from(&config.retry),
                config,
                remote,
                cache,
                stats,
                views,
                session: Mutex::new(Session::default()),
                epoch: AtomicU64::new(0),
                claims: Coalescer::new(),
                published,
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Engine backed by the redb cache file named in `config.storage`.
    pub fn with_redb(config: SyncConfig, remote: Arc<dyn RemoteStore>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SyncError::Config(e.to_string()))?;
        let path = config.storage.resolve_path().map_err(SyncError::Storage)?;
        let store = RedbStore::open(&path).map_err(SyncError::Storage)?;
        info!("Using {} snapshot cache at {}", store.backend_name(), path.display());
        Ok(Self::new(config, remote, Arc::new(store)))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    fn page_size(&self) -> usize {
        self.inner.config.pagination.page_size.max(1)
    }

    fn current_epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Observe published state.
    pub fn subscribe(&self) -> watch::Receiver<GallerySnapshot> {
        self.inner.published.subscribe()
    }

    pub fn snapshot(&self) -> GallerySnapshot {
        self.inner.published.borrow().clone()
    }

    pub async fn active_owner(&self) -> Option<OwnerId> {
        self.inner.session.lock().await.owner.clone()
    }

    /// Number of insert claims currently being fetched.
    pub fn in_flight_claims(&self) -> usize {
        self.inner.claims.in_flight_count()
    }

    /// Owner and epoch of the active session.
    async fn active(&self) -> Result<(OwnerId, u64)> {
        let session = self.inner.session.lock().await;
        let owner = session.owner.clone().ok_or(SyncError::NoActiveOwner)?;
        Ok((owner, session.epoch))
    }

    /// Like [`Self::active`] but also checks the caller's owner.
    async fn active_for(&self, owner: &str) -> Result<u64> {
        let (active, epoch) = self.active().await?;
        if active != owner {
            return Err(SyncError::StaleOwner(owner.to_string()));
        }
        Ok(epoch)
    }

    fn publish(&self, session: &Session) {
        let snapshot = GallerySnapshot {
            owner: session.owner.clone(),
            items: Arc::new(session.collection.items.clone()),
            has_more: session.collection.has_more,
            loading: session.loading,
            stats: session.stats.clone(),
            last_fetched_at: session.last_fetched_at,
        };
        self.inner.published.send_replace(snapshot);
    }

    /// Write the collection to the persistent cache. Called with the session
    /// lock held so writes land in mutation order.
    async fn persist(&self, session: &Session) {
        let Some(ref owner) = session.owner else {
            return;
        };
        let entry = CacheEntry {
            value: &session.collection,
            last_fetched_at: session.last_fetched_at.unwrap_or_default(),
        };
        if let Err(e) = self.inner.cache.save(COLLECTION_NAMESPACE, owner, &entry).await {
            warn!("Could not persist collection for {}: {}", owner, e);
        }
    }

    async fn lock_current(&self, epoch: u64) -> Option<MutexGuard<'_, Session>> {
        let session = self.inner.session.lock().await;
        if session.is_current(epoch) {
            Some(session)
        } else {
            debug!("Discarding result issued under stale epoch {}", epoch);
            None
        }
    }

    // ── Owner lifecycle ─────────────────────────────────────────────

    /// Last persisted collection for `owner`, without any network call.
    pub async fn load_cached(&self, owner: &str) -> Result<Option<CacheEntry<OwnerCollection>>> {
        self.inner
            .cache
            .load(COLLECTION_NAMESPACE, owner)
            .await
            .map_err(SyncError::Storage)
    }

    /// Make `owner` the active owner. In-memory state of the previous owner
    /// is dropped (its cache entries stay), listener tasks are stopped and
    /// any fetch still running for it will be discarded on completion.
    /// Returns true if a cached snapshot was available for first paint.
    pub async fn set_active_owner(&self, owner: impl Into<OwnerId>) -> Result<bool> {
        let owner = owner.into();
        let cached = match self.load_cached(&owner).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Ignoring unreadable cache for {}: {}", owner, e);
                None
            }
        };
        let cached_stats = self.inner.stats.cached(&owner).await;
        let has_cache = cached.is_some();

        let epoch = {
            let mut session = self.inner.session.lock().await;
            let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            self.stop_tasks();

            let mut fresh = Session {
                owner: Some(owner.clone()),
                epoch,
                stats: cached_stats.map(|e| e.value),
                ..Session::default()
            };
            if let Some(entry) = cached {
                fresh.collection = entry.value;
                fresh.collection.sort();
                fresh.last_fetched_at = Some(entry.last_fetched_at);
            }
            *session = fresh;
            self.inner.views.activate(Some(owner.clone()), epoch);
            self.publish(&session);
            epoch
        };

        info!(
            "Active owner is now {} ({} cached items)",
            owner,
            self.snapshot().items.len()
        );
        self.spawn_stats_recompute(epoch);
        Ok(has_cache)
    }

    /// Sign-out: drop the active session entirely.
    pub async fn clear_active_owner(&self) {
        let mut session = self.inner.session.lock().await;
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.stop_tasks();
        *session = Session::default();
        self.inner.views.activate(None, self.current_epoch());
        self.publish(&session);
    }

    /// Switch to `owner` if needed, then load its first page, serving a
    /// fresh cache immediately.
    pub async fn open(&self, owner: &str) -> Result<FetchOutcome> {
        if self.active_owner().await.as_deref() != Some(owner) {
            self.set_active_owner(owner).await?;
        }
        self.fetch_first_page(owner, false).await
    }

    // ── Stats ───────────────────────────────────────────────────────

    /// Read the remote stats row and recompute it if it looks wrong
    /// relative to what is loaded.
    pub async fn refresh_stats(&self) -> Result<Option<StatsCheck>> {
        let (owner, epoch) = self.active().await?;
        let loaded = self.inner.session.lock().await.collection.items.clone();
        let (snapshot, check) = self.inner.stats.reconcile(&owner, &loaded).await?;
        if !self.apply_stats(epoch, snapshot).await {
            return Ok(None);
        }
        Ok(Some(check))
    }

    pub async fn recompute_stats(&self) -> Result<Option<StatsSnapshot>> {
        let (owner, epoch) = self.active().await?;
        let snapshot = self.inner.stats.recompute(&owner).await?;
        if !self.apply_stats(epoch, snapshot.clone()).await {
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    async fn apply_stats(&self, epoch: u64, snapshot: StatsSnapshot) -> bool {
        match self.lock_current(epoch).await {
            Some(mut session) => {
                session.stats = Some(snapshot);
                self.publish(&session);
                true
            }
            None => false,
        }
    }

    fn spawn_stats_recompute(&self, epoch: u64) {
        let engine = self.clone();
        tokio::spawn(async move {
            if engine.current_epoch() != epoch {
                return;
            }
            if let Err(e) = engine.recompute_stats().await {
                warn!("Stats recompute failed: {}", e);
            }
        });
    }

    /// Reconcile stats after a page load unless they were computed recently.
    fn spawn_stats_refresh(&self, epoch: u64) {
        let engine = self.clone();
        tokio::spawn(async move {
            if engine.current_epoch() != epoch {
                return;
            }
            let window = engine.inner.config.freshness.stats_window();
            let fresh = engine.inner.session.lock().await.stats.as_ref().is_some_and(|s| {
                Utc::now()
                    .signed_duration_since(s.computed_at)
                    .to_std()
                    .is_ok_and(|age| age < window)
            });
            if fresh {
                debug!("Stats still fresh, skipping reconcile");
                return;
            }
            if let Err(e) = engine.refresh_stats().await {
                warn!("Stats refresh failed: {}", e);
            }
        });
    }

    // ── Filtered views ──────────────────────────────────────────────

    pub async fn filtered(&self, key: &FilterKey, force: bool) -> Result<OwnerCollection> {
        let page = self.inner.views.get(key, force).await?;
        Ok(self.without_removed(page).await)
    }

    pub async fn load_more_filtered(&self, key: &FilterKey) -> Result<OwnerCollection> {
        let page = self.inner.views.load_more(key).await?;
        Ok(self.without_removed(page).await)
    }

    /// A subset fetched after a local delete may still carry the row.
    async fn without_removed(&self, mut page: OwnerCollection) -> OwnerCollection {
        let stale: Vec<String> = {
            let session = self.inner.session.lock().await;
            page.items
                .iter()
                .filter(|i| session.removed.contains(&i.id))
                .map(|i| i.id.clone())
                .collect()
        };
        if !stale.is_empty() {
            self.inner.views.purge(&stale).await;
            page.remove_ids(&stale);
        }
        page
    }

    pub fn filtered_cached(&self, key: &FilterKey) -> Option<OwnerCollection> {
        self.inner.views.peek(key)
    }

    // ── Listeners ───────────────────────────────────────────────────

    fn stop_tasks(&self) {
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    fn track_task(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
    }

    /// Subscribe to the realtime channel for the active owner. The task
    /// stops on the next owner switch.
    pub async fn spawn_realtime(&self, channel: Arc<dyn RealtimeChannel>) -> Result<()> {
        let (owner, epoch) = self.active().await?;
        let mut events = channel.subscribe(&owner).await.map_err(SyncError::Network)?;
        let engine = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if engine.current_epoch() != epoch {
                    break;
                }
                let handler = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler.handle_realtime(event).await {
                        debug!("Realtime event not applied: {}", e);
                    }
                });
            }
            debug!("Realtime stream for {} ended", owner);
        });
        self.track_task(task);
        Ok(())
    }

    /// Feed "item saved" hints from the notification bus. Hints for other
    /// owners are ignored, so this task outlives owner switches.
    pub fn spawn_notifications(&self, mut hints: mpsc::UnboundedReceiver<ItemSaved>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(hint) = hints.recv().await {
                let handler = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler.handle_item_saved(hint).await {
                        debug!("Item-saved hint not applied: {}", e);
                    }
                });
            }
        })
    }

    /// Periodic incremental refresh for the active owner.
    pub async fn spawn_poller(&self) -> Result<()> {
        let (_, epoch) = self.active().await?;
        let period = Duration::from_secs(self.inner.config.polling.interval_secs.max(1));
        let engine = self.clone();
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if engine.current_epoch() != epoch {
                    break;
                }
                if let Err(e) = engine.refresh_incremental().await {
                    warn!("Periodic refresh failed: {}", e);
                }
            }
        });
        self.track_task(task);
        Ok(())
    }
}
