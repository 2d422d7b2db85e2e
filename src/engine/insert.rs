//! Convergent insert paths.
//!
//! An item can be announced by an optimistic local insert, by an
//! "item saved" hint carrying its id or url, by a realtime insert, or not
//! at all (hint with neither). Every path funnels into the same claim set:
//! the first caller for a key owns the fetch, later callers await its
//! result, and the merge itself is an idempotent upsert by id.

use tracing::{debug, info, warn};

use super::{Session, SyncEngine};
use crate::error::{Result, SyncError};
use crate::model::MediaItem;
use crate::notify::{ItemSaved, SavedTarget};
use crate::realtime::{decode_id, decode_row, RealtimeEvent};
use crate::remote::{PageRange, QueryFilter};
use crate::retry::Attempt;

/// Key an insert claims while its fetch is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClaimKey {
    Id(String),
    Url(String),
    Latest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Replaced a held placeholder that had no renderable url.
    Replaced,
    AlreadyPresent,
    /// The id was deleted earlier this session and stays deleted.
    Removed,
    /// Newest-row lookup found nothing.
    NotFound,
    /// Retries ran out; the newest-row fallback ran once instead.
    Exhausted { fallback_inserted: bool },
    /// Belongs to an owner that is not (or no longer) active.
    Discarded,
}

impl InsertOutcome {
    pub fn changed(&self) -> bool {
        matches!(
            self,
            InsertOutcome::Inserted
                | InsertOutcome::Replaced
                | InsertOutcome::Exhausted { fallback_inserted: true }
        )
    }
}

/// Where a merged row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Origin {
    /// Returned by a remote read.
    Read,
    /// Created locally or pushed by realtime; reads may not see it yet.
    Pushed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeOutcome {
    Insert(InsertOutcome),
    Removed(usize),
    /// Payload could not be decoded or belonged to another owner.
    Skipped,
}

/// Result of one lookup attempt inside the retry loop.
enum Lookup {
    Found(MediaItem),
    Settled(InsertOutcome),
}

impl SyncEngine {
    /// Upsert `item` into the session. Caller holds the session lock and is
    /// responsible for persisting and publishing when this reports a change.
    /// Only rows from a remote read advance the cursor.
    pub(super) fn merge_locked(
        &self,
        session: &mut Session,
        item: MediaItem,
        origin: Origin,
    ) -> InsertOutcome {
        if session.owner.as_deref() != Some(item.owner_id.as_str()) {
            return InsertOutcome::Discarded;
        }
        if session.removed.contains(&item.id) {
            return InsertOutcome::Removed;
        }
        if origin == Origin::Read {
            session.confirm(&item.id);
        }
        if let Some(existing) = session.collection.get_mut(&item.id) {
            if !existing.is_displayable() && item.is_displayable() {
                *existing = item;
                session.collection.sort();
                return InsertOutcome::Replaced;
            }
            return InsertOutcome::AlreadyPresent;
        }
        match origin {
            Origin::Read => session.collection.cursor += 1,
            Origin::Pushed => {
                session.unconfirmed.insert(item.id.clone());
            }
        }
        session.collection.items.push(item);
        session.collection.sort();
        InsertOutcome::Inserted
    }

    /// Merge under the lock if `epoch` is still current, then persist,
    /// publish and update filtered views.
    async fn merge(&self, epoch: u64, item: MediaItem, origin: Origin) -> InsertOutcome {
        let Some(mut session) = self.lock_current(epoch).await else {
            return InsertOutcome::Discarded;
        };
        let outcome = self.merge_locked(&mut session, item.clone(), origin);
        if outcome.changed() {
            self.persist(&session).await;
            self.publish(&session);
            drop(session);
            self.inner.views.on_merged(&item).await;
            debug!("Merged {} ({:?})", item.id, outcome);
        }
        outcome
    }

    pub(super) fn is_claimed(&self, epoch: u64, id: &str) -> bool {
        self.inner
            .claims
            .is_in_flight(&(epoch, ClaimKey::Id(id.to_string())))
    }

    /// Pre-network check shared by the id and url paths.
    async fn precheck(&self, epoch: u64, find: impl Fn(&Session) -> Option<&MediaItem>) -> Option<InsertOutcome> {
        let session = self.inner.session.lock().await;
        if !session.is_current(epoch) {
            return Some(InsertOutcome::Discarded);
        }
        match find(&session) {
            Some(held) if held.is_displayable() => Some(InsertOutcome::AlreadyPresent),
            _ => None,
        }
    }

    /// Locally created item, known in full. No network.
    pub async fn add_item_optimistic(&self, item: MediaItem) -> Result<InsertOutcome> {
        let mut session = self.inner.session.lock().await;
        if session.owner.as_deref() != Some(item.owner_id.as_str()) {
            return Ok(InsertOutcome::Discarded);
        }
        let outcome = self.merge_locked(&mut session, item.clone(), Origin::Pushed);
        if outcome.changed() {
            self.persist(&session).await;
            self.publish(&session);
            drop(session);
            self.inner.views.on_merged(&item).await;
        }
        Ok(outcome)
    }

    /// Fetch a row by id, retrying through read-after-write lag.
    pub async fn add_item_by_id(&self, id: &str) -> Result<InsertOutcome> {
        let (owner, epoch) = self.active().await?;
        let id = id.trim().to_string();
        if id.is_empty() {
            return Err(SyncError::Decode("empty item id".into()));
        }
        {
            let session = self.inner.session.lock().await;
            if session.removed.contains(&id) {
                return Ok(InsertOutcome::Removed);
            }
        }
        if let Some(outcome) = self.precheck(epoch, |s| s.collection.get(&id)).await {
            debug!("Skipping fetch for {}: {:?}", id, outcome);
            return Ok(outcome);
        }

        let key = (epoch, ClaimKey::Id(id.clone()));
        let engine = self.clone();
        let joined = self
            .inner
            .claims
            .run(key, move || async move {
                engine.claimed_fetch(owner, epoch, ClaimKey::Id(id)).await
            })
            .await;
        if !joined.leader {
            debug!("Joined in-flight claim: {:?}", joined.value);
        }
        Ok(joined.value)
    }

    /// Fetch a row by its primary or thumbnail url.
    pub async fn add_item_by_url(&self, url: &str) -> Result<InsertOutcome> {
        let (owner, epoch) = self.active().await?;
        let url = url.trim().to_string();
        if url.is_empty() {
            return Err(SyncError::Decode("empty item url".into()));
        }
        if let Some(outcome) = self.precheck(epoch, |s| s.collection.find_by_url(&url)).await {
            return Ok(outcome);
        }

        let key = (epoch, ClaimKey::Url(url.clone()));
        let engine = self.clone();
        let joined = self
            .inner
            .claims
            .run(key, move || async move {
                engine.claimed_fetch(owner, epoch, ClaimKey::Url(url)).await
            })
            .await;
        Ok(joined.value)
    }

    /// Last resort when a hint carries neither id nor url: merge the newest row.
    pub async fn add_latest_item(&self) -> Result<InsertOutcome> {
        let (owner, epoch) = self.active().await?;
        Ok(self.claimed_latest(owner, epoch).await)
    }

    async fn claimed_latest(&self, owner: String, epoch: u64) -> InsertOutcome {
        let engine = self.clone();
        self.inner
            .claims
            .run((epoch, ClaimKey::Latest), move || async move {
                engine.fetch_latest(owner, epoch).await
            })
            .await
            .value
    }

    async fn fetch_latest(&self, owner: String, epoch: u64) -> InsertOutcome {
        match self
            .inner
            .remote
            .query(&owner, &QueryFilter::all(), PageRange::first(1))
            .await
        {
            Ok(rows) => match rows.into_iter().next() {
                Some(row) => self.merge(epoch, row, Origin::Read).await,
                None => InsertOutcome::NotFound,
            },
            Err(e) => {
                warn!("Newest-row lookup for {} failed: {}", owner, e);
                InsertOutcome::NotFound
            }
        }
    }

    /// Body of an id/url claim: bounded retries, then the newest-row
    /// fallback exactly once.
    async fn claimed_fetch(&self, owner: String, epoch: u64, key: ClaimKey) -> InsertOutcome {
        let filter = match &key {
            ClaimKey::Id(id) => QueryFilter::ids([id.clone()]),
            ClaimKey::Url(url) => QueryFilter::url(url.clone()),
            ClaimKey::Latest => return self.fetch_latest(owner, epoch).await,
        };

        let found = self
            .inner
            .retry
            .run(|attempt| {
                let filter = filter.clone();
                let owner = owner.clone();
                let key = key.clone();
                async move {
                    if self.current_epoch() != epoch {
                        return Attempt::Done(Lookup::Settled(InsertOutcome::Discarded));
                    }
                    // Another path may have delivered it while we slept.
                    if attempt > 1 {
                        let held = match &key {
                            ClaimKey::Id(id) => self.precheck(epoch, |s| s.collection.get(id)).await,
                            ClaimKey::Url(url) => {
                                self.precheck(epoch, |s| s.collection.find_by_url(url)).await
                            }
                            ClaimKey::Latest => None,
                        };
                        if let Some(outcome) = held {
                            return Attempt::Done(Lookup::Settled(outcome));
                        }
                    }
                    match self.inner.remote.query(&owner, &filter, PageRange::first(1)).await {
                        Ok(rows) => match rows.into_iter().next() {
                            Some(row) => Attempt::Done(Lookup::Found(row)),
                            None => {
                                debug!("{:?} not visible yet (attempt {})", key, attempt);
                                Attempt::Retry
                            }
                        },
                        Err(e) => {
                            warn!("Fetch for {:?} failed (attempt {}): {}", key, attempt, e);
                            Attempt::Retry
                        }
                    }
                }
            })
            .await;

        match found {
            Some(Lookup::Found(row)) => self.merge(epoch, row, Origin::Read).await,
            Some(Lookup::Settled(outcome)) => outcome,
            None => {
                warn!(
                    "{:?} still missing after {} attempts; falling back to newest row",
                    key, self.inner.retry.max_attempts
                );
                let fallback = self.claimed_latest(owner, epoch).await;
                InsertOutcome::Exhausted {
                    fallback_inserted: fallback.changed(),
                }
            }
        }
    }

    /// Route a notification-bus hint to the matching insert path.
    pub async fn handle_item_saved(&self, hint: ItemSaved) -> Result<InsertOutcome> {
        let (owner, _) = self.active().await?;
        if hint.owner != owner {
            debug!("Ignoring item-saved hint for inactive owner {}", hint.owner);
            return Ok(InsertOutcome::Discarded);
        }
        match hint.target() {
            SavedTarget::Id(id) => self.add_item_by_id(&id).await,
            SavedTarget::Url(url) => self.add_item_by_url(&url).await,
            SavedTarget::Latest => self.add_latest_item().await,
        }
    }

    /// Apply one realtime event. Undecodable payloads are logged and skipped.
    pub async fn handle_realtime(&self, event: RealtimeEvent) -> Result<RealtimeOutcome> {
        let (owner, epoch) = self.active().await?;
        match event {
            RealtimeEvent::Insert(raw) => match decode_row(&raw) {
                Ok(item) if item.owner_id != owner => {
                    debug!("Realtime insert for other owner {}", item.owner_id);
                    Ok(RealtimeOutcome::Skipped)
                }
                Ok(item) if item.is_displayable() => {
                    Ok(RealtimeOutcome::Insert(self.merge(epoch, item, Origin::Pushed).await))
                }
                Ok(item) => Ok(RealtimeOutcome::Insert(self.add_item_by_id(&item.id).await?)),
                Err(e) => {
                    // The row is unusable but its id may still be readable.
                    match raw.get("id").map(decode_id) {
                        Some(Ok(id)) => {
                            debug!("Realtime row undecodable ({}); fetching {} by id", e, id);
                            Ok(RealtimeOutcome::Insert(self.add_item_by_id(&id).await?))
                        }
                        _ => {
                            warn!("Skipping realtime insert: {}", e);
                            Ok(RealtimeOutcome::Skipped)
                        }
                    }
                }
            },
            RealtimeEvent::Delete(raw) => match decode_id(&raw) {
                Ok(id) => {
                    info!("Realtime delete of {}", id);
                    Ok(RealtimeOutcome::Removed(self.remove_items(&[id]).await?))
                }
                Err(e) => {
                    warn!("Skipping realtime delete: {}", e);
                    Ok(RealtimeOutcome::Skipped)
                }
            },
        }
    }
}
