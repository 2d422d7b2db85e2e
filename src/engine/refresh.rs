//! Pagination and the two-phase incremental refresh.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, info};

use super::insert::{InsertOutcome, Origin};
use super::SyncEngine;
use crate::error::{Result, SyncError};
use crate::model::MediaItem;
use crate::remote::{PageRange, QueryFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Fresh cache shown as-is; an incremental refresh runs in the background.
    ServedFromCache,
    Loaded { added: usize, has_more: bool },
    /// The owner changed while the request was in flight.
    Discarded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub added: usize,
    pub removed: Vec<String>,
    /// Whether anything beyond the probe query was needed.
    pub fetched_full_rows: bool,
    pub discarded: bool,
}

impl SyncEngine {
    /// Load page 0 for `owner`. Without `force`, a cached snapshot younger
    /// than the staleness window is served and refreshed in the background.
    /// With nothing paged in yet the page replaces the collection; otherwise
    /// its rows are merged and later pages are kept.
    pub async fn fetch_first_page(&self, owner: &str, force: bool) -> Result<FetchOutcome> {
        let epoch = self.active_for(owner).await?;
        let page_size = self.page_size();

        {
            let mut session = self.inner.session.lock().await;
            let window = self.inner.config.freshness.collection_window();
            let fresh = session
                .last_fetched_at
                .map(|t| {
                    Utc::now()
                        .signed_duration_since(t)
                        .to_std()
                        .is_ok_and(|age| age < window)
                })
                .unwrap_or(false);
            if !force && fresh && session.collection.cursor > 0 {
                debug!("Serving fresh cached collection for {}", owner);
                self.spawn_incremental(epoch);
                return Ok(FetchOutcome::ServedFromCache);
            }
            if session.collection.is_empty() && !session.loading {
                session.loading = true;
                self.publish(&session);
            }
        }

        let fetched = self
            .inner
            .remote
            .query(owner, &QueryFilter::all(), PageRange::first(page_size))
            .await;

        let Some(mut session) = self.lock_current(epoch).await else {
            return Ok(FetchOutcome::Discarded);
        };
        let page = match fetched {
            Ok(page) => page,
            Err(e) => {
                session.loading = false;
                self.publish(&session);
                return Err(SyncError::Network(e));
            }
        };

        let returned = page.len();
        let mut merged = Vec::new();
        let loaded = if session.collection.cursor == 0 {
            // Keep pushed items the remote has not caught up with yet.
            let pending: Vec<MediaItem> = session
                .collection
                .items
                .iter()
                .filter(|i| session.unconfirmed.contains(&i.id) && !page.iter().any(|p| p.id == i.id))
                .cloned()
                .collect();
            for item in &page {
                session.unconfirmed.remove(&item.id);
            }
            let page: Vec<MediaItem> = page
                .into_iter()
                .filter(|i| !session.removed.contains(&i.id))
                .collect();
            let loaded = page.len();
            session.collection.replace_page(page, page_size);
            session.collection.items.extend(pending);
            session.collection.sort();
            loaded
        } else {
            let mut added = 0;
            for row in page {
                let outcome = self.merge_locked(&mut session, row.clone(), Origin::Read);
                if outcome == InsertOutcome::Inserted {
                    added += 1;
                }
                if outcome.changed() {
                    merged.push(row);
                }
            }
            session.collection.has_more = returned == page_size;
            added
        };
        session.last_fetched_at = Some(Utc::now());
        session.loading = false;
        self.persist(&session).await;
        self.publish(&session);
        let has_more = session.collection.has_more;
        drop(session);

        for item in &merged {
            self.inner.views.on_merged(item).await;
        }
        info!("Loaded first page for {} ({} items, has_more={})", owner, loaded, has_more);
        self.spawn_stats_refresh(epoch);
        Ok(FetchOutcome::Loaded { added: loaded, has_more })
    }

    /// Append the next page at the current cursor.
    pub async fn load_more(&self) -> Result<FetchOutcome> {
        let (owner, epoch) = self.active().await?;
        let page_size = self.page_size();
        let cursor = {
            let session = self.inner.session.lock().await;
            if !session.collection.has_more {
                return Ok(FetchOutcome::Loaded { added: 0, has_more: false });
            }
            session.collection.cursor
        };

        let page = self
            .inner
            .remote
            .query(&owner, &QueryFilter::all(), PageRange::new(cursor, page_size))
            .await
            .map_err(SyncError::Network)?;

        let Some(mut session) = self.lock_current(epoch).await else {
            return Ok(FetchOutcome::Discarded);
        };
        if session.collection.cursor != cursor {
            // Another load or a reset moved the cursor meanwhile.
            debug!("Dropping page at offset {} for {}: cursor moved", cursor, owner);
            return Ok(FetchOutcome::Loaded {
                added: 0,
                has_more: session.collection.has_more,
            });
        }
        let returned = page.len();
        let page: Vec<MediaItem> = page
            .into_iter()
            .filter(|i| !session.removed.contains(&i.id))
            .collect();
        let skipped = returned - page.len();
        // The page offset already counts pushed rows it contains.
        for item in &page {
            session.unconfirmed.remove(&item.id);
        }
        let added = session.collection.append_page(page, page_size);
        session.collection.cursor += skipped;
        if returned == page_size {
            session.collection.has_more = true;
        }
        self.persist(&session).await;
        self.publish(&session);
        let has_more = session.collection.has_more;
        debug!("Appended {} items for {} (cursor {})", added, owner, session.collection.cursor);
        Ok(FetchOutcome::Loaded { added, has_more })
    }

    /// Probe the first page for `{id, created_at}` only, purge rows that
    /// vanished from it, then fetch full records for ids not held locally.
    /// An unchanged remote costs exactly one probe query. Only rows held
    /// before the probe was issued can be judged deleted.
    pub async fn refresh_incremental(&self) -> Result<RefreshReport> {
        let (owner, epoch) = self.active().await?;
        let page_size = self.page_size();
        let mut report = RefreshReport::default();

        let held_before: HashSet<String> = {
            let Some(session) = self.lock_current(epoch).await else {
                report.discarded = true;
                return Ok(report);
            };
            session.collection.items.iter().map(|i| i.id.clone()).collect()
        };

        let probe = self
            .inner
            .remote
            .query_probe(&owner, PageRange::first(page_size))
            .await
            .map_err(SyncError::Network)?;

        let new_ids: Vec<String> = {
            let Some(mut session) = self.lock_current(epoch).await else {
                report.discarded = true;
                return Ok(report);
            };
            let probe_ids: HashSet<&str> = probe.iter().map(|r| r.id.as_str()).collect();

            // Only local rows inside the probed window can be judged. With a
            // full probe page the window ends at its oldest timestamp; rows
            // sharing that timestamp may sit just past the page boundary.
            let boundary = (probe.len() >= page_size)
                .then(|| probe.iter().map(|r| r.created_at).min())
                .flatten();
            let vanished: Vec<String> = session
                .collection
                .items
                .iter()
                .filter(|i| held_before.contains(&i.id))
                .filter(|i| boundary.map_or(true, |b| i.created_at > b))
                .filter(|i| !probe_ids.contains(i.id.as_str()))
                .filter(|i| !session.unconfirmed.contains(&i.id))
                .map(|i| i.id.clone())
                .collect();
            let vanished: Vec<String> = vanished
                .into_iter()
                .filter(|id| !self.is_claimed(epoch, id))
                .collect();

            let confirmed: Vec<String> = session
                .unconfirmed
                .iter()
                .filter(|id| probe_ids.contains(id.as_str()))
                .cloned()
                .collect();
            for id in confirmed {
                session.confirm(&id);
            }

            let new_ids = probe
                .iter()
                .filter(|r| !session.collection.contains(&r.id) && !session.removed.contains(&r.id))
                .map(|r| r.id.clone())
                .collect();

            if !vanished.is_empty() {
                session.removed.extend(vanished.iter().cloned());
                session.collection.remove_ids(&vanished);
                info!("Probe found {} deleted items for {}", vanished.len(), owner);
            }
            session.last_fetched_at = Some(Utc::now());
            self.persist(&session).await;
            self.publish(&session);
            report.removed = vanished;
            new_ids
        };

        if !report.removed.is_empty() {
            self.inner.views.purge(&report.removed).await;
            self.spawn_stats_recompute(epoch);
        }

        if new_ids.is_empty() {
            return Ok(report);
        }

        report.fetched_full_rows = true;
        let rows = self
            .inner
            .remote
            .query(&owner, &QueryFilter::ids(new_ids.iter().cloned()), PageRange::first(new_ids.len()))
            .await
            .map_err(SyncError::Network)?;

        let Some(mut session) = self.lock_current(epoch).await else {
            report.discarded = true;
            return Ok(report);
        };
        let mut merged = Vec::new();
        for row in rows {
            if self.merge_locked(&mut session, row.clone(), Origin::Read).changed() {
                merged.push(row);
            }
        }
        if !merged.is_empty() {
            self.persist(&session).await;
            self.publish(&session);
        }
        drop(session);

        for item in &merged {
            self.inner.views.on_merged(item).await;
        }
        report.added = merged.len();
        debug!("Incremental refresh for {}: +{} -{}", owner, report.added, report.removed.len());
        Ok(report)
    }

    fn spawn_incremental(&self, epoch: u64) {
        let engine = self.clone();
        tokio::spawn(async move {
            if engine.current_epoch() != epoch {
                return;
            }
            if let Err(e) = engine.refresh_incremental().await {
                tracing::warn!("Background refresh failed: {}", e);
            }
        });
    }
}
