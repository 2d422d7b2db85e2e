//! Local removals, remote deletes and favorite toggles.

use tracing::{debug, info, warn};

use super::SyncEngine;
use crate::error::{Result, SyncError};
use crate::remote::{PageRange, QueryFilter};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    /// Ids whose delete failed and that still exist remotely.
    pub failed: Vec<String>,
}

impl SyncEngine {
    /// Drop ids from the active collection and every loaded filtered view.
    /// Removed ids are never merged back in for the rest of the session.
    /// Returns how many were actually held.
    pub async fn remove_items(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let (_, epoch) = self.active().await?;
        let removed = {
            let Some(mut session) = self.lock_current(epoch).await else {
                return Ok(0);
            };
            session.removed.extend(ids.iter().cloned());
            // Pushed rows never took a cursor slot; give back what remove_ids takes.
            let pending = ids.iter().filter(|id| session.unconfirmed.remove(*id)).count();
            let removed = session.collection.remove_ids(ids).len();
            session.collection.cursor += pending.min(removed);
            if removed > 0 {
                self.persist(&session).await;
                self.publish(&session);
            }
            removed
        };

        self.inner.views.purge(ids).await;
        if removed > 0 {
            debug!("Removed {} items locally", removed);
            self.spawn_stats_recompute(epoch);
        }
        Ok(removed)
    }

    /// Delete rows remotely, then locally. A delete that errors is checked
    /// with a follow-up lookup: a row that is gone counts as deleted.
    pub async fn delete_items(&self, ids: &[String]) -> Result<DeleteReport> {
        let (owner, _) = self.active().await?;
        let mut report = DeleteReport::default();

        for id in ids {
            match self.inner.remote.delete(id).await {
                Ok(()) => report.deleted.push(id.clone()),
                Err(e) => {
                    let still_there = self
                        .inner
                        .remote
                        .query(&owner, &QueryFilter::ids([id.clone()]), PageRange::first(1))
                        .await
                        .map(|rows| !rows.is_empty());
                    match still_there {
                        Ok(false) => {
                            info!("Delete of {} reported '{}' but the row is gone", id, e);
                            report.deleted.push(id.clone());
                        }
                        Ok(true) => {
                            warn!("Delete of {} failed: {}", id, e);
                            report.failed.push(id.clone());
                        }
                        Err(check) => {
                            warn!("Delete of {} failed ({}); existence check failed: {}", id, e, check);
                            report.failed.push(id.clone());
                        }
                    }
                }
            }
        }

        self.remove_items(&report.deleted).await?;
        Ok(report)
    }

    /// Optimistically toggle `favorite`, reverting if the remote update fails.
    /// Returns false if the id is not held.
    pub async fn set_favorite(&self, id: &str, favorite: bool) -> Result<bool> {
        let (owner, epoch) = self.active().await?;
        let (previous, updated) = {
            let Some(mut session) = self.lock_current(epoch).await else {
                return Err(SyncError::StaleOwner(owner));
            };
            let Some(item) = session.collection.get_mut(id) else {
                return Ok(false);
            };
            let previous = item.favorite;
            item.favorite = favorite;
            let updated = item.clone();
            self.persist(&session).await;
            self.publish(&session);
            (previous, updated)
        };
        self.inner.views.on_updated(&updated).await;

        if let Err(e) = self.inner.remote.update_favorite(id, favorite).await {
            warn!("Favorite update for {} failed, reverting: {}", id, e);
            let reverted = {
                let Some(mut session) = self.lock_current(epoch).await else {
                    return Err(SyncError::Network(e));
                };
                let reverted = session.collection.get_mut(id).map(|item| {
                    item.favorite = previous;
                    item.clone()
                });
                if reverted.is_some() {
                    self.persist(&session).await;
                    self.publish(&session);
                }
                reverted
            };
            if let Some(item) = reverted {
                self.inner.views.on_updated(&item).await;
            }
            return Err(SyncError::Network(e));
        }

        self.spawn_stats_recompute(epoch);
        Ok(true)
    }
}
