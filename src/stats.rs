//! Aggregate statistics and their reconciliation against the remote copy.
//!
//! The remote keeps one stats row per owner. Locally we can only count the
//! part of the collection that has been paged in, so the comparison is
//! deliberately lopsided: a local view that is *smaller* than the remote
//! total is expected, a local view much *larger* than it means the remote
//! row is wrong and must be recomputed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, PersistentCache, STATS_NAMESPACE};
use crate::coalesce::Coalescer;
use crate::config::StatsConfig;
use crate::error::{Result, SyncError};
use crate::model::{ItemStatus, MediaItem, MediaKind};
use crate::remote::RemoteStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub favorites: u64,
    pub images: u64,
    pub videos: u64,
    /// Per-model image counts; rows without a model label are only in `images`.
    pub image_models: BTreeMap<String, u64>,
    pub video_models: BTreeMap<String, u64>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub computed_at: DateTime<Utc>,
}

impl Default for StatsSnapshot {
    fn default() -> Self {
        Self {
            favorites: 0,
            images: 0,
            videos: 0,
            image_models: BTreeMap::new(),
            video_models: BTreeMap::new(),
            computed_at: Utc::now(),
        }
    }
}

impl StatsSnapshot {
    /// Count `items`, skipping failed generations entirely.
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a MediaItem>) -> Self {
        let mut snapshot = StatsSnapshot::default();
        for item in items {
            if item.status == ItemStatus::Failed {
                continue;
            }
            if item.favorite {
                snapshot.favorites += 1;
            }
            let models = match item.kind {
                MediaKind::Image => {
                    snapshot.images += 1;
                    &mut snapshot.image_models
                }
                MediaKind::Video => {
                    snapshot.videos += 1;
                    &mut snapshot.video_models
                }
            };
            if let Some(model) = item.model_label() {
                *models.entry(model.to_string()).or_insert(0) += 1;
            }
        }
        snapshot
    }

    pub fn total(&self) -> u64 {
        self.images + self.videos
    }

    pub fn count(&self, kind: MediaKind) -> u64 {
        match kind {
            MediaKind::Image => self.images,
            MediaKind::Video => self.videos,
        }
    }

    pub fn is_all_zero(&self) -> bool {
        self.images == 0 && self.videos == 0
    }
}

/// Outcome of comparing the remote row against the loaded collection.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsCheck {
    Consistent,
    /// No stats row for the owner.
    Missing,
    /// Row exists but reads zero while the owner visibly has media.
    Uninitialized,
    Diverged { kind: MediaKind, local: u64, remote: u64 },
}

impl StatsCheck {
    pub fn needs_recompute(&self) -> bool {
        !matches!(self, StatsCheck::Consistent)
    }
}

/// `|local - remote| > min_diff && local > ratio * remote`, per kind.
///
/// Both thresholds were tuned by observation rather than derived from the
/// expected partial-page undercount; they are config so they can be retuned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DivergenceRule {
    pub min_diff: u64,
    pub ratio: f64,
}

impl Default for DivergenceRule {
    fn default() -> Self {
        Self {
            min_diff: 10,
            ratio: 2.0,
        }
    }
}

impl From<&StatsConfig> for DivergenceRule {
    fn from(config: &StatsConfig) -> Self {
        Self {
            min_diff: config.divergence_min_diff,
            ratio: config.divergence_ratio,
        }
    }
}

impl DivergenceRule {
    pub fn diverges(&self, local: u64, remote: u64) -> bool {
        local.abs_diff(remote) > self.min_diff && (local as f64) > self.ratio * (remote as f64)
    }

    pub fn check(&self, local: &StatsSnapshot, remote: Option<&StatsSnapshot>) -> StatsCheck {
        let Some(remote) = remote else {
            return StatsCheck::Missing;
        };
        if remote.is_all_zero() && local.total() > 0 {
            return StatsCheck::Uninitialized;
        }
        for kind in [MediaKind::Image, MediaKind::Video] {
            let (l, r) = (local.count(kind), remote.count(kind));
            if self.diverges(l, r) {
                return StatsCheck::Diverged { kind, local: l, remote: r };
            }
        }
        StatsCheck::Consistent
    }
}

pub struct StatsReconciler {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<PersistentCache>,
    rule: DivergenceRule,
    recomputes: Coalescer<String, std::result::Result<StatsSnapshot, String>>,
}

impl StatsReconciler {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<PersistentCache>,
        rule: DivergenceRule,
    ) -> Self {
        Self {
            remote,
            cache,
            rule,
            recomputes: Coalescer::new(),
        }
    }

    /// Last persisted snapshot for cold start.
    pub async fn cached(&self, owner: &str) -> Option<CacheEntry<StatsSnapshot>> {
        match self.cache.load(STATS_NAMESPACE, owner).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Could not read cached stats for {}: {}", owner, e);
                None
            }
        }
    }

    pub async fn fetch_stats(&self, owner: &str) -> Result<Option<StatsSnapshot>> {
        self.remote.fetch_stats(owner).await.map_err(SyncError::Network)
    }

    /// Ask the remote side for an authoritative recount. Concurrent calls
    /// for the same owner share one request.
    pub async fn recompute(&self, owner: &str) -> Result<StatsSnapshot> {
        let remote = Arc::clone(&self.remote);
        let cache = Arc::clone(&self.cache);
        let owner_key = owner.to_string();
        let joined = self
            .recomputes
            .run(owner.to_string(), move || async move {
                let snapshot = remote
                    .recompute_stats(&owner_key)
                    .await
                    .map_err(|e| format!("{e:#}"))?;
                if let Err(e) = cache
                    .save(STATS_NAMESPACE, &owner_key, &CacheEntry::new(snapshot.clone()))
                    .await
                {
                    warn!("Could not persist stats for {}: {}", owner_key, e);
                }
                Ok(snapshot)
            })
            .await;
        if !joined.leader {
            debug!("Joined in-flight stats recompute for {}", owner);
        }
        joined
            .value
            .map_err(|msg| SyncError::Network(anyhow::anyhow!(msg)))
    }

    /// Read the remote row, recompute it if it is missing, zeroed or
    /// inconsistent with `loaded`, and persist the result.
    pub async fn reconcile(
        &self,
        owner: &str,
        loaded: &[MediaItem],
    ) -> Result<(StatsSnapshot, StatsCheck)> {
        let remote = self.fetch_stats(owner).await?;
        let local = StatsSnapshot::from_items(loaded);
        let check = self.rule.check(&local, remote.as_ref());

        match (&check, remote) {
            (StatsCheck::Consistent, Some(snapshot)) => {
                if let Err(e) = self
                    .cache
                    .save(STATS_NAMESPACE, owner, &CacheEntry::new(snapshot.clone()))
                    .await
                {
                    warn!("Could not persist stats for {}: {}", owner, e);
                }
                Ok((snapshot, check))
            }
            _ => {
                info!("Stats for {} need recompute: {:?}", owner, check);
                let snapshot = self.recompute(owner).await?;
                Ok((snapshot, check))
            }
        }
    }
}
