//! In-process remote store.
//!
//! Behaves like the hosted table for a single process: rows are kept per
//! owner and served newest first. Hooks let callers reproduce the awkward
//! parts of a real backend: read-after-write lag on individual rows,
//! uniform latency, and failing deletes/updates. Every call is counted so
//! callers can check how much was actually queried.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{PageRange, QueryFilter, RemoteStore};
use crate::model::{sort_newest_first, MediaItem, ProbeRow};
use crate::stats::StatsSnapshot;

/// Number of calls per remote operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub query: usize,
    pub probe: usize,
    pub delete: usize,
    pub update: usize,
    pub fetch_stats: usize,
    pub recompute: usize,
}

#[derive(Default)]
struct State {
    rows: Vec<MediaItem>,
    stats: HashMap<String, StatsSnapshot>,
    /// id → remaining identity lookups (by id or url) that must miss it.
    lagging: HashMap<String, u32>,
    failing_deletes: HashSet<String>,
    /// Delete reports failure even though the row is gone.
    lost_delete_acks: HashSet<String>,
    fail_updates: bool,
    latency: Duration,
    calls: CallCounts,
    filters: Vec<QueryFilter>,
}

#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn insert_rows(&self, rows: impl IntoIterator<Item = MediaItem>) {
        self.with_state(|s| {
            for row in rows {
                s.rows.retain(|r| r.id != row.id);
                s.rows.push(row);
            }
            sort_newest_first(&mut s.rows);
        });
    }

    /// Remove rows without going through [`RemoteStore::delete`], as if
    /// another client deleted them.
    pub fn remove_rows(&self, ids: &[&str]) {
        self.with_state(|s| s.rows.retain(|r| !ids.contains(&r.id.as_str())));
    }

    pub fn row(&self, id: &str) -> Option<MediaItem> {
        self.with_state(|s| s.rows.iter().find(|r| r.id == id).cloned())
    }

    pub fn row_count(&self, owner: &str) -> usize {
        self.with_state(|s| s.rows.iter().filter(|r| r.owner_id == owner).count())
    }

    pub fn set_stats_row(&self, owner: &str, snapshot: StatsSnapshot) {
        self.with_state(|s| {
            s.stats.insert(owner.to_string(), snapshot);
        });
    }

    /// The next `misses` lookups by id or url will not see `id`.
    pub fn lag_row(&self, id: &str, misses: u32) {
        self.with_state(|s| {
            s.lagging.insert(id.to_string(), misses);
        });
    }

    pub fn fail_delete(&self, id: &str) {
        self.with_state(|s| {
            s.failing_deletes.insert(id.to_string());
        });
    }

    /// Delete removes the row but still reports an error.
    pub fn lose_delete_ack(&self, id: &str) {
        self.with_state(|s| {
            s.lost_delete_acks.insert(id.to_string());
        });
    }

    pub fn fail_updates(&self, fail: bool) {
        self.with_state(|s| s.fail_updates = fail);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.with_state(|s| s.latency = latency);
    }

    pub fn calls(&self) -> CallCounts {
        self.with_state(|s| s.calls)
    }

    /// Filters passed to [`RemoteStore::query`], in call order.
    pub fn query_log(&self) -> Vec<QueryFilter> {
        self.with_state(|s| s.filters.clone())
    }

    pub fn reset_calls(&self) {
        self.with_state(|s| {
            s.calls = CallCounts::default();
            s.filters.clear();
        });
    }

    async fn delay(&self) {
        let latency = self.with_state(|s| s.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn query(
        &self,
        owner: &str,
        filter: &QueryFilter,
        range: PageRange,
    ) -> Result<Vec<MediaItem>> {
        self.delay().await;
        Ok(self.with_state(|s| {
            s.calls.query += 1;
            s.filters.push(filter.clone());
            let by_identity = filter.is_by_identity();
            let mut visible = Vec::new();
            for row in s.rows.iter().filter(|r| r.owner_id == owner && filter.matches(r)) {
                match s.lagging.get_mut(&row.id) {
                    Some(misses) if *misses > 0 => {
                        if by_identity {
                            *misses -= 1;
                        }
                    }
                    _ => visible.push(row.clone()),
                }
            }
            visible
                .into_iter()
                .skip(range.offset)
                .take(range.limit)
                .collect()
        }))
    }

    async fn query_probe(&self, owner: &str, range: PageRange) -> Result<Vec<ProbeRow>> {
        self.delay().await;
        Ok(self.with_state(|s| {
            s.calls.probe += 1;
            s.rows
                .iter()
                .filter(|r| r.owner_id == owner)
                .filter(|r| s.lagging.get(&r.id).map_or(true, |m| *m == 0))
                .skip(range.offset)
                .take(range.limit)
                .map(ProbeRow::from)
                .collect()
        }))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.delay().await;
        self.with_state(|s| {
            s.calls.delete += 1;
            if s.failing_deletes.contains(id) {
                return Err(anyhow!("delete of {id} rejected"));
            }
            s.rows.retain(|r| r.id != id);
            if s.lost_delete_acks.remove(id) {
                return Err(anyhow!("connection reset while deleting {id}"));
            }
            Ok(())
        })
    }

    async fn update_favorite(&self, id: &str, favorite: bool) -> Result<()> {
        self.delay().await;
        self.with_state(|s| {
            s.calls.update += 1;
            if s.fail_updates {
                return Err(anyhow!("update of {id} rejected"));
            }
            let row = s
                .rows
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| anyhow!("no row {id}"))?;
            row.favorite = favorite;
            Ok(())
        })
    }

    async fn fetch_stats(&self, owner: &str) -> Result<Option<StatsSnapshot>> {
        self.delay().await;
        Ok(self.with_state(|s| {
            s.calls.fetch_stats += 1;
            s.stats.get(owner).cloned()
        }))
    }

    async fn recompute_stats(&self, owner: &str) -> Result<StatsSnapshot> {
        self.delay().await;
        Ok(self.with_state(|s| {
            s.calls.recompute += 1;
            let snapshot =
                StatsSnapshot::from_items(s.rows.iter().filter(|r| r.owner_id == owner));
            s.stats.insert(owner.to_string(), snapshot.clone());
            snapshot
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::item;

    #[tokio::test]
    async fn test_query_orders_newest_first_and_pages() {
        let remote = MemoryRemote::new();
        remote.insert_rows((0..10).map(|i| item(&format!("i{i}"), "alice", i)));
        remote.insert_rows([item("other", "bob", 100)]);

        let page = remote
            .query("alice", &QueryFilter::all(), PageRange::new(2, 3))
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i7", "i6", "i5"]);

        let probe = remote.query_probe("alice", PageRange::first(50)).await.unwrap();
        assert_eq!(probe.len(), 10);
        assert_eq!(remote.calls().probe, 1);
    }

    #[tokio::test]
    async fn test_lagging_row_misses_identity_lookups() {
        let remote = MemoryRemote::new();
        remote.insert_rows([item("x", "alice", 0)]);
        remote.lag_row("x", 2);

        let filter = QueryFilter::ids(["x"]);
        for _ in 0..2 {
            assert!(remote.query("alice", &filter, PageRange::first(1)).await.unwrap().is_empty());
        }
        assert_eq!(remote.query("alice", &filter, PageRange::first(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lost_delete_ack_still_removes() {
        let remote = MemoryRemote::new();
        remote.insert_rows([item("x", "alice", 0)]);
        remote.lose_delete_ack("x");
        assert!(remote.delete("x").await.is_err());
        assert!(remote.row("x").is_none());
    }
}
