use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use super::*;
use crate::model::test_support::{item, placeholder};
use crate::realtime::RealtimeEvent;
use crate::remote::{MemoryRemote, QueryFilter};
use crate::storage::MemoryStore;

fn config(page_size: usize) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.pagination.page_size = page_size;
    config
}

fn engine(remote: &Arc<MemoryRemote>, page_size: usize) -> SyncEngine {
    SyncEngine::new(config(page_size), remote.clone(), Arc::new(MemoryStore::new()))
}

fn ids(engine: &SyncEngine) -> Vec<String> {
    engine.snapshot().items.iter().map(|i| i.id.clone()).collect()
}

fn count_of(engine: &SyncEngine, id: &str) -> usize {
    engine.snapshot().items.iter().filter(|i| i.id == id).count()
}

/// Let spawned background work run to completion.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn seeded(rows: usize, page_size: usize) -> (Arc<MemoryRemote>, SyncEngine) {
    let remote = Arc::new(MemoryRemote::new());
    remote.insert_rows((0..rows).map(|i| item(&format!("i{i}"), "alice", i as i64)));
    let engine = engine(&remote, page_size);
    engine.set_active_owner("alice").await.unwrap();
    (remote, engine)
}

struct Scripted(Vec<RealtimeEvent>);

#[async_trait]
impl RealtimeChannel for Scripted {
    async fn subscribe(&self, _owner: &str) -> anyhow::Result<BoxStream<'static, RealtimeEvent>> {
        Ok(stream::iter(self.0.clone()).boxed())
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_id_and_url_hints_insert_once() {
    let (remote, engine) = seeded(3, 50).await;
    engine.fetch_first_page("alice", true).await.unwrap();
    remote.insert_rows([item("x", "alice", 100)]);
    remote.lag_row("x", 1);

    let (a, b, c) = tokio::join!(
        engine.add_item_by_id("x"),
        engine.add_item_by_id("x"),
        engine.add_item_by_url("https://cdn.example.com/x.png"),
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

    // Same claim key, same result.
    assert_eq!(a, b);
    assert!(matches!(c, InsertOutcome::Inserted | InsertOutcome::AlreadyPresent));
    assert_eq!(count_of(&engine, "x"), 1);
    assert_eq!(ids(&engine)[0], "x");
    assert_eq!(engine.in_flight_claims(), 0);

    // A later hint for the same item never reaches the network.
    remote.reset_calls();
    let again = engine.add_item_by_id("x").await.unwrap();
    assert_eq!(again, InsertOutcome::AlreadyPresent);
    assert_eq!(remote.calls().query, 0);
}

#[tokio::test(start_paused = true)]
async fn test_order_after_mixed_mutations() {
    let (remote, engine) = seeded(8, 3).await;

    engine.fetch_first_page("alice", true).await.unwrap();
    assert_eq!(ids(&engine), vec!["i7", "i6", "i5"]);
    engine.load_more().await.unwrap();

    let report = engine.delete_items(&["i6".to_string()]).await.unwrap();
    assert_eq!(report.deleted, vec!["i6"]);
    assert!(remote.row("i6").is_none());

    // Cursor shrank with the delete, so the next page starts at i1.
    let outcome = engine.load_more().await.unwrap();
    assert_eq!(outcome, FetchOutcome::Loaded { added: 2, has_more: false });

    let outcome = engine
        .add_item_optimistic(item("new", "alice", 100))
        .await
        .unwrap();
    assert_eq!(outcome, InsertOutcome::Inserted);

    assert_eq!(
        ids(&engine),
        vec!["new", "i7", "i5", "i4", "i3", "i2", "i1", "i0"]
    );
    assert!(!engine.snapshot().has_more);
}

#[tokio::test(start_paused = true)]
async fn test_realtime_and_hint_race_merge_once() {
    let (remote, engine) = seeded(2, 50).await;
    engine.fetch_first_page("alice", true).await.unwrap();
    let x = item("x", "alice", 50);
    remote.insert_rows([x.clone()]);

    let row = serde_json::to_value(&x).unwrap();
    let (rt, hint) = tokio::join!(
        engine.handle_realtime(RealtimeEvent::Insert(row.clone())),
        engine.handle_item_saved(ItemSaved::new("alice").with_id("x")),
    );
    let rt = rt.unwrap();
    let hint = hint.unwrap();

    let inserted = [rt == RealtimeOutcome::Insert(InsertOutcome::Inserted), hint == InsertOutcome::Inserted];
    assert_eq!(inserted.iter().filter(|i| **i).count(), 1);
    assert_eq!(count_of(&engine, "x"), 1);

    // Replayed event is a no-op.
    let replay = engine.handle_realtime(RealtimeEvent::Insert(row)).await.unwrap();
    assert_eq!(replay, RealtimeOutcome::Insert(InsertOutcome::AlreadyPresent));
}

#[tokio::test(start_paused = true)]
async fn test_placeholder_replaced_by_full_row() {
    let (_remote, engine) = seeded(1, 50).await;
    engine.fetch_first_page("alice", true).await.unwrap();

    let outcome = engine
        .add_item_optimistic(placeholder("p", "alice", 10))
        .await
        .unwrap();
    assert_eq!(outcome, InsertOutcome::Inserted);

    let full = serde_json::to_value(item("p", "alice", 10)).unwrap();
    let outcome = engine.handle_realtime(RealtimeEvent::Insert(full)).await.unwrap();
    assert_eq!(outcome, RealtimeOutcome::Insert(InsertOutcome::Replaced));
    let snapshot = engine.snapshot();
    assert!(snapshot.items.iter().all(|i| i.is_displayable()));
    assert_eq!(count_of(&engine, "p"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_probe_deletion_purges_filtered_views() {
    let (remote, engine) = seeded(5, 50).await;
    engine.fetch_first_page("alice", true).await.unwrap();
    let view = engine
        .filtered(&FilterKey::Model("flux".into()), false)
        .await
        .unwrap();
    assert_eq!(view.len(), 5);

    remote.remove_rows(&["i2"]);
    let report = engine.refresh_incremental().await.unwrap();
    assert_eq!(report.removed, vec!["i2"]);
    assert!(!report.fetched_full_rows);

    assert!(!ids(&engine).contains(&"i2".to_string()));
    let view = engine
        .filtered_cached(&FilterKey::Model("flux".into()))
        .unwrap();
    assert!(!view.contains("i2"));
    assert_eq!(view.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_probe_keeps_unconfirmed_optimistic_items() {
    let (remote, engine) = seeded(2, 50).await;
    engine.fetch_first_page("alice", true).await.unwrap();
    engine
        .add_item_optimistic(item("opt", "alice", 100))
        .await
        .unwrap();

    // Remote has not caught up yet: the probe must not delete it.
    let report = engine.refresh_incremental().await.unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(count_of(&engine, "opt"), 1);

    // Seen once, it is an ordinary row and can vanish like any other.
    remote.insert_rows([item("opt", "alice", 100)]);
    engine.refresh_incremental().await.unwrap();
    remote.remove_rows(&["opt"]);
    let report = engine.refresh_incremental().await.unwrap();
    assert_eq!(report.removed, vec!["opt"]);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_keeps_realtime_rows_reads_cannot_see_yet() {
    let (remote, engine) = seeded(2, 50).await;
    engine.fetch_first_page("alice", true).await.unwrap();
    let x = item("x", "alice", 100);
    remote.insert_rows([x.clone()]);
    remote.lag_row("x", 1);

    let row = serde_json::to_value(&x).unwrap();
    let outcome = engine.handle_realtime(RealtimeEvent::Insert(row)).await.unwrap();
    assert_eq!(outcome, RealtimeOutcome::Insert(InsertOutcome::Inserted));

    let report = engine.refresh_incremental().await.unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(count_of(&engine, "x"), 1);
    assert_eq!(
        engine.add_item_by_id("x").await.unwrap(),
        InsertOutcome::AlreadyPresent
    );

    // Once reads see it, a later disappearance is a real delete.
    remote.lag_row("x", 0);
    let report = engine.refresh_incremental().await.unwrap();
    assert!(report.removed.is_empty());
    remote.remove_rows(&["x"]);
    let report = engine.refresh_incremental().await.unwrap();
    assert_eq!(report.removed, vec!["x"]);
}

#[tokio::test(start_paused = true)]
async fn test_pushed_rows_do_not_shift_the_next_page() {
    let (remote, engine) = seeded(6, 2).await;
    engine.fetch_first_page("alice", true).await.unwrap();
    engine
        .add_item_optimistic(item("new", "alice", 100))
        .await
        .unwrap();

    // Not on the remote yet, so the next page still starts at offset 2.
    let outcome = engine.load_more().await.unwrap();
    assert_eq!(outcome, FetchOutcome::Loaded { added: 2, has_more: true });
    assert_eq!(ids(&engine), vec!["new", "i5", "i4", "i3", "i2"]);

    // Seen by a read, it now takes a slot ahead of the loaded pages.
    remote.insert_rows([item("new", "alice", 100)]);
    engine.refresh_incremental().await.unwrap();
    let outcome = engine.load_more().await.unwrap();
    assert_eq!(outcome, FetchOutcome::Loaded { added: 2, has_more: true });
    assert_eq!(ids(&engine), vec!["new", "i5", "i4", "i3", "i2", "i1", "i0"]);
}

#[tokio::test(start_paused = true)]
async fn test_first_page_reload_keeps_later_pages() {
    let (remote, engine) = seeded(100, 50).await;
    engine.fetch_first_page("alice", true).await.unwrap();
    engine.load_more().await.unwrap();
    assert_eq!(engine.snapshot().items.len(), 100);

    remote.insert_rows([item("top", "alice", 1_000)]);
    let outcome = engine.fetch_first_page("alice", true).await.unwrap();
    assert_eq!(outcome, FetchOutcome::Loaded { added: 1, has_more: true });
    assert_eq!(engine.snapshot().items.len(), 101);
    assert_eq!(ids(&engine)[0], "top");

    // The new row took a slot, so nothing held is fetched again.
    let outcome = engine.load_more().await.unwrap();
    assert_eq!(outcome, FetchOutcome::Loaded { added: 0, has_more: false });
    assert_eq!(engine.snapshot().items.len(), 101);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_cache_served_without_query() {
    let remote = Arc::new(MemoryRemote::new());
    remote.insert_rows((0..4).map(|i| item(&format!("i{i}"), "alice", i)));
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

    let first = SyncEngine::new(config(50), remote.clone(), Arc::clone(&store));
    first.open("alice").await.unwrap();
    settle().await;

    let second = SyncEngine::new(config(50), remote.clone(), store);
    remote.reset_calls();
    let outcome = second.open("alice").await.unwrap();
    assert_eq!(outcome, FetchOutcome::ServedFromCache);
    assert_eq!(ids(&second), vec!["i3", "i2", "i1", "i0"]);

    settle().await;
    let calls = remote.calls();
    assert_eq!(calls.probe, 1);
    assert_eq!(calls.query, 0);
}

#[tokio::test(start_paused = true)]
async fn test_owner_switch_discards_in_flight_fetch() {
    let (remote, engine) = seeded(3, 50).await;
    remote.set_latency(Duration::from_secs(5));

    let pending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.fetch_first_page("alice", true).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    engine.set_active_owner("bob").await.unwrap();

    let outcome = pending.await.unwrap().unwrap();
    assert_eq!(outcome, FetchOutcome::Discarded);
    let snapshot = engine.snapshot();
    assert_eq!(snapshot.owner.as_deref(), Some("bob"));
    assert!(snapshot.items.is_empty());

    // And nothing of alice's was persisted under bob.
    assert!(engine.load_cached("bob").await.unwrap().is_none());
    assert!(matches!(
        engine.fetch_first_page("alice", false).await,
        Err(SyncError::StaleOwner(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_two_pages_then_probe_only_refresh() {
    let (remote, engine) = seeded(120, 50).await;
    engine.fetch_first_page("alice", true).await.unwrap();
    engine.load_more().await.unwrap();
    assert_eq!(engine.snapshot().items.len(), 100);

    remote.reset_calls();
    let report = engine.refresh_incremental().await.unwrap();
    assert_eq!(report, RefreshReport::default());
    let calls = remote.calls();
    assert_eq!(calls.probe, 1);
    assert_eq!(calls.query, 0);
    assert_eq!(engine.snapshot().items.len(), 100);
}

#[tokio::test(start_paused = true)]
async fn test_lagging_row_found_on_third_attempt() {
    let (remote, engine) = seeded(3, 50).await;
    engine.fetch_first_page("alice", true).await.unwrap();
    remote.insert_rows([item("x", "alice", 1_000)]);
    remote.lag_row("x", 2);
    remote.reset_calls();

    let start = tokio::time::Instant::now();
    let (by_id, hint) = tokio::join!(
        engine.add_item_by_id("x"),
        engine.handle_item_saved(ItemSaved::new("alice").with_id("x")),
    );
    assert_eq!(by_id.unwrap(), InsertOutcome::Inserted);
    assert_eq!(hint.unwrap(), InsertOutcome::Inserted);

    // 1s + 2s of backoff before the third lookup.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    let lookups = remote
        .query_log()
        .iter()
        .filter(|f| f.ids.as_deref() == Some(&["x".to_string()][..]))
        .count();
    assert_eq!(lookups, 3);
    assert_eq!(ids(&engine)[0], "x");
    assert_eq!(count_of(&engine, "x"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fall_back_to_latest_once() {
    let (remote, engine) = seeded(3, 50).await;
    engine.fetch_first_page("alice", true).await.unwrap();
    remote.insert_rows([item("x", "alice", 1_000)]);
    remote.lag_row("x", 10);
    remote.reset_calls();

    let start = tokio::time::Instant::now();
    let outcome = engine.add_item_by_id("x").await.unwrap();
    assert_eq!(outcome, InsertOutcome::Exhausted { fallback_inserted: false });
    assert!(start.elapsed() >= Duration::from_secs(31));

    let log = remote.query_log();
    assert_eq!(log.iter().filter(|f| f.ids.is_some()).count(), 5);
    assert_eq!(log.iter().filter(|f| **f == QueryFilter::all()).count(), 1);
    assert_eq!(count_of(&engine, "x"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_lost_delete_ack_confirmed_by_lookup() {
    let (remote, engine) = seeded(3, 50).await;
    engine.fetch_first_page("alice", true).await.unwrap();
    remote.lose_delete_ack("i0");
    remote.fail_delete("i1");

    let report = engine
        .delete_items(&["i0".to_string(), "i1".to_string()])
        .await
        .unwrap();
    assert_eq!(report.deleted, vec!["i0"]);
    assert_eq!(report.failed, vec!["i1"]);
    assert_eq!(ids(&engine), vec!["i2", "i1"]);

    // A late realtime insert for the deleted id stays out.
    let late = serde_json::to_value(item("i0", "alice", 0)).unwrap();
    let outcome = engine.handle_realtime(RealtimeEvent::Insert(late)).await.unwrap();
    assert_eq!(outcome, RealtimeOutcome::Insert(InsertOutcome::Removed));
}

#[tokio::test(start_paused = true)]
async fn test_favorite_reverts_on_failure() {
    let (remote, engine) = seeded(3, 50).await;
    engine.fetch_first_page("alice", true).await.unwrap();
    let favorites = engine.filtered(&FilterKey::Favorites, false).await.unwrap();
    assert!(favorites.is_empty());

    remote.fail_updates(true);
    let result = engine.set_favorite("i1", true).await;
    assert!(matches!(result, Err(SyncError::Network(_))));
    let held = engine.snapshot().items.iter().find(|i| i.id == "i1").cloned().unwrap();
    assert!(!held.favorite);
    assert!(engine.filtered_cached(&FilterKey::Favorites).unwrap().is_empty());

    remote.fail_updates(false);
    assert!(engine.set_favorite("i1", true).await.unwrap());
    assert!(remote.row("i1").unwrap().favorite);
    let favorites = engine.filtered_cached(&FilterKey::Favorites).unwrap();
    assert_eq!(favorites.items.len(), 1);
    assert!(!engine.set_favorite("missing", true).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_realtime_events_are_skipped() {
    let (remote, engine) = seeded(3, 50).await;
    engine.fetch_first_page("alice", true).await.unwrap();

    let skipped = engine
        .handle_realtime(RealtimeEvent::Insert(json!({"foo": 1})))
        .await
        .unwrap();
    assert_eq!(skipped, RealtimeOutcome::Skipped);
    let skipped = engine
        .handle_realtime(RealtimeEvent::Delete(json!(null)))
        .await
        .unwrap();
    assert_eq!(skipped, RealtimeOutcome::Skipped);

    // Bad timestamp but readable id: fetched by id instead.
    remote.insert_rows([item("x", "alice", 500)]);
    let outcome = engine
        .handle_realtime(RealtimeEvent::Insert(json!({"id": "x", "created_at": "soon"})))
        .await
        .unwrap();
    assert_eq!(outcome, RealtimeOutcome::Insert(InsertOutcome::Inserted));

    let removed = engine
        .handle_realtime(RealtimeEvent::Delete(json!({"id": "x"})))
        .await
        .unwrap();
    assert_eq!(removed, RealtimeOutcome::Removed(1));
    assert_eq!(ids(&engine), vec!["i2", "i1", "i0"]);
}

#[tokio::test(start_paused = true)]
async fn test_listeners_feed_the_engine() {
    let (remote, engine) = seeded(2, 50).await;
    engine.fetch_first_page("alice", true).await.unwrap();

    let y = item("y", "alice", 200);
    remote.insert_rows([item("x", "alice", 100), y.clone()]);
    let channel = Arc::new(Scripted(vec![
        RealtimeEvent::Insert(serde_json::to_value(&y).unwrap()),
        RealtimeEvent::Delete(json!("i0")),
    ]));
    engine.spawn_realtime(channel).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    let bus = engine.spawn_notifications(rx);
    tx.send(ItemSaved::new("bob").with_id("x")).unwrap();
    tx.send(ItemSaved::new("alice").with_url("https://cdn.example.com/x.png"))
        .unwrap();
    settle().await;

    assert_eq!(ids(&engine), vec!["y", "x", "i1"]);
    drop(tx);
    bus.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_poller_picks_up_remote_changes() {
    let (remote, engine) = seeded(3, 50).await;
    engine.fetch_first_page("alice", true).await.unwrap();
    engine.spawn_poller().await.unwrap();

    remote.remove_rows(&["i1"]);
    remote.insert_rows([item("z", "alice", 90)]);
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(ids(&engine), vec!["z", "i2", "i0"]);

    // Switching owner stops the poller.
    engine.set_active_owner("bob").await.unwrap();
    remote.reset_calls();
    tokio::time::sleep(Duration::from_secs(121)).await;
    assert_eq!(remote.calls().probe, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stats_follow_loaded_collection() {
    let (remote, engine) = seeded(4, 50).await;
    engine.fetch_first_page("alice", true).await.unwrap();
    settle().await;

    let stats = engine.snapshot().stats.unwrap();
    assert_eq!(stats.images, 4);
    assert_eq!(stats.image_models.get("flux"), Some(&4));

    // A zeroed remote row is treated as uninitialised and recomputed.
    remote.set_stats_row("alice", StatsSnapshot::default());
    let check = engine.refresh_stats().await.unwrap();
    assert_eq!(check, Some(StatsCheck::Uninitialized));
    assert_eq!(engine.snapshot().stats.unwrap().images, 4);
}

#[tokio::test]
async fn test_operations_require_active_owner() {
    let remote = Arc::new(MemoryRemote::new());
    let engine = engine(&remote, 50);
    assert!(matches!(engine.load_more().await, Err(SyncError::NoActiveOwner)));
    assert!(matches!(
        engine.add_item_by_id("x").await,
        Err(SyncError::NoActiveOwner)
    ));

    engine.set_active_owner("alice").await.unwrap();
    engine.clear_active_owner().await;
    assert!(engine.snapshot().owner.is_none());
    assert!(engine.active_owner().await.is_none());
}
