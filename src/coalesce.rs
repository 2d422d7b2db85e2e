//! Keyed coalescing of in-flight work.
//!
//! The first caller for a key becomes the leader: its future is boxed,
//! made shareable and registered. Callers arriving while it runs await the
//! same shared future instead of starting their own. The registration is
//! dropped when the leader finishes or is dropped, whichever comes first.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use futures_util::future::{BoxFuture, FutureExt, Shared};

type InFlight<V> = Shared<BoxFuture<'static, V>>;

pub struct Coalescer<K, V>
where
    V: Clone,
{
    inflight: Arc<Mutex<HashMap<K, (u64, InFlight<V>)>>>,
    next_token: std::sync::atomic::AtomicU64,
}

impl<K, V> Default for Coalescer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the leader's registration on every exit path.
struct Release<K: Eq + Hash, V: Clone> {
    inflight: Arc<Mutex<HashMap<K, (u64, InFlight<V>)>>>,
    key: K,
    token: u64,
}

impl<K: Eq + Hash, V: Clone> Drop for Release<K, V> {
    fn drop(&mut self) {
        if let Ok(mut map) = self.inflight.lock() {
            // Only remove our own registration, never a successor's.
            if map.get(&self.key).is_some_and(|(t, _)| *t == self.token) {
                map.remove(&self.key);
            }
        }
    }
}

/// Result of a coalesced call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined<V> {
    pub value: V,
    /// True if this caller ran the work, false if it joined another's.
    pub leader: bool,
}

impl<K, V> Coalescer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_token: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.inflight
            .lock()
            .map(|m| m.contains_key(key))
            .unwrap_or(false)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Run `make()` for `key` unless an equal key is already in flight,
    /// in which case await that one instead.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> Joined<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (shared, release) = {
            let mut map = match self.inflight.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some((_, existing)) = map.get(&key) {
                (existing.clone(), None)
            } else {
                let token = self
                    .next_token
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let shared = make().boxed().shared();
                map.insert(key.clone(), (token, shared.clone()));
                let release = Release {
                    inflight: Arc::clone(&self.inflight),
                    key,
                    token,
                };
                (shared, Some(release))
            }
        };

        let value = shared.await;
        let leader = release.is_some();
        drop(release);
        Joined { value, leader }
    }
}
