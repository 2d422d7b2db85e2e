//! Client-side sync engine for a per-owner media gallery.
//!
//! Keeps one ordered, deduplicated collection for the active owner in step
//! with a hosted table that has read-after-write lag, while several
//! independent signals (optimistic inserts, "item saved" hints, realtime
//! events, periodic probes) race to announce the same rows.

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod engine;
pub mod error;
pub mod filtered;
pub mod logging;
pub mod model;
pub mod notify;
pub mod realtime;
pub mod remote;
pub mod retry;
pub mod stats;
pub mod storage;

pub use config::SyncConfig;
pub use engine::{
    ClaimKey, DeleteReport, FetchOutcome, GallerySnapshot, InsertOutcome, RealtimeOutcome,
    RefreshReport, SyncEngine,
};
pub use error::{Result, SyncError};
pub use filtered::FilterKey;
pub use model::{MediaItem, MediaKind, OwnerCollection, OwnerId};
pub use notify::ItemSaved;
pub use realtime::{RealtimeChannel, RealtimeEvent};
pub use remote::{MemoryRemote, RemoteStore};
pub use stats::{StatsCheck, StatsSnapshot};
pub use storage::{KeyValueStore, MemoryStore, RedbStore};
