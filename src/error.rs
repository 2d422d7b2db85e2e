use thiserror::Error;

/// Failures surfaced by the sync engine.
///
/// Collaborators (remote store, key-value store) report `anyhow` errors;
/// the engine classifies them here. Most of these never reach callers:
/// per-item fetch failures are absorbed inside the insert paths and only
/// show up in logs.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient remote failure. Retried per the backoff policy where the
    /// operation allows it.
    #[error("remote store request failed: {0}")]
    Network(#[source] anyhow::Error),

    /// Row not visible yet (read-after-write lag on the remote store).
    #[error("item {0} not found on remote store yet")]
    NotFoundYet(String),

    /// Loosely-typed payload could not be decoded.
    #[error("could not decode payload: {0}")]
    Decode(String),

    /// The call was made for an owner that is no longer active.
    #[error("owner {0} is not the active owner")]
    StaleOwner(String),

    #[error("no active owner")]
    NoActiveOwner,

    #[error("persistent store failed: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

impl SyncError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::NotFoundYet(_))
    }
}
