use std::time::Duration;

/// Why one reconcile attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("sync failed: {0:#}")]
    Sync(anyhow::Error),
    /// Caught at the worker boundary; never retried.
    #[error("sync panicked: {0}")]
    Panicked(String),
}

impl ReconcileError {
    pub fn is_panic(&self) -> bool { matches!(self, Self::Panicked(_)) }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("timed out after {0:?} waiting for cache sync")]
    CacheSyncTimeout(Duration),
    #[error("controller already started")]
    AlreadyStarted,
    #[error("controller task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
