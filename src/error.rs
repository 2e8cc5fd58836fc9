//! Errors surfaced by [`Watcher`](crate::Watcher) and [`FullWatcher`](crate::FullWatcher).
use thiserror::Error;

/// Result alias for watcher operations.
pub type Result<T, E = WatchError> = std::result::Result<T, E>;

/// Watcher failure categories.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The store could not be opened/created or the engine failed to start.
    /// Nothing built before the failure is left open.
    #[error("construct watcher: {0}")]
    Construct(#[source] anyhow::Error),

    /// Querying the engine's best block failed.
    #[error("chain sync: {0}")]
    Sync(#[source] anyhow::Error),

    /// An address did not decode for the configured network.
    #[error("invalid address {address}: {source}")]
    InvalidAddress {
        /// The rejected input.
        address: String,
        /// Decoder error.
        #[source]
        source: bitcoin::address::ParseError,
    },

    /// `start_watching` was called a second time on the same watcher.
    #[error("start_watching called several times")]
    AlreadyWatching,

    /// The live rescan session rejected new addresses. They stay recorded
    /// and are re-applied by the next rebuild.
    #[error("rescan update: {0}")]
    Update(#[source] anyhow::Error),

    /// The watcher has been closed.
    #[error("watcher is closed")]
    Closed,

    /// Stopping the engine or closing the store failed during `close`.
    #[error("shutdown: {0}")]
    Shutdown(#[source] anyhow::Error),
}
