//! Sync-module error types.

use syntond_clock::ClockError;
use syntond_config::ConfigError;
use syntond_feed::FeedError;

/// Errors from the sync module and its message interface.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Instance configuration was rejected; the instance does not start.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A clock resource could not be acquired or adjusted at startup.
    #[error(transparent)]
    Clock(#[from] ClockError),

    /// The clock feed refused a startup request.
    #[error(transparent)]
    Feed(#[from] FeedError),

    /// No instance with this name exists in the module.
    #[error("unknown sync instance `{instance}`")]
    UnknownInstance { instance: String },

    /// The module worker is no longer running.
    #[error("sync module stopped")]
    ModuleStopped,
}
