//! Feed error types.

/// Errors surfaced by the clock feed.
///
/// The freshness family (`Again`, `Stale`, `Overrun`, `NoData`) is
/// recoverable by design: readers treat any of them as "skip this
/// iteration" and try again on the next cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// No sample has been produced for this source yet.
    #[error("no sample produced yet")]
    Again,

    /// The available sample does not meet the subscription's freshness or
    /// age requirements.
    #[error("sample is stale")]
    Stale,

    /// The writer lapped this reader; samples were missed.
    #[error("ring overrun: reader too slow")]
    Overrun,

    /// The source was removed from the feed.
    #[error("source removed from feed")]
    OwnerDead,

    /// No source is registered for the requested clock.
    #[error("clock {clock} not registered with the feed")]
    NotFound { clock: String },

    /// The most recent sampling attempt for this source failed.
    #[error("latest sample failed to capture")]
    NoData,

    /// The clock is already registered with the feed.
    #[error("clock {clock} already registered with the feed")]
    AlreadyRegistered { clock: String },

    /// All cycle-event subscriber slots are taken.
    #[error("cycle-event subscriber capacity exhausted")]
    EventCapacity,

    /// The feed service is no longer running.
    #[error("feed service stopped")]
    ServiceStopped,
}
