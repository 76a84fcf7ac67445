//! # syntond-feed: The central clock-sampling service
//!
//! Comparing a hardware clock against the system clock is relatively
//! expensive, and every sync module wants the result on its own schedule.
//! The feed converts those on-demand comparisons into a steady cadence of
//! cached samples: one dedicated worker samples every registered clock on a
//! fixed tick and writes the result into that source's ring buffer.
//! Subscribers read the most recent sample through a [`Subscription`]
//! handle that enforces freshness (`require_fresh`), age bounds and overrun
//! detection.
//!
//! # Ring protocol
//!
//! Each source's ring has a single writer (the feed worker). A write fills
//! the slot `write_counter % capacity` and then publishes the incremented
//! counter with release ordering. Readers snapshot the counter, read the
//! newest slot, and re-check the counter afterwards: if the writer advanced
//! by almost a full ring in between, the read reports
//! [`FeedError::Overrun`] instead of handing out a half-overwritten value.
//! This bounds memory, never blocks the writer, and lets a slow reader
//! detect that it missed samples deterministically.
//!
//! # Lifecycle
//!
//! Sources removed while subscriptions exist are parked on an inactive
//! list; reads against them fail with [`FeedError::OwnerDead`] and the
//! source is reclaimed when the last subscription drops. Cycle-complete
//! events fan out to a fixed number of registered sinks after every
//! sampling pass, with allocate-or-skip semantics on backpressure.

mod error;
mod service;
mod source;
mod subscription;

pub use error::FeedError;
pub use service::{
    CycleEvent, CycleSink, FeedHandle, FeedMsg, FeedWorker, DEFAULT_POLL_PERIOD_LOG2,
    EVENT_SUBSCRIBER_CAPACITY,
};
pub use source::{ClockSample, Reading, RING_CAPACITY};
pub use subscription::{PairReading, Subscription};
