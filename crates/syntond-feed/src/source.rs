//! Per-source sample rings.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use syntond_clock::{ClockId, ReferenceClock};
use syntond_types::{MonoTime, Nanos, WallTime};

use crate::FeedError;

/// Ring capacity per source. A power of two so slot selection is a mask.
pub const RING_CAPACITY: usize = 16;

/// One ring-buffer entry: a cached comparison of a source clock against the
/// system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockSample {
    /// Writer-assigned sequence number; equals the write counter value at
    /// capture time.
    pub seq: u64,
    /// Whether the capture succeeded.
    pub ok: bool,
    /// Monotonic capture timestamp.
    pub mono: MonoTime,
    /// Realtime (system clock) capture timestamp.
    pub system: WallTime,
    /// Reconstructed reading of the source clock at `system`:
    /// `system + offset`. Zeroed when the capture failed.
    pub snapshot: WallTime,
}

/// Shared state of one feed source: the sample ring plus lifecycle flags.
///
/// Exactly one writer exists (the feed worker); readers go through
/// [`Subscription`](crate::Subscription). The write counter is published
/// with release ordering after each slot write and re-checked by readers,
/// which is what turns the ring into a freshness-aware single-writer /
/// multi-reader structure.
#[derive(Debug)]
pub struct SourceInner {
    clock: Arc<dyn ReferenceClock>,
    poll_period_log2: i32,
    ring: [Mutex<ClockSample>; RING_CAPACITY],
    /// Number of completed writes. Only grows.
    write_counter: AtomicU64,
    /// Live subscription count; the feed reaps an inactive source once this
    /// reaches zero.
    subscribers: AtomicUsize,
    /// Set when the source is removed from the active list.
    inactive: AtomicBool,
}

impl SourceInner {
    pub(crate) fn new(clock: Arc<dyn ReferenceClock>, poll_period_log2: i32) -> Self {
        Self {
            clock,
            poll_period_log2,
            ring: std::array::from_fn(|_| Mutex::new(ClockSample::default())),
            write_counter: AtomicU64::new(0),
            subscribers: AtomicUsize::new(0),
            inactive: AtomicBool::new(false),
        }
    }

    pub(crate) fn clock_id(&self) -> &ClockId {
        self.clock.id()
    }

    pub(crate) fn clock(&self) -> &Arc<dyn ReferenceClock> {
        &self.clock
    }

    pub(crate) fn poll_period_log2(&self) -> i32 {
        self.poll_period_log2
    }

    pub(crate) fn write_counter(&self) -> u64 {
        self.write_counter.load(Ordering::Acquire)
    }

    pub(crate) fn mark_inactive(&self) {
        self.inactive.store(true, Ordering::Release);
    }

    pub(crate) fn is_inactive(&self) -> bool {
        self.inactive.load(Ordering::Acquire)
    }

    pub(crate) fn add_subscriber(&self) {
        self.subscribers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_subscriber(&self) {
        self.subscribers.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }

    /// Writes the next sample. Feed worker only.
    pub(crate) fn push_sample(&self, sample: ClockSample) {
        let wc = self.write_counter.load(Ordering::Relaxed);
        let slot = (wc % RING_CAPACITY as u64) as usize;
        {
            let mut guard = self.ring[slot].lock().expect("sample slot poisoned");
            *guard = ClockSample { seq: wc, ..sample };
        }
        // Publish after the slot content is in place.
        self.write_counter.store(wc + 1, Ordering::Release);
    }

    /// Reads the most recent complete sample with the writer-before/after
    /// counter protocol.
    ///
    /// Returns the counter snapshot `w1` alongside the sample; freshness
    /// policy on top of this is the subscription's business.
    pub(crate) fn read_latest(&self) -> Result<(u64, ClockSample), FeedError> {
        if self.is_inactive() {
            return Err(FeedError::OwnerDead);
        }
        let w1 = self.write_counter.load(Ordering::Acquire);
        if w1 == 0 {
            return Err(FeedError::Again);
        }
        let slot = ((w1 - 1) % RING_CAPACITY as u64) as usize;
        let sample = *self.ring[slot].lock().expect("sample slot poisoned");
        if !sample.ok {
            return Err(FeedError::NoData);
        }
        let w2 = self.write_counter.load(Ordering::Acquire);
        if w2 >= w1 + RING_CAPACITY as u64 - 1 {
            return Err(FeedError::Overrun);
        }
        Ok((w1, sample))
    }
}

/// A successfully captured comparison, as handed to readers.
#[derive(Debug, Clone, Copy)]
pub struct Reading {
    /// Source clock minus system clock.
    pub diff: Nanos,
    /// Realtime capture timestamp.
    pub system: WallTime,
    /// Monotonic capture timestamp.
    pub mono: MonoTime,
}

impl Reading {
    pub(crate) fn from_sample(sample: &ClockSample) -> Self {
        Self {
            diff: sample.snapshot - sample.system,
            system: sample.system,
            mono: sample.mono,
        }
    }
}
