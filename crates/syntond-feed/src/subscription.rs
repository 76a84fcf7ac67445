//! Reader handles with freshness and age contracts.

use std::sync::Arc;

use syntond_clock::{monotonic_now, realtime_now};
use syntond_types::{MonoTime, Nanos};

use crate::source::{Reading, SourceInner, RING_CAPACITY};
use crate::FeedError;

/// A reader handle for one feed source.
///
/// Subscriptions are owned by exactly one consumer and are not shared;
/// all freshness state (`read_counter`, `min_counter`, age bounds) lives in
/// the handle, while the sample ring itself stays with the feed.
///
/// A subscription for the system clock is a *null subscription*: the system
/// clock compared to itself is always zero, so reads succeed immediately
/// with current timestamps and freshness options are accepted but have no
/// effect.
#[derive(Debug)]
pub struct Subscription {
    source: Option<Arc<SourceInner>>,
    /// Write-counter value at the most recent successful read; -1 initially.
    read_counter: i64,
    /// Minimum write counter the next read must observe; -1 means any.
    min_counter: i64,
    /// Set by `require_fresh`, cleared by the first read attempt that
    /// observes the requirement (whether it was met in time or overrun).
    fresh_pending: bool,
    max_age: Option<Nanos>,
    max_age_diff: Option<Nanos>,
}

impl Subscription {
    pub(crate) fn new(source: Arc<SourceInner>) -> Self {
        source.add_subscriber();
        Self {
            source: Some(source),
            read_counter: -1,
            min_counter: -1,
            fresh_pending: false,
            max_age: None,
            max_age_diff: None,
        }
    }

    /// The null subscription for the system clock.
    pub(crate) fn null() -> Self {
        Self {
            source: None,
            read_counter: -1,
            min_counter: -1,
            fresh_pending: false,
            max_age: None,
            max_age_diff: None,
        }
    }

    /// Whether this is the system clock's null subscription.
    pub fn is_system(&self) -> bool {
        self.source.is_none()
    }

    /// Demands that the next read observe a sample produced after this
    /// call. If the writer laps the demand by a full ring, the next read
    /// reports [`FeedError::Overrun`] once.
    pub fn require_fresh(&mut self) {
        if let Some(source) = &self.source {
            // min_counter only ever grows.
            let required = source.write_counter() as i64 + 1;
            self.min_counter = self.min_counter.max(required);
            self.fresh_pending = true;
        }
    }

    /// Bounds the age of returned samples against the monotonic clock.
    pub fn set_max_age(&mut self, max_age: Option<Nanos>) {
        self.max_age = max_age;
    }

    /// Bounds the capture-time difference tolerated in two-subscription
    /// comparisons.
    pub fn set_max_age_diff(&mut self, max_age_diff: Option<Nanos>) {
        self.max_age_diff = max_age_diff;
    }

    /// Reads the current sample under this subscription's contracts.
    fn read(&mut self, mono_now: MonoTime) -> Result<Reading, FeedError> {
        let Some(source) = &self.source else {
            return Ok(Reading {
                diff: Nanos::ZERO,
                system: realtime_now(),
                mono: mono_now,
            });
        };

        let (w1, sample) = source.read_latest()?;
        let w1 = w1 as i64;

        if w1 < self.min_counter {
            return Err(FeedError::Stale);
        }
        if self.fresh_pending {
            self.fresh_pending = false;
            if w1 >= (self.min_counter - 1) + RING_CAPACITY as i64 - 1 {
                return Err(FeedError::Overrun);
            }
        }
        if let Some(max_age) = self.max_age {
            if mono_now - sample.mono > max_age {
                return Err(FeedError::Stale);
            }
        }

        self.read_counter = w1;
        Ok(Reading::from_sample(&sample))
    }

    /// Compares the subscribed clock to the system clock.
    pub fn compare_to_system(&mut self) -> Result<Reading, FeedError> {
        self.read(monotonic_now())
    }

    /// Compares two subscribed clocks: `diff = self - other`.
    pub fn compare_to(&mut self, other: &mut Subscription) -> Result<PairReading, FeedError> {
        let now = monotonic_now();
        self.compare_to_at(other, now)
    }

    fn compare_to_at(
        &mut self,
        other: &mut Subscription,
        mono_now: MonoTime,
    ) -> Result<PairReading, FeedError> {
        let first = self.read(mono_now)?;
        let second = other.read(mono_now)?;

        // The tightest capture-skew bound of the two subscriptions applies.
        let bound = match (self.max_age_diff, other.max_age_diff) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (one, two) => one.or(two),
        };
        if let Some(bound) = bound {
            if (first.mono - second.mono).abs() > bound {
                return Err(FeedError::Stale);
            }
        }

        Ok(PairReading {
            diff: first.diff - second.diff,
            first,
            second,
        })
    }

    #[cfg(test)]
    pub(crate) fn read_at(&mut self, mono_now: MonoTime) -> Result<Reading, FeedError> {
        self.read(mono_now)
    }

    #[cfg(test)]
    pub(crate) fn read_counter(&self) -> i64 {
        self.read_counter
    }

    #[cfg(test)]
    pub(crate) fn min_counter(&self) -> i64 {
        self.min_counter
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(source) = &self.source {
            source.remove_subscriber();
        }
    }
}

/// Result of a two-subscription comparison.
#[derive(Debug, Clone, Copy)]
pub struct PairReading {
    /// First clock minus second clock.
    pub diff: Nanos,
    pub first: Reading,
    pub second: Reading,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ClockSample;
    use syntond_clock::{ClockId, SoftwareClock};
    use syntond_types::WallTime;

    fn source() -> Arc<SourceInner> {
        let clock = Arc::new(SoftwareClock::new_manual(ClockId::phc("t0")));
        Arc::new(SourceInner::new(clock, 0))
    }

    fn push(src: &SourceInner, diff_ns: i64, mono_ns: i64) {
        src.push_sample(ClockSample {
            seq: 0,
            ok: true,
            mono: MonoTime::new(mono_ns),
            system: WallTime::new(mono_ns + 1_000_000),
            snapshot: WallTime::new(mono_ns + 1_000_000 + diff_ns),
        });
    }

    #[test]
    fn read_before_first_sample_is_again() {
        let src = source();
        let mut sub = Subscription::new(Arc::clone(&src));
        assert_eq!(sub.read_at(MonoTime::new(0)).unwrap_err(), FeedError::Again);
    }

    #[test]
    fn successful_read_updates_read_counter() {
        let src = source();
        let mut sub = Subscription::new(Arc::clone(&src));
        push(&src, 42, 10);

        let reading = sub.read_at(MonoTime::new(20)).unwrap();
        assert_eq!(reading.diff.as_nanos(), 42);
        assert_eq!(sub.read_counter(), 1);
    }

    #[test]
    fn require_fresh_blocks_until_new_sample() {
        let src = source();
        let mut sub = Subscription::new(Arc::clone(&src));
        push(&src, 1, 10);
        sub.read_at(MonoTime::new(20)).unwrap();

        sub.require_fresh();
        assert_eq!(
            sub.read_at(MonoTime::new(30)).unwrap_err(),
            FeedError::Stale
        );

        push(&src, 2, 40);
        let reading = sub.read_at(MonoTime::new(50)).unwrap();
        assert_eq!(reading.diff.as_nanos(), 2);
    }

    #[test]
    fn min_counter_is_monotonic() {
        let src = source();
        let mut sub = Subscription::new(Arc::clone(&src));
        push(&src, 1, 10);
        sub.require_fresh();
        let first = sub.min_counter();
        // A second require_fresh before any new write must not lower it
        sub.require_fresh();
        assert!(sub.min_counter() >= first);
    }

    #[test]
    fn writer_lapping_a_fresh_demand_is_overrun() {
        let src = source();
        let mut sub = Subscription::new(Arc::clone(&src));
        push(&src, 1, 10);
        sub.read_at(MonoTime::new(20)).unwrap();

        sub.require_fresh();
        for i in 0..RING_CAPACITY as i64 {
            push(&src, i, 100 + i);
        }
        assert_eq!(
            sub.read_at(MonoTime::new(200)).unwrap_err(),
            FeedError::Overrun
        );
        // The overrun is reported once; the demand itself was satisfied
        let reading = sub.read_at(MonoTime::new(201)).unwrap();
        assert_eq!(reading.diff.as_nanos(), RING_CAPACITY as i64 - 1);
    }

    #[test]
    fn max_age_rejects_old_samples() {
        let src = source();
        let mut sub = Subscription::new(Arc::clone(&src));
        sub.set_max_age(Some(Nanos::new(100)));
        push(&src, 1, 1_000);

        assert!(sub.read_at(MonoTime::new(1_050)).is_ok());
        assert_eq!(
            sub.read_at(MonoTime::new(1_200)).unwrap_err(),
            FeedError::Stale
        );
    }

    #[test]
    fn null_subscription_reads_zero() {
        let mut sub = Subscription::null();
        assert!(sub.is_system());
        let reading = sub.compare_to_system().unwrap();
        assert_eq!(reading.diff, Nanos::ZERO);
    }

    #[test]
    fn pair_compare_subtracts_diffs() {
        let a = source();
        let b = source();
        let mut sub_a = Subscription::new(Arc::clone(&a));
        let mut sub_b = Subscription::new(Arc::clone(&b));
        push(&a, 100, 10);
        push(&b, 30, 12);

        let pair = sub_a.compare_to_at(&mut sub_b, MonoTime::new(20)).unwrap();
        assert_eq!(pair.diff.as_nanos(), 70);
    }

    #[test]
    fn pair_compare_applies_tightest_age_diff() {
        let a = source();
        let b = source();
        let mut sub_a = Subscription::new(Arc::clone(&a));
        let mut sub_b = Subscription::new(Arc::clone(&b));
        sub_a.set_max_age_diff(Some(Nanos::new(1_000)));
        sub_b.set_max_age_diff(Some(Nanos::new(10)));

        push(&a, 1, 0);
        push(&b, 2, 500); // captures 500ns apart, beyond the 10ns bound

        assert_eq!(
            sub_a
                .compare_to_at(&mut sub_b, MonoTime::new(600))
                .unwrap_err(),
            FeedError::Stale
        );
    }

    #[test]
    fn drop_releases_subscriber_slot() {
        let src = source();
        {
            let _sub = Subscription::new(Arc::clone(&src));
            assert_eq!(src.subscriber_count(), 1);
        }
        assert_eq!(src.subscriber_count(), 0);
    }
}
