//! # syntond-clock: Local reference clock abstraction
//!
//! A *local reference clock* (LRC) is a clock the daemon can read and steer:
//! the system clock, or a hardware clock on a network interface. This crate
//! provides the trait the rest of the daemon programs against, plus the two
//! implementations it ships with:
//!
//! - [`SystemClock`]: the process-wide realtime clock. Readable everywhere;
//!   steering it requires a kernel adjunct outside this crate's scope, so
//!   adjustments are recorded and logged rather than applied.
//! - [`SoftwareClock`]: a deterministic software clock with a configurable
//!   drift model. Used by the simulation paths and throughout the test
//!   suites, where it stands in for a NIC hardware clock.
//!
//! Clock handles are shared by `Arc` and are reference-stable for the
//! process lifetime; every implementation serializes its own mutation
//! internally so callers never coordinate around a handle.

mod error;
mod frequency;
mod software;
mod system;

use std::fmt::{self, Display};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use syntond_types::{MonoTime, Nanos, WallTime};

pub use error::ClockError;
pub use frequency::FrequencyStore;
pub use software::SoftwareClock;
pub use system::SystemClock;

/// Identifier of a local reference clock, e.g. `system` or `phc:eth0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClockId(String);

impl ClockId {
    /// The well-known id of the system realtime clock.
    pub fn system() -> Self {
        Self("system".to_string())
    }

    /// The id of the hardware clock on the named interface.
    pub fn phc(interface: &str) -> Self {
        Self(format!("phc:{interface}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_system(&self) -> bool {
        self.0 == "system"
    }
}

impl Display for ClockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClockId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A steerable local reference clock.
///
/// All methods take `&self`: handles are shared across worker threads via
/// `Arc<dyn ReferenceClock>`, and each implementation serializes its own
/// state internally.
pub trait ReferenceClock: Send + Sync + fmt::Debug {
    /// Stable identifier of this clock.
    fn id(&self) -> &ClockId;

    /// Current reading of this clock on the realtime timeline.
    fn read(&self) -> Result<WallTime, ClockError>;

    /// Offset of this clock relative to the system clock:
    /// `offset = this_clock - system_clock`, in nanoseconds.
    fn compare_to_system(&self) -> Result<Nanos, ClockError>;

    /// Slews the clock frequency. Positive `ppb` makes the clock run faster
    /// by that many parts per billion; the adjustment persists until
    /// replaced.
    fn adjust_frequency(&self, ppb: f64) -> Result<(), ClockError>;

    /// Steps the clock reading by `offset` in one discontinuous jump.
    fn step(&self, offset: Nanos) -> Result<(), ClockError>;

    /// Largest frequency adjustment magnitude the clock supports, in ppb.
    fn max_frequency_adjustment_ppb(&self) -> f64;

    /// Enables or disables the timed-event source bound to this clock.
    ///
    /// A clock's event source can serve at most one consumer; enabling it
    /// twice without an intervening disable fails with
    /// [`ClockError::EventSourceBusy`].
    fn set_timed_event_source(&self, enable: bool) -> Result<(), ClockError>;
}

/// Current process-local monotonic time.
///
/// Anchored at first use; never goes backwards regardless of steps applied
/// to any realtime clock.
pub fn monotonic_now() -> MonoTime {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    MonoTime::new(start.elapsed().as_nanos() as i64)
}

/// Current system realtime, nanoseconds since the UNIX epoch.
pub fn realtime_now() -> WallTime {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    WallTime::new(since_epoch.as_nanos() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_id_constructors() {
        assert_eq!(ClockId::system().as_str(), "system");
        assert!(ClockId::system().is_system());

        let phc = ClockId::phc("eth2");
        assert_eq!(phc.as_str(), "phc:eth2");
        assert!(!phc.is_system());
    }

    #[test]
    fn monotonic_never_decreases() {
        let a = monotonic_now();
        let b = monotonic_now();
        assert!(b >= a);
    }

    #[test]
    fn realtime_is_plausible() {
        // After 2020, before 2100
        let now = realtime_now();
        assert!(now.secs() > 1_577_836_800);
        assert!(now.secs() < 4_102_444_800);
    }
}
