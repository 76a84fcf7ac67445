//! # syntond-types: Core types for syntond
//!
//! This crate contains shared types used across the syntond daemon:
//! - Temporal types ([`MonoTime`], [`WallTime`], [`Nanos`])
//! - Sync-instance state ([`SyncState`], [`Alarm`], [`AlarmSet`])
//! - Control flags ([`ControlFlag`], [`ControlFlags`])
//! - Master metadata ([`MasterInfo`], [`ClockClass`], [`TimeSource`], [`Accuracy`])
//! - Status reporting ([`InstanceStatus`])
//! - Event-source samples ([`PulseEvent`])
//!
//! Everything here is cheap to copy and free of platform dependencies so it
//! can flow through message queues between worker threads without locks.

use std::fmt::{self, Display};
use std::ops::{Add, AddAssign, Neg, Sub};

use serde::{Deserialize, Serialize};

// ============================================================================
// Temporal types - nanosecond newtypes, all Copy
// ============================================================================

/// A signed duration in nanoseconds.
///
/// Used for clock offsets, pulse periods and adjustment magnitudes. The
/// range of an `i64` covers roughly ±292 years, which is comfortably more
/// than any interval the daemon measures.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Nanos(i64);

impl Nanos {
    pub const ZERO: Nanos = Nanos(0);

    pub const fn new(ns: i64) -> Self {
        Self(ns)
    }

    /// Builds a duration from whole seconds.
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Builds a duration from milliseconds.
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms * 1_000_000)
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    /// Duration as fractional seconds.
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Absolute magnitude of the duration.
    pub const fn abs(self) -> Self {
        Self(self.0.abs())
    }
}

impl Display for Nanos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

impl From<i64> for Nanos {
    fn from(ns: i64) -> Self {
        Self(ns)
    }
}

impl From<Nanos> for i64 {
    fn from(d: Nanos) -> Self {
        d.0
    }
}

impl Add for Nanos {
    type Output = Nanos;
    fn add(self, rhs: Nanos) -> Nanos {
        Nanos(self.0 + rhs.0)
    }
}

impl Sub for Nanos {
    type Output = Nanos;
    fn sub(self, rhs: Nanos) -> Nanos {
        Nanos(self.0 - rhs.0)
    }
}

impl Neg for Nanos {
    type Output = Nanos;
    fn neg(self) -> Nanos {
        Nanos(-self.0)
    }
}

/// A point on the process-local monotonic timeline (nanoseconds).
///
/// Monotonic time never goes backwards, even when the system clock is
/// stepped, so it is the only timeline used for measuring intervals:
/// pulse cadence, alarm timeouts, sample ages.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct MonoTime(i64);

impl MonoTime {
    pub const fn new(ns: i64) -> Self {
        Self(ns)
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    /// Elapsed time since `earlier`. Negative if `earlier` is in the future.
    pub fn since(self, earlier: MonoTime) -> Nanos {
        Nanos(self.0 - earlier.0)
    }
}

impl Sub for MonoTime {
    type Output = Nanos;
    fn sub(self, rhs: MonoTime) -> Nanos {
        Nanos(self.0 - rhs.0)
    }
}

impl Add<Nanos> for MonoTime {
    type Output = MonoTime;
    fn add(self, rhs: Nanos) -> MonoTime {
        MonoTime(self.0 + rhs.as_nanos())
    }
}

impl AddAssign<Nanos> for MonoTime {
    fn add_assign(&mut self, rhs: Nanos) {
        self.0 += rhs.as_nanos();
    }
}

/// A point on the realtime (wall-clock) timeline, nanoseconds since the
/// UNIX epoch.
///
/// Wall time can jump forwards or backwards when a clock is stepped, so it
/// is never used to measure intervals; it only labels samples and reports.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct WallTime(i64);

impl WallTime {
    pub const fn new(ns: i64) -> Self {
        Self(ns)
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    /// Whole-second component.
    pub const fn secs(self) -> i64 {
        self.0.div_euclid(1_000_000_000)
    }

    /// Sub-second component in nanoseconds, always in `0..1e9`.
    pub const fn subsec_nanos(self) -> i64 {
        self.0.rem_euclid(1_000_000_000)
    }
}

impl Sub for WallTime {
    type Output = Nanos;
    fn sub(self, rhs: WallTime) -> Nanos {
        Nanos(self.0 - rhs.0)
    }
}

impl Add<Nanos> for WallTime {
    type Output = WallTime;
    fn add(self, rhs: Nanos) -> WallTime {
        WallTime(self.0 + rhs.as_nanos())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs(), self.subsec_nanos())
    }
}

// ============================================================================
// Sync-instance state machine
// ============================================================================

/// State of a sync-module instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    /// Waiting for the first valid event from the source.
    #[default]
    Listening,
    /// Receiving events and disciplining (or ready to discipline) the clock.
    Slave,
    /// The event source reported an error; waiting for it to recover.
    Faulty,
}

impl Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Listening => "listening",
            SyncState::Slave => "slave",
            SyncState::Faulty => "faulty",
        };
        f.write_str(s)
    }
}

/// Alarm conditions raised while an instance is in [`SyncState::Slave`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Alarm {
    /// No event seen for longer than the alarm timeout.
    NoSignal,
    /// Event sequence numbers are discontinuous.
    SeqNumError,
    /// Pulse period fell outside the accepted band.
    BadSignal,
    /// The time-of-day source is not providing usable time.
    NoTimeOfDay,
}

impl Alarm {
    const ALL: [Alarm; 4] = [
        Alarm::NoSignal,
        Alarm::SeqNumError,
        Alarm::BadSignal,
        Alarm::NoTimeOfDay,
    ];

    const fn bit(self) -> u8 {
        match self {
            Alarm::NoSignal => 1 << 0,
            Alarm::SeqNumError => 1 << 1,
            Alarm::BadSignal => 1 << 2,
            Alarm::NoTimeOfDay => 1 << 3,
        }
    }
}

impl Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Alarm::NoSignal => "no-signal",
            Alarm::SeqNumError => "seq-num-error",
            Alarm::BadSignal => "bad-signal",
            Alarm::NoTimeOfDay => "no-time-of-day",
        };
        f.write_str(s)
    }
}

/// A set of [`Alarm`] conditions, stored as a bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AlarmSet(u8);

impl AlarmSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn set(&mut self, alarm: Alarm) {
        self.0 |= alarm.bit();
    }

    pub fn clear(&mut self, alarm: Alarm) {
        self.0 &= !alarm.bit();
    }

    pub const fn contains(self, alarm: Alarm) -> bool {
        self.0 & alarm.bit() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates over the alarms currently raised.
    pub fn iter(self) -> impl Iterator<Item = Alarm> {
        Alarm::ALL.into_iter().filter(move |a| self.contains(*a))
    }
}

impl Display for AlarmSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for alarm in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{alarm}")?;
            first = false;
        }
        Ok(())
    }
}

// ============================================================================
// Control flags
// ============================================================================

/// Per-instance control flags set by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlFlag {
    /// This instance is the currently selected reference.
    Selected,
    /// This instance may adjust its local reference clock.
    ClockCtrl,
    /// This instance processes event timestamps (as opposed to merely
    /// tracking signal presence).
    TimestampProcessing,
    /// This instance contributes its offset to clustering evaluation.
    ClusteringDeterminant,
}

impl ControlFlag {
    const fn bit(self) -> u8 {
        match self {
            ControlFlag::Selected => 1 << 0,
            ControlFlag::ClockCtrl => 1 << 1,
            ControlFlag::TimestampProcessing => 1 << 2,
            ControlFlag::ClusteringDeterminant => 1 << 3,
        }
    }
}

/// A set of [`ControlFlag`]s with masked-update semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ControlFlags(u8);

impl ControlFlags {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn with(mut self, flag: ControlFlag) -> Self {
        self.0 |= flag.bit();
        self
    }

    pub const fn contains(self, flag: ControlFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    /// Builds the mask covering the given flags.
    pub fn mask_of(flags: &[ControlFlag]) -> ControlFlags {
        let mut mask = ControlFlags::empty();
        for f in flags {
            mask = mask.with(*f);
        }
        mask
    }

    /// Applies a masked update: `new = (old & !mask) | (flags & mask)`.
    ///
    /// Returns the previous value so callers can detect edges.
    pub fn apply(&mut self, mask: ControlFlags, flags: ControlFlags) -> ControlFlags {
        let old = *self;
        self.0 = (self.0 & !mask.0) | (flags.0 & mask.0);
        old
    }
}

// ============================================================================
// Master metadata
// ============================================================================

/// Quality class of the remote master clock, as configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClockClass {
    /// Locked to its reference.
    Locked,
    /// Lost its reference but still within holdover specification.
    Holdover,
    /// Free-running oscillator.
    #[default]
    Freerunning,
}

impl Display for ClockClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClockClass::Locked => "locked",
            ClockClass::Holdover => "holdover",
            ClockClass::Freerunning => "freerunning",
        };
        f.write_str(s)
    }
}

/// The kind of reference behind the remote master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeSource {
    Atomic,
    Gps,
    Ptp,
    Ntp,
    #[default]
    Oscillator,
}

impl Display for TimeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeSource::Atomic => "atomic",
            TimeSource::Gps => "gps",
            TimeSource::Ptp => "ptp",
            TimeSource::Ntp => "ntp",
            TimeSource::Oscillator => "oscillator",
        };
        f.write_str(s)
    }
}

/// Stated accuracy of a time source, in nanoseconds, or unknown.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Accuracy {
    #[default]
    Unknown,
    Nanoseconds(f64),
}

impl Display for Accuracy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Accuracy::Unknown => f.write_str("unknown"),
            Accuracy::Nanoseconds(ns) => write!(f, "{ns}ns"),
        }
    }
}

/// Static metadata describing the remote master driving an instance.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MasterInfo {
    pub clock_class: ClockClass,
    pub time_source: TimeSource,
    pub accuracy: Accuracy,
    /// Whether the master is traceable to a time standard.
    pub traceable_time: bool,
    /// Whether the master is traceable to a frequency standard.
    pub traceable_freq: bool,
    /// Number of network hops between the grandmaster and this instance.
    pub steps_removed: u32,
}

// ============================================================================
// Status reporting
// ============================================================================

/// A fully-populated status record for one sync-module instance.
///
/// Sent to the engine in `GET_STATUS` replies and in asynchronous
/// state-change notifications. `offset_valid` is false outside
/// [`SyncState::Slave`]; consumers must not treat `offset_from_master_ns`
/// as usable when it is clear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    /// Instance name (section name from configuration).
    pub name: String,
    pub state: SyncState,
    pub alarms: AlarmSet,
    /// Identifier of the local reference clock being disciplined.
    pub clock: String,
    /// Accuracy of the local pulse source itself.
    pub local_accuracy: Accuracy,
    pub master: MasterInfo,
    /// Current filtered offset from the master, nanoseconds.
    pub offset_from_master_ns: f64,
    /// Whether `offset_from_master_ns` is currently meaningful.
    pub offset_valid: bool,
    /// Offset magnitude reported for clustering evaluation, when this
    /// instance is a clustering determinant.
    pub clustering_score: f64,
    /// Selection priority from configuration; smaller wins.
    pub user_priority: u32,
}

// ============================================================================
// Event-source samples
// ============================================================================

/// Sequence sentinel meaning "the source does not provide sequence numbers".
pub const SEQ_NONE: u32 = u32::MAX;

/// One timed event from a pulse source: a sequence number and the hardware
/// timestamp of the pulse edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseEvent {
    /// Source-assigned sequence number, or [`SEQ_NONE`].
    pub seq: u32,
    /// Hardware timestamp of the event on the realtime timeline.
    pub timestamp: WallTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nanos_arithmetic() {
        let a = Nanos::from_secs(2);
        let b = Nanos::from_millis(500);
        assert_eq!((a + b).as_nanos(), 2_500_000_000);
        assert_eq!((a - b).as_nanos(), 1_500_000_000);
        assert_eq!((-b).as_nanos(), -500_000_000);
        assert_eq!(Nanos::new(-7).abs().as_nanos(), 7);
    }

    #[test]
    fn walltime_components() {
        let t = WallTime::new(1_700_000_000_123_456_789);
        assert_eq!(t.secs(), 1_700_000_000);
        assert_eq!(t.subsec_nanos(), 123_456_789);
    }

    #[test]
    fn walltime_components_negative() {
        // Just before the epoch: seconds round towards -inf, nanos stay positive
        let t = WallTime::new(-1);
        assert_eq!(t.secs(), -1);
        assert_eq!(t.subsec_nanos(), 999_999_999);
    }

    #[test]
    fn monotime_elapsed() {
        let t0 = MonoTime::new(1_000);
        let t1 = t0 + Nanos::new(500);
        assert_eq!(t1.since(t0).as_nanos(), 500);
        assert_eq!((t0 - t1).as_nanos(), -500);
    }

    #[test]
    fn alarm_set_operations() {
        let mut alarms = AlarmSet::empty();
        assert!(alarms.is_empty());

        alarms.set(Alarm::NoSignal);
        alarms.set(Alarm::BadSignal);
        assert!(alarms.contains(Alarm::NoSignal));
        assert!(alarms.contains(Alarm::BadSignal));
        assert!(!alarms.contains(Alarm::SeqNumError));

        alarms.clear(Alarm::NoSignal);
        assert!(!alarms.contains(Alarm::NoSignal));
        assert!(!alarms.is_empty());

        assert_eq!(alarms.to_string(), "bad-signal");
    }

    #[test]
    fn alarm_set_display_lists_all() {
        let mut alarms = AlarmSet::empty();
        assert_eq!(alarms.to_string(), "none");
        alarms.set(Alarm::SeqNumError);
        alarms.set(Alarm::NoTimeOfDay);
        assert_eq!(alarms.to_string(), "seq-num-error,no-time-of-day");
    }

    #[test]
    fn control_flags_masked_apply() {
        let mut flags = ControlFlags::empty()
            .with(ControlFlag::ClockCtrl)
            .with(ControlFlag::TimestampProcessing);

        // Clear ClockCtrl, leave everything else untouched
        let mask = ControlFlags::mask_of(&[ControlFlag::ClockCtrl]);
        let old = flags.apply(mask, ControlFlags::empty());

        assert!(old.contains(ControlFlag::ClockCtrl));
        assert!(!flags.contains(ControlFlag::ClockCtrl));
        assert!(flags.contains(ControlFlag::TimestampProcessing));
    }

    #[test]
    fn control_flags_zero_mask_is_noop() {
        let mut flags = ControlFlags::empty().with(ControlFlag::Selected);
        let before = flags;
        flags.apply(
            ControlFlags::empty(),
            ControlFlags::empty().with(ControlFlag::ClockCtrl),
        );
        assert_eq!(flags, before);
    }

    #[test]
    fn sync_state_display() {
        assert_eq!(SyncState::Listening.to_string(), "listening");
        assert_eq!(SyncState::Slave.to_string(), "slave");
        assert_eq!(SyncState::Faulty.to_string(), "faulty");
    }
}
