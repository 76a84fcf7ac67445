//! Sync-module protocol messages.
//!
//! One enum of message kinds for the module worker; synchronous operations
//! carry a reply slot, asynchronous ones do not:
//!
//! | Message | Direction | Reply |
//! |---|---|---|
//! | [`SyncMsg::Run`] | engine → module | — |
//! | [`SyncMsg::GetStatus`] | engine → module | status record |
//! | [`SyncMsg::Control`] | engine → module | ack |
//! | [`SyncMsg::StepClock`] | engine → module | ack |
//! | [`SyncMsg::LogStats`] | engine → module | — |
//! | [`SyncMsg::SaveState`] | engine → module | — |
//! | [`SyncMsg::WriteTopology`] | engine → module | text fragment |
//! | [`SyncMsg::StatsEndPeriod`] | engine → module | — |
//! | [`SyncMsg::TestMode`] | engine → module | — |
//! | [`SyncMsg::PidAdjust`] | engine → all modules | — |
//! | [`SyncMsg::FeedCycle`] | feed → module | — |
//! | [`SyncMsg::StepNotice`] | sibling module → module | — |
//!
//! Module-to-engine traffic is the [`EngineEvent`] enum, delivered through
//! an [`EngineSink`] with allocate-or-skip semantics.

use serde::Serialize;
use syntond_feed::CycleEvent;
use syntond_runtime::ReplySender;
use syntond_types::{ControlFlags, InstanceStatus, Nanos, SyncState, WallTime};

use crate::SyncError;

/// Bit identifying the SHM module type in `PidAdjust` multicasts.
pub const SERVO_TYPE_SHM: u32 = 1 << 0;

/// All module types.
pub const SERVO_TYPE_ALL: u32 = u32::MAX;

/// Named test behaviours toggled by `TestMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestModeId {
    /// Synthesize pulse events in the polling path instead of reading the
    /// event source; occasionally corrupts the sequence number.
    BogusEvents,
}

/// Messages handled by the SHM module worker.
pub enum SyncMsg {
    /// Start processing: arms per-instance timers and begins polling.
    Run,

    /// Full status record for one instance.
    GetStatus {
        instance: String,
        reply: ReplySender<Result<InstanceStatus, SyncError>>,
    },

    /// Masked control-flag update: `new = (old & !mask) | (flags & mask)`.
    Control {
        instance: String,
        mask: ControlFlags,
        flags: ControlFlags,
        reply: ReplySender<Result<(), SyncError>>,
    },

    /// Forced clock step.
    StepClock {
        instance: String,
        offset: Nanos,
        reply: ReplySender<Result<(), SyncError>>,
    },

    /// Emit a real-time statistics snapshot to the log.
    LogStats,

    /// Persist per-instance state summaries and, where eligible, frequency
    /// corrections.
    SaveState,

    /// Human-readable topology fragment for one instance.
    WriteTopology {
        instance: String,
        reply: ReplySender<Result<String, SyncError>>,
    },

    /// Close the statistics period ending at `time` and write it out.
    StatsEndPeriod { time: WallTime },

    /// Toggle a named test mode on one instance.
    TestMode { instance: String, mode: TestModeId },

    /// Servo re-tuning multicast. Applies when `module_mask` includes this
    /// module's type bit; `None` coefficients keep their current values.
    PidAdjust {
        module_mask: u32,
        kp: Option<f64>,
        ki: Option<f64>,
        kd: Option<f64>,
        reset: bool,
    },

    /// Cycle-complete notification from the clock feed.
    FeedCycle(CycleEvent),

    /// A sibling module stepped the clock this module's time-of-day output
    /// feeds; flush filtered history.
    StepNotice { instance: String, offset: Nanos },
}

/// One real-time statistics record, emitted after each accepted servo
/// sample and serialized as JSON for downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RtStatsRecord {
    pub instance: String,
    /// Realtime timestamp of the sample, nanoseconds since the epoch.
    pub timestamp_ns: i64,
    /// Filtered offset from master, nanoseconds.
    pub offset_from_master_ns: f64,
    /// Current frequency correction, ppb.
    pub freq_adjust_ppb: f64,
    /// Whether the convergence measure currently holds.
    pub synchronized: bool,
    /// Most recent pulse period, nanoseconds.
    pub period_ns: f64,
}

/// Asynchronous module-to-engine notifications.
#[derive(Debug)]
pub enum EngineEvent {
    /// State, alarms or clustering score changed; carries the full record.
    StateChanged(InstanceStatus),
    /// A servo sample was accepted.
    RtStats(RtStatsRecord),
}

/// Delivery endpoint for [`EngineEvent`]s.
///
/// Returning the event signals backpressure; the module drops the
/// notification rather than blocking its own loop.
pub struct EngineSink {
    deliver: Box<dyn Fn(EngineEvent) -> Result<(), EngineEvent> + Send>,
}

impl EngineSink {
    pub fn new(deliver: impl Fn(EngineEvent) -> Result<(), EngineEvent> + Send + 'static) -> Self {
        Self {
            deliver: Box::new(deliver),
        }
    }

    /// A sink that discards everything; for tests and detached modules.
    pub fn discard() -> Self {
        Self::new(|_| Ok(()))
    }

    pub fn emit(&self, event: EngineEvent) {
        if (self.deliver)(event).is_err() {
            tracing::debug!("engine event dropped: engine busy");
        }
    }
}

impl std::fmt::Debug for EngineSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSink").finish_non_exhaustive()
    }
}

/// Status a time-of-day source reports to its consumers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TodStatus {
    pub state: SyncState,
    /// Master-to-system offset, nanoseconds.
    pub offset_from_master_ns: f64,
}

/// Handle to the sync instance providing time-of-day.
///
/// The engine wires this to a `GetStatus` round-trip on the providing
/// module's worker; `status` returning `None` means the provider could not
/// be reached.
pub trait TimeOfDaySource: Send {
    /// Name of the providing instance.
    fn name(&self) -> &str;

    /// Fetches the provider's current status.
    fn status(&mut self) -> Option<TodStatus>;

    /// Tells the provider that this module stepped the local clock.
    fn notify_step(&mut self, offset: Nanos);
}
