//! # syntond-sync: The SHM sync module
//!
//! A sync module disciplines a local reference clock from one kind of time
//! source. This crate implements the SHM flavour: a per-instance state
//! machine fed by `(sequence, hardware timestamp)` pulse events plus an
//! auxiliary time-of-day reference, driving a notch → outlier → FIR → PID
//! conditioning pipeline that either slews or steps the clock.
//!
//! The module runs as one worker thread owning every configured instance.
//! The engine talks to it exclusively through [`SyncMsg`] messages (see
//! [`message`] for the full table); the module answers with synchronous
//! replies and asynchronous [`EngineEvent`] notifications.
//!
//! # State machine
//!
//! ```text
//!             first valid event
//!  LISTENING ───────────────────► SLAVE ──┐ no event for 60s
//!      ▲  ▲                        │  ▲   └────────────────► LISTENING
//!      │  │ successful read        │  │
//!      │  └────────── FAULTY ◄─────┘  │ alarms while SLAVE:
//!      │                source error  │ NO_SIGNAL (silent >1.1s),
//!      └──────────────────────────────┘ SEQ_NUM_ERROR, BAD_SIGNAL,
//!                                       NO_TIME_OF_DAY
//! ```

mod error;
mod event_source;
mod instance;
mod message;
mod reporting;
mod shm;

pub use error::SyncError;
pub use event_source::{EventSource, EventSourceFault, PulseInjector, QueuedPulseSource};
pub use instance::{
    Counters, InstanceParams, ShmInstance, ALARM_TIMEOUT, EVENT_TIMEOUT, PULSE_CHECK_INTERVAL,
    REQUIRED_GOOD_PERIODS, STEP_THRESHOLD_NS,
};
pub use message::{
    EngineEvent, EngineSink, RtStatsRecord, SyncMsg, TestModeId, TimeOfDaySource, TodStatus,
    SERVO_TYPE_ALL, SERVO_TYPE_SHM,
};
pub use reporting::{state_file_content, stats_line, topology_fragment};
pub use shm::{ModuleParams, ShmHandle, ShmModule};
