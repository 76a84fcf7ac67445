//! # syntond: Daemon core wiring
//!
//! The engine sits above the component crates and owns their lifecycles:
//! it starts the clock feed, builds SHM instances from configuration,
//! spawns the sync-module worker, and drains the module's asynchronous
//! notifications. Everything below it communicates by messages; the engine
//! is the only place where the pieces meet.
//!
//! ```text
//!                 ┌───────────────┐
//!                 │     Engine    │
//!                 └───┬───────┬───┘
//!       run/control/  │       │  state-changed,
//!       status/stats  │       │  rt-stats events
//!                 ┌───▼───┐ ┌─▼─────────┐
//!                 │  SHM  │ │ clock feed│
//!                 │module │◄┤  service  │ cycle events, samples
//!                 └───┬───┘ └─────┬─────┘
//!                 ┌───▼───────────▼───┐
//!                 │ clock abstraction │
//!                 └───────────────────┘
//! ```

mod engine;

pub use engine::Engine;

// Re-exported so embedders need only this crate.
pub use syntond_config::{ConfigLoader, ShmInstanceConfig, StepPolicy, SyntondConfig};
pub use syntond_sync::{EngineEvent, RtStatsRecord, TestModeId};
pub use syntond_types::{InstanceStatus, SyncState};
