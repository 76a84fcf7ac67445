//! The system realtime clock.

use std::sync::Mutex;

use syntond_types::{Nanos, WallTime};

use crate::{realtime_now, ClockError, ClockId, ReferenceClock};

/// Default frequency range of the system clock, in ppb (500 ppm, the
/// conventional kernel limit for realtime clock slewing).
const SYSTEM_MAX_FREQ_PPB: f64 = 500_000.0;

#[derive(Debug, Default)]
struct SystemClockState {
    freq_adjust_ppb: f64,
    event_source_enabled: bool,
}

/// Handle for the system realtime clock.
///
/// Reads go straight to the OS. Slewing a production system clock is the
/// job of a privileged kernel adjunct outside this crate; the requested
/// frequency corrections are recorded on the handle for it and logged,
/// which keeps the servo loop and its reporting fully exercisable without
/// elevated privileges. Stepping has no such deferred path and is refused.
#[derive(Debug)]
pub struct SystemClock {
    id: ClockId,
    state: Mutex<SystemClockState>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            id: ClockId::system(),
            state: Mutex::new(SystemClockState::default()),
        }
    }

    /// The most recently requested frequency adjustment.
    pub fn requested_frequency_ppb(&self) -> f64 {
        self.state.lock().expect("system clock state poisoned").freq_adjust_ppb
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceClock for SystemClock {
    fn id(&self) -> &ClockId {
        &self.id
    }

    fn read(&self) -> Result<WallTime, ClockError> {
        Ok(realtime_now())
    }

    fn compare_to_system(&self) -> Result<Nanos, ClockError> {
        // This *is* the system clock.
        Ok(Nanos::ZERO)
    }

    fn adjust_frequency(&self, ppb: f64) -> Result<(), ClockError> {
        if ppb.abs() > SYSTEM_MAX_FREQ_PPB {
            return Err(ClockError::FrequencyRange {
                requested_ppb: ppb,
                max_ppb: SYSTEM_MAX_FREQ_PPB,
            });
        }
        let mut state = self.state.lock().expect("system clock state poisoned");
        state.freq_adjust_ppb = ppb;
        tracing::debug!(ppb, "system clock frequency adjustment recorded");
        Ok(())
    }

    fn step(&self, offset: Nanos) -> Result<(), ClockError> {
        tracing::warn!(
            offset_ns = offset.as_nanos(),
            "system clock cannot be stepped from here"
        );
        Err(ClockError::Unsupported {
            clock: self.id.to_string(),
            operation: "step",
        })
    }

    fn max_frequency_adjustment_ppb(&self) -> f64 {
        SYSTEM_MAX_FREQ_PPB
    }

    fn set_timed_event_source(&self, enable: bool) -> Result<(), ClockError> {
        let mut state = self.state.lock().expect("system clock state poisoned");
        if enable && state.event_source_enabled {
            return Err(ClockError::EventSourceBusy {
                clock: self.id.to_string(),
            });
        }
        if !enable && !state.event_source_enabled {
            return Err(ClockError::EventSourceIdle {
                clock: self.id.to_string(),
            });
        }
        state.event_source_enabled = enable;
        Ok(())
    }
}
