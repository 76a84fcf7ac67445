//! Deterministic software clock with a drift model.

use std::sync::Mutex;

use syntond_types::{MonoTime, Nanos, WallTime};

use crate::{monotonic_now, realtime_now, ClockError, ClockId, ReferenceClock};

/// Default frequency adjustment range, in ppb. Hardware clocks on NICs
/// typically accept far larger corrections than the system clock; 1% is a
/// representative bound.
const DEFAULT_MAX_FREQ_PPB: f64 = 10_000_000.0;

#[derive(Debug)]
struct Model {
    /// Monotonic instant at which `offset_ns` was last evaluated.
    last_eval: MonoTime,
    /// Current offset of this clock relative to the system clock.
    offset_ns: f64,
    /// Inherent oscillator drift, ppb. Positive runs fast.
    drift_ppb: f64,
    /// Currently applied frequency adjustment, ppb.
    freq_adjust_ppb: f64,
    /// When set, time only advances through [`SoftwareClock::advance`].
    manual_now: Option<MonoTime>,
    event_source_enabled: bool,
    step_count: u64,
}

impl Model {
    /// Rolls the offset forward to `now` under `drift + adjustment`.
    fn evaluate(&mut self, now: MonoTime) {
        let dt = now.since(self.last_eval);
        if dt > Nanos::ZERO {
            let rate_ppb = self.drift_ppb + self.freq_adjust_ppb;
            self.offset_ns += rate_ppb * 1e-9 * dt.as_nanos() as f64;
            self.last_eval = now;
        }
    }

    fn now(&self) -> MonoTime {
        self.manual_now.unwrap_or_else(monotonic_now)
    }
}

/// A software clock whose offset to the system clock evolves under a
/// configurable drift, and which honours frequency adjustments and steps.
///
/// Two modes:
///
/// - **Free-running** ([`SoftwareClock::new`]): time advances with the real
///   process monotonic clock. Stands in for a NIC hardware clock when the
///   daemon runs without hardware.
/// - **Manual** ([`SoftwareClock::new_manual`]): time advances only through
///   [`advance`](SoftwareClock::advance), which makes servo behaviour exactly
///   reproducible in tests.
#[derive(Debug)]
pub struct SoftwareClock {
    id: ClockId,
    max_freq_ppb: f64,
    model: Mutex<Model>,
}

impl SoftwareClock {
    /// Creates a free-running software clock with zero initial offset and
    /// zero drift.
    pub fn new(id: ClockId) -> Self {
        Self::build(id, None)
    }

    /// Creates a manually-advanced software clock starting at monotonic 0.
    pub fn new_manual(id: ClockId) -> Self {
        Self::build(id, Some(MonoTime::new(0)))
    }

    fn build(id: ClockId, manual_now: Option<MonoTime>) -> Self {
        let start = manual_now.unwrap_or_else(monotonic_now);
        Self {
            id,
            max_freq_ppb: DEFAULT_MAX_FREQ_PPB,
            model: Mutex::new(Model {
                last_eval: start,
                offset_ns: 0.0,
                drift_ppb: 0.0,
                freq_adjust_ppb: 0.0,
                manual_now,
                event_source_enabled: false,
                step_count: 0,
            }),
        }
    }

    /// Overrides the frequency adjustment range.
    pub fn with_max_frequency_ppb(mut self, max_ppb: f64) -> Self {
        assert!(max_ppb > 0.0, "max frequency range must be positive");
        self.max_freq_ppb = max_ppb;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Model> {
        self.model.lock().expect("software clock model poisoned")
    }

    /// Sets the inherent oscillator drift, ppb. Positive runs fast.
    pub fn set_drift_ppb(&self, drift_ppb: f64) {
        let mut model = self.lock();
        let now = model.now();
        model.evaluate(now);
        model.drift_ppb = drift_ppb;
    }

    /// Forces the current offset to the system clock.
    pub fn set_offset(&self, offset: Nanos) {
        let mut model = self.lock();
        let now = model.now();
        model.evaluate(now);
        model.offset_ns = offset.as_nanos() as f64;
    }

    /// Advances a manual-mode clock by `dt`.
    ///
    /// # Panics
    ///
    /// Panics if the clock is free-running.
    pub fn advance(&self, dt: Nanos) {
        assert!(dt >= Nanos::ZERO, "cannot advance time backwards");
        let mut model = self.lock();
        let now = model
            .manual_now
            .expect("advance() is only valid on a manual-mode clock")
            + dt;
        model.manual_now = Some(now);
        model.evaluate(now);
    }

    /// Currently applied frequency adjustment, ppb.
    pub fn frequency_adjustment_ppb(&self) -> f64 {
        self.lock().freq_adjust_ppb
    }

    /// Number of steps applied since creation.
    pub fn step_count(&self) -> u64 {
        self.lock().step_count
    }
}

impl ReferenceClock for SoftwareClock {
    fn id(&self) -> &ClockId {
        &self.id
    }

    fn read(&self) -> Result<WallTime, ClockError> {
        let mut model = self.lock();
        let now = model.now();
        model.evaluate(now);
        Ok(realtime_now() + Nanos::new(model.offset_ns as i64))
    }

    fn compare_to_system(&self) -> Result<Nanos, ClockError> {
        let mut model = self.lock();
        let now = model.now();
        model.evaluate(now);
        Ok(Nanos::new(model.offset_ns as i64))
    }

    fn adjust_frequency(&self, ppb: f64) -> Result<(), ClockError> {
        if ppb.abs() > self.max_freq_ppb {
            return Err(ClockError::FrequencyRange {
                requested_ppb: ppb,
                max_ppb: self.max_freq_ppb,
            });
        }
        let mut model = self.lock();
        let now = model.now();
        model.evaluate(now);
        model.freq_adjust_ppb = ppb;
        Ok(())
    }

    fn step(&self, offset: Nanos) -> Result<(), ClockError> {
        let mut model = self.lock();
        let now = model.now();
        model.evaluate(now);
        model.offset_ns += offset.as_nanos() as f64;
        model.step_count += 1;
        Ok(())
    }

    fn max_frequency_adjustment_ppb(&self) -> f64 {
        self.max_freq_ppb
    }

    fn set_timed_event_source(&self, enable: bool) -> Result<(), ClockError> {
        let mut model = self.lock();
        if enable && model.event_source_enabled {
            return Err(ClockError::EventSourceBusy {
                clock: self.id.to_string(),
            });
        }
        if !enable && !model.event_source_enabled {
            return Err(ClockError::EventSourceIdle {
                clock: self.id.to_string(),
            });
        }
        model.event_source_enabled = enable;
        Ok(())
    }
}
