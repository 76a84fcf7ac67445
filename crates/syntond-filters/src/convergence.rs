//! Sustained-confinement convergence test.

/// Decides whether a clock counts as synchronized: the absolute offset must
/// stay within `max_offset` continuously for at least `min_period` seconds.
///
/// A single excursion restarts the window.
#[derive(Debug, Clone)]
pub struct ConvergenceMeasure {
    max_offset: f64,
    min_period_secs: f64,
    within_since: Option<f64>,
}

impl ConvergenceMeasure {
    /// # Panics
    ///
    /// Panics if either parameter is negative or non-finite.
    pub fn new(max_offset: f64, min_period_secs: f64) -> Self {
        assert!(
            max_offset.is_finite() && max_offset >= 0.0,
            "convergence threshold must be finite and non-negative"
        );
        assert!(
            min_period_secs.is_finite() && min_period_secs >= 0.0,
            "convergence period must be finite and non-negative"
        );
        Self {
            max_offset,
            min_period_secs,
            within_since: None,
        }
    }

    /// Feeds an offset observation at time `now_secs` (monotonic seconds)
    /// and returns whether convergence currently holds.
    pub fn update(&mut self, now_secs: f64, offset: f64) -> bool {
        if offset.abs() > self.max_offset {
            self.within_since = None;
            return false;
        }
        let since = *self.within_since.get_or_insert(now_secs);
        now_secs - since >= self.min_period_secs
    }

    /// Restarts the confinement window.
    pub fn reset(&mut self) {
        self.within_since = None;
    }

    /// The configured offset threshold.
    pub fn max_offset(&self) -> f64 {
        self.max_offset
    }
}
