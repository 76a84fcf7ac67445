//! Streaming statistics accumulator for long-term reporting periods.

/// Count / min / mean / max / standard deviation over a stream of offset
/// samples, using Welford's online algorithm for numerical stability.
///
/// One accumulator covers one statistics period; `take()` snapshots and
/// clears it when the period closes.
#[derive(Debug, Clone, Default)]
pub struct OffsetStats {
    count: u64,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
}

impl OffsetStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one sample.
    pub fn record(&mut self, value: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Smallest recorded value, or 0 when empty.
    pub fn min(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.min }
    }

    /// Largest recorded value, or 0 when empty.
    pub fn max(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.max }
    }

    /// Arithmetic mean, or 0 when empty.
    pub fn mean(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.mean }
    }

    /// Population standard deviation, or 0 with fewer than two samples.
    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }

    /// Snapshots the current figures and clears the accumulator.
    pub fn take(&mut self) -> OffsetStats {
        std::mem::take(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_accumulator_reports_zeros() {
        let stats = OffsetStats::new();
        assert_eq!(stats.count(), 0);
        assert_eq!(stats.min(), 0.0);
        assert_eq!(stats.max(), 0.0);
        assert_eq!(stats.mean(), 0.0);
        assert_eq!(stats.std_dev(), 0.0);
    }

    #[test]
    fn basic_figures() {
        let mut stats = OffsetStats::new();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            stats.record(v);
        }
        assert_eq!(stats.count(), 8);
        assert_eq!(stats.min(), 2.0);
        assert_eq!(stats.max(), 9.0);
        assert_eq!(stats.mean(), 5.0);
        assert!((stats.std_dev() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn negative_values_handled() {
        let mut stats = OffsetStats::new();
        stats.record(-10.0);
        stats.record(10.0);
        assert_eq!(stats.min(), -10.0);
        assert_eq!(stats.max(), 10.0);
        assert_eq!(stats.mean(), 0.0);
    }

    #[test]
    fn take_snapshots_and_clears() {
        let mut stats = OffsetStats::new();
        stats.record(1.0);
        stats.record(3.0);

        let period = stats.take();
        assert_eq!(period.count(), 2);
        assert_eq!(period.mean(), 2.0);

        assert_eq!(stats.count(), 0);
        assert_eq!(stats.mean(), 0.0);
    }

    proptest! {
        /// Welford's mean matches the naive sum/count mean.
        #[test]
        fn prop_mean_matches_naive(values in prop::collection::vec(-1e9f64..1e9, 1..100)) {
            let mut stats = OffsetStats::new();
            for v in &values {
                stats.record(*v);
            }
            let naive = values.iter().sum::<f64>() / values.len() as f64;
            prop_assert!((stats.mean() - naive).abs() < 1e-3);
        }

        /// Min and max bracket the mean.
        #[test]
        fn prop_min_max_bracket_mean(values in prop::collection::vec(-1e9f64..1e9, 1..100)) {
            let mut stats = OffsetStats::new();
            for v in &values {
                stats.record(*v);
            }
            prop_assert!(stats.min() <= stats.mean() + 1e-6);
            prop_assert!(stats.mean() <= stats.max() + 1e-6);
        }
    }
}
