//! Outlier rejection using Peirce's criterion.
//!
//! Peirce's criterion gives, for a sample set of size N drawn from a normal
//! distribution, the largest deviation-to-standard-deviation ratio a value
//! may have before it is more probable that the value is erroneous than that
//! it belongs to the distribution. Unlike fixed k-sigma tests the ratio
//! grows with N, so large windows do not over-reject.
//!
//! # References
//!
//! - Peirce, B. (1852): "Criterion for the rejection of doubtful observations"
//! - Ross, S. M. (2003): "Peirce's criterion for the elimination of suspect
//!   experimental data", Journal of Engineering Technology

use std::collections::VecDeque;

use crate::SampleRejected;

/// Smallest window size with a defined criterion ratio.
pub const PEIRCE_SIZE_MIN: usize = 3;

/// Largest supported window size.
pub const PEIRCE_SIZE_MAX: usize = 60;

/// Maximum |deviation| / std-dev ratios for one doubtful observation,
/// indexed by `N - PEIRCE_SIZE_MIN` for N in 3..=60 (Ross 2003).
const PEIRCE_RATIO: [f64; 58] = [
    1.196, 1.383, 1.509, 1.610, 1.693, 1.763, 1.824, 1.878, // N = 3..=10
    1.925, 1.969, 2.007, 2.043, 2.076, 2.106, 2.134, 2.161, // N = 11..=18
    2.185, 2.209, 2.230, 2.251, 2.271, 2.290, 2.307, 2.324, // N = 19..=26
    2.341, 2.356, 2.371, 2.385, 2.399, 2.412, 2.425, 2.438, // N = 27..=34
    2.450, 2.461, 2.472, 2.483, 2.494, 2.504, 2.514, 2.524, // N = 35..=42
    2.533, 2.542, 2.551, 2.560, 2.568, 2.577, 2.585, 2.592, // N = 43..=50
    2.600, 2.608, 2.615, 2.622, 2.629, 2.636, 2.643, 2.649, // N = 51..=58
    2.656, 2.662, // N = 59..=60
];

/// Rolling-window outlier filter based on Peirce's criterion.
///
/// Maintains the last `size` samples. Each new value is tested against the
/// window's mean and standard deviation; a value whose deviation exceeds the
/// criterion is declared an outlier. Outliers are not stored verbatim:
/// `mean + adaption * (value - mean)` enters the window instead, so a level
/// shift in the input eventually pulls the window along rather than being
/// rejected forever.
#[derive(Debug, Clone)]
pub struct PeirceFilter {
    size: usize,
    adaption: f64,
    samples: VecDeque<f64>,
}

impl PeirceFilter {
    /// # Panics
    ///
    /// Panics if `size` is outside [`PEIRCE_SIZE_MIN`]`..=`[`PEIRCE_SIZE_MAX`]
    /// or `adaption` is outside `0.0..=1.0`.
    pub fn new(size: usize, adaption: f64) -> Self {
        assert!(
            (PEIRCE_SIZE_MIN..=PEIRCE_SIZE_MAX).contains(&size),
            "peirce window size must be in {PEIRCE_SIZE_MIN}..={PEIRCE_SIZE_MAX}"
        );
        assert!(
            (0.0..=1.0).contains(&adaption),
            "peirce adaption must be in 0..=1"
        );
        Self {
            size,
            adaption,
            samples: VecDeque::with_capacity(size),
        }
    }

    /// The criterion ratio for a window of `n` samples.
    fn ratio(n: usize) -> f64 {
        debug_assert!(n >= PEIRCE_SIZE_MIN);
        let n = n.min(PEIRCE_SIZE_MAX);
        PEIRCE_RATIO[n - PEIRCE_SIZE_MIN]
    }

    fn mean(&self) -> f64 {
        let sum: f64 = self.samples.iter().sum();
        sum / self.samples.len() as f64
    }

    fn std_dev(&self, mean: f64) -> f64 {
        let n = self.samples.len() as f64;
        let var: f64 = self.samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        var.sqrt()
    }

    /// Tests one value against the window and absorbs it.
    ///
    /// Returns `Err(SampleRejected::Outlier)` when the value failed the
    /// criterion (the damped value was stored in its place).
    pub fn update(&mut self, value: f64) -> Result<(), SampleRejected> {
        // Until the window reaches the criterion's domain, accept everything.
        if self.samples.len() < PEIRCE_SIZE_MIN {
            self.push(value);
            return Ok(());
        }

        let mean = self.mean();
        let std_dev = self.std_dev(mean);
        let threshold = Self::ratio(self.samples.len()) * std_dev;

        // A zero-variance window accepts only exact repeats of the mean.
        if (value - mean).abs() > threshold {
            self.push(mean + self.adaption * (value - mean));
            return Err(SampleRejected::Outlier);
        }

        self.push(value);
        Ok(())
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == self.size {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Clears the window.
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    /// Number of samples currently in the window.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
