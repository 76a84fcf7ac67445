//! # syntond-filters: Signal-conditioning and servo primitives
//!
//! The building blocks of the clock-discipline pipeline, in the order a
//! sample flows through them:
//!
//! - [`NotchFilter`] — accept/reject band around the nominal pulse period
//! - [`FirFilter`] — N-tap moving average over accepted offsets
//! - [`PeirceFilter`] — statistical outlier rejection (Peirce's criterion)
//! - [`PidFilter`] — proportional–integral(–derivative) controller producing
//!   the frequency correction
//! - [`ConvergenceMeasure`] — sustained-confinement test deciding the
//!   "synchronized" flag
//! - [`OffsetStats`] — streaming min/mean/max/std-dev accumulator for
//!   long-term statistics periods
//!
//! Every primitive is a plain value owned by a single sync-module instance;
//! nothing here is shared across threads.

mod convergence;
mod fir;
mod notch;
mod peirce;
mod pid;
mod stats;

pub use convergence::ConvergenceMeasure;
pub use fir::{FirFilter, FIR_DEPTH_MAX};
pub use notch::NotchFilter;
pub use peirce::{PeirceFilter, PEIRCE_SIZE_MAX, PEIRCE_SIZE_MIN};
pub use pid::PidFilter;
pub use stats::OffsetStats;

/// A sample rejected by a conditioning filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SampleRejected {
    /// The value fell outside the accepted band.
    #[error("sample outside accepted band")]
    OutsideBand,
    /// The value was statistically identified as an outlier.
    #[error("sample rejected as outlier")]
    Outlier,
}
