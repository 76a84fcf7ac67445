//! # syntond-config: Configuration management
//!
//! A hierarchical section store: daemon-wide options under `[general]`, and
//! one section per sync-module instance under the module-type category
//! (`[shm.<name>]`). Loading merges built-in defaults, system and local
//! TOML files and `SYNTOND_*` environment variables, in that precedence
//! order; validation happens afterwards, per instance, so one bad section
//! cannot take down its siblings.

mod error;
mod loader;
mod paths;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use syntond_types::{Accuracy, ClockClass, TimeSource};

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// How the daemon is allowed to correct a clock's offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepPolicy {
    /// Never step; always slew, however long it takes.
    SlewOnly,
    /// Step whenever the offset exceeds the step threshold.
    #[default]
    SlewAndStep,
    /// Step only for the first correction after startup, slew afterwards.
    StepAtStartup,
    /// Step only if it moves the clock forwards, slew otherwise.
    StepForward,
}

impl StepPolicy {
    /// Whether this policy permits stepping for the given correction.
    ///
    /// `first_update` is true until an instance has applied its first
    /// correction; `diff_ns` is the measured offset (the step applied would
    /// be its negation).
    pub fn permits_step(self, first_update: bool, diff_ns: f64) -> bool {
        match self {
            StepPolicy::SlewOnly => false,
            StepPolicy::SlewAndStep => true,
            StepPolicy::StepAtStartup => first_update,
            StepPolicy::StepForward => diff_ns < 0.0,
        }
    }
}

/// Kind of signal an SHM instance consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShmSourceType {
    /// Pulse plus time-of-day from the same source.
    #[default]
    Complete,
    /// Time-of-day only.
    Tod,
    /// Pulse-per-second only; time-of-day comes from another instance.
    Pps,
}

/// Outlier filter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutlierFilterType {
    Disabled,
    #[default]
    StdDev,
}

/// Traceability claims for the remote master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceabilityFlag {
    Time,
    Freq,
}

/// `master_accuracy` accepts a number of nanoseconds or the keyword
/// `unknown`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AccuracyOption {
    Nanoseconds(f64),
    Keyword(String),
}

impl AccuracyOption {
    fn to_accuracy(&self) -> Option<Accuracy> {
        match self {
            AccuracyOption::Nanoseconds(ns) if ns.is_finite() && *ns >= 0.0 => {
                Some(Accuracy::Nanoseconds(*ns))
            }
            AccuracyOption::Keyword(kw) if kw == "unknown" => Some(Accuracy::Unknown),
            _ => None,
        }
    }
}

// Bounds mirrored from the filter primitives; re-validated here so a bad
// config fails at load time instead of panicking in a worker thread.
const FIR_SIZE_RANGE: (usize, usize) = (1, 128);
const OUTLIER_SIZE_RANGE: (usize, usize) = (3, 60);

fn default_priority() -> u32 {
    128
}

fn default_steps_removed() -> u32 {
    1
}

fn default_pid_p() -> f64 {
    0.05
}

fn default_pid_i() -> f64 {
    0.001
}

fn default_outlier_size() -> usize {
    30
}

fn default_outlier_adaption() -> f64 {
    1.0
}

fn default_fir_size() -> usize {
    4
}

fn default_sync_threshold() -> f64 {
    1_000.0
}

/// Configuration for one SHM sync-module instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShmInstanceConfig {
    /// NIC whose hardware clock this instance disciplines; must support
    /// hardware timestamping. The name `system` binds the instance to the
    /// system realtime clock instead.
    pub interface: String,

    /// Selection priority; smaller wins.
    #[serde(default = "default_priority")]
    pub priority: u32,

    #[serde(default)]
    pub shm_source_type: ShmSourceType,

    /// Name of another sync instance providing time-of-day. Required for
    /// pulse-only sources.
    #[serde(default)]
    pub time_of_day: Option<String>,

    #[serde(default)]
    pub master_clock_class: ClockClass,

    #[serde(default)]
    pub master_time_source: TimeSource,

    #[serde(default)]
    pub master_accuracy: Option<AccuracyOption>,

    #[serde(default)]
    pub master_traceability: Vec<TraceabilityFlag>,

    #[serde(default = "default_steps_removed")]
    pub steps_removed: u32,

    /// Propagation-delay compensation, nanoseconds.
    #[serde(default)]
    pub shm_delay: f64,

    #[serde(default = "default_pid_p")]
    pub pid_filter_p: f64,

    #[serde(default = "default_pid_i")]
    pub pid_filter_i: f64,

    #[serde(default)]
    pub outlier_filter_type: OutlierFilterType,

    #[serde(default = "default_outlier_size")]
    pub outlier_filter_size: usize,

    #[serde(default = "default_outlier_adaption")]
    pub outlier_filter_adaption: f64,

    #[serde(default = "default_fir_size")]
    pub fir_filter_size: usize,

    /// Convergence threshold, nanoseconds.
    #[serde(default = "default_sync_threshold")]
    pub sync_threshold: f64,
}

impl ShmInstanceConfig {
    /// Minimal config for the named interface; everything else defaulted.
    pub fn for_interface(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            priority: default_priority(),
            shm_source_type: ShmSourceType::default(),
            time_of_day: None,
            master_clock_class: ClockClass::default(),
            master_time_source: TimeSource::default(),
            master_accuracy: None,
            master_traceability: Vec::new(),
            steps_removed: default_steps_removed(),
            shm_delay: 0.0,
            pid_filter_p: default_pid_p(),
            pid_filter_i: default_pid_i(),
            outlier_filter_type: OutlierFilterType::default(),
            outlier_filter_size: default_outlier_size(),
            outlier_filter_adaption: default_outlier_adaption(),
            fir_filter_size: default_fir_size(),
            sync_threshold: default_sync_threshold(),
        }
    }

    /// The master accuracy as a domain value.
    pub fn accuracy(&self) -> Accuracy {
        self.master_accuracy
            .as_ref()
            .and_then(AccuracyOption::to_accuracy)
            .unwrap_or(Accuracy::Unknown)
    }

    pub fn traceable_time(&self) -> bool {
        self.master_traceability.contains(&TraceabilityFlag::Time)
    }

    pub fn traceable_freq(&self) -> bool {
        self.master_traceability.contains(&TraceabilityFlag::Freq)
    }

    /// Validates ranges and cross-field requirements.
    pub fn validate(&self, instance: &str) -> Result<(), ConfigError> {
        let inst = || instance.to_string();

        if self.interface.is_empty() {
            return Err(ConfigError::MissingOption {
                instance: inst(),
                option: "interface",
            });
        }

        let unit_range = |option: &'static str, value: f64| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(ConfigError::OutOfRange {
                    instance: inst(),
                    option,
                    value,
                    min: 0.0,
                    max: 1.0,
                })
            }
        };
        unit_range("pid_filter_p", self.pid_filter_p)?;
        unit_range("pid_filter_i", self.pid_filter_i)?;
        unit_range("outlier_filter_adaption", self.outlier_filter_adaption)?;

        if !(FIR_SIZE_RANGE.0..=FIR_SIZE_RANGE.1).contains(&self.fir_filter_size) {
            return Err(ConfigError::OutOfRange {
                instance: inst(),
                option: "fir_filter_size",
                value: self.fir_filter_size as f64,
                min: FIR_SIZE_RANGE.0 as f64,
                max: FIR_SIZE_RANGE.1 as f64,
            });
        }

        if self.outlier_filter_type != OutlierFilterType::Disabled
            && !(OUTLIER_SIZE_RANGE.0..=OUTLIER_SIZE_RANGE.1).contains(&self.outlier_filter_size)
        {
            return Err(ConfigError::OutOfRange {
                instance: inst(),
                option: "outlier_filter_size",
                value: self.outlier_filter_size as f64,
                min: OUTLIER_SIZE_RANGE.0 as f64,
                max: OUTLIER_SIZE_RANGE.1 as f64,
            });
        }

        if !self.sync_threshold.is_finite() || self.sync_threshold <= 0.0 {
            return Err(ConfigError::OutOfRange {
                instance: inst(),
                option: "sync_threshold",
                value: self.sync_threshold,
                min: f64::MIN_POSITIVE,
                max: f64::MAX,
            });
        }

        if !self.shm_delay.is_finite() {
            return Err(ConfigError::InvalidValue {
                instance: inst(),
                option: "shm_delay",
                value: self.shm_delay.to_string(),
            });
        }

        if let Some(acc) = &self.master_accuracy {
            if acc.to_accuracy().is_none() {
                return Err(ConfigError::InvalidValue {
                    instance: inst(),
                    option: "master_accuracy",
                    value: format!("{acc:?}"),
                });
            }
        }

        if self.shm_source_type == ShmSourceType::Pps && self.time_of_day.is_none() {
            return Err(ConfigError::MissingOption {
                instance: inst(),
                option: "time_of_day",
            });
        }

        Ok(())
    }
}

/// Daemon-wide options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory for state and frequency-correction files.
    pub state_dir: PathBuf,
    /// Directory for long-term statistics files.
    pub stats_dir: PathBuf,
    /// Step-vs-slew policy, shared by all instances.
    pub clock_ctrl: StepPolicy,
    /// Feed sampling period as log2 seconds (-2 = 250 ms).
    pub feed_poll_period_log2: i32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/syntond"),
            stats_dir: PathBuf::from("/var/lib/syntond/stats"),
            clock_ctrl: StepPolicy::default(),
            feed_poll_period_log2: -2,
        }
    }
}

/// The daemon's full configuration tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntondConfig {
    pub general: GeneralConfig,
    /// SHM instances, keyed by instance name.
    pub shm: BTreeMap<String, ShmInstanceConfig>,
}

impl SyntondConfig {
    /// Validates every instance section and cross-instance references.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, instance) in &self.shm {
            instance.validate(name)?;
            if let Some(tod) = &instance.time_of_day {
                if !self.shm.contains_key(tod) {
                    return Err(ConfigError::UnknownTimeOfDaySource {
                        instance: name.clone(),
                        time_source: tod.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
