//! Configuration error types.

/// Errors from configuration validation.
///
/// All of these are rejected at module startup: an instance with invalid
/// configuration never starts, while sibling instances continue.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required option is missing.
    #[error("instance {instance}: required option `{option}` is missing")]
    MissingOption {
        instance: String,
        option: &'static str,
    },

    /// A numeric option is outside its permitted range.
    #[error("instance {instance}: option `{option}` = {value} outside {min}..={max}")]
    OutOfRange {
        instance: String,
        option: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// An option has a value the daemon does not recognize.
    #[error("instance {instance}: option `{option}` has invalid value `{value}`")]
    InvalidValue {
        instance: String,
        option: &'static str,
        value: String,
    },

    /// Two instances reference each other inconsistently.
    #[error("instance {instance}: time-of-day source `{time_source}` is not a configured instance")]
    UnknownTimeOfDaySource {
        instance: String,
        time_source: String,
    },
}
