//! Clock error types.

use std::path::PathBuf;

/// Errors from clock operations.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// The operation is not supported by this clock implementation.
    #[error("clock {clock}: {operation} not supported")]
    Unsupported {
        clock: String,
        operation: &'static str,
    },

    /// Requested frequency adjustment exceeds the clock's range.
    #[error("frequency adjustment {requested_ppb}ppb exceeds maximum {max_ppb}ppb")]
    FrequencyRange { requested_ppb: f64, max_ppb: f64 },

    /// The clock's timed-event source already has a consumer.
    #[error("clock {clock}: timed-event source already in use")]
    EventSourceBusy { clock: String },

    /// The clock's timed-event source is not enabled.
    #[error("clock {clock}: timed-event source not enabled")]
    EventSourceIdle { clock: String },

    /// Reading or writing a persisted frequency correction failed.
    #[error("frequency file {path}: {source}")]
    FrequencyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
