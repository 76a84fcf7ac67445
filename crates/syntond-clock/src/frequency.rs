//! Persisted frequency corrections.
//!
//! The daemon saves the converged frequency correction for each disciplined
//! clock so the next start begins slewing from a good estimate instead of
//! rediscovering the oscillator's drift from zero. One small text file per
//! clock, in a state directory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::{ClockError, ClockId};

/// Reads and writes per-clock frequency-correction files.
#[derive(Debug, Clone)]
pub struct FrequencyStore {
    dir: PathBuf,
}

impl FrequencyStore {
    /// Creates a store rooted at `dir`. The directory is created on first
    /// save, not here.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, clock: &ClockId) -> PathBuf {
        // Clock ids may contain ':'; keep filenames portable.
        let safe: String = clock
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        self.dir.join(format!("freq-correction-{safe}"))
    }

    /// Persists `ppb` as the saved correction for `clock`.
    pub fn save(&self, clock: &ClockId, ppb: f64) -> Result<(), ClockError> {
        let path = self.path_for(clock);
        let io_err = |source| ClockError::FrequencyFile {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut file = fs::File::create(&path).map_err(io_err)?;
        writeln!(file, "{ppb:.3}").map_err(io_err)?;
        Ok(())
    }

    /// Loads the saved correction for `clock`.
    ///
    /// Returns `None` when no file exists. A file that exists but does not
    /// parse is treated the same way, with a warning, so a corrupt state
    /// directory cannot keep an instance from starting.
    pub fn load(&self, clock: &ClockId) -> Option<f64> {
        let path = self.path_for(clock);
        let content = fs::read_to_string(&path).ok()?;
        match content.trim().parse::<f64>() {
            Ok(ppb) if ppb.is_finite() => Some(ppb),
            _ => {
                tracing::warn!(
                    path = %path.display(),
                    "ignoring unparseable frequency-correction file"
                );
                None
            }
        }
    }
}
