//! Well-known file locations.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

/// Resolves the daemon's configuration file locations.
#[derive(Debug, Clone, Default)]
pub struct Paths;

impl Paths {
    /// System-wide configuration file.
    pub fn system_config_file() -> PathBuf {
        PathBuf::from("/etc/syntond/syntond.toml")
    }

    /// Per-user configuration file (`~/.config/syntond/syntond.toml` on
    /// Linux), when a home directory exists.
    pub fn user_config_file() -> Option<PathBuf> {
        ProjectDirs::from("", "", "syntond").map(|dirs| dirs.config_dir().join("syntond.toml"))
    }

    /// Configuration file inside a working directory, used by development
    /// setups and tests.
    pub fn local_config_file(dir: &Path) -> PathBuf {
        dir.join("syntond.toml")
    }
}
