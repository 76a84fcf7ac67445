//! Configuration loader with multi-source merging.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::{Paths, SyntondConfig};

/// Builder-pattern loader merging defaults, files and environment.
///
/// Precedence, lowest to highest:
///
/// 1. Built-in defaults
/// 2. System config (`/etc/syntond/syntond.toml`)
/// 3. User config (`~/.config/syntond/syntond.toml`)
/// 4. An explicitly provided file, if any
/// 5. Environment variables (`SYNTOND_*`)
pub struct ConfigLoader {
    explicit_file: Option<PathBuf>,
    env_prefix: String,
    search_standard_paths: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            explicit_file: None,
            env_prefix: "SYNTOND".to_string(),
            search_standard_paths: true,
        }
    }

    /// Adds an explicit configuration file (highest-precedence file source).
    pub fn with_file(mut self, file: impl AsRef<Path>) -> Self {
        self.explicit_file = Some(file.as_ref().to_path_buf());
        self
    }

    /// Overrides the environment variable prefix (default: `SYNTOND`).
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skips the system/user standard locations; only the explicit file and
    /// environment are consulted. Used by tests.
    pub fn without_standard_paths(mut self) -> Self {
        self.search_standard_paths = false;
        self
    }

    /// Loads and validates the merged configuration.
    pub fn load(self) -> Result<SyntondConfig> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults
        let defaults = SyntondConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2 + 3. Standard locations, when present
        if self.search_standard_paths {
            let system_file = Paths::system_config_file();
            if system_file.exists() {
                builder = builder.add_source(
                    config::File::from(system_file)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
            if let Some(user_file) = Paths::user_config_file() {
                if user_file.exists() {
                    builder = builder.add_source(
                        config::File::from(user_file)
                            .required(false)
                            .format(config::FileFormat::Toml),
                    );
                }
            }
        }

        // 4. Explicit file
        if let Some(file) = self.explicit_file {
            builder = builder.add_source(
                config::File::from(file)
                    .required(true)
                    .format(config::FileFormat::Toml),
            );
        }

        // 5. Environment (SYNTOND_GENERAL_CLOCK_CTRL=slew-only, ...)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("_")
                .try_parsing(true),
        );

        let merged = builder.build().context("failed to build configuration")?;
        let syntond_config: SyntondConfig = merged
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        syntond_config
            .validate()
            .context("configuration failed validation")?;

        Ok(syntond_config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
