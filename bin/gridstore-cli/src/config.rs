//! CLI configuration file

use anyhow::{Context, Result};
use gridstore_common::EnvironmentConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Command line values that take precedence over the file
#[derive(Debug, Default)]
pub struct Overrides {
    pub base_dir: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub task_threads: Option<usize>,
    pub disable_trash: bool,
    pub log_level: Option<String>,
}

impl Config {
    /// Load the config file if it exists, defaults otherwise
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Merge CLI args into the config (CLI takes precedence)
    #[must_use]
    pub fn merge(mut self, overrides: Overrides) -> Self {
        if let Some(base_dir) = overrides.base_dir {
            self.environment.base_dir = base_dir;
        }
        if let Some(archive_dir) = overrides.archive_dir {
            self.environment.archive_dir = Some(archive_dir);
        }
        if let Some(task_threads) = overrides.task_threads {
            self.environment.task_threads = task_threads;
        }
        if overrides.disable_trash {
            self.environment.disable_trash = true;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        self
    }
}
