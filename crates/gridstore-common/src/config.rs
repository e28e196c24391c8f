//! Configuration types for gridstore
//!
//! An [`EnvironmentConfig`] describes where a persistence environment keeps
//! its active stores, snapshots, trash and archives, and how its background
//! task pool and blocking waits behave.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Persistence environment configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Root directory; the other directories default to children of it
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Directory holding the active stores (default `<base>/active`)
    #[serde(default)]
    pub active_dir: Option<PathBuf>,
    /// Directory holding snapshots (default `<base>/snapshots`)
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
    /// Directory receiving safely-deleted stores (default `<base>/trash`)
    #[serde(default)]
    pub trash_dir: Option<PathBuf>,
    /// Disable the trash so deletes always remove directly
    #[serde(default)]
    pub disable_trash: bool,
    /// Directory used by the directory archiver (default `<base>/archive`)
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    /// Worker threads for asynchronous opens and batches; 0 runs tasks inline
    #[serde(default = "default_task_threads")]
    pub task_threads: usize,
    /// Grace period for outstanding tasks when a manager is released
    #[serde(default = "default_release_grace_ms")]
    pub release_grace_ms: u64,
    /// Upper bound on waits for a store to become ready
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Slice length of bounded waits
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/gridstore")
}

const fn default_task_threads() -> usize {
    4
}

const fn default_release_grace_ms() -> u64 {
    5000
}

const fn default_ready_timeout_ms() -> u64 {
    300_000
}

const fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            active_dir: None,
            snapshot_dir: None,
            trash_dir: None,
            disable_trash: false,
            archive_dir: None,
            task_threads: default_task_threads(),
            release_grace_ms: default_release_grace_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl EnvironmentConfig {
    /// Configuration rooted at `base_dir` with default settings
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn active_dir(&self) -> PathBuf {
        self.active_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("active"))
    }

    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        self.snapshot_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("snapshots"))
    }

    /// Trash directory, or `None` when the trash is disabled
    #[must_use]
    pub fn trash_dir(&self) -> Option<PathBuf> {
        if self.disable_trash {
            return None;
        }
        Some(
            self.trash_dir
                .clone()
                .unwrap_or_else(|| self.base_dir.join("trash")),
        )
    }

    #[must_use]
    pub fn archive_dir(&self) -> PathBuf {
        self.archive_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("archive"))
    }

    #[must_use]
    pub const fn release_grace(&self) -> Duration {
        Duration::from_millis(self.release_grace_ms)
    }

    #[must_use]
    pub const fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Poll interval, never shorter than one millisecond
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directories() {
        let config = EnvironmentConfig::with_base_dir("/tmp/grid");
        assert_eq!(config.active_dir(), PathBuf::from("/tmp/grid/active"));
        assert_eq!(config.snapshot_dir(), PathBuf::from("/tmp/grid/snapshots"));
        assert_eq!(config.trash_dir(), Some(PathBuf::from("/tmp/grid/trash")));
        assert_eq!(config.release_grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: EnvironmentConfig =
            serde_json::from_str(r#"{"base_dir": "/srv", "task_threads": 0, "disable_trash": true}"#)
                .unwrap();
        assert_eq!(config.task_threads, 0);
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.ready_timeout_ms, 300_000);
        assert!(config.trash_dir().is_none());
    }
}
