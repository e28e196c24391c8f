//! Advisory OS file locks guarding store and snapshot directories against
//! concurrent processes.

use gridstore_common::{PersistenceError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Name of the lock directory inside a manager's data directory
pub const LOCK_DIR: &str = ".lock";

/// Exclusive `flock` held until dropped
pub struct FileLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl FileLock {
    /// Take the lock without blocking
    ///
    /// Fails with [`PersistenceError::ConcurrentAccess`] when another open
    /// file description holds it.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            if errno == Errno::EWOULDBLOCK {
                PersistenceError::concurrent(format!("unable to lock {}", path.display()))
            } else {
                PersistenceError::Io(std::io::Error::from(errno))
            }
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

/// Remove a lock file, ignoring a missing one
pub fn remove_lock_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
