//! Persistence environment
//!
//! A [`PersistenceEnvironment`] owns the active, snapshot and trash
//! directories of one service. It hands out at most one active
//! [`PersistenceManager`] and one manager per named snapshot, and creates
//! and removes snapshots.

use crate::backend::StorageEngine;
use crate::lockfile::{FileLock, LOCK_DIR, remove_lock_file};
use crate::manager::{ManagerOptions, PersistenceManager};
use gridstore_common::{EnvironmentConfig, PersistenceError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Managers {
    active: Option<PersistenceManager>,
    snapshots: HashMap<String, PersistenceManager>,
    released: bool,
}

pub(crate) struct EnvironmentInner {
    name: String,
    active_dir: Option<PathBuf>,
    snapshot_dir: PathBuf,
    trash_dir: Option<PathBuf>,
    engine: Arc<dyn StorageEngine>,
    options: ManagerOptions,
    managers: Mutex<Managers>,
}

impl EnvironmentInner {
    /// Forget a manager that released itself
    pub(crate) fn on_released(&self, manager: &PersistenceManager) {
        let mut managers = self.managers.lock();
        if managers
            .active
            .as_ref()
            .is_some_and(|active| active.ptr_eq(manager))
        {
            managers.active = None;
        }
        managers
            .snapshots
            .retain(|_, snapshot| !snapshot.ptr_eq(manager));
    }
}

/// Directories and managers of one persistence environment
#[derive(Clone)]
pub struct PersistenceEnvironment {
    inner: Arc<EnvironmentInner>,
}

impl PersistenceEnvironment {
    /// Create an environment from explicit directories.
    ///
    /// Each directory is created if missing. The directories must be
    /// pairwise distinct.
    pub fn new(
        active_dir: Option<PathBuf>,
        snapshot_dir: PathBuf,
        trash_dir: Option<PathBuf>,
        engine: Arc<dyn StorageEngine>,
        options: ManagerOptions,
    ) -> Result<Self> {
        let active_dir = active_dir.map(|dir| ensure_dir(&dir)).transpose()?;
        let snapshot_dir = ensure_dir(&snapshot_dir)?;
        let trash_dir = trash_dir.map(|dir| ensure_dir(&dir)).transpose()?;

        let dirs: Vec<&PathBuf> = [active_dir.as_ref(), Some(&snapshot_dir), trash_dir.as_ref()]
            .into_iter()
            .flatten()
            .collect();
        for (i, a) in dirs.iter().enumerate() {
            if dirs[i + 1..].contains(a) {
                return Err(PersistenceError::illegal_argument(format!(
                    "active, snapshot and trash directories must be different: {}",
                    a.display()
                )));
            }
        }

        let name = active_dir
            .as_deref()
            .and_then(Path::parent)
            .unwrap_or(snapshot_dir.as_path())
            .display()
            .to_string();
        info!(
            "Created persistence environment {} (active={:?}, snapshots={:?}, trash={:?})",
            name, active_dir, snapshot_dir, trash_dir
        );

        Ok(Self {
            inner: Arc::new(EnvironmentInner {
                name,
                active_dir,
                snapshot_dir,
                trash_dir,
                engine,
                options,
                managers: Mutex::new(Managers::default()),
            }),
        })
    }

    /// Create an environment laid out by `config`
    pub fn from_config(config: &EnvironmentConfig, engine: Arc<dyn StorageEngine>) -> Result<Self> {
        Self::new(
            Some(config.active_dir()),
            config.snapshot_dir(),
            config.trash_dir(),
            engine,
            ManagerOptions::from(config),
        )
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn active_directory(&self) -> Option<&Path> {
        self.inner.active_dir.as_deref()
    }

    #[must_use]
    pub fn snapshot_directory(&self) -> &Path {
        &self.inner.snapshot_dir
    }

    #[must_use]
    pub fn trash_directory(&self) -> Option<&Path> {
        self.inner.trash_dir.as_deref()
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.inner.engine
    }

    fn new_manager(&self, dir: PathBuf, trash: Option<PathBuf>, name: String) -> Result<PersistenceManager> {
        PersistenceManager::with_environment(
            dir,
            trash,
            Some(name),
            Some((self.inner.name.clone(), Arc::downgrade(&self.inner))),
            Arc::clone(&self.inner.engine),
            &self.inner.options,
        )
    }

    fn ensure_active(managers: &Managers) -> Result<()> {
        if managers.released {
            return Err(PersistenceError::illegal_state(
                "persistence environment has been released",
            ));
        }
        Ok(())
    }

    /// The manager of the active directory, created on first use
    pub fn open_active(&self) -> Result<PersistenceManager> {
        let mut managers = self.inner.managers.lock();
        Self::ensure_active(&managers)?;
        if let Some(active) = &managers.active {
            return Ok(active.clone());
        }
        let Some(dir) = self.inner.active_dir.clone() else {
            return Err(PersistenceError::illegal_state(
                "environment has no active directory",
            ));
        };
        let manager = self.new_manager(dir, self.inner.trash_dir.clone(), "active".to_string())?;
        managers.active = Some(manager.clone());
        Ok(manager)
    }

    /// The manager of an existing snapshot
    pub fn open_snapshot(&self, name: &str) -> Result<PersistenceManager> {
        validate_snapshot_name(name)?;
        let mut managers = self.inner.managers.lock();
        Self::ensure_active(&managers)?;
        if let Some(manager) = managers.snapshots.get(name) {
            return Ok(manager.clone());
        }
        let dir = self.inner.snapshot_dir.join(name);
        if !dir.is_dir() {
            return Err(PersistenceError::illegal_argument(format!(
                "snapshot {name} does not exist"
            )));
        }
        let manager = self.new_manager(dir, None, name.to_string())?;
        managers.snapshots.insert(name.to_string(), manager.clone());
        Ok(manager)
    }

    /// Create a snapshot named `name`.
    ///
    /// With a source manager every store in its directory is copied while
    /// all of its open stores are write-locked; without one an empty
    /// snapshot is created, to be populated by the caller.
    pub fn create_snapshot(
        &self,
        name: &str,
        from: Option<&PersistenceManager>,
    ) -> Result<PersistenceManager> {
        validate_snapshot_name(name)?;
        Self::ensure_active(&self.inner.managers.lock())?;

        let target = self.inner.snapshot_dir.join(name);
        if target.exists() {
            return Err(PersistenceError::illegal_argument(format!(
                "snapshot {name} already exists"
            )));
        }

        match from {
            Some(manager) => {
                let staging = self.inner.snapshot_dir.join(format!(".{name}.tmp"));
                if staging.exists() {
                    fs::remove_dir_all(&staging)?;
                }
                let copied = manager.execute_exclusive(|| -> Result<usize> {
                    fs::create_dir_all(&staging)?;
                    let ids = manager.list()?;
                    for id in &ids {
                        copy_dir(&manager.data_dir().join(id), &staging.join(id))?;
                    }
                    Ok(ids.len())
                });
                match copied {
                    Ok(count) => {
                        fs::rename(&staging, &target)?;
                        info!("Created snapshot {} with {} stores", name, count);
                    }
                    Err(e) => {
                        if let Err(cleanup) = fs::remove_dir_all(&staging) {
                            warn!("Failed to remove snapshot staging directory {:?}: {}", staging, cleanup);
                        }
                        return Err(e.with_environment(self.name()));
                    }
                }
            }
            None => {
                fs::create_dir_all(&target)?;
                debug!("Created empty snapshot {}", name);
            }
        }

        self.open_snapshot(name)
    }

    /// Remove a snapshot. Returns false if it did not exist.
    ///
    /// The removal holds an OS lock so two processes sharing the snapshot
    /// directory cannot remove the same snapshot at once. With a trash
    /// directory the snapshot is moved there first.
    pub fn remove_snapshot(&self, name: &str) -> Result<bool> {
        validate_snapshot_name(name)?;
        let dir = self.inner.snapshot_dir.join(name);
        if !dir.exists() {
            return Ok(false);
        }

        let lock_path = self
            .inner
            .snapshot_dir
            .join(LOCK_DIR)
            .join(format!("{name}.lck"));
        let lock = FileLock::try_acquire(&lock_path)?;

        let manager = self.inner.managers.lock().snapshots.remove(name);
        if let Some(manager) = manager {
            manager.release();
        }

        let result = self.discard_snapshot_dir(name, &dir);
        drop(lock);
        remove_lock_file(&lock_path)?;
        result?;

        info!("Removed snapshot {}", name);
        Ok(true)
    }

    fn discard_snapshot_dir(&self, name: &str, dir: &Path) -> Result<()> {
        if let Some(trash) = &self.inner.trash_dir {
            let target = trash.join(format!("snapshot-{name}"));
            if target.exists() {
                fs::remove_dir_all(&target)?;
            }
            fs::rename(dir, &target)?;
            debug!("Moved snapshot {} to trash {:?}", name, target);
        } else {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// Names of the snapshots in the snapshot directory
    pub fn list_snapshots(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.inner.snapshot_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// Release every manager and refuse further use
    pub fn release(&self) {
        let managers = {
            let mut managers = self.inner.managers.lock();
            if managers.released {
                return;
            }
            managers.released = true;
            let mut all: Vec<PersistenceManager> = managers.snapshots.drain().map(|(_, m)| m).collect();
            all.extend(managers.active.take());
            all
        };
        for manager in managers {
            manager.release();
        }
        info!("Released persistence environment {}", self.name());
    }
}

impl std::fmt::Debug for PersistenceEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceEnvironment")
            .field("active_dir", &self.inner.active_dir)
            .field("snapshot_dir", &self.inner.snapshot_dir)
            .field("trash_dir", &self.inner.trash_dir)
            .finish_non_exhaustive()
    }
}

fn validate_snapshot_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.trim() != name
    {
        return Err(PersistenceError::illegal_argument(format!(
            "invalid snapshot name: {name:?}"
        )));
    }
    Ok(())
}

fn ensure_dir(dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| {
        PersistenceError::fatal(format!("unable to create directory {}: {e}", dir.display()))
    })?;
    Ok(fs::canonicalize(dir)?)
}

/// Recursively copy a directory, skipping lock files
fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == LOCK_DIR {
            continue;
        }
        let target = to.join(&name);
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RedbEngine;
    use crate::cache;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    fn environment(dir: &TempDir) -> PersistenceEnvironment {
        let options = ManagerOptions {
            task_threads: 0,
            release_grace: Duration::from_millis(200),
            ..ManagerOptions::default()
        };
        PersistenceEnvironment::new(
            Some(dir.path().join("active")),
            dir.path().join("snapshots"),
            Some(dir.path().join("trash")),
            Arc::new(RedbEngine::new()),
            options,
        )
        .unwrap()
    }

    #[test]
    fn test_directories_must_differ() {
        let dir = tempdir().unwrap();
        let err = PersistenceEnvironment::new(
            Some(dir.path().join("same")),
            dir.path().join("same"),
            None,
            Arc::new(RedbEngine::new()),
            ManagerOptions::default(),
        )
        .unwrap_err();
        assert!(err.is_illegal_argument());
    }

    #[test]
    fn test_active_manager_is_shared() {
        let dir = tempdir().unwrap();
        let env = environment(&dir);
        let a = env.open_active().unwrap();
        let b = env.open_active().unwrap();
        assert!(a.ptr_eq(&b));

        // a released manager is replaced on the next open
        a.release();
        let c = env.open_active().unwrap();
        assert!(!c.ptr_eq(&a));
        assert!(!c.is_released());
    }

    #[test]
    fn test_snapshot_lifecycle() {
        let dir = tempdir().unwrap();
        let env = environment(&dir);
        let active = env.open_active().unwrap();
        let store = active.open("0-1-a-1", None).unwrap();
        store.ensure_extent(1).unwrap();
        store.store(1, b"k", b"v", None).unwrap();
        cache::seal(&store, 1, None).unwrap();

        let snapshot = env.create_snapshot("nightly", Some(&active)).unwrap();
        assert_eq!(env.list_snapshots().unwrap(), vec!["nightly".to_string()]);
        assert_eq!(snapshot.list().unwrap(), vec!["0-1-a-1".to_string()]);

        // later writes to the active store are not visible in the snapshot
        store.store(1, b"k", b"changed", None).unwrap();
        let copy = snapshot.open("0-1-a-1", None).unwrap();
        assert_eq!(copy.load(1, b"k").unwrap(), Some(b"v".to_vec()));
        assert!(cache::is_sealed(&copy).unwrap());

        assert!(env.create_snapshot("nightly", Some(&active)).unwrap_err().is_illegal_argument());

        assert!(env.remove_snapshot("nightly").unwrap());
        assert!(snapshot.is_released());
        assert!(env.list_snapshots().unwrap().is_empty());
        assert!(!env.remove_snapshot("nightly").unwrap());
        assert!(env.open_snapshot("nightly").unwrap_err().is_illegal_argument());
    }

    #[test]
    fn test_empty_snapshot() {
        let dir = tempdir().unwrap();
        let env = environment(&dir);
        let snapshot = env.create_snapshot("restore", None).unwrap();
        assert!(snapshot.list().unwrap().is_empty());
        assert!(env.open_snapshot("restore").unwrap().ptr_eq(&snapshot));
        assert!(env.create_snapshot("../escape", None).unwrap_err().is_illegal_argument());
    }

    #[test]
    fn test_release_releases_all_managers() {
        let dir = tempdir().unwrap();
        let env = environment(&dir);
        let active = env.open_active().unwrap();
        let snapshot = env.create_snapshot("s", None).unwrap();

        env.release();

        assert!(active.is_released());
        assert!(snapshot.is_released());
        assert!(env.open_active().is_err());
    }
}
