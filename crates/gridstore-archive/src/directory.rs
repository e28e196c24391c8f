//! Directory archive backend
//!
//! Layout:
//!
//! ```text
//! <root>/
//!   <snapshot>/
//!     meta.properties     shared metadata and per-store checksums
//!     <store-id>          transfer stream of one store, empty for an empty store
//! ```
//!
//! The root is typically a shared file system reachable from every member.

use crate::archiver::ArchiveBackend;
use gridstore_common::{PersistenceError, Result, StoreId};
use gridstore_storage::{META_FILENAME, Properties};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Archives snapshots as plain files under a root directory
#[derive(Debug, Clone)]
pub struct DirectoryArchiveBackend {
    root: PathBuf,
}

impl DirectoryArchiveBackend {
    /// Create a backend rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            PersistenceError::fatal(format!(
                "unable to create archive directory {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_dir(&self, snapshot: &str) -> Result<PathBuf> {
        validate_snapshot_name(snapshot)?;
        Ok(self.root.join(snapshot))
    }

    fn store_path(&self, snapshot: &str, store_id: &str) -> Result<PathBuf> {
        let id = StoreId::new(store_id)?;
        if id.as_str() == META_FILENAME || id.as_str().starts_with('.') {
            return Err(PersistenceError::illegal_argument(format!(
                "invalid archived store identifier: {id}"
            )));
        }
        Ok(self.snapshot_dir(snapshot)?.join(id.as_str()))
    }
}

fn validate_snapshot_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(PersistenceError::illegal_argument(format!(
            "invalid snapshot name: {name:?}"
        )));
    }
    Ok(())
}

impl ArchiveBackend for DirectoryArchiveBackend {
    fn list_snapshots(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') && entry.file_type()?.is_dir() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn list_stores(&self, snapshot: &str) -> Result<Option<Vec<String>>> {
        let dir = self.snapshot_dir(snapshot)?;
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == META_FILENAME || name.starts_with('.') || !entry.file_type()?.is_file() {
                continue;
            }
            ids.push(name);
        }
        ids.sort();
        Ok(Some(ids))
    }

    fn create_snapshot(&self, snapshot: &str) -> Result<()> {
        let dir = self.snapshot_dir(snapshot)?;
        if dir.exists() {
            return Err(PersistenceError::illegal_argument(format!(
                "snapshot {snapshot} is already archived"
            )));
        }
        fs::create_dir_all(&dir)?;
        debug!("Created archive directory {:?}", dir);
        Ok(())
    }

    fn remove_snapshot(&self, snapshot: &str) -> Result<bool> {
        let dir = self.snapshot_dir(snapshot)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn read_metadata(&self, snapshot: &str) -> Result<Option<Properties>> {
        match Properties::read_from(&self.snapshot_dir(snapshot)?) {
            Ok(props) => Ok(Some(props)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_metadata(&self, snapshot: &str, metadata: &Properties) -> Result<()> {
        metadata.write_to(&self.snapshot_dir(snapshot)?)?;
        Ok(())
    }

    fn store_writer(&self, snapshot: &str, store_id: &str) -> Result<Box<dyn Write + Send>> {
        Ok(Box::new(File::create(self.store_path(snapshot, store_id)?)?))
    }

    fn store_reader(&self, snapshot: &str, store_id: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.store_path(snapshot, store_id)?;
        match File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(PersistenceError::illegal_state(format!(
                    "store {store_id} is missing from archived snapshot {snapshot}"
                )))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout() {
        let dir = tempdir().unwrap();
        let backend = DirectoryArchiveBackend::new(dir.path().join("archive")).unwrap();

        backend.create_snapshot("nightly").unwrap();
        assert!(backend.create_snapshot("nightly").unwrap_err().is_illegal_argument());

        backend
            .store_writer("nightly", "1-1-a-1")
            .unwrap()
            .write_all(b"data")
            .unwrap();
        drop(backend.store_writer("nightly", "0-1-a-1").unwrap());
        let mut props = Properties::new();
        props.set("partition.count", 2);
        backend.write_metadata("nightly", &props).unwrap();

        assert_eq!(backend.list_snapshots().unwrap(), vec!["nightly"]);
        assert_eq!(
            backend.list_stores("nightly").unwrap().unwrap(),
            vec!["0-1-a-1", "1-1-a-1"]
        );
        assert_eq!(backend.list_stores("missing").unwrap(), None);
        assert_eq!(
            backend.read_metadata("nightly").unwrap().unwrap().get_i32("partition.count"),
            Some(2)
        );

        let mut content = Vec::new();
        backend
            .store_reader("nightly", "1-1-a-1")
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"data");

        assert!(backend.remove_snapshot("nightly").unwrap());
        assert!(!backend.remove_snapshot("nightly").unwrap());
        assert_eq!(backend.read_metadata("nightly").unwrap(), None);
    }

    #[test]
    fn test_rejects_escaping_names() {
        let dir = tempdir().unwrap();
        let backend = DirectoryArchiveBackend::new(dir.path()).unwrap();
        assert!(backend.create_snapshot("../up").unwrap_err().is_illegal_argument());
        assert!(backend.create_snapshot(".hidden").unwrap_err().is_illegal_argument());
        backend.create_snapshot("s").unwrap();
        assert!(backend.store_writer("s", "meta.properties").is_err());
        assert!(backend.store_writer("s", "a/b").is_err());
        assert!(backend.store_reader("s", "absent").err().unwrap().to_string().contains("missing"));
    }
}
