//! Snapshot archiver
//!
//! Moves local snapshots to and from an [`ArchiveBackend`]. Each archived
//! snapshot carries one metadata file, written once from the store of the
//! global partition, plus a CRC32C per store file that is verified on
//! retrieval.

use crate::snapshot::Snapshot;
use crate::stats::ArchiverStatistics;
use gridstore_common::{ChecksumReader, ChecksumWriter, PersistenceError, Result, StoreChecksum};
use gridstore_placement::guid;
use gridstore_storage::cache;
use gridstore_storage::metadata::{
    META_IMPL_VERSION, META_PARTITION_COUNT, META_SERVICE_VERSION, META_STORAGE_FORMAT,
    META_STORAGE_VERSION,
};
use gridstore_storage::{
    ManagerOptions, OfflinePersistenceInfo, PersistenceEnvironment, PersistenceManager,
    PersistenceTools, PersistentStore, Properties, StorageDescriptor, StorageEngine, StoreSource,
};
use parking_lot::Mutex;
use std::fmt;
use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Metadata key of the persistence version of the archived stores
pub const META_PERSISTENCE_VERSION: &str = "persistence.version";

/// Metadata key holding the CRC32C of an archived store file
#[must_use]
pub fn checksum_key(store_id: &str) -> String {
    format!("store.{store_id}.crc32c")
}

/// Storage for archived snapshots
pub trait ArchiveBackend: Send + Sync + fmt::Debug {
    /// Names of the archived snapshots
    fn list_snapshots(&self) -> Result<Vec<String>>;

    /// Store ids of an archived snapshot, `None` if it is not archived
    fn list_stores(&self, snapshot: &str) -> Result<Option<Vec<String>>>;

    /// Start a new archived snapshot; fails if it already exists
    fn create_snapshot(&self, snapshot: &str) -> Result<()>;

    /// Remove an archived snapshot, returning false if it did not exist
    fn remove_snapshot(&self, snapshot: &str) -> Result<bool>;

    fn read_metadata(&self, snapshot: &str) -> Result<Option<Properties>>;

    fn write_metadata(&self, snapshot: &str, metadata: &Properties) -> Result<()>;

    /// Destination of the transfer stream of one store
    fn store_writer(&self, snapshot: &str, store_id: &str) -> Result<Box<dyn Write + Send>>;

    /// Source of the transfer stream of one store
    fn store_reader(&self, snapshot: &str, store_id: &str) -> Result<Box<dyn Read + Send>>;
}

/// Called with the store id after each archived or retrieved store
pub type Heartbeat = Arc<dyn Fn(&str) + Send + Sync>;

/// Archives and retrieves snapshots through an [`ArchiveBackend`]
pub struct SnapshotArchiver<B: ArchiveBackend> {
    backend: Arc<B>,
    engine: Arc<dyn StorageEngine>,
    stats: Mutex<ArchiverStatistics>,
    heartbeat: Option<Heartbeat>,
}

impl<B: ArchiveBackend + 'static> SnapshotArchiver<B> {
    /// Create an archiver; `engine` opens stores for offline tools
    pub fn new(backend: B, engine: Arc<dyn StorageEngine>) -> Self {
        Self {
            backend: Arc::new(backend),
            engine,
            stats: Mutex::new(ArchiverStatistics::default()),
            heartbeat: None,
        }
    }

    /// Invoke `heartbeat` after every store so long operations can signal
    /// liveness
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Timings of the most recent archive and retrieve
    #[must_use]
    pub fn statistics(&self) -> ArchiverStatistics {
        *self.stats.lock()
    }

    pub fn list(&self) -> Result<Vec<String>> {
        self.backend.list_snapshots()
    }

    /// The archived snapshot `name` with the stores found in the archive
    pub fn get(&self, name: &str) -> Result<Snapshot> {
        self.backend
            .list_stores(name)?
            .map(|ids| Snapshot::new(name, ids))
            .ok_or_else(|| unknown_snapshot(name))
    }

    /// Remove an archived snapshot
    pub fn remove(&self, name: &str) -> Result<bool> {
        if !self.backend.remove_snapshot(name)? {
            return Err(unknown_snapshot(name));
        }
        info!("Removed archived snapshot {}", name);
        Ok(true)
    }

    /// Archive the local snapshot `snapshot` of `env`
    pub fn archive(&self, snapshot: &Snapshot, env: &PersistenceEnvironment) -> Result<()> {
        let name = snapshot.name();
        let manager = env.open_snapshot(name)?;
        self.stats.lock().archive.reset();
        self.backend.create_snapshot(name)?;
        info!(
            "Archiving snapshot {} ({} stores)",
            name,
            snapshot.store_ids().len()
        );

        if let Err(e) = self.archive_stores(snapshot, &manager) {
            if let Err(cleanup) = self.backend.remove_snapshot(name) {
                warn!("Failed to remove partially archived snapshot {}: {}", name, cleanup);
            }
            return Err(e);
        }
        info!("Archived snapshot {}: {}", name, self.stats.lock().archive);
        Ok(())
    }

    fn archive_stores(&self, snapshot: &Snapshot, manager: &PersistenceManager) -> Result<()> {
        let name = snapshot.name();
        let mut metadata = manager.descriptor().to_properties();
        let mut shared = false;

        for id in snapshot.store_ids() {
            let started = Instant::now();
            let archived = self.archive_store(name, id, manager, &mut metadata, &mut shared);
            let closed = manager.close(id);
            let checksum = archived?;
            closed?;

            metadata.set(checksum_key(id), checksum.to_hex());
            self.stats.lock().archive.record(started.elapsed());
            debug!("Archived store {} ({} bytes)", id, checksum.length);
            self.beat(id);
        }

        if !shared {
            warn!(
                "Snapshot {} has no store of the global partition; archived without partition metadata",
                name
            );
        }
        self.backend.write_metadata(name, &metadata)
    }

    fn archive_store(
        &self,
        name: &str,
        id: &str,
        manager: &PersistenceManager,
        metadata: &mut Properties,
        shared: &mut bool,
    ) -> Result<StoreChecksum> {
        if !*shared && is_global_store(id) {
            let store = manager.open(id, None)?;
            write_shared_metadata(&store, metadata)?;
            *shared = true;
        }

        let mut writer = ChecksumWriter::new(BufWriter::new(self.backend.store_writer(name, id)?));
        // an empty store is archived as an empty file
        if !manager.is_empty(id)? {
            manager.write(id, &mut writer)?;
        }
        writer.flush()?;
        Ok(writer.checksum())
    }

    /// Retrieve the archived snapshot into a new local snapshot of `env`
    pub fn retrieve(&self, snapshot: &Snapshot, env: &PersistenceEnvironment) -> Result<()> {
        let name = snapshot.name();
        let metadata = self.metadata(name)?;
        self.stats.lock().retrieve.reset();
        let manager = env.create_snapshot(name, None)?;
        info!(
            "Retrieving snapshot {} ({} stores)",
            name,
            snapshot.store_ids().len()
        );

        let result = snapshot.store_ids().iter().try_for_each(|id| {
            let started = Instant::now();
            let restored = restore_store(self.backend.as_ref(), name, id, &manager, &metadata);
            let closed = manager.close(id);
            restored?;
            closed?;
            self.stats.lock().retrieve.record(started.elapsed());
            self.beat(id);
            Ok(())
        });

        if let Err(e) = result {
            if let Err(cleanup) = env.remove_snapshot(name) {
                warn!("Failed to remove partially retrieved snapshot {}: {}", name, cleanup);
            }
            return Err(e);
        }
        info!("Retrieved snapshot {}: {}", name, self.stats.lock().retrieve);
        Ok(())
    }

    /// Offline tools over an archived snapshot.
    ///
    /// Stores are retrieved one at a time into a scratch environment under
    /// the system temp directory, so only one store occupies local disk.
    pub fn get_persistence_tools(&self, name: &str) -> Result<PersistenceTools> {
        let metadata = self.metadata(name)?;
        let store_ids = self.get(name)?.store_ids().to_vec();
        if store_ids.is_empty() {
            return Err(PersistenceError::illegal_argument(format!(
                "archived snapshot {name} has no stores"
            )));
        }

        let info = OfflinePersistenceInfo {
            partition_count: metadata.get_i32(META_PARTITION_COUNT).unwrap_or(-1),
            storage_format: metadata
                .get(META_STORAGE_FORMAT)
                .unwrap_or_default()
                .to_string(),
            storage_version: metadata.get_i32(META_STORAGE_VERSION).unwrap_or(0),
            impl_version: metadata.get_i32(META_IMPL_VERSION).unwrap_or(0),
            persistence_version: metadata.get_i32(META_PERSISTENCE_VERSION).unwrap_or(0),
            service_version: metadata.get(META_SERVICE_VERSION).map(str::to_string),
            archived: true,
            store_ids,
        };

        let source = ArchivedStoreSource {
            backend: Arc::clone(&self.backend),
            engine: Arc::clone(&self.engine),
            snapshot: name.to_string(),
            metadata,
        };
        Ok(PersistenceTools::new(info, Arc::new(source)))
    }

    /// Metadata of an archived snapshot, failing if it is absent or
    /// incomplete
    fn metadata(&self, name: &str) -> Result<Properties> {
        match self.backend.read_metadata(name)? {
            Some(props) if StorageDescriptor::is_complete(&props) => Ok(props),
            Some(_) => Err(PersistenceError::illegal_state(format!(
                "metadata of archived snapshot {name} is incomplete"
            ))),
            None if self.backend.list_stores(name)?.is_none() => Err(unknown_snapshot(name)),
            None => Err(PersistenceError::illegal_state(format!(
                "archived snapshot {name} has no metadata"
            ))),
        }
    }

    fn beat(&self, id: &str) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat(id);
        }
    }
}

impl<B: ArchiveBackend> fmt::Debug for SnapshotArchiver<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotArchiver")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

fn unknown_snapshot(name: &str) -> PersistenceError {
    PersistenceError::illegal_argument(format!("unknown archived snapshot {name}"))
}

fn is_global_store(id: &str) -> bool {
    guid::parse_partition(id).is_ok_and(cache::is_global_partitioning_scheme_pid)
}

fn write_shared_metadata(store: &PersistentStore, metadata: &mut Properties) -> Result<()> {
    metadata.set(META_PARTITION_COUNT, cache::get_partition_count(store)?);
    let version = cache::get_persistence_version(store)?;
    metadata.set(META_PERSISTENCE_VERSION, version);
    if version != 0 {
        metadata.set(META_SERVICE_VERSION, cache::get_service_version(store)?);
    }
    Ok(())
}

/// Populate store `id` of `manager` from the archive, verifying its checksum
fn restore_store<B: ArchiveBackend + ?Sized>(
    backend: &B,
    snapshot: &str,
    id: &str,
    manager: &PersistenceManager,
    metadata: &Properties,
) -> Result<()> {
    let mut input = BufReader::new(backend.store_reader(snapshot, id)?);
    if input.fill_buf()?.is_empty() {
        manager.open(id, None)?;
        return Ok(());
    }

    let mut reader = ChecksumReader::new(input);
    manager.read(id, &mut reader)?;
    io::copy(&mut reader, &mut io::sink())?;

    let actual = reader.checksum();
    if let Some(expected) = metadata
        .get(&checksum_key(id))
        .and_then(StoreChecksum::parse_crc)
        && expected != actual.crc32c
    {
        if let Err(e) = manager.delete(id, false) {
            warn!("Failed to delete corrupt store {}: {}", id, e);
        }
        return Err(PersistenceError::corrupted(format!(
            "store {id} of archived snapshot {snapshot} failed checksum verification: expected {expected:08x}, found {}",
            actual.to_hex()
        )));
    }
    Ok(())
}

/// Supplies the stores of an archived snapshot by retrieving them one at a
/// time into a scratch environment
struct ArchivedStoreSource<B: ArchiveBackend> {
    backend: Arc<B>,
    engine: Arc<dyn StorageEngine>,
    snapshot: String,
    metadata: Properties,
}

impl<B: ArchiveBackend> ArchivedStoreSource<B> {
    fn retrieve_into(
        &self,
        scratch: &Path,
        id: &str,
        f: &mut dyn FnMut(&PersistentStore) -> Result<()>,
    ) -> Result<()> {
        let options = ManagerOptions {
            task_threads: 0,
            ..ManagerOptions::default()
        };
        let env = PersistenceEnvironment::new(
            None,
            scratch.join("snapshots"),
            None,
            Arc::clone(&self.engine),
            options,
        )?;
        let result = env
            .create_snapshot(&self.snapshot, None)
            .and_then(|manager| {
                restore_store(self.backend.as_ref(), &self.snapshot, id, &manager, &self.metadata)?;
                let store = manager.open(id, None)?;
                f(&store)
            });
        env.release();
        result
    }
}

impl<B: ArchiveBackend> StoreSource for ArchivedStoreSource<B> {
    fn with_store(&self, id: &str, f: &mut dyn FnMut(&PersistentStore) -> Result<()>) -> Result<()> {
        let scratch = std::env::temp_dir().join(format!("gridstore-tools-{}", Uuid::new_v4()));
        let result = self.retrieve_into(&scratch, id, f);
        if let Err(e) = fs::remove_dir_all(&scratch) {
            warn!("Failed to remove scratch directory {:?}: {}", scratch, e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DirectoryArchiveBackend;
    use gridstore_storage::RedbEngine;
    use rand::RngCore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{TempDir, tempdir};

    fn environment(dir: &TempDir, name: &str) -> PersistenceEnvironment {
        let options = ManagerOptions {
            task_threads: 0,
            ..ManagerOptions::default()
        };
        PersistenceEnvironment::new(
            Some(dir.path().join(name).join("active")),
            dir.path().join(name).join("snapshots"),
            None,
            Arc::new(RedbEngine::new()),
            options,
        )
        .unwrap()
    }

    fn archiver(dir: &TempDir) -> SnapshotArchiver<DirectoryArchiveBackend> {
        let backend = DirectoryArchiveBackend::new(dir.path().join("archive")).unwrap();
        SnapshotArchiver::new(backend, Arc::new(RedbEngine::new()))
    }

    /// Sealed active stores for partitions 0 and 1, optionally an empty
    /// third store, and a snapshot `nightly` of them
    fn populated(env: &PersistenceEnvironment, with_empty: bool) -> Vec<u8> {
        let active = env.open_active().unwrap();
        let mut payload = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut payload);

        for id in ["0-1-a-1", "1-1-a-1"] {
            let store = active.open(id, None).unwrap();
            store.ensure_extent(1).unwrap();
            store.store(1, b"payload", &payload, None).unwrap();
            cache::seal(&store, 2, None).unwrap();
        }
        if with_empty {
            active.open("2-1-a-1", None).unwrap();
        }

        env.create_snapshot("nightly", Some(&active)).unwrap();
        payload
    }

    #[test]
    fn test_archive_and_retrieve() {
        let dir = tempdir().unwrap();
        let source = environment(&dir, "source");
        let payload = populated(&source, true);

        let beats = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&beats);
        let archiver = archiver(&dir).with_heartbeat(Arc::new(move |_: &str| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        let snapshot = Snapshot::local(&source, "nightly").unwrap();
        archiver.archive(&snapshot, &source).unwrap();
        assert_eq!(beats.load(Ordering::Relaxed), 3);
        assert_eq!(archiver.statistics().archive.count, 3);
        assert_eq!(archiver.list().unwrap(), vec!["nightly"]);

        let archived = archiver.get("nightly").unwrap();
        assert_eq!(archived.store_ids(), snapshot.store_ids());
        let metadata = archiver.backend().read_metadata("nightly").unwrap().unwrap();
        assert_eq!(metadata.get_i32(META_PARTITION_COUNT), Some(2));
        assert!(metadata.contains(&checksum_key("1-1-a-1")));

        let target = environment(&dir, "target");
        archiver.retrieve(&archived, &target).unwrap();
        assert_eq!(archiver.statistics().retrieve.count, 3);

        let restored = target.open_snapshot("nightly").unwrap();
        assert_eq!(restored.list().unwrap(), snapshot.store_ids());
        let store = restored.open("1-1-a-1", None).unwrap();
        assert_eq!(store.load(1, b"payload").unwrap(), Some(payload));
        assert!(cache::is_sealed(&store).unwrap());
        assert!(restored.is_empty("2-1-a-1").unwrap());
    }

    #[test]
    fn test_archive_requires_local_snapshot() {
        let dir = tempdir().unwrap();
        let env = environment(&dir, "source");
        let archiver = archiver(&dir);
        let err = archiver
            .archive(&Snapshot::new("absent", Vec::new()), &env)
            .unwrap_err();
        assert!(err.is_illegal_argument());
        assert!(archiver.list().unwrap().is_empty());
    }

    #[test]
    fn test_remove_unknown_snapshot() {
        let dir = tempdir().unwrap();
        let archiver = archiver(&dir);
        assert!(archiver.remove("absent").unwrap_err().is_illegal_argument());
        assert!(archiver.get("absent").unwrap_err().is_illegal_argument());

        let env = environment(&dir, "source");
        populated(&env, false);
        archiver
            .archive(&Snapshot::local(&env, "nightly").unwrap(), &env)
            .unwrap();
        assert!(archiver.remove("nightly").unwrap());
        assert!(archiver.list().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_archive_fails_retrieve() {
        let dir = tempdir().unwrap();
        let source = environment(&dir, "source");
        populated(&source, false);
        let archiver = archiver(&dir);
        archiver
            .archive(&Snapshot::local(&source, "nightly").unwrap(), &source)
            .unwrap();

        // flip a byte inside the value payload of one archived store
        let path = dir.path().join("archive").join("nightly").join("1-1-a-1");
        let mut bytes = fs::read(&path).unwrap();
        let idx = bytes.len() / 2;
        bytes[idx] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let target = environment(&dir, "target");
        let err = archiver
            .retrieve(&archiver.get("nightly").unwrap(), &target)
            .unwrap_err();
        assert!(err.to_string().contains("checksum"));
        assert!(target.list_snapshots().unwrap().is_empty());
    }

    #[test]
    fn test_retrieve_requires_metadata() {
        let dir = tempdir().unwrap();
        let archiver = archiver(&dir);
        archiver.backend().create_snapshot("bare").unwrap();
        let env = environment(&dir, "target");
        let err = archiver
            .retrieve(&archiver.get("bare").unwrap(), &env)
            .unwrap_err();
        assert!(err.to_string().contains("no metadata"));
    }

    #[test]
    fn test_persistence_tools_over_archive() {
        let dir = tempdir().unwrap();
        let source = environment(&dir, "source");
        populated(&source, false);
        let archiver = archiver(&dir);
        archiver
            .archive(&Snapshot::local(&source, "nightly").unwrap(), &source)
            .unwrap();

        let tools = archiver.get_persistence_tools("nightly").unwrap();
        let info = tools.info();
        assert!(info.archived);
        assert_eq!(info.partition_count, 2);
        assert_eq!(info.persistence_version, cache::PERSISTENCE_VERSION);
        assert_eq!(info.store_ids.len(), 2);

        tools.validate().unwrap();
        let stats = tools.statistics().unwrap();
        assert_eq!(stats.total_entries(), 2);
        assert_eq!(stats.total_bytes(), 2 * (7 + 4096));
    }

    #[test]
    fn test_tools_report_unsealed_archived_store() {
        let dir = tempdir().unwrap();
        let source = environment(&dir, "source");
        populated(&source, true);
        let archiver = archiver(&dir);
        archiver
            .archive(&Snapshot::local(&source, "nightly").unwrap(), &source)
            .unwrap();

        let err = archiver
            .get_persistence_tools("nightly")
            .unwrap()
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("2-1-a-1"));
    }
}
