//! Persistence manager
//!
//! A [`PersistenceManager`] owns one data directory of named stores. It
//! mediates creation, opening, closing and deletion of stores, bulk
//! import/export, and the background task pool used for asynchronous opens,
//! extent deletions and deferred batches.

use crate::backend::StorageEngine;
use crate::environment::EnvironmentInner;
use crate::lockfile::LOCK_DIR;
use crate::metadata::{Properties, StorageDescriptor};
use crate::store::{PersistentStore, StoreContext, StoreState};
use crate::task::{Collector, Completion, TaskPool, Work, notify_collector};
use crate::tools::{OfflinePersistenceInfo, PersistenceTools, StoreSource};
use crate::transfer::{RecordReader, RecordWriter, is_stream_failure};
use crate::cache;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use gridstore_common::{EnvironmentConfig, PersistenceError, Receipt, Result, StoreId};
use parking_lot::Mutex;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tuning for a manager's task pool and blocking waits
#[derive(Clone, Debug)]
pub struct ManagerOptions {
    /// Worker threads; 0 runs tasks on the calling thread
    pub task_threads: usize,
    pub release_grace: Duration,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from(&EnvironmentConfig::default())
    }
}

impl From<&EnvironmentConfig> for ManagerOptions {
    fn from(config: &EnvironmentConfig) -> Self {
        Self {
            task_threads: config.task_threads,
            release_grace: config.release_grace(),
            ready_timeout: config.ready_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

pub(crate) struct ManagerInner {
    ctx: Arc<StoreContext>,
    stores: DashMap<StoreId, PersistentStore>,
    exclusive: Mutex<()>,
    release_grace: Duration,
    environment: Mutex<Option<Weak<EnvironmentInner>>>,
}

/// Owner of a directory of persistent stores
#[derive(Clone)]
pub struct PersistenceManager {
    inner: Arc<ManagerInner>,
}

impl PersistenceManager {
    /// Create a manager over `data_dir`, creating the directory if needed
    pub fn new(
        data_dir: impl Into<PathBuf>,
        trash_dir: Option<PathBuf>,
        name: Option<String>,
        engine: Arc<dyn StorageEngine>,
        options: &ManagerOptions,
    ) -> Result<Self> {
        Self::with_environment(data_dir.into(), trash_dir, name, None, engine, options)
    }

    pub(crate) fn with_environment(
        data_dir: PathBuf,
        trash_dir: Option<PathBuf>,
        name: Option<String>,
        environment: Option<(String, Weak<EnvironmentInner>)>,
        engine: Arc<dyn StorageEngine>,
        options: &ManagerOptions,
    ) -> Result<Self> {
        fs::create_dir_all(&data_dir).map_err(|e| {
            PersistenceError::fatal(format!(
                "unable to create data directory {}: {e}",
                data_dir.display()
            ))
        })?;
        let name = name.unwrap_or_else(|| data_dir.display().to_string());
        let (env_name, env) = environment.unzip();

        let ctx = StoreContext {
            tasks: TaskPool::new(&name, options.task_threads),
            lock_dir: data_dir.join(LOCK_DIR),
            name,
            environment: env_name,
            data_dir,
            trash_dir,
            engine,
            released: AtomicBool::new(false),
            ready_timeout: options.ready_timeout,
            poll_interval: options.poll_interval,
        };

        debug!("Created persistence manager {} at {:?}", ctx.name, ctx.data_dir);
        Ok(Self {
            inner: Arc::new(ManagerInner {
                ctx: Arc::new(ctx),
                stores: DashMap::new(),
                exclusive: Mutex::new(()),
                release_grace: options.release_grace,
                environment: Mutex::new(env),
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.ctx.name
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.inner.ctx.data_dir
    }

    #[must_use]
    pub fn descriptor(&self) -> &StorageDescriptor {
        self.inner.ctx.descriptor()
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.ctx.is_released()
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_released() {
            return Err(PersistenceError::illegal_state(format!(
                "persistence manager {} has been released",
                self.name()
            )));
        }
        Ok(())
    }

    fn enrich(&self, e: PersistenceError) -> PersistenceError {
        let e = e.with_manager(self.name());
        match &self.inner.ctx.environment {
            Some(env) => e.with_environment(env),
            None => e,
        }
    }

    /// Insert a store handle for `id` if none exists. Returns the live
    /// handle and whether this call created it.
    fn register(&self, id: StoreId) -> Result<(PersistentStore, bool)> {
        match self.inner.stores.entry(id) {
            Entry::Occupied(entry) => Ok((entry.get().clone(), false)),
            Entry::Vacant(entry) => {
                self.ensure_active()?;
                let store = PersistentStore::new(entry.key().clone(), Arc::clone(&self.inner.ctx));
                entry.insert(store.clone());
                Ok((store, true))
            }
        }
    }

    /// Get or instantiate the handle for a store without opening it
    pub fn create_store(&self, id: &str) -> Result<PersistentStore> {
        let id = StoreId::new(id)?;
        self.register(id).map(|(store, _)| store)
    }

    /// Open a store, creating it if necessary, optionally copying `from`
    pub fn open(&self, id: &str, from: Option<&PersistentStore>) -> Result<PersistentStore> {
        self.open_with_collector(id, from, None)
    }

    /// Open a store. When both `from` and `collector` are given the open runs
    /// on the task pool and its outcome is reported to the collector; the
    /// returned handle blocks callers until the open finishes.
    pub fn open_with_collector(
        &self,
        id: &str,
        from: Option<&PersistentStore>,
        collector: Option<Arc<dyn Collector>>,
    ) -> Result<PersistentStore> {
        let id = StoreId::new(id)?;
        let (store, created) = self.register(id)?;
        if created {
            store.set_state(StoreState::Opening);
            let task = OpenTask {
                store: store.clone(),
                from: from.cloned(),
                collector,
                manager: Arc::downgrade(&self.inner),
            };
            match (&task.collector, &task.from) {
                (Some(_), Some(from)) => {
                    let association = from.id().as_str().to_string();
                    self.inner.ctx.tasks.submit(&association, Work::Open(task));
                }
                _ => task.execute()?,
            }
        }
        Ok(store)
    }

    /// Close a store, releasing its resources
    pub fn close(&self, id: &str) -> Result<()> {
        self.ensure_active()?;
        let id = StoreId::new(id)?;
        self.close_store(&id);
        Ok(())
    }

    fn close_store(&self, id: &StoreId) {
        if let Some((_, store)) = self.inner.stores.remove(id) {
            store.release();
        }
    }

    /// Delete a store's on-disk state, opened or not
    pub fn delete(&self, id: &str, safe: bool) -> Result<()> {
        self.ensure_active()?;
        let id = StoreId::new(id)?;
        let store = self.inner.stores.remove(&id).map_or_else(
            || PersistentStore::new(id.clone(), Arc::clone(&self.inner.ctx)),
            |(_, store)| store,
        );
        store.delete(safe).map_err(|e| self.enrich(e))
    }

    /// Ids of the stores in the data directory.
    ///
    /// Stores with incomplete or unreadable metadata are included so callers
    /// can clean them up; incompatible stores are skipped.
    pub fn list(&self) -> Result<Vec<String>> {
        let descriptor = self.descriptor();
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.data_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == LOCK_DIR || !entry.file_type()?.is_dir() {
                continue;
            }
            match Properties::read_from(&entry.path()) {
                Ok(props) if StorageDescriptor::is_complete(&props) => {
                    if descriptor.is_compatible(&props) {
                        ids.push(name);
                    } else {
                        warn!(
                            "Skipping incompatible persistent store directory {:?}",
                            entry.path()
                        );
                    }
                }
                // incomplete or unreadable metadata: listed for cleanup
                _ => ids.push(name),
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Ids of the currently open (or opening) stores
    #[must_use]
    pub fn list_open(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .stores
            .iter()
            .map(|entry| entry.key().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Whether store `id` holds no entries, opening it if needed
    pub fn is_empty(&self, id: &str) -> Result<bool> {
        let mut empty = true;
        self.with_store(id, &mut |store: &PersistentStore| {
            empty = store.is_empty()?;
            Ok(())
        })?;
        Ok(empty)
    }

    /// Populate a new store `id` from a transfer stream. The store is
    /// deleted again if the stream is corrupt or unreadable.
    pub fn read<R: Read>(&self, id: &str, input: R) -> Result<u64> {
        self.ensure_active()?;
        let store_id = StoreId::new(id)?;

        let store = {
            let _exclusive = self.inner.exclusive.lock();
            if self.inner.stores.contains_key(&store_id) {
                return Err(PersistenceError::concurrent(format!(
                    "the store {store_id} is currently open"
                )));
            }
            let (store, _) = self.register(store_id.clone())?;
            store.set_state(StoreState::Opening);
            store
        };

        // concurrent openers block until the import is complete
        let result = {
            let guard = store.lock_exclusive();
            let result = match store.open_held(None) {
                Ok(_) => RecordReader::new(input)
                    .and_then(|mut reader| store.import_held(&mut reader)),
                Err(e) => {
                    drop(guard);
                    self.close_store(&store_id);
                    return Err(self.enrich(e));
                }
            };
            drop(guard);
            result
        };
        match result {
            Ok(count) => {
                debug!("Read {} records into store {}", count, store_id);
                Ok(count)
            }
            Err(e) => {
                if is_stream_failure(&e) {
                    if let Err(cleanup) = self.delete(id, false) {
                        warn!("Failed to delete partially read store {}: {}", store_id, cleanup);
                    }
                }
                Err(self.enrich(e))
            }
        }
    }

    /// Write the full content of store `id` to a transfer stream, opening
    /// the store if needed.
    pub fn write<W: Write>(&self, id: &str, output: W) -> Result<u64> {
        self.ensure_active()?;
        let store = self.open(id, None)?;
        let mut writer = RecordWriter::new(output)?;
        let count = store.export(&mut writer).map_err(|e| self.enrich(e))?;
        writer.finish()?;
        Ok(count)
    }

    /// Run `f` while every open store is write-locked, so no other access to
    /// this manager's stores happens concurrently.
    pub fn execute_exclusive<T>(&self, f: impl FnOnce() -> T) -> T {
        let _exclusive = self.inner.exclusive.lock();
        let stores: Vec<PersistentStore> = self
            .inner
            .stores
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let guards: Vec<_> = stores.iter().map(PersistentStore::lock_exclusive).collect();
        let result = f();
        drop(guards);
        result
    }

    /// Release the manager: wait for outstanding tasks, cancel the rest,
    /// release every open store and detach from the environment.
    pub fn release(&self) {
        if self.inner.ctx.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks = &self.inner.ctx.tasks;
        if !tasks.await_drained(self.inner.release_grace, Duration::from_secs(1)) {
            let cancelled = tasks.cancel_outstanding();
            warn!(
                "Cancelled {} outstanding persistence tasks of manager {}",
                cancelled,
                self.name()
            );
        }
        tasks.shutdown();

        for entry in self.inner.stores.iter() {
            entry.value().release();
        }
        self.inner.stores.clear();

        let environment = self.inner.environment.lock().take();
        if let Some(env) = environment.and_then(|weak| weak.upgrade()) {
            env.on_released(self);
        }
        info!("Released persistence manager {}", self.name());
    }

    /// Offline tools over the stores in this manager's directory
    pub fn persistence_tools(&self) -> Result<PersistenceTools> {
        let ids = self.list()?;
        let Some(first) = ids.first() else {
            return Err(PersistenceError::illegal_argument(
                "snapshot must have at least one store",
            ));
        };

        let (partition_count, persistence_version) = {
            let store = self.open(first, None)?;
            let result = cache::get_partition_count(&store)
                .and_then(|count| Ok((count, cache::get_persistence_version(&store)?)));
            self.close_store(store.id());
            result?
        };

        let descriptor = self.descriptor();
        let info = OfflinePersistenceInfo {
            partition_count,
            storage_format: descriptor.storage_format.clone(),
            storage_version: descriptor.storage_version,
            impl_version: descriptor.impl_version,
            persistence_version,
            service_version: None,
            archived: false,
            store_ids: ids,
        };
        Ok(PersistenceTools::new(info, Arc::new(self.clone())))
    }
}

impl StoreSource for PersistenceManager {
    fn with_store(&self, id: &str, f: &mut dyn FnMut(&PersistentStore) -> Result<()>) -> Result<()> {
        let was_open = self.list_open().iter().any(|open| open == id);
        let store = self.open(id, None)?;
        let result = f(&store);
        if !was_open {
            self.close_store(store.id());
        }
        result
    }
}

impl std::fmt::Debug for PersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceManager")
            .field("name", &self.name())
            .field("data_dir", &self.data_dir())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Opens a store, optionally from a source store, reporting to a collector
pub(crate) struct OpenTask {
    store: PersistentStore,
    from: Option<PersistentStore>,
    collector: Option<Arc<dyn Collector>>,
    manager: Weak<ManagerInner>,
}

impl OpenTask {
    fn receipt(&self) -> Receipt {
        Receipt::from(self.store.id().as_str())
    }

    /// Close the failed store and remove it from its manager's live map
    fn close(&self) {
        match self.manager.upgrade() {
            Some(inner) => {
                if let Some((_, store)) = inner.stores.remove(self.store.id()) {
                    store.release();
                }
            }
            None => self.store.release(),
        }
    }

    /// Open the store. Without a collector a failure is returned to the
    /// caller; with one it is reported there instead.
    pub(crate) fn execute(self) -> Result<()> {
        match self.store.open(self.from.as_ref()) {
            Ok(created) => {
                if created {
                    match &self.from {
                        Some(from) => info!(
                            "Created persistent store {} from {}",
                            self.store, from
                        ),
                        None => info!("Created persistent store {}", self.store),
                    }
                }
                if let Some(collector) = &self.collector {
                    notify_collector(collector.as_ref(), Completion::Done(self.receipt()));
                }
                Ok(())
            }
            Err(e) => {
                self.close();
                match &self.collector {
                    Some(collector) => {
                        let err = e.into_async(Some(self.receipt()));
                        notify_collector(collector.as_ref(), Completion::Failed(err));
                        Ok(())
                    }
                    None => Err(e),
                }
            }
        }
    }

    /// Cancel before running: the store is closed and the collector told
    pub(crate) fn cancel(self) {
        self.close();
        if let Some(collector) = &self.collector {
            let err = PersistenceError::persistence("open cancelled")
                .into_async(Some(self.receipt()));
            notify_collector(collector.as_ref(), Completion::Failed(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RedbEngine;
    use crossbeam_channel::{Receiver, Sender, unbounded};
    use rand::Rng;
    use std::io::Cursor;
    use std::thread;
    use tempfile::{TempDir, tempdir};

    fn manager(dir: &TempDir, threads: usize) -> PersistenceManager {
        let options = ManagerOptions {
            task_threads: threads,
            release_grace: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
        };
        PersistenceManager::new(
            dir.path().join("active"),
            Some(dir.path().join("trash")),
            Some("test".to_string()),
            Arc::new(RedbEngine::new()),
            &options,
        )
        .unwrap()
    }

    #[test]
    fn test_open_is_idempotent() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir, 0);

        let a = mgr.open(" s1 ", None).unwrap();
        let b = mgr.open("s1", None).unwrap();
        assert!(a.same_store(&b));
        assert_eq!(mgr.list_open(), vec!["s1".to_string()]);
        assert_eq!(mgr.list().unwrap(), vec!["s1".to_string()]);

        assert!(mgr.create_store("s1").unwrap().same_store(&a));
        assert!(mgr.open("  ", None).unwrap_err().is_illegal_argument());
    }

    #[test]
    fn test_concurrent_opens_share_one_store() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir, 0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = mgr.clone();
                thread::spawn(move || mgr.open("shared", None).unwrap())
            })
            .collect();
        let stores: Vec<PersistentStore> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for store in &stores {
            assert!(store.same_store(&stores[0]));
            // blocks until the winning opener finished
            assert!(store.extents().unwrap().is_empty());
        }
        assert_eq!(mgr.list().unwrap(), vec!["shared".to_string()]);
    }

    #[test]
    fn test_close_and_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir, 0);
        let store = mgr.open("s", None).unwrap();
        store.ensure_extent(1).unwrap();
        store.store(1, b"k", b"v", None).unwrap();

        mgr.close("s").unwrap();
        assert!(mgr.list_open().is_empty());
        assert!(store.load(1, b"k").is_err());

        let store = mgr.open("s", None).unwrap();
        assert_eq!(store.load(1, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_delete_unopened_store() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir, 0);
        mgr.open("s", None).unwrap();
        mgr.close("s").unwrap();

        mgr.delete("s", false).unwrap();

        assert!(mgr.list().unwrap().is_empty());
        assert!(!dir.path().join("trash").join("s").exists());
    }

    #[test]
    fn test_list_flags_incomplete_and_skips_incompatible() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir, 0);
        mgr.open("good", None).unwrap();

        fs::create_dir_all(mgr.data_dir().join("incomplete")).unwrap();
        let alien = mgr.data_dir().join("alien");
        fs::create_dir_all(&alien).unwrap();
        StorageDescriptor::new(1, "OTHER", 9)
            .to_properties()
            .write_to(&alien)
            .unwrap();

        assert_eq!(
            mgr.list().unwrap(),
            vec!["good".to_string(), "incomplete".to_string()]
        );
    }

    #[test]
    fn test_write_then_read_into_new_store() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir, 0);
        let source = mgr.open("source", None).unwrap();
        source.ensure_extent(1).unwrap();
        source.ensure_extent(-2).unwrap();
        source.store(1, b"a", b"1", None).unwrap();
        source.store(-2, b"b", b"2", None).unwrap();

        let mut buf = Vec::new();
        assert_eq!(mgr.write("source", &mut buf).unwrap(), 2);
        assert_eq!(mgr.read("copy", &buf[..]).unwrap(), 2);

        let copy = mgr.open("copy", None).unwrap();
        assert_eq!(copy.extents().unwrap(), vec![-2, 1]);
        assert_eq!(copy.load(-2, b"b").unwrap(), Some(b"2".to_vec()));
    }

    /// Transfer stream that stalls on its first read until the gate opens
    struct StalledReader {
        data: Cursor<Vec<u8>>,
        started: Sender<()>,
        gate: Receiver<()>,
        stalled: bool,
    }

    impl Read for StalledReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.stalled {
                self.stalled = true;
                let _ = self.started.send(());
                let _ = self.gate.recv_timeout(Duration::from_secs(5));
            }
            self.data.read(buf)
        }
    }

    #[test]
    fn test_store_being_read_is_not_visible_half_imported() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir, 0);
        let source = mgr.open("source", None).unwrap();
        source.ensure_extent(1).unwrap();
        source.store(1, b"k", b"v", None).unwrap();
        let mut buf = Vec::new();
        mgr.write("source", &mut buf).unwrap();

        let (started_tx, started_rx) = unbounded();
        let (gate_tx, gate_rx) = unbounded::<()>();
        let input = StalledReader {
            data: Cursor::new(buf),
            started: started_tx,
            gate: gate_rx,
            stalled: false,
        };
        let importer = {
            let mgr = mgr.clone();
            thread::spawn(move || mgr.read("copy", input).unwrap())
        };
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // the handle is already registered, but access waits for the import
        let copy = mgr.open("copy", None).unwrap();
        let (tx, rx) = unbounded::<Option<Vec<u8>>>();
        let loader = thread::spawn(move || {
            tx.send(copy.load(1, b"k").unwrap()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        drop(gate_tx);
        assert_eq!(importer.join().unwrap(), 1);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Some(b"v".to_vec())
        );
        loader.join().unwrap();
    }

    #[test]
    fn test_random_payloads_survive_transfer() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir, 0);
        let source = mgr.open("source", None).unwrap();
        let mut rng = rand::thread_rng();

        let mut expected = Vec::new();
        for extent in 1..=3 {
            source.ensure_extent(extent).unwrap();
            for i in 0..50 {
                let key = format!("key-{i}").into_bytes();
                let len = rng.gen_range(0..2048);
                let value: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
                source.store(extent, &key, &value, None).unwrap();
                expected.push((extent, key, value));
            }
        }
        assert!(!mgr.is_empty("source").unwrap());

        let mut buf = Vec::new();
        mgr.write("source", &mut buf).unwrap();
        mgr.read("copy", &buf[..]).unwrap();

        let copy = mgr.open("copy", None).unwrap();
        for (extent, key, value) in expected {
            assert_eq!(copy.load(extent, &key).unwrap(), Some(value));
        }
    }

    #[test]
    fn test_read_into_open_store_is_concurrent_access() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir, 0);
        mgr.open("busy", None).unwrap();

        let mut buf = Vec::new();
        mgr.write("busy", &mut buf).unwrap();
        assert!(mgr.read("busy", &buf[..]).unwrap_err().is_concurrent_access());
    }

    #[test]
    fn test_corrupt_read_deletes_store() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir, 0);

        let err = mgr.read("bad", &b"not a store"[..]).unwrap_err();
        assert!(is_stream_failure(&err));
        assert!(mgr.list_open().is_empty());
        assert!(!mgr.data_dir().join("bad").exists());
    }

    #[test]
    fn test_async_open_reports_to_collector() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir, 2);
        let source = mgr.open("source", None).unwrap();
        source.ensure_extent(1).unwrap();
        source.store(1, b"k", b"v", None).unwrap();

        let (tx, rx) = unbounded::<Completion>();
        let target = mgr
            .open_with_collector("target", Some(&source), Some(Arc::new(tx)))
            .unwrap();

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Completion::Done(receipt) => assert_eq!(receipt, Receipt::from("target")),
            Completion::Failed(e) => panic!("open failed: {e}"),
        }
        assert_eq!(target.load(1, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_failed_sync_open_is_removed() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir, 0);
        fs::create_dir_all(mgr.data_dir().join("broken")).unwrap();

        assert!(mgr.open("broken", None).unwrap_err().is_fatal());
        assert!(mgr.list_open().is_empty());
    }

    #[test]
    fn test_release_closes_everything() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir, 2);
        let store = mgr.open("s", None).unwrap();

        mgr.release();

        assert!(mgr.is_released());
        assert_eq!(store.state(), StoreState::Closed);
        assert!(mgr.list_open().is_empty());
        assert!(mgr.open("t", None).is_err());
    }

    #[test]
    fn test_execute_exclusive_returns_value() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir, 0);
        mgr.open("a", None).unwrap();
        mgr.open("b", None).unwrap();

        let seen = mgr.execute_exclusive(|| 42);
        assert_eq!(seen, 42);
    }
}
