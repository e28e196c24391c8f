//! Persistent store
//!
//! A [`PersistentStore`] is one named store under a manager's data
//! directory. It holds any number of extents, each an independent
//! key/value namespace, on top of a pluggable [`StoreBackend`].
//!
//! Structural operations (open, release, delete, extent creation, move and
//! truncation) take the store's write lock. Per-entry operations (load,
//! store, erase, iterate, begin, commit, abort) take the read lock, so they
//! may run concurrently with each other but never alongside a structural
//! change.

use crate::backend::{BatchOp, StorageEngine, StoreBackend};
use crate::batch::{BatchTask, Deferred, Token};
use crate::lockfile::{FileLock, remove_lock_file};
use crate::metadata::{META_FILENAME, StorageDescriptor};
use crate::task::{Collector, TaskPool, Work};
use crate::transfer::{RecordReader, RecordWriter};
use gridstore_common::{ExtentId, PersistenceError, Receipt, Result, StoreId};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Operations committed per backend transaction during bulk import
const IMPORT_BATCH_SIZE: usize = 4096;

/// Lifecycle state of a store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreState {
    /// Instantiated but never opened
    Initialized,
    /// An open is in flight
    Opening,
    /// Open and accepting operations
    Ready,
    /// Released, deleted or failed to open
    Closed,
}

/// State shared by a manager and all of its stores
pub(crate) struct StoreContext {
    pub(crate) name: String,
    pub(crate) environment: Option<String>,
    pub(crate) data_dir: PathBuf,
    pub(crate) lock_dir: PathBuf,
    pub(crate) trash_dir: Option<PathBuf>,
    pub(crate) engine: Arc<dyn StorageEngine>,
    pub(crate) tasks: TaskPool,
    pub(crate) released: AtomicBool,
    pub(crate) ready_timeout: Duration,
    pub(crate) poll_interval: Duration,
}

impl StoreContext {
    pub(crate) fn descriptor(&self) -> &StorageDescriptor {
        self.engine.descriptor()
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

struct StoreInner {
    id: StoreId,
    dir: PathBuf,
    lock_file: PathBuf,
    ctx: Arc<StoreContext>,
    lock: RwLock<()>,
    state: Mutex<StoreState>,
    state_changed: Condvar,
    backend: Mutex<Option<Arc<dyn StoreBackend>>>,
    extents: RwLock<HashSet<ExtentId>>,
    deleted: Mutex<HashSet<ExtentId>>,
    deleted_changed: Condvar,
}

/// Handle to a persistent store; clones refer to the same store
#[derive(Clone)]
pub struct PersistentStore {
    inner: Arc<StoreInner>,
}

impl PersistentStore {
    pub(crate) fn new(id: StoreId, ctx: Arc<StoreContext>) -> Self {
        let dir = ctx.data_dir.join(id.as_str());
        let lock_file = ctx.lock_dir.join(format!("{id}.lck"));
        Self {
            inner: Arc::new(StoreInner {
                id,
                dir,
                lock_file,
                ctx,
                lock: RwLock::new(()),
                state: Mutex::new(StoreState::Initialized),
                state_changed: Condvar::new(),
                backend: Mutex::new(None),
                extents: RwLock::new(HashSet::new()),
                deleted: Mutex::new(HashSet::new()),
                deleted_changed: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &StoreId {
        &self.inner.id
    }

    /// Directory holding this store's files
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.inner.dir
    }

    #[must_use]
    pub fn state(&self) -> StoreState {
        *self.inner.state.lock()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == StoreState::Ready
    }

    /// Whether both handles refer to the same store instance
    #[must_use]
    pub fn same_store(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ----- extent lifecycle ---------------------------------------------

    /// Ensure an extent exists, returning true if it was created.
    ///
    /// Waits for a pending deletion of the same extent to finish first.
    pub fn ensure_extent(&self, extent: ExtentId) -> Result<bool> {
        if self.contains_extent(extent) {
            return Ok(false);
        }
        self.ensure_ready()?;
        self.await_extent_deletion(extent);

        let _guard = self.inner.lock.write();
        self.ensure_extent_locked(extent)
    }

    /// Schedule deletion of an extent and its entries
    pub fn delete_extent(&self, extent: ExtentId) -> Result<()> {
        if !self.contains_extent(extent) {
            return Ok(());
        }
        self.ensure_ready()?;

        let scheduled = {
            let _guard = self.inner.lock.write();
            self.inner.extents.write().remove(&extent) && self.inner.deleted.lock().insert(extent)
        };
        if scheduled {
            self.inner.ctx.tasks.submit(
                self.id().as_str(),
                Work::DeleteExtent {
                    store: self.clone(),
                    extent,
                },
            );
        }
        Ok(())
    }

    /// Move every entry of `old` into `new`. `new` exists afterwards even if
    /// `old` was unknown.
    pub fn move_extent(&self, old: ExtentId, new: ExtentId) -> Result<()> {
        self.ensure_ready()?;
        {
            let _guard = self.inner.lock.write();
            if self.contains_extent(old) {
                if self.inner.deleted.lock().contains(&new) {
                    return Err(PersistenceError::illegal_argument(format!(
                        "deleted extent identifier: {new}"
                    )));
                }
                self.backend()?
                    .move_extent(old, new)
                    .map_err(|e| self.enrich(e))?;
                self.inner.extents.write().remove(&old);
                self.ensure_extent_locked(new)?;
                return Ok(());
            }
        }
        self.ensure_extent(new).map(|_| ())
    }

    /// Remove all entries of an extent while keeping the extent
    pub fn truncate_extent(&self, extent: ExtentId) -> Result<()> {
        if !self.contains_extent(extent) {
            return Ok(());
        }
        self.ensure_ready()?;
        let _guard = self.inner.lock.write();
        self.backend()?
            .truncate_extent(extent)
            .map_err(|e| self.enrich(e))
    }

    /// Known extent ids in ascending order
    pub fn extents(&self) -> Result<Vec<ExtentId>> {
        self.ensure_ready()?;
        let mut ids: Vec<ExtentId> = self.inner.extents.read().iter().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    #[must_use]
    pub fn contains_extent(&self, extent: ExtentId) -> bool {
        self.inner.extents.read().contains(&extent)
    }

    // ----- entry operations ---------------------------------------------

    pub fn load(&self, extent: ExtentId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_ready()?;
        let _guard = self.inner.lock.read();
        self.validate_extent(extent)?;
        self.backend()?
            .load(extent, key)
            .map_err(|e| self.enrich(e))
    }

    /// Store a value. Without a token the write is committed immediately.
    pub fn store(
        &self,
        extent: ExtentId,
        key: &[u8],
        value: &[u8],
        token: Option<&Token>,
    ) -> Result<()> {
        self.apply(BatchOp::store(extent, key, value), token)
    }

    /// Erase a key. Without a token the erase is committed immediately.
    pub fn erase(&self, extent: ExtentId, key: &[u8], token: Option<&Token>) -> Result<()> {
        self.apply(BatchOp::erase(extent, key), token)
    }

    fn apply(&self, op: BatchOp, token: Option<&Token>) -> Result<()> {
        self.ensure_ready()?;
        let _guard = self.inner.lock.read();
        self.validate_extent(op.extent())?;

        if let Some(token) = token {
            self.validate_token(token)?;
            token.push(op);
            return Ok(());
        }

        let implicit = Token::new(self.id().clone(), None);
        implicit.push(op);
        self.commit_locked(implicit)
    }

    /// Visit every `(extent, key, value)`; returning false stops early
    pub fn iterate<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(ExtentId, &[u8], &[u8]) -> bool,
    {
        self.ensure_ready()?;
        let _guard = self.inner.lock.read();
        let known = self.inner.extents.read().clone();
        self.backend()?
            .iterate(&mut |extent, key, value| {
                // extents pending deletion are still on disk
                !known.contains(&extent) || visitor(extent, key, value)
            })
            .map_err(|e| self.enrich(e))
    }

    /// Whether the store holds no entries at all
    pub fn is_empty(&self) -> Result<bool> {
        let mut empty = true;
        self.iterate(|_, _, _| {
            empty = false;
            false
        })?;
        Ok(empty)
    }

    // ----- transactions -------------------------------------------------

    /// Begin a synchronous transaction
    pub fn begin(&self) -> Result<Token> {
        self.ensure_ready()?;
        let _guard = self.inner.lock.read();
        Ok(Token::new(self.id().clone(), None))
    }

    /// Begin a deferred transaction whose commit runs in the background and
    /// reports `receipt` (or the failure) to `collector`.
    pub fn begin_async(
        &self,
        collector: Option<Arc<dyn Collector>>,
        receipt: Option<Receipt>,
    ) -> Result<Token> {
        self.ensure_ready()?;
        let _guard = self.inner.lock.read();
        Ok(Token::new(
            self.id().clone(),
            Some(Deferred { collector, receipt }),
        ))
    }

    /// Commit a token. Deferred tokens are queued on the task pool.
    pub fn commit(&self, mut token: Token) -> Result<()> {
        self.validate_token(&token)?;
        if let Some(deferred) = token.take_deferred() {
            let task = BatchTask::new(self.clone(), token, deferred);
            self.inner
                .ctx
                .tasks
                .submit(self.id().as_str(), Work::Batch(task));
            return Ok(());
        }

        self.ensure_ready()?;
        let _guard = self.inner.lock.read();
        self.commit_locked(token)
    }

    /// Abort a token. Never fails; problems are logged.
    pub fn abort(&self, mut token: Token) {
        if let Some(deferred) = token.take_deferred() {
            BatchTask::new(self.clone(), token, deferred).abort(None);
            return;
        }
        if let Err(e) = self.ensure_ready() {
            warn!(
                "Caught an error while aborting transaction {}: {}",
                token.id(),
                e
            );
            return;
        }
        let _guard = self.inner.lock.read();
        self.abort_locked(&token);
    }

    fn commit_locked(&self, token: Token) -> Result<()> {
        let ops = token.take_ops();
        if let Err(e) = self.commit_validated(&ops) {
            self.abort_locked(&token);
            return Err(self.enrich(e));
        }
        Ok(())
    }

    fn abort_locked(&self, token: &Token) {
        let discarded = token.take_ops().len();
        debug!(
            "Aborted transaction {} on store {} ({} operations discarded)",
            token.id(),
            self.id(),
            discarded
        );
    }

    /// Validate and commit operations queued by a deferred token
    pub(crate) fn commit_ops(&self, ops: &[BatchOp]) -> Result<()> {
        self.ensure_ready()?;
        let _guard = self.inner.lock.read();
        self.commit_validated(ops)
    }

    /// Commit with the read lock held. Every extent must still be known:
    /// the backend would otherwise recreate a deleted extent.
    fn commit_validated(&self, ops: &[BatchOp]) -> Result<()> {
        for op in ops {
            self.validate_extent(op.extent())?;
        }
        self.backend()?.commit(ops)
    }

    // ----- lifecycle ----------------------------------------------------

    /// Open the store, optionally copying the content of `from`. Returns
    /// true if the store directory was newly created.
    pub(crate) fn open(&self, from: Option<&Self>) -> Result<bool> {
        let _guard = self.inner.lock.write();
        self.open_held(from)
    }

    /// [`Self::open`] for a caller already holding the write lock
    pub(crate) fn open_held(&self, from: Option<&Self>) -> Result<bool> {
        match self.open_locked(from) {
            Ok(created) => {
                self.set_state(StoreState::Ready);
                Ok(created)
            }
            Err(e) => {
                self.release_backend();
                self.set_state(StoreState::Closed);
                Err(self.enrich(e))
            }
        }
    }

    fn open_locked(&self, from: Option<&Self>) -> Result<bool> {
        let dir = &self.inner.dir;
        let mut created = false;
        if !dir.exists() {
            if let Err(e) = fs::create_dir(dir)
                && !dir.exists()
            {
                return Err(PersistenceError::fatal(format!(
                    "unable to create data directory {}: {e}",
                    dir.display()
                )));
            }
            created = true;
        }

        // held for the duration of the open only
        let _storage_lock = FileLock::try_acquire(&self.inner.lock_file).map_err(|e| {
            if e.is_concurrent_access() {
                PersistenceError::concurrent(format!(
                    "unable to lock data directory {}",
                    dir.display()
                ))
            } else {
                e
            }
        })?;

        let descriptor = self.inner.ctx.descriptor();
        if !created {
            descriptor.validate_dir(dir)?;
        }

        let backend = self.inner.ctx.engine.open(dir)?;
        *self.inner.backend.lock() = Some(Arc::clone(&backend));

        if let Some(from) = from {
            if let Err(e) = self.copy_from(backend.as_ref(), from) {
                self.release_backend();
                if let Err(cleanup) = fs::remove_dir_all(dir) {
                    warn!("Failed to remove partially copied store {:?}: {}", dir, cleanup);
                }
                return Err(e);
            }
        }

        let ids = backend.load_extent_ids()?;
        self.inner.extents.write().extend(ids);

        descriptor.to_properties().write_to(dir).map_err(|e| {
            PersistenceError::fatal(format!(
                "error writing metadata in directory {}: {e}",
                dir.display()
            ))
        })?;

        Ok(created)
    }

    fn copy_from(&self, backend: &dyn StoreBackend, from: &Self) -> Result<()> {
        if from.same_store(self) || from.id() == self.id() {
            return Err(PersistenceError::illegal_argument(
                "a store cannot be opened from itself",
            ));
        }
        from.inner.ctx.descriptor().validate_dir(from.directory())?;

        let extents = from.extents()?;
        let mut ops = Vec::new();
        from.iterate(|extent, key, value| {
            ops.push(BatchOp::store(extent, key, value));
            true
        })?;

        for extent in extents {
            backend.create_extent(extent)?;
        }
        backend.commit(&ops)
    }

    /// Release backend resources and close the store
    pub(crate) fn release(&self) {
        let _guard = self.inner.lock.write();
        self.release_locked();
    }

    fn release_locked(&self) {
        self.release_backend();
        self.set_state(StoreState::Closed);
        self.inner.extents.write().clear();
        self.inner.deleted.lock().clear();
        self.inner.deleted_changed.notify_all();
    }

    fn release_backend(&self) {
        let backend = self.inner.backend.lock().take();
        if let Some(backend) = backend
            && let Err(e) = backend.release()
        {
            debug!("Error releasing store {}: {}", self.id(), e);
        }
    }

    /// Release the store and remove its files. A safe delete moves a store
    /// that was ever opened into the trash directory first.
    pub(crate) fn delete(&self, safe: bool) -> Result<()> {
        let _guard = self.inner.lock.write();
        self.release_locked();

        let storage_lock = FileLock::try_acquire(&self.inner.lock_file)?;
        let result = self.delete_locked(safe);
        drop(storage_lock);

        remove_lock_file(&self.inner.lock_file)?;
        if self.inner.dir.exists() {
            fs::remove_dir_all(&self.inner.dir)?;
        }
        result
    }

    fn delete_locked(&self, safe: bool) -> Result<()> {
        let Some(trash) = self.inner.ctx.trash_dir.as_ref().filter(|_| safe) else {
            return Ok(());
        };
        // a store is only born once its metadata has been written
        if !self.inner.dir.join(META_FILENAME).exists() {
            return Ok(());
        }
        if !trash.exists() {
            info!("Creating persistence trash directory {:?}", trash);
            fs::create_dir_all(trash)?;
        }
        let target = trash.join(self.id().as_str());
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&self.inner.dir, &target)?;
        debug!("Moved store {} to trash {:?}", self.id(), target);
        Ok(())
    }

    // ----- bulk transfer ------------------------------------------------

    /// Populate this store from a record stream. The caller holds the write
    /// lock. Returns the number of records read.
    pub(crate) fn import_held<R: Read>(&self, reader: &mut RecordReader<R>) -> Result<u64> {
        self.ensure_ready()?;
        let backend = self.backend()?;

        let mut count = 0u64;
        let mut ops = Vec::with_capacity(IMPORT_BATCH_SIZE);
        while let Some(record) = reader.next_record()? {
            self.ensure_extent_locked(record.extent)?;
            ops.push(BatchOp::Store {
                extent: record.extent,
                key: record.key,
                value: record.value,
            });
            count += 1;
            if ops.len() >= IMPORT_BATCH_SIZE {
                backend.commit(&ops)?;
                ops.clear();
            }
        }
        backend.commit(&ops)?;
        Ok(count)
    }

    /// Write every entry to a record stream while holding the read lock.
    /// Returns the number of records written.
    pub(crate) fn export<W: Write>(&self, writer: &mut RecordWriter<W>) -> Result<u64> {
        self.ensure_ready()?;
        let _guard = self.inner.lock.read();
        let known = self.inner.extents.read().clone();

        let mut count = 0u64;
        let mut failure = None;
        self.backend()?.iterate(&mut |extent, key, value| {
            if !known.contains(&extent) {
                return true;
            }
            match writer.write_record(extent, key, value) {
                Ok(()) => {
                    count += 1;
                    true
                }
                Err(e) => {
                    failure = Some(e);
                    false
                }
            }
        })?;
        failure.map_or(Ok(count), Err)
    }

    /// Hold the write lock for the lifetime of the returned guard
    pub(crate) fn lock_exclusive(&self) -> parking_lot::RwLockWriteGuard<'_, ()> {
        self.inner.lock.write()
    }

    // ----- helpers ------------------------------------------------------

    pub(crate) fn set_state(&self, state: StoreState) {
        let mut current = self.inner.state.lock();
        if *current != state {
            *current = state;
            self.inner.state_changed.notify_all();
        }
    }

    /// Block until the store is ready, failing if it closes first.
    pub(crate) fn ensure_ready(&self) -> Result<()> {
        let ctx = &self.inner.ctx;
        let deadline = Instant::now() + ctx.ready_timeout;
        let mut state = self.inner.state.lock();
        loop {
            match *state {
                StoreState::Ready => return Ok(()),
                StoreState::Closed => {
                    return Err(self.enrich(PersistenceError::persistence(format!(
                        "store {self} has been closed"
                    ))));
                }
                StoreState::Initialized | StoreState::Opening => {}
            }
            if ctx.is_released() {
                return Err(self.enrich(PersistenceError::Interrupted(format!(
                    "manager released while waiting for store {self} to be opened"
                ))));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(self.enrich(PersistenceError::Timeout(format!(
                    "waiting for store {self} to be opened"
                ))));
            }
            self.inner
                .state_changed
                .wait_for(&mut state, ctx.poll_interval.min(deadline - now));
        }
    }

    /// Wait (bounded) while a deletion of `extent` is pending
    fn await_extent_deletion(&self, extent: ExtentId) {
        let ctx = &self.inner.ctx;
        let deadline = Instant::now() + ctx.ready_timeout;
        let mut deleted = self.inner.deleted.lock();
        while deleted.contains(&extent) {
            let now = Instant::now();
            if now >= deadline || ctx.is_released() {
                // creation below fails while the deletion is still pending
                break;
            }
            self.inner
                .deleted_changed
                .wait_for(&mut deleted, ctx.poll_interval.min(deadline - now));
        }
    }

    fn ensure_extent_locked(&self, extent: ExtentId) -> Result<bool> {
        if self.contains_extent(extent) {
            return Ok(false);
        }
        if self.inner.deleted.lock().contains(&extent) {
            return Err(PersistenceError::illegal_argument(format!(
                "deleted extent identifier: {extent}"
            )));
        }
        self.backend()?
            .create_extent(extent)
            .map_err(|e| self.enrich(e))?;
        self.inner.extents.write().insert(extent);
        Ok(true)
    }

    /// Run a scheduled extent deletion under the write lock
    pub(crate) fn complete_extent_deletion(&self, extent: ExtentId) {
        let _guard = self.inner.lock.write();
        if !self.inner.deleted.lock().remove(&extent) {
            return;
        }
        if let Err(e) = self.backend().and_then(|b| b.delete_extent(extent)) {
            error!(
                "Failed to delete extent {} in store {}: {}",
                extent,
                self.id(),
                e
            );
        }
        self.inner.deleted_changed.notify_all();
    }

    fn validate_extent(&self, extent: ExtentId) -> Result<()> {
        if self.contains_extent(extent) {
            Ok(())
        } else {
            Err(PersistenceError::illegal_argument(format!(
                "unknown extent identifier: {extent}"
            )))
        }
    }

    fn validate_token(&self, token: &Token) -> Result<()> {
        if token.store_id() == self.id() {
            Ok(())
        } else {
            Err(PersistenceError::illegal_argument(format!(
                "token {} belongs to store {}, not {}",
                token.id(),
                token.store_id(),
                self.id()
            )))
        }
    }

    fn backend(&self) -> Result<Arc<dyn StoreBackend>> {
        self.inner
            .backend
            .lock()
            .clone()
            .ok_or_else(|| self.enrich(PersistenceError::illegal_state("store is not open")))
    }

    /// Attach store, manager and environment references to an error
    pub(crate) fn enrich(&self, e: PersistenceError) -> PersistenceError {
        let ctx = &self.inner.ctx;
        let e = e.with_store(self.id().as_str()).with_manager(&ctx.name);
        match &ctx.environment {
            Some(env) => e.with_environment(env),
            None => e,
        }
    }
}

impl fmt::Display for PersistentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.inner.id, self.inner.dir.display())
    }
}

impl fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentStore")
            .field("id", &self.inner.id)
            .field("dir", &self.inner.dir)
            .field("state", &self.state())
            .finish()
    }
}
