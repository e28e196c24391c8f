//! redb-backed store engine.
//!
//! Each store directory holds one redb database file. Every extent is a
//! separate table named `extent:<id>`, so deleting or truncating an extent is
//! a single table operation and the known extents are the table names.

use super::{BatchOp, EntryVisitor, StorageEngine, StoreBackend};
use crate::metadata::StorageDescriptor;
use gridstore_common::{ExtentId, PersistenceError, Result};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition, TableHandle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Storage format recorded in `meta.properties`
pub const REDB_STORAGE_FORMAT: &str = "REDB";

const REDB_IMPL_VERSION: i32 = 1;
const REDB_STORAGE_VERSION: i32 = 2;
const DB_FILENAME: &str = "store.redb";
const TABLE_PREFIX: &str = "extent:";

fn table_name(extent: ExtentId) -> String {
    format!("{TABLE_PREFIX}{extent}")
}

fn parse_table_name(name: &str) -> Option<ExtentId> {
    name.strip_prefix(TABLE_PREFIX)?.parse().ok()
}

fn extent_table(name: &str) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
    TableDefinition::new(name)
}

fn backend_err(e: impl Into<redb::Error>) -> PersistenceError {
    match e.into() {
        redb::Error::DatabaseAlreadyOpen => {
            PersistenceError::concurrent("database is already open by another process")
        }
        other => PersistenceError::backend(other.to_string()),
    }
}

/// Engine creating [`RedbBackend`]s
#[derive(Debug)]
pub struct RedbEngine {
    descriptor: StorageDescriptor,
}

impl RedbEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            descriptor: StorageDescriptor::new(
                REDB_IMPL_VERSION,
                REDB_STORAGE_FORMAT,
                REDB_STORAGE_VERSION,
            ),
        }
    }
}

impl Default for RedbEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for RedbEngine {
    fn descriptor(&self) -> &StorageDescriptor {
        &self.descriptor
    }

    fn open(&self, dir: &Path) -> Result<Arc<dyn StoreBackend>> {
        Ok(Arc::new(RedbBackend::open(dir.join(DB_FILENAME))?))
    }
}

/// A store's extents held in one redb database
pub struct RedbBackend {
    path: PathBuf,
    db: RwLock<Option<Database>>,
}

impl RedbBackend {
    /// Open (or create) the database file at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let db = Database::create(&path).map_err(backend_err)?;
        debug!("Opened redb store at {:?}", path);
        Ok(Self {
            path,
            db: RwLock::new(Some(db)),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(|| {
            PersistenceError::illegal_state(format!("store {} has been released", self.path.display()))
        })?;
        f(db)
    }

    fn write(&self, f: impl FnOnce(&redb::WriteTransaction) -> Result<()>) -> Result<()> {
        self.with_db(|db| {
            let txn = db.begin_write().map_err(backend_err)?;
            // an error drops the transaction, which aborts it
            f(&txn)?;
            txn.commit().map_err(backend_err)
        })
    }
}

impl StoreBackend for RedbBackend {
    fn load_extent_ids(&self) -> Result<Vec<ExtentId>> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(backend_err)?;
            let mut ids: Vec<ExtentId> = txn
                .list_tables()
                .map_err(backend_err)?
                .filter_map(|handle| parse_table_name(handle.name()))
                .collect();
            ids.sort_unstable();
            Ok(ids)
        })
    }

    fn create_extent(&self, extent: ExtentId) -> Result<()> {
        let name = table_name(extent);
        self.write(|txn| {
            txn.open_table(extent_table(&name)).map_err(backend_err)?;
            Ok(())
        })
    }

    fn delete_extent(&self, extent: ExtentId) -> Result<()> {
        let name = table_name(extent);
        self.write(|txn| {
            txn.delete_table(extent_table(&name)).map_err(backend_err)?;
            Ok(())
        })
    }

    fn truncate_extent(&self, extent: ExtentId) -> Result<()> {
        let name = table_name(extent);
        self.write(|txn| {
            txn.delete_table(extent_table(&name)).map_err(backend_err)?;
            txn.open_table(extent_table(&name)).map_err(backend_err)?;
            Ok(())
        })
    }

    fn load(&self, extent: ExtentId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let name = table_name(extent);
        self.with_db(|db| {
            let txn = db.begin_read().map_err(backend_err)?;
            let table = match txn.open_table(extent_table(&name)) {
                Ok(table) => table,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(backend_err(e)),
            };
            let value = table.get(key).map_err(backend_err)?;
            Ok(value.map(|guard| guard.value().to_vec()))
        })
    }

    fn iterate(&self, visitor: &mut EntryVisitor<'_>) -> Result<()> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(backend_err)?;
            let mut extents: Vec<(ExtentId, String)> = txn
                .list_tables()
                .map_err(backend_err)?
                .filter_map(|handle| {
                    let name = handle.name().to_string();
                    parse_table_name(&name).map(|id| (id, name))
                })
                .collect();
            extents.sort_unstable_by_key(|(id, _)| *id);

            for (extent, name) in &extents {
                let table = txn.open_table(extent_table(name)).map_err(backend_err)?;
                for entry in table.iter().map_err(backend_err)? {
                    let (key, value) = entry.map_err(backend_err)?;
                    if !visitor(*extent, key.value(), value.value()) {
                        return Ok(());
                    }
                }
            }
            Ok(())
        })
    }

    fn commit(&self, ops: &[BatchOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.write(|txn| {
            for op in ops {
                let name = table_name(op.extent());
                let mut table = txn.open_table(extent_table(&name)).map_err(backend_err)?;
                match op {
                    BatchOp::Store { key, value, .. } => {
                        table
                            .insert(key.as_slice(), value.as_slice())
                            .map_err(backend_err)?;
                    }
                    BatchOp::Erase { key, .. } => {
                        table.remove(key.as_slice()).map_err(backend_err)?;
                    }
                }
            }
            Ok(())
        })
    }

    fn move_extent(&self, old: ExtentId, new: ExtentId) -> Result<()> {
        if old == new {
            return Ok(());
        }
        let old_name = table_name(old);
        let new_name = table_name(new);
        self.write(|txn| {
            {
                let source = txn
                    .open_table(extent_table(&old_name))
                    .map_err(backend_err)?;
                let mut target = txn
                    .open_table(extent_table(&new_name))
                    .map_err(backend_err)?;
                for entry in source.iter().map_err(backend_err)? {
                    let (key, value) = entry.map_err(backend_err)?;
                    target
                        .insert(key.value(), value.value())
                        .map_err(backend_err)?;
                }
            }
            txn.delete_table(extent_table(&old_name))
                .map_err(backend_err)?;
            Ok(())
        })
    }

    fn release(&self) -> Result<()> {
        if self.db.write().take().is_some() {
            debug!("Released redb store at {:?}", self.path);
        }
        Ok(())
    }
}
