//! gridstore storage engine - extent-oriented persistent stores
//!
//! This crate implements the local persistence layer of a data grid node:
//! - Persistent stores of independent key/value extents over a pluggable
//!   backend (redb by default)
//! - Managers owning a directory of stores, with asynchronous opens and
//!   deferred batch commits on a background task pool
//! - Environments owning the active directory and named snapshots
//! - OS-level file locks and `meta.properties` compatibility checks
//! - The bulk store transfer format
//! - Cache metadata conventions (sealing, cache names, registrations)
//! - Offline statistics and validation tools

pub mod backend;
pub mod batch;
pub mod cache;
pub mod environment;
pub mod lockfile;
pub mod manager;
pub mod metadata;
pub mod store;
pub mod task;
pub mod tools;
pub mod transfer;

// Re-exports
pub use backend::{BatchOp, RedbBackend, RedbEngine, StorageEngine, StoreBackend};
pub use batch::Token;
pub use environment::PersistenceEnvironment;
pub use lockfile::{FileLock, LOCK_DIR};
pub use manager::{ManagerOptions, PersistenceManager};
pub use metadata::{META_FILENAME, Properties, StorageDescriptor};
pub use store::{PersistentStore, StoreState};
pub use task::{Collector, Completion};
pub use tools::{
    CacheStatistics, OfflinePersistenceInfo, PersistenceStatistics, PersistenceTools, StoreSource,
};
pub use transfer::{Record, RecordReader, RecordWriter};
