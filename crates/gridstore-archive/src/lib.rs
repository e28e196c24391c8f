//! gridstore archive - off-node snapshot storage
//!
//! Local snapshots are copied to an archive so they survive the loss of the
//! nodes that took them, and copied back to recover. This crate provides:
//! - [`SnapshotArchiver`], the archive/retrieve protocol with per-store
//!   timing statistics and liveness heartbeats
//! - [`DirectoryArchiveBackend`], an archive on a (shared) file system
//! - Offline statistics and validation of archived snapshots

pub mod archiver;
pub mod directory;
pub mod snapshot;
pub mod stats;

pub use archiver::{ArchiveBackend, Heartbeat, SnapshotArchiver};
pub use directory::DirectoryArchiveBackend;
pub use snapshot::Snapshot;
pub use stats::{ArchiverStatistics, OperationStats};
