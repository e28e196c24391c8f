//! gridstore placement - partition GUIDs and store allocation
//!
//! This crate decides which persisted partition versions win during
//! recovery and which member handles which store:
//!
//! # Modules
//!
//! ## GUIDs
//! Encoding of `<partition>-<version>-<timestamp>-<member>` identifiers and
//! newest-version selection per partition.
//!
//! ## Resolver
//! Aggregates the GUIDs reported by every member and derives ownership,
//! unresolved partitions and whether storage is shared.
//!
//! ## Allocation
//! Balanced assignment of snapshot stores to the members that can see them.
//!
//! # Example
//! ```ignore
//! use gridstore_placement::GuidResolver;
//!
//! let resolver = GuidResolver::new(257);
//! resolver.register(1, member_one_guids)?;
//! resolver.register(2, member_two_guids)?;
//! let ownership = resolver.member_ownership();
//! ```

pub mod allocation;
pub mod guid;
pub mod resolver;

pub use allocation::{allocate_snapshot_partitions, assign_stores};
pub use guid::Guid;
pub use resolver::{GuidResolver, Resolution};
