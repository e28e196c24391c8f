//! gridstore common - shared types and utilities
//!
//! This crate provides the error taxonomy, configuration types and the
//! identifier types used across all gridstore components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{ChecksumReader, ChecksumWriter, StoreChecksum};
pub use config::EnvironmentConfig;
pub use error::{ErrorContext, PersistenceError, Result};
pub use types::*;
