//! Snapshot descriptors

use gridstore_common::Result;
use gridstore_storage::PersistenceEnvironment;
use std::fmt;

/// A named, point-in-time set of stores
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    name: String,
    store_ids: Vec<String>,
}

impl Snapshot {
    #[must_use]
    pub fn new(name: impl Into<String>, store_ids: Vec<String>) -> Self {
        Self {
            name: name.into(),
            store_ids,
        }
    }

    /// Describe the local snapshot `name` of an environment
    pub fn local(env: &PersistenceEnvironment, name: &str) -> Result<Self> {
        let manager = env.open_snapshot(name)?;
        Ok(Self::new(name, manager.list()?))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn store_ids(&self) -> &[String] {
        &self.store_ids
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} stores)", self.name, self.store_ids.len())
    }
}
