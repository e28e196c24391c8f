//! Store metadata (`meta.properties`)
//!
//! Every store directory carries a small `key=value` file describing the
//! engine that wrote it. A store is only considered born once this file has
//! been written, and it is only reopened when the recorded format matches.

use gridstore_common::{PersistenceError, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

/// Name of the metadata file in a store or archived snapshot directory
pub const META_FILENAME: &str = "meta.properties";

pub const META_IMPL_VERSION: &str = "implementation.version";
pub const META_STORAGE_FORMAT: &str = "storage.format";
pub const META_STORAGE_VERSION: &str = "storage.version";
pub const META_PARTITION_COUNT: &str = "partition.count";
pub const META_SERVICE_VERSION: &str = "service.version";

/// Ordered `key=value` properties
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Parse a property as an integer
    #[must_use]
    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge all entries of `other`, overwriting existing keys
    pub fn extend(&mut self, other: &Self) {
        for (k, v) in other.iter() {
            self.set(k, v);
        }
    }

    /// Parse properties text; `#` and `!` start comments, `=` or `:` separate
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut props = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let (key, value) = line
                .find(['=', ':'])
                .map_or((line, ""), |idx| (&line[..idx], &line[idx + 1..]));
            props.set(key.trim(), value.trim());
        }
        props
    }

    /// Render as properties text
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::from("# gridstore metadata\n");
        for (k, v) in self.iter() {
            let _ = writeln!(out, "{k}={v}");
        }
        out
    }

    /// Read `meta.properties` from a directory
    pub fn read_from(dir: &Path) -> io::Result<Self> {
        fs::read_to_string(dir.join(META_FILENAME)).map(|text| Self::parse(&text))
    }

    /// Write `meta.properties` into a directory, replacing it atomically
    pub fn write_to(&self, dir: &Path) -> io::Result<()> {
        let tmp = dir.join(format!("{META_FILENAME}.tmp"));
        fs::write(&tmp, self.render())?;
        fs::rename(&tmp, dir.join(META_FILENAME))
    }
}

/// Identity of the engine that wrote a store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageDescriptor {
    pub impl_version: i32,
    pub storage_format: String,
    pub storage_version: i32,
}

impl StorageDescriptor {
    pub fn new(impl_version: i32, storage_format: impl Into<String>, storage_version: i32) -> Self {
        Self {
            impl_version,
            storage_format: storage_format.into(),
            storage_version,
        }
    }

    /// The properties every store written by this engine carries
    #[must_use]
    pub fn to_properties(&self) -> Properties {
        let mut props = Properties::new();
        props.set(META_IMPL_VERSION, self.impl_version);
        props.set(META_STORAGE_FORMAT, &self.storage_format);
        props.set(META_STORAGE_VERSION, self.storage_version);
        props
    }

    /// Whether the properties carry every required field
    #[must_use]
    pub fn is_complete(props: &Properties) -> bool {
        props.get_i32(META_IMPL_VERSION).is_some()
            && props
                .get(META_STORAGE_FORMAT)
                .is_some_and(|f| !f.is_empty())
            && props.get_i32(META_STORAGE_VERSION).is_some()
    }

    /// Whether a store described by `props` can be opened by this engine
    #[must_use]
    pub fn is_compatible(&self, props: &Properties) -> bool {
        props
            .get_i32(META_IMPL_VERSION)
            .is_some_and(|v| v <= self.impl_version)
            && props.get_i32(META_STORAGE_VERSION) == Some(self.storage_version)
            && props.get(META_STORAGE_FORMAT) == Some(self.storage_format.as_str())
    }

    /// Read and check the metadata in `dir`, failing with a fatal error
    pub fn validate_dir(&self, dir: &Path) -> Result<Properties> {
        let props = Properties::read_from(dir).map_err(|e| {
            PersistenceError::fatal(format!(
                "error reading metadata in directory {}: {e}",
                dir.display()
            ))
        })?;
        if !Self::is_complete(&props) {
            return Err(PersistenceError::fatal(format!(
                "the data in directory {} appears to be incomplete",
                dir.display()
            )));
        }
        if !self.is_compatible(&props) {
            return Err(PersistenceError::fatal(format!(
                "the data in directory {} is incompatible with this manager",
                dir.display()
            )));
        }
        Ok(props)
    }
}
