//! Offline persistence tools
//!
//! Statistics and validation over the stores of a snapshot that is not
//! being used by a running service, whether it lives in a local snapshot
//! directory or in an archive.

use crate::cache::{self, CacheNames, CacheVisitor};
use crate::store::PersistentStore;
use gridstore_common::{PersistenceError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// What is known about an offline snapshot without opening every store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OfflinePersistenceInfo {
    /// Partition count recorded in the stores; -1 if unknown
    pub partition_count: i32,
    pub storage_format: String,
    pub storage_version: i32,
    pub impl_version: i32,
    pub persistence_version: i32,
    pub service_version: Option<String>,
    /// Whether the snapshot lives in an archive rather than on local disk
    pub archived: bool,
    pub store_ids: Vec<String>,
}

impl fmt::Display for OfflinePersistenceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "partition count:     {}", self.partition_count)?;
        writeln!(
            f,
            "storage format:      {} (version {})",
            self.storage_format, self.storage_version
        )?;
        writeln!(f, "impl version:        {}", self.impl_version)?;
        writeln!(f, "persistence version: {}", self.persistence_version)?;
        if let Some(service_version) = &self.service_version {
            writeln!(f, "service version:     {service_version}")?;
        }
        writeln!(f, "archived:            {}", self.archived)?;
        write!(f, "stores:              {}", self.store_ids.len())
    }
}

/// Supplies the stores of an offline snapshot one at a time
pub trait StoreSource: Send + Sync {
    /// Make the store `id` available to `f` for the duration of the call
    fn with_store(
        &self,
        id: &str,
        f: &mut dyn FnMut(&PersistentStore) -> Result<()>,
    ) -> Result<()>;
}

/// Per-cache counters gathered by replaying stores
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    pub entries: u64,
    /// Key plus value bytes of the cache entries
    pub bytes: u64,
    pub indices: u64,
    pub triggers: u64,
    pub listeners: u64,
    pub locks: u64,
}

/// Statistics of an offline snapshot, keyed by cache name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistenceStatistics {
    caches: BTreeMap<String, CacheStatistics>,
}

impl PersistenceStatistics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cache(&self, name: &str) -> Option<&CacheStatistics> {
        self.caches.get(name)
    }

    pub fn caches(&self) -> impl Iterator<Item = (&str, &CacheStatistics)> {
        self.caches.iter().map(|(name, stats)| (name.as_str(), stats))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    #[must_use]
    pub fn total_entries(&self) -> u64 {
        self.caches.values().map(|c| c.entries).sum()
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.caches.values().map(|c| c.bytes).sum()
    }

    fn entry(&mut self, name: String) -> &mut CacheStatistics {
        self.caches.entry(name).or_default()
    }
}

impl fmt::Display for PersistenceStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<32} {:>10} {:>12} {:>8} {:>8} {:>9} {:>6}",
            "CACHE", "ENTRIES", "BYTES", "INDICES", "TRIGGERS", "LISTENERS", "LOCKS"
        )?;
        for (name, c) in &self.caches {
            writeln!(
                f,
                "{:<32} {:>10} {:>12} {:>8} {:>8} {:>9} {:>6}",
                name, c.entries, c.bytes, c.indices, c.triggers, c.listeners, c.locks
            )?;
        }
        write!(
            f,
            "total: {} entries, {} bytes",
            self.total_entries(),
            self.total_bytes()
        )
    }
}

/// Accumulates [`PersistenceStatistics`] from replayed stores
struct StatsVisitor<'a> {
    stats: &'a mut PersistenceStatistics,
    names: CacheNames,
}

impl StatsVisitor<'_> {
    fn cache(&mut self, cache_id: i64) -> &mut CacheStatistics {
        let name = self
            .names
            .get(&cache_id)
            .cloned()
            .unwrap_or_else(|| format!("cache-{cache_id}"));
        self.stats.entry(name)
    }
}

impl CacheVisitor for StatsVisitor<'_> {
    fn visit_cache_entry(&mut self, cache_id: i64, key: &[u8], value: &[u8]) -> bool {
        let cache = self.cache(cache_id);
        cache.entries += 1;
        cache.bytes += (key.len() + value.len()) as u64;
        true
    }

    fn visit_listener(&mut self, cache_id: i64, _key: &[u8], _listener_id: i64, _lite: bool) -> bool {
        self.cache(cache_id).listeners += 1;
        true
    }

    fn visit_lock(&mut self, cache_id: i64, _key: &[u8], _holder_id: i64, _thread_id: i64) -> bool {
        self.cache(cache_id).locks += 1;
        true
    }

    fn visit_index(&mut self, cache_id: i64, _extractor: &[u8], _comparator: &[u8]) -> bool {
        self.cache(cache_id).indices += 1;
        true
    }

    fn visit_trigger(&mut self, cache_id: i64, _trigger: &[u8]) -> bool {
        self.cache(cache_id).triggers += 1;
        true
    }
}

/// Fail unless the store was sealed
pub fn validate_store_sealed(store: &PersistentStore) -> Result<()> {
    if cache::is_sealed(store)? {
        Ok(())
    } else {
        Err(PersistenceError::illegal_state(format!(
            "store {} was not sealed correctly",
            store.id()
        )))
    }
}

/// Statistics and validation over an offline snapshot
pub struct PersistenceTools {
    info: OfflinePersistenceInfo,
    source: Arc<dyn StoreSource>,
}

impl PersistenceTools {
    #[must_use]
    pub fn new(info: OfflinePersistenceInfo, source: Arc<dyn StoreSource>) -> Self {
        Self { info, source }
    }

    #[must_use]
    pub const fn info(&self) -> &OfflinePersistenceInfo {
        &self.info
    }

    /// Replay every store and gather per-cache statistics
    pub fn statistics(&self) -> Result<PersistenceStatistics> {
        let mut stats = PersistenceStatistics::new();
        for id in &self.info.store_ids {
            self.source.with_store(id, &mut |store: &PersistentStore| {
                validate_store_sealed(store)?;
                let mut visitor = StatsVisitor {
                    stats: &mut stats,
                    names: cache::get_cache_names(store)?,
                };
                cache::visit_store(store, &mut visitor)
            })?;
            debug!("Gathered statistics for store {}", id);
        }
        Ok(stats)
    }

    /// Check that every store is sealed and records the expected partition
    /// count
    pub fn validate(&self) -> Result<()> {
        let partition_count = self.info.partition_count;
        for id in &self.info.store_ids {
            self.source.with_store(id, &mut |store: &PersistentStore| {
                validate_store_sealed(store)?;
                cache::validate(store, partition_count)
            })?;
        }
        info!("Validated {} stores", self.info.store_ids.len());
        Ok(())
    }
}

impl fmt::Debug for PersistenceTools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceTools")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RedbEngine;
    use crate::manager::{ManagerOptions, PersistenceManager};
    use tempfile::{TempDir, tempdir};

    fn manager(dir: &TempDir) -> PersistenceManager {
        let options = ManagerOptions {
            task_threads: 0,
            ..ManagerOptions::default()
        };
        PersistenceManager::new(
            dir.path().join("snapshot"),
            None,
            None,
            Arc::new(RedbEngine::new()),
            &options,
        )
        .unwrap()
    }

    fn populate(mgr: &PersistenceManager, id: &str, entries: usize) {
        let store = mgr.open(id, None).unwrap();
        let mut names = CacheNames::new();
        names.insert(1, "orders".to_string());
        cache::store_cache_names(&store, &names).unwrap();
        store.ensure_extent(1).unwrap();
        for i in 0..entries {
            store.store(1, format!("k{i}").as_bytes(), b"vv", None).unwrap();
        }
        cache::register_index(&store, 1, b"x", b"c", None).unwrap();
        cache::seal(&store, 2, None).unwrap();
        mgr.close(id).unwrap();
    }

    #[test]
    fn test_tools_info_from_first_store() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir);
        populate(&mgr, "0-1-a-1", 2);
        populate(&mgr, "1-1-a-1", 3);

        let tools = mgr.persistence_tools().unwrap();
        let info = tools.info();
        assert_eq!(info.partition_count, 2);
        assert_eq!(info.persistence_version, cache::PERSISTENCE_VERSION);
        assert_eq!(info.storage_format, "REDB");
        assert!(!info.archived);
        assert_eq!(info.store_ids, vec!["0-1-a-1", "1-1-a-1"]);
        // the probe store is closed again
        assert!(mgr.list_open().is_empty());
    }

    #[test]
    fn test_statistics_aggregate_per_cache() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir);
        populate(&mgr, "0-1-a-1", 2);
        populate(&mgr, "1-1-a-1", 3);

        let stats = mgr.persistence_tools().unwrap().statistics().unwrap();
        let orders = stats.cache("orders").unwrap();
        assert_eq!(orders.entries, 5);
        assert_eq!(orders.bytes, 5 * 4);
        assert_eq!(orders.indices, 2);
        assert_eq!(stats.total_entries(), 5);
        assert!(stats.to_string().contains("orders"));
    }

    #[test]
    fn test_validate_detects_unsealed_store() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir);
        populate(&mgr, "0-1-a-1", 1);
        let tools = mgr.persistence_tools().unwrap();
        tools.validate().unwrap();

        let store = mgr.open("0-1-a-1", None).unwrap();
        cache::unseal(&store).unwrap();
        mgr.close("0-1-a-1").unwrap();

        let err = tools.validate().unwrap_err();
        assert!(err.to_string().contains("not sealed"));
    }

    #[test]
    fn test_empty_snapshot_has_no_tools() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir);
        assert!(mgr.persistence_tools().unwrap_err().is_illegal_argument());
    }
}
