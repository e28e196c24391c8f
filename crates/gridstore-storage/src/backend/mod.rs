//! Pluggable byte-store backends
//!
//! A [`StorageEngine`] opens one [`StoreBackend`] per store directory. The
//! backend only persists bytes: extent bookkeeping, locking and lifecycle
//! live in [`crate::store::PersistentStore`].

pub mod redb_store;

use crate::metadata::StorageDescriptor;
use gridstore_common::{ExtentId, Result};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub use redb_store::{RedbBackend, RedbEngine};

/// A single mutation applied by [`StoreBackend::commit`]
#[derive(Clone, PartialEq, Eq)]
pub enum BatchOp {
    Store {
        extent: ExtentId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Erase {
        extent: ExtentId,
        key: Vec<u8>,
    },
}

impl BatchOp {
    #[must_use]
    pub fn store(extent: ExtentId, key: &[u8], value: &[u8]) -> Self {
        Self::Store {
            extent,
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    #[must_use]
    pub fn erase(extent: ExtentId, key: &[u8]) -> Self {
        Self::Erase {
            extent,
            key: key.to_vec(),
        }
    }

    #[must_use]
    pub const fn extent(&self) -> ExtentId {
        match self {
            Self::Store { extent, .. } | Self::Erase { extent, .. } => *extent,
        }
    }
}

impl fmt::Debug for BatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store { extent, key, value } => write!(
                f,
                "Store(extent={extent}, key={}B, value={}B)",
                key.len(),
                value.len()
            ),
            Self::Erase { extent, key } => write!(f, "Erase(extent={extent}, key={}B)", key.len()),
        }
    }
}

/// Visitor over `(extent, key, value)` triples; returning false stops iteration
pub type EntryVisitor<'a> = dyn FnMut(ExtentId, &[u8], &[u8]) -> bool + 'a;

/// Low-level byte persistence beneath a single store
pub trait StoreBackend: Send + Sync {
    /// Extent ids currently present on disk
    fn load_extent_ids(&self) -> Result<Vec<ExtentId>>;

    fn create_extent(&self, extent: ExtentId) -> Result<()>;

    /// Remove an extent together with its entries
    fn delete_extent(&self, extent: ExtentId) -> Result<()>;

    /// Remove every entry of an extent, keeping the extent
    fn truncate_extent(&self, extent: ExtentId) -> Result<()>;

    fn load(&self, extent: ExtentId, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn iterate(&self, visitor: &mut EntryVisitor<'_>) -> Result<()>;

    /// Apply all operations atomically, in order
    fn commit(&self, ops: &[BatchOp]) -> Result<()>;

    /// Move every entry of `old` into `new` and drop `old`.
    ///
    /// The default copies through [`StoreBackend::commit`], so the copy is
    /// atomic but the removal of `old` is a separate step.
    fn move_extent(&self, old: ExtentId, new: ExtentId) -> Result<()> {
        if old == new {
            return Ok(());
        }
        let mut ops = Vec::new();
        self.iterate(&mut |extent, key, value| {
            if extent == old {
                ops.push(BatchOp::store(new, key, value));
            }
            true
        })?;
        self.create_extent(new)?;
        self.commit(&ops)?;
        self.delete_extent(old)
    }

    /// Release all resources; the backend is unusable afterwards
    fn release(&self) -> Result<()>;
}

/// Factory for backends plus the format they write
pub trait StorageEngine: Send + Sync + fmt::Debug {
    fn descriptor(&self) -> &StorageDescriptor;

    /// Open (creating if needed) the backend living in `dir`
    fn open(&self, dir: &Path) -> Result<Arc<dyn StoreBackend>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Minimal in-memory backend exercising the trait's default methods
    #[derive(Default)]
    struct MapBackend {
        data: Mutex<BTreeMap<ExtentId, BTreeMap<Vec<u8>, Vec<u8>>>>,
    }

    impl StoreBackend for MapBackend {
        fn load_extent_ids(&self) -> Result<Vec<ExtentId>> {
            Ok(self.data.lock().keys().copied().collect())
        }

        fn create_extent(&self, extent: ExtentId) -> Result<()> {
            self.data.lock().entry(extent).or_default();
            Ok(())
        }

        fn delete_extent(&self, extent: ExtentId) -> Result<()> {
            self.data.lock().remove(&extent);
            Ok(())
        }

        fn truncate_extent(&self, extent: ExtentId) -> Result<()> {
            if let Some(map) = self.data.lock().get_mut(&extent) {
                map.clear();
            }
            Ok(())
        }

        fn load(&self, extent: ExtentId, key: &[u8]) -> Result<Option<Vec<u8>>> {
            Ok(self
                .data
                .lock()
                .get(&extent)
                .and_then(|m| m.get(key).cloned()))
        }

        fn iterate(&self, visitor: &mut EntryVisitor<'_>) -> Result<()> {
            let data = self.data.lock().clone();
            for (extent, map) in &data {
                for (k, v) in map {
                    if !visitor(*extent, k, v) {
                        return Ok(());
                    }
                }
            }
            Ok(())
        }

        fn commit(&self, ops: &[BatchOp]) -> Result<()> {
            let mut data = self.data.lock();
            for op in ops {
                match op {
                    BatchOp::Store { extent, key, value } => {
                        data.entry(*extent)
                            .or_default()
                            .insert(key.clone(), value.clone());
                    }
                    BatchOp::Erase { extent, key } => {
                        if let Some(map) = data.get_mut(extent) {
                            map.remove(key);
                        }
                    }
                }
            }
            Ok(())
        }

        fn release(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_default_move_extent() {
        let backend = MapBackend::default();
        backend.create_extent(1).unwrap();
        backend
            .commit(&[BatchOp::store(1, b"k1", b"v1"), BatchOp::store(1, b"k2", b"v2")])
            .unwrap();

        backend.move_extent(1, 2).unwrap();

        assert_eq!(backend.load_extent_ids().unwrap(), vec![2]);
        assert_eq!(backend.load(2, b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(backend.load(1, b"k1").unwrap(), None);
    }

    #[test]
    fn test_batch_op_debug_hides_payload() {
        let op = BatchOp::store(3, b"secret", b"value");
        assert_eq!(op.extent(), 3);
        assert_eq!(format!("{op:?}"), "Store(extent=3, key=6B, value=5B)");
    }
}
