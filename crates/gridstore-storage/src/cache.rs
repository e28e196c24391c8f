//! Cache metadata encoding
//!
//! Conventions layered on top of a [`PersistentStore`] by a partitioned cache
//! service:
//!
//! - extent 0 (META) holds the seal marker, quorum info, partition count,
//!   persistence version and the cache id to name table
//! - positive extents hold cache content, one extent per cache id
//! - negative extents hold per-cache registrations (listeners, locks,
//!   indices, triggers), each kind in its own extent derived from the cache
//!   id so a whole kind can be dropped with one `delete_extent`
//!
//! Numeric fields are big-endian. Registration keys are
//! `[type byte | numeric fields] + original key bytes`.

use crate::batch::Token;
use crate::store::PersistentStore;
use bytes::{Buf, BufMut, BytesMut};
use gridstore_common::{ExtentId, PartitionId, PersistenceError, Result};
use std::collections::BTreeMap;

/// Extent holding store-wide metadata
pub const META_EXTENT: ExtentId = 0;

/// Negative extent slots reserved per cache id
pub const RESERVED_META_EXTENTS: i64 = 8;

/// Version of the cache persistence conventions written by [`seal`]
pub const PERSISTENCE_VERSION: i32 = 14;

const KEY_TYPE_LISTENER: u8 = 0;
const KEY_TYPE_LOCK: u8 = 1;
const KEY_TYPE_INDEX: u8 = 2;
const KEY_TYPE_TRIGGER: u8 = 3;

const KEY_SEAL: &[u8] = b"SEAL";
const KEY_QUORUM: &[u8] = b"QUORUM";
const KEY_PARTITION_COUNT: &[u8] = b"PARTITION_COUNT";
const KEY_PERSISTENCE_VERSION: &[u8] = b"SERVICE_VERSION";
const KEY_CACHES: &[u8] = b"CACHES";

const VALUE_TRUE: &[u8] = &[1];
const VALUE_FALSE: &[u8] = &[0];

/// Cache id to cache name
pub type CacheNames = BTreeMap<i64, String>;

// ----- sealing -------------------------------------------------------------

/// Mark a store as complete and recoverable, recording the partition count
/// and persistence version. Without a token the writes are committed at once.
pub fn seal(store: &PersistentStore, partition_count: i32, token: Option<&Token>) -> Result<()> {
    store.ensure_extent(META_EXTENT)?;

    let write = |token: &Token| -> Result<()> {
        store.store(
            META_EXTENT,
            KEY_PARTITION_COUNT,
            &partition_count.to_be_bytes(),
            Some(token),
        )?;
        store.store(
            META_EXTENT,
            KEY_PERSISTENCE_VERSION,
            &PERSISTENCE_VERSION.to_be_bytes(),
            Some(token),
        )?;
        store.store(META_EXTENT, KEY_SEAL, KEY_SEAL, Some(token))
    };

    match token {
        Some(token) => write(token),
        None => {
            let token = store.begin()?;
            match write(&token) {
                Ok(()) => store.commit(token),
                Err(e) => {
                    store.abort(token);
                    Err(e)
                }
            }
        }
    }
}

/// Remove the seal and the markers written with it
pub fn unseal(store: &PersistentStore) -> Result<()> {
    store.ensure_extent(META_EXTENT)?;
    let token = store.begin()?;
    let result = [KEY_PARTITION_COUNT, KEY_PERSISTENCE_VERSION, KEY_SEAL]
        .into_iter()
        .try_for_each(|key| store.erase(META_EXTENT, key, Some(&token)));
    match result {
        Ok(()) => store.commit(token),
        Err(e) => {
            store.abort(token);
            Err(e)
        }
    }
}

/// Whether the store carries a seal. A store without a META extent is not
/// sealed.
pub fn is_sealed(store: &PersistentStore) -> Result<bool> {
    if !store.contains_extent(META_EXTENT) {
        return Ok(false);
    }
    Ok(store.load(META_EXTENT, KEY_SEAL)?.is_some())
}

// ----- quorum info ---------------------------------------------------------

/// Store raw quorum info in the META extent
pub fn write_quorum_raw(store: &PersistentStore, info: &[u8]) -> Result<()> {
    store.ensure_extent(META_EXTENT)?;
    store.store(META_EXTENT, KEY_QUORUM, info, None)
}

/// Store quorum info and seal the store
pub fn write_quorum(store: &PersistentStore, info: &[u8], partition_count: i32) -> Result<()> {
    write_quorum_raw(store, info)?;
    seal(store, partition_count, None)
}

pub fn read_quorum_raw(store: &PersistentStore) -> Result<Option<Vec<u8>>> {
    store.ensure_extent(META_EXTENT)?;
    store.load(META_EXTENT, KEY_QUORUM)
}

// ----- validation and META values -----------------------------------------

/// Check a store before recovering from it.
///
/// Fails with `FatalAccess` when the persisted partition count differs from
/// `partition_count`, when the store is unsealed, or when the META extent is
/// missing altogether.
pub fn validate(store: &PersistentStore, partition_count: i32) -> Result<()> {
    if !store.contains_extent(META_EXTENT) {
        return Err(PersistenceError::fatal("missing internal extent"));
    }

    let mut problems = Vec::new();
    let persisted = get_partition_count(store)?;
    if persisted != partition_count {
        problems.push(format!(
            "partition-count mismatch {persisted}(persisted) != {partition_count}(service)"
        ));
    }
    if !is_sealed(store)? {
        problems.push("store has not been sealed".to_string());
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(PersistenceError::fatal(problems.join(" and ")))
    }
}

/// Persisted partition count, or -1 if none was recorded
pub fn get_partition_count(store: &PersistentStore) -> Result<i32> {
    Ok(load_i32(store, KEY_PARTITION_COUNT)?.unwrap_or(-1))
}

/// Persisted persistence version, or 0 if none was recorded
pub fn get_persistence_version(store: &PersistentStore) -> Result<i32> {
    Ok(load_i32(store, KEY_PERSISTENCE_VERSION)?.unwrap_or(0))
}

/// Persistence version rendered for display
pub fn get_service_version(store: &PersistentStore) -> Result<String> {
    let version = get_persistence_version(store)?;
    Ok(if version == 0 {
        "<none>".to_string()
    } else {
        version.to_string()
    })
}

fn load_i32(store: &PersistentStore, key: &[u8]) -> Result<Option<i32>> {
    if !store.contains_extent(META_EXTENT) {
        return Ok(None);
    }
    let Some(value) = store.load(META_EXTENT, key)? else {
        return Ok(None);
    };
    let bytes: [u8; 4] = value.as_slice().try_into().map_err(|_| {
        PersistenceError::corrupted(format!(
            "META value {} has {} bytes, expected 4",
            String::from_utf8_lossy(key),
            value.len()
        ))
    })?;
    Ok(Some(i32::from_be_bytes(bytes)))
}

/// Store the cache id to name table
pub fn store_cache_names(store: &PersistentStore, caches: &CacheNames) -> Result<()> {
    let mut buf = BytesMut::with_capacity(4 + caches.len() * 32);
    buf.put_i32(len_i32(caches.len(), "cache count")?);
    for (id, name) in caches {
        buf.put_i64(*id);
        buf.put_i32(len_i32(name.len(), "cache name")?);
        buf.put_slice(name.as_bytes());
    }

    store.ensure_extent(META_EXTENT)?;
    store.store(META_EXTENT, KEY_CACHES, &buf, None)
}

/// Load the cache id to name table; empty if none was stored
pub fn get_cache_names(store: &PersistentStore) -> Result<CacheNames> {
    let mut caches = CacheNames::new();
    if !store.contains_extent(META_EXTENT) {
        return Ok(caches);
    }
    let Some(value) = store.load(META_EXTENT, KEY_CACHES)? else {
        return Ok(caches);
    };

    let truncated = || PersistenceError::corrupted("truncated cache name table");
    let mut buf = value.as_slice();
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let count = buf.get_i32();
    for _ in 0..count {
        if buf.remaining() < 12 {
            return Err(truncated());
        }
        let id = buf.get_i64();
        let len = usize::try_from(buf.get_i32()).map_err(|_| truncated())?;
        if buf.remaining() < len {
            return Err(truncated());
        }
        let name = String::from_utf8(buf[..len].to_vec())
            .map_err(|e| PersistenceError::corrupted(format!("invalid cache name: {e}")))?;
        buf.advance(len);
        caches.insert(id, name);
    }
    Ok(caches)
}

fn len_i32(len: usize, what: &str) -> Result<i32> {
    i32::try_from(len)
        .map_err(|_| PersistenceError::illegal_argument(format!("{what} too large: {len}")))
}

/// Partition holding logically global metadata
#[must_use]
pub const fn is_global_partitioning_scheme_pid(partition: PartitionId) -> bool {
    partition == 0
}

// ----- extent families -----------------------------------------------------

/// Content extent of a cache followed by its reserved negative slots
fn extent_family(cache_id: i64) -> impl Iterator<Item = ExtentId> {
    std::iter::once(cache_id).chain((0..RESERVED_META_EXTENTS).map(move |i| -cache_id - i))
}

/// Delete a cache's content extent and every associated metadata extent
pub fn delete_extents(store: &PersistentStore, cache_id: i64) -> Result<()> {
    extent_family(cache_id).try_for_each(|extent| store.delete_extent(extent))
}

/// Move a cache's content extent and every associated metadata extent to a
/// new cache id
pub fn move_extents(store: &PersistentStore, old_cache_id: i64, new_cache_id: i64) -> Result<()> {
    extent_family(old_cache_id)
        .zip(extent_family(new_cache_id))
        .try_for_each(|(old, new)| store.move_extent(old, new))
}

fn check_cache_id(cache_id: i64) -> Result<()> {
    if cache_id > 0 {
        Ok(())
    } else {
        Err(PersistenceError::illegal_argument(format!(
            "invalid cache id: {cache_id}"
        )))
    }
}

#[must_use]
pub const fn listener_extent_id(cache_id: i64) -> ExtentId {
    -cache_id
}

#[must_use]
pub const fn lock_extent_id(cache_id: i64) -> ExtentId {
    -cache_id - 1
}

#[must_use]
pub const fn index_extent_id(cache_id: i64) -> ExtentId {
    -cache_id - 2
}

#[must_use]
pub const fn trigger_extent_id(cache_id: i64) -> ExtentId {
    -cache_id - 3
}

fn registration_key(kind: u8, fields: &[i64], suffix: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(1 + fields.len() * 8 + suffix.len());
    buf.put_u8(kind);
    for field in fields {
        buf.put_i64(*field);
    }
    buf.put_slice(suffix);
    buf
}

fn store_registration(
    store: &PersistentStore,
    extent: ExtentId,
    key: &[u8],
    value: &[u8],
    token: Option<&Token>,
) -> Result<()> {
    store.ensure_extent(extent)?;
    store.store(extent, key, value, token)
}

fn erase_registration(
    store: &PersistentStore,
    extent: ExtentId,
    key: &[u8],
    token: Option<&Token>,
) -> Result<()> {
    store.ensure_extent(extent)?;
    store.erase(extent, key, token)
}

// ----- listeners -----------------------------------------------------------

pub fn register_listener(
    store: &PersistentStore,
    cache_id: i64,
    key: &[u8],
    listener_id: i64,
    lite: bool,
    token: Option<&Token>,
) -> Result<()> {
    check_cache_id(cache_id)?;
    let reg = registration_key(KEY_TYPE_LISTENER, &[listener_id, cache_id], key);
    let value = if lite { VALUE_TRUE } else { VALUE_FALSE };
    store_registration(store, listener_extent_id(cache_id), &reg, value, token)
}

pub fn unregister_listener(
    store: &PersistentStore,
    cache_id: i64,
    key: &[u8],
    listener_id: i64,
    token: Option<&Token>,
) -> Result<()> {
    check_cache_id(cache_id)?;
    let reg = registration_key(KEY_TYPE_LISTENER, &[listener_id, cache_id], key);
    erase_registration(store, listener_extent_id(cache_id), &reg, token)
}

/// Drop every listener registration of a cache
pub fn unregister_listeners(store: &PersistentStore, cache_id: i64) -> Result<()> {
    check_cache_id(cache_id)?;
    store.delete_extent(listener_extent_id(cache_id))
}

// ----- locks ---------------------------------------------------------------

pub fn register_lock(
    store: &PersistentStore,
    cache_id: i64,
    key: &[u8],
    holder_id: i64,
    thread_id: i64,
    token: Option<&Token>,
) -> Result<()> {
    check_cache_id(cache_id)?;
    let reg = registration_key(KEY_TYPE_LOCK, &[holder_id, thread_id, cache_id], key);
    store_registration(store, lock_extent_id(cache_id), &reg, VALUE_TRUE, token)
}

pub fn unregister_lock(
    store: &PersistentStore,
    cache_id: i64,
    key: &[u8],
    holder_id: i64,
    thread_id: i64,
    token: Option<&Token>,
) -> Result<()> {
    check_cache_id(cache_id)?;
    let reg = registration_key(KEY_TYPE_LOCK, &[holder_id, thread_id, cache_id], key);
    erase_registration(store, lock_extent_id(cache_id), &reg, token)
}

/// Drop every lock registration of a cache
pub fn unregister_locks(store: &PersistentStore, cache_id: i64) -> Result<()> {
    check_cache_id(cache_id)?;
    store.delete_extent(lock_extent_id(cache_id))
}

// ----- indices -------------------------------------------------------------

pub fn register_index(
    store: &PersistentStore,
    cache_id: i64,
    extractor: &[u8],
    comparator: &[u8],
    token: Option<&Token>,
) -> Result<()> {
    check_cache_id(cache_id)?;
    let reg = registration_key(KEY_TYPE_INDEX, &[cache_id], extractor);
    store_registration(store, index_extent_id(cache_id), &reg, comparator, token)
}

pub fn unregister_index(
    store: &PersistentStore,
    cache_id: i64,
    extractor: &[u8],
    token: Option<&Token>,
) -> Result<()> {
    check_cache_id(cache_id)?;
    let reg = registration_key(KEY_TYPE_INDEX, &[cache_id], extractor);
    erase_registration(store, index_extent_id(cache_id), &reg, token)
}

/// Drop every index registration of a cache
pub fn unregister_indices(store: &PersistentStore, cache_id: i64) -> Result<()> {
    check_cache_id(cache_id)?;
    store.delete_extent(index_extent_id(cache_id))
}

// ----- triggers ------------------------------------------------------------

pub fn register_trigger(
    store: &PersistentStore,
    cache_id: i64,
    trigger: &[u8],
    token: Option<&Token>,
) -> Result<()> {
    check_cache_id(cache_id)?;
    let reg = registration_key(KEY_TYPE_TRIGGER, &[cache_id], trigger);
    store_registration(store, trigger_extent_id(cache_id), &reg, VALUE_TRUE, token)
}

pub fn unregister_trigger(
    store: &PersistentStore,
    cache_id: i64,
    trigger: &[u8],
    token: Option<&Token>,
) -> Result<()> {
    check_cache_id(cache_id)?;
    let reg = registration_key(KEY_TYPE_TRIGGER, &[cache_id], trigger);
    erase_registration(store, trigger_extent_id(cache_id), &reg, token)
}

/// Drop every trigger registration of a cache
pub fn unregister_triggers(store: &PersistentStore, cache_id: i64) -> Result<()> {
    check_cache_id(cache_id)?;
    store.delete_extent(trigger_extent_id(cache_id))
}

// ----- replay --------------------------------------------------------------

/// Receives the logical content of a store replayed by [`visit_store`].
///
/// Every method returns false to stop the replay. Cache ids are the ids as
/// persisted, which may differ from the ids of a recovering service.
pub trait CacheVisitor {
    fn visit_cache_entry(&mut self, cache_id: i64, key: &[u8], value: &[u8]) -> bool;

    fn visit_listener(&mut self, _cache_id: i64, _key: &[u8], _listener_id: i64, _lite: bool) -> bool {
        true
    }

    fn visit_lock(&mut self, _cache_id: i64, _key: &[u8], _holder_id: i64, _thread_id: i64) -> bool {
        true
    }

    fn visit_index(&mut self, _cache_id: i64, _extractor: &[u8], _comparator: &[u8]) -> bool {
        true
    }

    fn visit_trigger(&mut self, _cache_id: i64, _trigger: &[u8]) -> bool {
        true
    }
}

/// Decode one raw store entry and pass it to the visitor. Unknown or
/// malformed registration keys stop the replay.
pub fn dispatch(visitor: &mut dyn CacheVisitor, extent: ExtentId, key: &[u8], value: &[u8]) -> bool {
    if extent > 0 {
        return visitor.visit_cache_entry(extent, key, value);
    }
    if extent == META_EXTENT {
        return true;
    }

    let mut buf = key;
    if !buf.has_remaining() {
        return false;
    }
    let header = |fields: usize| 1 + fields * 8;
    match buf.get_u8() {
        KEY_TYPE_LISTENER if key.len() >= header(2) => {
            let listener_id = buf.get_i64();
            let cache_id = buf.get_i64();
            visitor.visit_listener(cache_id, &key[header(2)..], listener_id, value == VALUE_TRUE)
        }
        KEY_TYPE_LOCK if key.len() >= header(3) => {
            let holder_id = buf.get_i64();
            let thread_id = buf.get_i64();
            let cache_id = buf.get_i64();
            visitor.visit_lock(cache_id, &key[header(3)..], holder_id, thread_id)
        }
        KEY_TYPE_INDEX if key.len() >= header(1) => {
            let cache_id = buf.get_i64();
            visitor.visit_index(cache_id, &key[header(1)..], value)
        }
        KEY_TYPE_TRIGGER if key.len() >= header(1) => {
            let cache_id = buf.get_i64();
            visitor.visit_trigger(cache_id, &key[header(1)..])
        }
        _ => false,
    }
}

/// Replay the whole store through a cache visitor
pub fn visit_store(store: &PersistentStore, visitor: &mut dyn CacheVisitor) -> Result<()> {
    store.iterate(|extent, key, value| dispatch(&mut *visitor, extent, key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RedbEngine;
    use crate::manager::{ManagerOptions, PersistenceManager};
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    fn open_store(dir: &TempDir) -> (PersistenceManager, PersistentStore) {
        let options = ManagerOptions {
            task_threads: 0,
            ..ManagerOptions::default()
        };
        let mgr = PersistenceManager::new(
            dir.path().join("active"),
            None,
            None,
            Arc::new(RedbEngine::new()),
            &options,
        )
        .unwrap();
        let store = mgr.open("0-1-a-1", None).unwrap();
        (mgr, store)
    }

    #[derive(Default)]
    struct Recorder {
        entries: Vec<(i64, Vec<u8>, Vec<u8>)>,
        listeners: Vec<(i64, Vec<u8>, i64, bool)>,
        locks: Vec<(i64, Vec<u8>, i64, i64)>,
        indices: Vec<(i64, Vec<u8>, Vec<u8>)>,
        triggers: Vec<(i64, Vec<u8>)>,
    }

    impl CacheVisitor for Recorder {
        fn visit_cache_entry(&mut self, cache_id: i64, key: &[u8], value: &[u8]) -> bool {
            self.entries.push((cache_id, key.to_vec(), value.to_vec()));
            true
        }

        fn visit_listener(&mut self, cache_id: i64, key: &[u8], listener_id: i64, lite: bool) -> bool {
            self.listeners.push((cache_id, key.to_vec(), listener_id, lite));
            true
        }

        fn visit_lock(&mut self, cache_id: i64, key: &[u8], holder_id: i64, thread_id: i64) -> bool {
            self.locks.push((cache_id, key.to_vec(), holder_id, thread_id));
            true
        }

        fn visit_index(&mut self, cache_id: i64, extractor: &[u8], comparator: &[u8]) -> bool {
            self.indices.push((cache_id, extractor.to_vec(), comparator.to_vec()));
            true
        }

        fn visit_trigger(&mut self, cache_id: i64, trigger: &[u8]) -> bool {
            self.triggers.push((cache_id, trigger.to_vec()));
            true
        }
    }

    #[test]
    fn test_seal_and_unseal() {
        let dir = tempdir().unwrap();
        let (_mgr, store) = open_store(&dir);
        assert!(!is_sealed(&store).unwrap());

        seal(&store, 257, None).unwrap();
        assert!(is_sealed(&store).unwrap());
        assert_eq!(get_partition_count(&store).unwrap(), 257);
        assert_eq!(get_persistence_version(&store).unwrap(), PERSISTENCE_VERSION);
        assert_eq!(get_service_version(&store).unwrap(), "14");

        unseal(&store).unwrap();
        assert!(!is_sealed(&store).unwrap());
        assert_eq!(get_partition_count(&store).unwrap(), -1);
        assert_eq!(get_service_version(&store).unwrap(), "<none>");
    }

    #[test]
    fn test_seal_within_caller_token() {
        let dir = tempdir().unwrap();
        let (_mgr, store) = open_store(&dir);
        store.ensure_extent(META_EXTENT).unwrap();

        let token = store.begin().unwrap();
        seal(&store, 7, Some(&token)).unwrap();
        assert!(!is_sealed(&store).unwrap());
        store.commit(token).unwrap();
        assert!(is_sealed(&store).unwrap());
    }

    #[test]
    fn test_validate() {
        let dir = tempdir().unwrap();
        let (_mgr, store) = open_store(&dir);

        let err = validate(&store, 7).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("missing internal extent"));

        store.ensure_extent(META_EXTENT).unwrap();
        let err = validate(&store, 7).unwrap_err();
        assert!(err.to_string().contains("mismatch"));
        assert!(err.to_string().contains("not been sealed"));

        seal(&store, 7, None).unwrap();
        validate(&store, 7).unwrap();
        assert!(validate(&store, 13).unwrap_err().is_fatal());
    }

    #[test]
    fn test_quorum_raw_and_sealing() {
        let dir = tempdir().unwrap();
        let (_mgr, store) = open_store(&dir);
        assert_eq!(read_quorum_raw(&store).unwrap(), None);

        write_quorum(&store, b"members:1,2,3", 31).unwrap();

        assert_eq!(read_quorum_raw(&store).unwrap(), Some(b"members:1,2,3".to_vec()));
        assert!(is_sealed(&store).unwrap());
    }

    #[test]
    fn test_cache_names() {
        let dir = tempdir().unwrap();
        let (_mgr, store) = open_store(&dir);
        assert!(get_cache_names(&store).unwrap().is_empty());

        let mut caches = CacheNames::new();
        caches.insert(1, "orders".to_string());
        caches.insert(42, "クライアント".to_string());
        store_cache_names(&store, &caches).unwrap();

        assert_eq!(get_cache_names(&store).unwrap(), caches);
    }

    #[test]
    fn test_truncated_cache_names_are_corrupt() {
        let dir = tempdir().unwrap();
        let (_mgr, store) = open_store(&dir);
        store.ensure_extent(META_EXTENT).unwrap();
        store.store(META_EXTENT, KEY_CACHES, &[0, 0, 0, 2, 0, 0], None).unwrap();

        assert!(matches!(
            get_cache_names(&store).unwrap_err().root(),
            PersistenceError::StreamCorrupted(_)
        ));
    }

    #[test]
    fn test_extent_ids() {
        assert_eq!(listener_extent_id(5), -5);
        assert_eq!(lock_extent_id(5), -6);
        assert_eq!(index_extent_id(5), -7);
        assert_eq!(trigger_extent_id(5), -8);
        assert!(is_global_partitioning_scheme_pid(0));
        assert!(!is_global_partitioning_scheme_pid(1));

        let family: Vec<_> = extent_family(3).collect();
        assert_eq!(family, vec![3, -3, -4, -5, -6, -7, -8, -9, -10]);
    }

    #[test]
    fn test_registrations_replay_through_visitor() {
        let dir = tempdir().unwrap();
        let (_mgr, store) = open_store(&dir);
        seal(&store, 7, None).unwrap();
        store.ensure_extent(3).unwrap();
        store.store(3, b"key", b"value", None).unwrap();

        register_listener(&store, 3, b"key", 11, true, None).unwrap();
        register_lock(&store, 3, b"key", 12, 99, None).unwrap();
        register_index(&store, 3, b"extractor", b"comparator", None).unwrap();
        register_trigger(&store, 3, b"trigger", None).unwrap();

        let mut recorder = Recorder::default();
        visit_store(&store, &mut recorder).unwrap();

        assert_eq!(recorder.entries, vec![(3, b"key".to_vec(), b"value".to_vec())]);
        assert_eq!(recorder.listeners, vec![(3, b"key".to_vec(), 11, true)]);
        assert_eq!(recorder.locks, vec![(3, b"key".to_vec(), 12, 99)]);
        assert_eq!(
            recorder.indices,
            vec![(3, b"extractor".to_vec(), b"comparator".to_vec())]
        );
        assert_eq!(recorder.triggers, vec![(3, b"trigger".to_vec())]);
    }

    #[test]
    fn test_unregister() {
        let dir = tempdir().unwrap();
        let (_mgr, store) = open_store(&dir);
        register_listener(&store, 3, b"a", 1, false, None).unwrap();
        register_listener(&store, 3, b"b", 1, false, None).unwrap();
        register_lock(&store, 3, b"a", 1, 1, None).unwrap();

        unregister_listener(&store, 3, b"a", 1, None).unwrap();
        unregister_lock(&store, 3, b"a", 1, 1, None).unwrap();

        let mut recorder = Recorder::default();
        visit_store(&store, &mut recorder).unwrap();
        assert_eq!(recorder.listeners, vec![(3, b"b".to_vec(), 1, false)]);
        assert!(recorder.locks.is_empty());

        unregister_listeners(&store, 3).unwrap();
        assert!(!store.contains_extent(listener_extent_id(3)));
        assert!(register_trigger(&store, 0, b"t", None).unwrap_err().is_illegal_argument());
    }

    #[test]
    fn test_move_and_delete_extent_families() {
        let dir = tempdir().unwrap();
        let (_mgr, store) = open_store(&dir);
        store.ensure_extent(3).unwrap();
        store.store(3, b"k", b"v", None).unwrap();
        register_index(&store, 3, b"x", b"c", None).unwrap();

        move_extents(&store, 3, 20).unwrap();

        assert_eq!(store.load(20, b"k").unwrap(), Some(b"v".to_vec()));
        let index_key = registration_key(KEY_TYPE_INDEX, &[3], b"x");
        assert_eq!(
            store.load(index_extent_id(20), &index_key).unwrap(),
            Some(b"c".to_vec())
        );
        assert!(extent_family(3).all(|extent| !store.contains_extent(extent)));

        delete_extents(&store, 20).unwrap();
        assert!(extent_family(20).all(|extent| !store.contains_extent(extent)));
    }
}
