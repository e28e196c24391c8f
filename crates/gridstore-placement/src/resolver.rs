//! Recovery-time GUID resolution
//!
//! Every member reports the partition GUIDs visible in its storage. The
//! resolver picks the newest GUID per partition and works out which members
//! can supply it, which partitions nobody can recover and whether all members
//! share the same storage.

use crate::guid::Guid;
use gridstore_common::{MemberId, PartitionId, PartitionSet, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Outcome of resolving the registered GUIDs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    /// Newest GUID per partition, `None` where no member reported one
    pub newest: Vec<Option<Guid>>,
    /// Partitions for which each member holds the newest GUID
    pub ownership: BTreeMap<MemberId, PartitionSet>,
    /// Partitions without any registered GUID
    pub unresolved: PartitionSet,
    /// Whether every member can see every winning GUID
    pub shared: bool,
}

impl Resolution {
    fn compute(partition_count: u32, registered: &BTreeMap<MemberId, Vec<Guid>>) -> Self {
        let mut newest: Vec<Option<Guid>> = vec![None; partition_count as usize];
        for guid in registered.values().flatten() {
            let Some(slot) = newest.get_mut(guid.partition as usize) else {
                continue;
            };
            match slot {
                Some(current) if !guid.supersedes(current) => {}
                _ => *slot = Some(*guid),
            }
        }

        let mut resolved = PartitionSet::new(partition_count);
        let mut unresolved = PartitionSet::new(partition_count);
        for (partition, guid) in newest.iter().enumerate() {
            let partition = partition as PartitionId;
            if guid.is_some() {
                resolved.add(partition);
            } else {
                unresolved.add(partition);
            }
        }

        let ownership: BTreeMap<MemberId, PartitionSet> = registered
            .iter()
            .map(|(member, guids)| {
                let mut owned = PartitionSet::new(partition_count);
                for guid in guids {
                    if newest.get(guid.partition as usize) == Some(&Some(*guid)) {
                        owned.add(guid.partition);
                    }
                }
                (*member, owned)
            })
            .collect();

        let shared = !ownership.is_empty() && ownership.values().all(|set| *set == resolved);

        Self {
            newest,
            ownership,
            unresolved,
            shared,
        }
    }
}

/// Accumulates member GUID registrations and resolves them lazily
#[derive(Debug)]
pub struct GuidResolver {
    partition_count: u32,
    registered: RwLock<BTreeMap<MemberId, Vec<Guid>>>,
    resolution: RwLock<Option<Arc<Resolution>>>,
}

impl GuidResolver {
    #[must_use]
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition_count,
            registered: RwLock::new(BTreeMap::new()),
            resolution: RwLock::new(None),
        }
    }

    #[must_use]
    pub const fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Record the GUIDs visible to `member`.
    ///
    /// Repeated registrations for a member accumulate. Fails without
    /// registering anything if a GUID is malformed.
    pub fn register<'a, I>(&self, member: MemberId, guids: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let parsed = guids
            .into_iter()
            .map(str::parse::<Guid>)
            .collect::<Result<Vec<_>>>()?;
        debug!("Member {} registered {} GUIDs", member, parsed.len());

        self.registered
            .write()
            .entry(member)
            .or_default()
            .extend(parsed);
        *self.resolution.write() = None;
        Ok(())
    }

    /// Members that have registered so far
    #[must_use]
    pub fn members(&self) -> Vec<MemberId> {
        self.registered.read().keys().copied().collect()
    }

    /// The current resolution, computed on first use after a registration
    #[must_use]
    pub fn resolve(&self) -> Arc<Resolution> {
        if let Some(resolution) = self.resolution.read().as_ref() {
            return Arc::clone(resolution);
        }
        let mut slot = self.resolution.write();
        if let Some(resolution) = slot.as_ref() {
            return Arc::clone(resolution);
        }
        let resolution = Arc::new(Resolution::compute(
            self.partition_count,
            &self.registered.read(),
        ));
        *slot = Some(Arc::clone(&resolution));
        resolution
    }

    /// Newest GUID per partition, `None` where nothing was registered
    #[must_use]
    pub fn resolved_guids(&self) -> Vec<Option<String>> {
        self.resolve()
            .newest
            .iter()
            .map(|guid| guid.map(|g| g.to_string()))
            .collect()
    }

    /// Partitions for which each member holds the newest GUID
    #[must_use]
    pub fn member_ownership(&self) -> BTreeMap<MemberId, PartitionSet> {
        self.resolve().ownership.clone()
    }

    /// The newest GUIDs `member` is authoritative for
    #[must_use]
    pub fn member_guids(&self, member: MemberId) -> Vec<String> {
        let resolution = self.resolve();
        let Some(owned) = resolution.ownership.get(&member) else {
            return Vec::new();
        };
        owned
            .iter()
            .filter_map(|p| resolution.newest[p as usize].map(|g| g.to_string()))
            .collect()
    }

    #[must_use]
    pub fn unresolved_partitions(&self) -> PartitionSet {
        self.resolve().unresolved.clone()
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.resolve().shared
    }
}
