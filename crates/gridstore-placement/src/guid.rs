//! Partition GUIDs
//!
//! A GUID names one persisted version of a partition:
//! `<partition>-<version:hex>-<timestamp:hex>-<member>`, e.g. `7-1a-18f2c3d4e5-3`.
//! Partition and member are decimal; version and the creation timestamp
//! (milliseconds) are lower-case hex. GUIDs of the same partition order by
//! version.

use gridstore_common::{MemberId, PartitionId, PersistenceError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Parsed partition GUID
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Guid {
    pub partition: PartitionId,
    pub version: u64,
    /// Creation time in milliseconds since the epoch
    pub timestamp: u64,
    /// Member that created this version
    pub member: MemberId,
}

impl Guid {
    #[must_use]
    pub const fn new(partition: PartitionId, version: u64, timestamp: u64, member: MemberId) -> Self {
        Self {
            partition,
            version,
            timestamp,
            member,
        }
    }

    /// Whether `self` is a strictly newer version of the same partition
    #[must_use]
    pub fn supersedes(&self, other: &Self) -> bool {
        self.partition == other.partition && self.version > other.version
    }
}

impl Ord for Guid {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.partition, self.version, self.timestamp, self.member).cmp(&(
            other.partition,
            other.version,
            other.timestamp,
            other.member,
        ))
    }
}

impl PartialOrd for Guid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:x}-{:x}-{}",
            self.partition, self.version, self.timestamp, self.member
        )
    }
}

impl FromStr for Guid {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || PersistenceError::illegal_argument(format!("invalid GUID: {s}"));

        let mut fields = s.split('-');
        let (Some(partition), Some(version), Some(timestamp), Some(member), None) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(invalid());
        };

        let decimal = |field: &str| !field.is_empty() && field.bytes().all(|b| b.is_ascii_digit());
        let hex = |field: &str| {
            !field.is_empty() && field.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        };
        if !(decimal(partition) && hex(version) && hex(timestamp) && decimal(member)) {
            return Err(invalid());
        }

        Ok(Self {
            partition: partition.parse().map_err(|_| invalid())?,
            version: u64::from_str_radix(version, 16).map_err(|_| invalid())?,
            timestamp: u64::from_str_radix(timestamp, 16).map_err(|_| invalid())?,
            member: member.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for Guid {
    type Error = PersistenceError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Guid> for String {
    fn from(guid: Guid) -> Self {
        guid.to_string()
    }
}

/// Format a GUID from its fields
#[must_use]
pub fn generate(partition: PartitionId, version: u64, timestamp: u64, member: MemberId) -> String {
    Guid::new(partition, version, timestamp, member).to_string()
}

/// Whether `guid` is well formed
#[must_use]
pub fn validate(guid: &str) -> bool {
    guid.parse::<Guid>().is_ok()
}

pub fn parse_partition(guid: &str) -> Result<PartitionId> {
    guid.parse::<Guid>().map(|g| g.partition)
}

pub fn parse_version(guid: &str) -> Result<u64> {
    guid.parse::<Guid>().map(|g| g.version)
}

pub fn parse_timestamp(guid: &str) -> Result<u64> {
    guid.parse::<Guid>().map(|g| g.timestamp)
}

pub fn parse_member(guid: &str) -> Result<MemberId> {
    guid.parse::<Guid>().map(|g| g.member)
}

/// Time the creating member joined the service, as recorded in the GUID
pub fn get_service_join_time(guid: &str) -> Result<u64> {
    parse_timestamp(guid)
}

/// The GUIDs created by `member`
pub fn get_member_guids<'a, I>(guids: I, member: MemberId) -> Result<Vec<String>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut owned = Vec::new();
    for guid in guids {
        if parse_member(guid)? == member {
            owned.push(guid.to_string());
        }
    }
    Ok(owned)
}

/// The newest GUID per partition, keyed by partition id
pub fn get_mapped_guids<'a, I>(guids: I, partition_count: u32) -> Result<BTreeMap<PartitionId, String>>
where
    I: IntoIterator<Item = &'a str>,
{
    Ok(resolve_newest(guids, partition_count)?
        .into_iter()
        .enumerate()
        .filter_map(|(partition, guid)| guid.map(|g| (partition as PartitionId, g)))
        .collect())
}

/// Pick the GUID with the highest version for each partition.
///
/// The result has one slot per partition; partitions without any GUID are
/// `None`. GUIDs naming a partition beyond `partition_count` are left over
/// from an earlier partition count and are ignored. Of two GUIDs with equal
/// versions the first one seen wins.
pub fn resolve_newest<'a, I>(guids: I, partition_count: u32) -> Result<Vec<Option<String>>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut newest: Vec<Option<Guid>> = vec![None; partition_count as usize];
    for text in guids {
        let guid: Guid = text.parse()?;
        let Some(slot) = newest.get_mut(guid.partition as usize) else {
            continue;
        };
        match slot {
            Some(current) if !guid.supersedes(current) => {}
            _ => *slot = Some(guid),
        }
    }
    Ok(newest
        .into_iter()
        .map(|guid| guid.map(|g| g.to_string()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_parse() {
        let guid = generate(7, 26, 0x18f2_c3d4_e5, 3);
        assert_eq!(guid, "7-1a-18f2c3d4e5-3");
        assert!(validate(&guid));
        assert_eq!(parse_partition(&guid).unwrap(), 7);
        assert_eq!(parse_version(&guid).unwrap(), 26);
        assert_eq!(parse_timestamp(&guid).unwrap(), 0x18f2_c3d4_e5);
        assert_eq!(get_service_join_time(&guid).unwrap(), 0x18f2_c3d4_e5);
        assert_eq!(parse_member(&guid).unwrap(), 3);
    }

    #[test]
    fn test_validate_rejects_malformed() {
        for bad in [
            "",
            "1-2-3",
            "1-2-3-4-5",
            "a-1-1-1",
            "1-G-1-1",
            "1-1-1-x",
            "1-1A-1-1",
            "-1-1-1-1",
            "1--1-1",
        ] {
            assert!(!validate(bad), "{bad} should be invalid");
        }
        assert!(parse_partition("junk").unwrap_err().is_illegal_argument());
    }

    #[test]
    fn test_resolve_newest_prefers_higher_version() {
        let guids = ["0-1-a-1", "1-1-a-1", "0-2-b-2", "0-1-c-3"];
        let newest = resolve_newest(guids, 2).unwrap();
        assert_eq!(
            newest,
            vec![Some("0-2-b-2".to_string()), Some("1-1-a-1".to_string())]
        );
    }

    #[test]
    fn test_resolve_newest_ignores_out_of_range_partitions() {
        let newest = resolve_newest(["5-9-a-1", "1-1-a-1"], 3).unwrap();
        assert_eq!(newest, vec![None, Some("1-1-a-1".to_string()), None]);
    }

    #[test]
    fn test_equal_versions_keep_first() {
        let newest = resolve_newest(["0-3-a-1", "0-3-b-2"], 1).unwrap();
        assert_eq!(newest, vec![Some("0-3-a-1".to_string())]);
    }

    #[test]
    fn test_member_and_mapped_guids() {
        let guids = ["0-1-a-1", "1-2-a-2", "2-1-a-1"];
        assert_eq!(
            get_member_guids(guids, 1).unwrap(),
            vec!["0-1-a-1".to_string(), "2-1-a-1".to_string()]
        );

        let mapped = get_mapped_guids(guids, 4).unwrap();
        assert_eq!(mapped.len(), 3);
        assert_eq!(mapped[&1], "1-2-a-2");
        assert!(!mapped.contains_key(&3));
    }

    #[test]
    fn test_ordering_by_partition_then_version() {
        let mut guids: Vec<Guid> = ["1-1-a-1", "0-10-a-1", "0-2-a-1"]
            .iter()
            .map(|g| g.parse().unwrap())
            .collect();
        guids.sort();
        let sorted: Vec<String> = guids.into_iter().map(String::from).collect();
        assert_eq!(sorted, vec!["0-2-a-1", "0-10-a-1", "1-1-a-1"]);
    }

    #[test]
    fn test_serde_as_string() {
        let guid: Guid = "4-ff-10-2".parse().unwrap();
        let json = serde_json::to_string(&guid).unwrap();
        assert_eq!(json, "\"4-ff-10-2\"");
        let back: Guid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, guid);
        assert!(serde_json::from_str::<Guid>("\"nope\"").is_err());
    }
}
