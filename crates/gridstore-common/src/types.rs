//! Core type definitions for gridstore
//!
//! Identifiers shared by the storage, placement and archive crates.

use crate::error::{PersistenceError, Result};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an extent within a store.
///
/// Positive ids hold cache content, zero is the META extent and negative ids
/// are derived from a cache id for auxiliary registrations.
pub type ExtentId = i64;

/// Identifier of a cluster member
pub type MemberId = u32;

/// Identifier of a partition
pub type PartitionId = u32;

/// Identifier of a persistent store: a non-empty, trimmed string
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct StoreId(String);

impl StoreId {
    /// Create a store id, trimming surrounding whitespace
    pub fn new(id: impl AsRef<str>) -> Result<Self> {
        let trimmed = id.as_ref().trim();
        if trimmed.is_empty() {
            return Err(PersistenceError::illegal_argument(
                "invalid store identifier: must be non-empty",
            ));
        }
        if trimmed.contains(['/', '\\']) || trimmed == "." || trimmed == ".." {
            return Err(PersistenceError::illegal_argument(format!(
                "invalid store identifier: {trimmed}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Get as string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreId({})", self.0)
    }
}

impl AsRef<str> for StoreId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque value correlating an asynchronous request with its completion
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct Receipt(String);

impl From<&str> for Receipt {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<u64> for Receipt {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// Fixed-size set of partition ids
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PartitionSet {
    partition_count: u32,
    words: Vec<u64>,
}

impl PartitionSet {
    /// Create an empty set for the given partition count
    #[must_use]
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition_count,
            words: vec![0; (partition_count as usize).div_ceil(64)],
        }
    }

    /// Create a set containing every partition
    #[must_use]
    pub fn full(partition_count: u32) -> Self {
        let mut set = Self::new(partition_count);
        set.fill();
        set
    }

    /// Number of partitions this set ranges over
    #[must_use]
    pub const fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Add every partition
    pub fn fill(&mut self) {
        for p in 0..self.partition_count {
            self.add(p);
        }
    }

    /// Add a partition, returning true if it was absent
    ///
    /// # Panics
    ///
    /// Panics if the partition is out of range.
    pub fn add(&mut self, partition: PartitionId) -> bool {
        assert!(
            partition < self.partition_count,
            "partition {partition} out of range 0..{}",
            self.partition_count
        );
        let (word, bit) = Self::locate(partition);
        let was_set = self.words[word] & bit != 0;
        self.words[word] |= bit;
        !was_set
    }

    /// Remove a partition, returning true if it was present
    pub fn remove(&mut self, partition: PartitionId) -> bool {
        if partition >= self.partition_count {
            return false;
        }
        let (word, bit) = Self::locate(partition);
        let was_set = self.words[word] & bit != 0;
        self.words[word] &= !bit;
        was_set
    }

    /// Check membership
    #[must_use]
    pub fn contains(&self, partition: PartitionId) -> bool {
        if partition >= self.partition_count {
            return false;
        }
        let (word, bit) = Self::locate(partition);
        self.words[word] & bit != 0
    }

    /// Number of partitions in the set
    #[must_use]
    pub fn cardinality(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.cardinality() == self.partition_count as usize
    }

    /// Iterate the partitions in ascending order
    pub fn iter(&self) -> impl Iterator<Item = PartitionId> + '_ {
        (0..self.partition_count).filter(move |p| self.contains(*p))
    }

    const fn locate(partition: PartitionId) -> (usize, u64) {
        ((partition / 64) as usize, 1u64 << (partition % 64))
    }
}

impl fmt::Debug for PartitionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionSet{self}")
    }
}

impl fmt::Display for PartitionSet {
    /// Renders contiguous runs as ranges, e.g. `{0, 3..5}`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut runs: Vec<(u32, u32)> = Vec::new();
        for p in self.iter() {
            match runs.last_mut() {
                Some((_, end)) if *end + 1 == p => *end = p,
                _ => runs.push((p, p)),
            }
        }
        let parts: Vec<String> = runs
            .iter()
            .map(|(start, end)| {
                if start == end {
                    start.to_string()
                } else {
                    format!("{start}..{end}")
                }
            })
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_id_trims() {
        let id = StoreId::new("  12-a-b-1 ").unwrap();
        assert_eq!(id.as_str(), "12-a-b-1");
        assert!(StoreId::new("   ").is_err());
        assert!(StoreId::new("").is_err());
        assert!(StoreId::new("../x").is_err());
    }

    #[test]
    fn test_partition_set_membership() {
        let mut set = PartitionSet::new(130);
        assert!(set.is_empty());
        assert!(set.add(0));
        assert!(!set.add(0));
        assert!(set.add(129));
        assert!(set.contains(129));
        assert!(!set.contains(500));
        assert_eq!(set.cardinality(), 2);
        assert!(set.remove(0));
        assert!(!set.remove(0));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![129]);
    }

    #[test]
    fn test_partition_set_full_and_display() {
        let full = PartitionSet::full(5);
        assert!(full.is_full());
        assert_eq!(full.to_string(), "{0..4}");

        let mut set = PartitionSet::new(8);
        for p in [0, 2, 3, 4, 7] {
            set.add(p);
        }
        assert_eq!(set.to_string(), "{0, 2..4, 7}");
    }

    #[test]
    fn test_receipt_conversions() {
        assert_eq!(Receipt::from(42u64).to_string(), "42");
        assert_eq!(Receipt::from("abc"), Receipt::from("abc".to_string()));
    }
}
