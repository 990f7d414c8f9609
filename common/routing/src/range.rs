use std::fmt;

use serde::{Deserialize, Serialize};

/// Lowest effective partition key. Every routing map starts here.
pub const MIN_INCLUSIVE_EFFECTIVE_PARTITION_KEY: &str = "";
/// Upper bound of the effective partition key space. Every routing map ends here.
pub const MAX_EXCLUSIVE_EFFECTIVE_PARTITION_KEY: &str = "FF";

/// A contiguous slice of the effective partition key space owned by one physical partition.
///
/// Boundaries are uppercase hex strings compared lexicographically. `parents` holds the ids of the
/// ranges this one was split from, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKeyRange {
    pub id: String,
    pub min_inclusive: String,
    pub max_exclusive: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

impl PartitionKeyRange {
    pub fn new(id: &str, min_inclusive: &str, max_exclusive: &str) -> Self {
        Self {
            id: id.to_owned(),
            min_inclusive: min_inclusive.to_owned(),
            max_exclusive: max_exclusive.to_owned(),
            parents: Vec::new(),
        }
    }

    pub fn with_parents(mut self, parents: &[&str]) -> Self {
        self.parents = parents.iter().map(|p| (*p).to_owned()).collect();
        self
    }

    /// The key interval this range owns.
    pub fn to_range(&self) -> Range {
        Range::new(&self.min_inclusive, &self.max_exclusive, true, false)
    }

    /// Whether `effective_partition_key` falls inside `[min_inclusive, max_exclusive)`.
    pub fn contains(&self, effective_partition_key: &str) -> bool {
        self.min_inclusive.as_str() <= effective_partition_key
            && effective_partition_key < self.max_exclusive.as_str()
    }
}

impl fmt::Display for PartitionKeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:[{}, {})",
            self.id, self.min_inclusive, self.max_exclusive
        )
    }
}

/// An interval over effective partition keys, used to describe what a request targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Range {
    pub min: String,
    pub max: String,
    pub is_min_inclusive: bool,
    pub is_max_inclusive: bool,
}

impl Range {
    pub fn new(min: &str, max: &str, is_min_inclusive: bool, is_max_inclusive: bool) -> Self {
        Self {
            min: min.to_owned(),
            max: max.to_owned(),
            is_min_inclusive,
            is_max_inclusive,
        }
    }

    /// A range holding exactly one effective partition key.
    pub fn point(effective_partition_key: &str) -> Self {
        Self::new(effective_partition_key, effective_partition_key, true, true)
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self::new(
            MIN_INCLUSIVE_EFFECTIVE_PARTITION_KEY,
            MAX_EXCLUSIVE_EFFECTIVE_PARTITION_KEY,
            true,
            false,
        )
    }

    pub fn is_empty(&self) -> bool {
        match self.min.cmp(&self.max) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => !(self.is_min_inclusive && self.is_max_inclusive),
            std::cmp::Ordering::Less => false,
        }
    }

    /// Whether the two intervals share at least one key.
    pub fn overlaps(&self, other: &Range) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }

        // self ends before other starts
        match self.max.cmp(&other.min) {
            std::cmp::Ordering::Less => return false,
            std::cmp::Ordering::Equal if !(self.is_max_inclusive && other.is_min_inclusive) => {
                return false
            }
            _ => {}
        }

        // other ends before self starts
        match other.max.cmp(&self.min) {
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => other.is_max_inclusive && self.is_min_inclusive,
            std::cmp::Ordering::Greater => true,
        }
    }
}
