use std::collections::{BTreeMap, HashSet};

use crate::error::RoutingError;
use crate::range::{
    PartitionKeyRange, Range, MAX_EXCLUSIVE_EFFECTIVE_PARTITION_KEY,
    MIN_INCLUSIVE_EFFECTIVE_PARTITION_KEY,
};

/// The full set of partition key ranges of one collection, ordered by minimum boundary.
///
/// A map only exists in complete form: the ranges cover the key space from
/// [`MIN_INCLUSIVE_EFFECTIVE_PARTITION_KEY`] to [`MAX_EXCLUSIVE_EFFECTIVE_PARTITION_KEY`] with no
/// gaps and no overlaps. Maps are immutable; a refresh builds a new one and the cache swaps it in.
///
/// ```text
/// CollectionRoutingMap {
///     collection_rid: "f1BWAJ0z-wA=",
///     ordered_ranges: [
///         0: ["",         "3FFFFFFF")
///         3: ["3FFFFFFF", "7FFFFFFF")   parents: [1]
///         4: ["7FFFFFFF", "FF")         parents: [1]
///     ],
///     gone_ranges: {1},
///     change_feed_etag: Some("\"00000002\""),
/// }
/// ```
///
/// Two maps are equal when they share the collection, the ordered ranges and the version marker;
/// the retired range ids are bookkeeping and do not take part.
#[derive(Debug, Clone)]
pub struct CollectionRoutingMap {
    collection_rid: String,
    ordered_ranges: Vec<PartitionKeyRange>,
    gone_ranges: HashSet<String>,
    change_feed_etag: Option<String>,
}

impl PartialEq for CollectionRoutingMap {
    fn eq(&self, other: &Self) -> bool {
        self.collection_rid == other.collection_rid
            && self.ordered_ranges == other.ordered_ranges
            && self.change_feed_etag == other.change_feed_etag
    }
}

impl Eq for CollectionRoutingMap {}

impl CollectionRoutingMap {
    /// Build a map from the ranges returned by the backend.
    ///
    /// Returns `Ok(None)` when the ranges leave a gap in the key space (the feed was partial), and
    /// an error when two ranges overlap, which no amount of refreshing fixes.
    pub fn try_create_complete(
        collection_rid: &str,
        ranges: Vec<PartitionKeyRange>,
        change_feed_etag: Option<String>,
    ) -> Result<Option<Self>, RoutingError> {
        let gone_ranges: HashSet<String> = ranges
            .iter()
            .flat_map(|range| range.parents.iter().cloned())
            .collect();

        Self::build(collection_rid, ranges, gone_ranges, change_feed_etag)
    }

    /// Merge an incremental range feed into this map.
    ///
    /// Ranges whose ids show up as parents of the new ranges are retired. The result goes through
    /// the same completeness checks as [`CollectionRoutingMap::try_create_complete`].
    pub fn try_combine(
        &self,
        new_ranges: Vec<PartitionKeyRange>,
        change_feed_etag: Option<String>,
    ) -> Result<Option<Self>, RoutingError> {
        let mut gone_ranges = self.gone_ranges.clone();
        gone_ranges.extend(
            new_ranges
                .iter()
                .flat_map(|range| range.parents.iter().cloned()),
        );

        let ranges = self
            .ordered_ranges
            .iter()
            .cloned()
            .chain(new_ranges)
            .collect();

        Self::build(&self.collection_rid, ranges, gone_ranges, change_feed_etag)
    }

    fn build(
        collection_rid: &str,
        ranges: Vec<PartitionKeyRange>,
        gone_ranges: HashSet<String>,
        change_feed_etag: Option<String>,
    ) -> Result<Option<Self>, RoutingError> {
        // Later entries for the same id win; retired parents are dropped.
        let mut by_id: BTreeMap<String, PartitionKeyRange> = BTreeMap::new();
        for range in ranges {
            if !gone_ranges.contains(&range.id) {
                by_id.insert(range.id.clone(), range);
            }
        }

        let mut ordered_ranges: Vec<PartitionKeyRange> = by_id.into_values().collect();
        ordered_ranges.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));

        for pair in ordered_ranges.windows(2) {
            let (previous, next) = (&pair[0], &pair[1]);
            if previous.max_exclusive > next.min_inclusive {
                return Err(RoutingError::OverlappingRanges {
                    collection: collection_rid.to_owned(),
                    detail: format!("{previous} overlaps {next}"),
                });
            }
        }

        if !Self::is_complete_set(&ordered_ranges) {
            tracing::debug!(
                collection_rid,
                ranges = ordered_ranges.len(),
                "partition key ranges do not cover the key space"
            );
            return Ok(None);
        }

        Ok(Some(Self {
            collection_rid: collection_rid.to_owned(),
            ordered_ranges,
            gone_ranges,
            change_feed_etag,
        }))
    }

    fn is_complete_set(ordered_ranges: &[PartitionKeyRange]) -> bool {
        let (Some(first), Some(last)) = (ordered_ranges.first(), ordered_ranges.last()) else {
            return false;
        };

        first.min_inclusive == MIN_INCLUSIVE_EFFECTIVE_PARTITION_KEY
            && last.max_exclusive == MAX_EXCLUSIVE_EFFECTIVE_PARTITION_KEY
            && ordered_ranges
                .windows(2)
                .all(|pair| pair[0].max_exclusive == pair[1].min_inclusive)
    }

    pub fn collection_rid(&self) -> &str {
        &self.collection_rid
    }

    pub fn ordered_ranges(&self) -> &[PartitionKeyRange] {
        &self.ordered_ranges
    }

    /// Version marker handed back by the backend; used for incremental refreshes.
    pub fn change_feed_etag(&self) -> Option<&str> {
        self.change_feed_etag.as_deref()
    }

    pub fn len(&self) -> usize {
        self.ordered_ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered_ranges.is_empty()
    }

    /// Whether `range_id` was split away and is no longer addressable.
    pub fn is_gone(&self, range_id: &str) -> bool {
        self.gone_ranges.contains(range_id)
    }

    pub fn range_by_id(&self, range_id: &str) -> Option<&PartitionKeyRange> {
        self.ordered_ranges.iter().find(|range| range.id == range_id)
    }

    /// The range owning `effective_partition_key`.
    pub fn range_by_effective_partition_key(
        &self,
        effective_partition_key: &str,
    ) -> Option<&PartitionKeyRange> {
        let index = self
            .ordered_ranges
            .partition_point(|range| range.min_inclusive.as_str() <= effective_partition_key);

        index
            .checked_sub(1)
            .and_then(|i| self.ordered_ranges.get(i))
            .filter(|range| range.contains(effective_partition_key))
    }

    /// Every range that shares at least one key with any of `targets`, in key order.
    pub fn overlapping_ranges(&self, targets: &[Range]) -> Vec<&PartitionKeyRange> {
        self.ordered_ranges
            .iter()
            .filter(|range| {
                let owned = range.to_range();
                targets.iter().any(|target| owned.overlaps(target))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_ranges() -> Vec<PartitionKeyRange> {
        vec![
            PartitionKeyRange::new("2", "0000000050", "0000000070"),
            PartitionKeyRange::new("0", "", "0000000030"),
            PartitionKeyRange::new("1", "0000000030", "0000000050"),
            PartitionKeyRange::new("3", "0000000070", "FF"),
        ]
    }

    #[test]
    fn test_complete_map_orders_ranges_and_resolves_keys() {
        let map = CollectionRoutingMap::try_create_complete("rid", four_ranges(), None)
            .unwrap()
            .expect("ranges cover the key space");

        let ids: Vec<&str> = map.ordered_ranges().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2", "3"]);

        assert_eq!(map.range_by_effective_partition_key("").unwrap().id, "0");
        assert_eq!(
            map.range_by_effective_partition_key("0000000000").unwrap().id,
            "0"
        );
        assert_eq!(
            map.range_by_effective_partition_key("0000000030").unwrap().id,
            "1"
        );
        assert_eq!(
            map.range_by_effective_partition_key("0000000031").unwrap().id,
            "1"
        );
        assert_eq!(
            map.range_by_effective_partition_key("0000000071").unwrap().id,
            "3"
        );
        assert!(map.range_by_effective_partition_key("FF").is_none());

        assert_eq!(map.range_by_id("1").unwrap().min_inclusive, "0000000030");
        assert!(map.range_by_id("9").is_none());
    }

    #[test]
    fn test_overlapping_ranges_lookup() {
        let map = CollectionRoutingMap::try_create_complete("rid", four_ranges(), None)
            .unwrap()
            .unwrap();

        assert_eq!(map.overlapping_ranges(&[Range::full()]).len(), 4);
        assert!(map
            .overlapping_ranges(&[Range::new("", "", false, false)])
            .is_empty());

        let point = map.overlapping_ranges(&[Range::point("0000000040")]);
        assert_eq!(point.len(), 1);
        assert_eq!(point[0].id, "1");

        let spanning = map.overlapping_ranges(&[
            Range::new("0000000040", "0000000045", true, true),
            Range::new("0000000045", "0000000046", true, true),
            Range::new("0000000046", "0000000050", true, true),
        ]);
        let ids: Vec<&str> = spanning.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn test_overlapping_input_is_rejected() {
        let result = CollectionRoutingMap::try_create_complete(
            "rid",
            vec![
                PartitionKeyRange::new("1", "0000000020", "0000000030"),
                PartitionKeyRange::new("2", "0000000025", "0000000035"),
            ],
            None,
        );

        assert!(matches!(
            result,
            Err(RoutingError::OverlappingRanges { .. })
        ));
    }

    #[test]
    fn test_gap_yields_incomplete_map() {
        let with_gap = CollectionRoutingMap::try_create_complete(
            "rid",
            vec![
                PartitionKeyRange::new("2", "", "0000000030"),
                PartitionKeyRange::new("3", "0000000031", "FF"),
            ],
            None,
        )
        .unwrap();
        assert!(with_gap.is_none());

        let contiguous = CollectionRoutingMap::try_create_complete(
            "rid",
            vec![
                PartitionKeyRange::new("2", "", "0000000030"),
                PartitionKeyRange::new("3", "0000000030", "FF"),
            ],
            None,
        )
        .unwrap();
        assert!(contiguous.is_some());

        let empty = CollectionRoutingMap::try_create_complete("rid", vec![], None).unwrap();
        assert!(empty.is_none());
    }

    #[test]
    fn test_parents_are_gone() {
        let map = CollectionRoutingMap::try_create_complete(
            "rid",
            vec![
                PartitionKeyRange::new("2", "", "0000000030").with_parents(&["1", "0"]),
                PartitionKeyRange::new("3", "0000000030", "0000000032").with_parents(&["5"]),
                PartitionKeyRange::new("4", "0000000032", "FF"),
            ],
            None,
        )
        .unwrap()
        .unwrap();

        assert!(map.is_gone("1"));
        assert!(map.is_gone("0"));
        assert!(map.is_gone("5"));
        assert!(!map.is_gone("2"));
        assert!(!map.is_gone("4"));
    }

    #[test]
    fn test_combine_replaces_split_parent_with_children() {
        let map = CollectionRoutingMap::try_create_complete(
            "rid",
            vec![
                PartitionKeyRange::new("0", "", "0000000030"),
                PartitionKeyRange::new("1", "0000000030", "FF"),
            ],
            Some("\"1\"".to_string()),
        )
        .unwrap()
        .unwrap();

        let combined = map
            .try_combine(
                vec![
                    PartitionKeyRange::new("2", "0000000030", "0000000070").with_parents(&["1"]),
                    PartitionKeyRange::new("3", "0000000070", "FF").with_parents(&["1"]),
                ],
                Some("\"2\"".to_string()),
            )
            .unwrap()
            .expect("children cover the parent");

        let ids: Vec<&str> = combined
            .ordered_ranges()
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["0", "2", "3"]);
        assert!(combined.is_gone("1"));
        assert_eq!(combined.change_feed_etag(), Some("\"2\""));
        assert_ne!(combined, map);
    }

    #[test]
    fn test_equality_ignores_retired_ranges() {
        let children = || {
            vec![
                PartitionKeyRange::new("0", "", "0000000030"),
                PartitionKeyRange::new("2", "0000000030", "0000000070").with_parents(&["1"]),
                PartitionKeyRange::new("3", "0000000070", "FF").with_parents(&["1"]),
            ]
        };

        let before_split = CollectionRoutingMap::try_create_complete(
            "rid",
            vec![
                PartitionKeyRange::new("0", "", "0000000030"),
                PartitionKeyRange::new("1", "0000000030", "FF").with_parents(&["9"]),
            ],
            Some("\"1\"".to_string()),
        )
        .unwrap()
        .unwrap();
        let combined = before_split
            .try_combine(children()[1..].to_vec(), Some("\"2\"".to_string()))
            .unwrap()
            .unwrap();
        let fresh =
            CollectionRoutingMap::try_create_complete("rid", children(), Some("\"2\"".to_string()))
                .unwrap()
                .unwrap();

        assert!(combined.is_gone("9"));
        assert!(!fresh.is_gone("9"));
        assert_eq!(combined, fresh);

        let other_marker =
            CollectionRoutingMap::try_create_complete("rid", children(), Some("\"3\"".to_string()))
                .unwrap()
                .unwrap();
        assert_ne!(fresh, other_marker);
    }

    #[test]
    fn test_combine_with_partial_children_is_incomplete() {
        let map = CollectionRoutingMap::try_create_complete(
            "rid",
            vec![
                PartitionKeyRange::new("0", "", "0000000030"),
                PartitionKeyRange::new("1", "0000000030", "FF"),
            ],
            None,
        )
        .unwrap()
        .unwrap();

        // Only one child of the split arrived; the other half of the parent is uncovered.
        let combined = map
            .try_combine(
                vec![PartitionKeyRange::new("2", "0000000030", "0000000070").with_parents(&["1"])],
                None,
            )
            .unwrap();

        assert!(combined.is_none());
    }
}
