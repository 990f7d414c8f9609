use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RoutingError;
use crate::range::PartitionKeyRange;

/// One page of the partition key range feed of a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionKeyRangeFeed {
    pub ranges: Vec<PartitionKeyRange>,
    /// Version marker to hand back on the next incremental request.
    pub etag: Option<String>,
}

impl PartitionKeyRangeFeed {
    pub fn new(ranges: Vec<PartitionKeyRange>, etag: Option<&str>) -> Self {
        Self {
            ranges,
            etag: etag.map(str::to_owned),
        }
    }

    /// The feed reported no change since `etag`.
    pub fn not_modified(etag: Option<&str>) -> Self {
        Self::new(Vec::new(), etag)
    }
}

/// Source of partition key ranges for a collection.
///
/// With `if_none_match` set, implementations return only the ranges that changed since that
/// version marker (an empty feed when nothing changed). Without it they return every range.
/// A collection that no longer exists is reported as [`RoutingError::NotFound`].
#[async_trait]
pub trait RoutingMapFetcher: Send + Sync + 'static {
    async fn fetch_ranges(
        &self,
        collection_rid: &str,
        if_none_match: Option<&str>,
    ) -> Result<PartitionKeyRangeFeed, RoutingError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionKeyDefinition {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// The subset of a collection's properties the client routes with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerProperties {
    pub id: String,
    #[serde(rename = "_rid", default)]
    pub rid: String,
    #[serde(rename = "partitionKey", default)]
    pub partition_key: PartitionKeyDefinition,
}

impl ContainerProperties {
    pub fn new(id: &str, rid: &str, partition_key_path: &str) -> Self {
        Self {
            id: id.to_owned(),
            rid: rid.to_owned(),
            partition_key: PartitionKeyDefinition {
                paths: vec![partition_key_path.to_owned()],
                kind: Some("Hash".to_owned()),
            },
        }
    }

    /// First partition key path with the leading slash removed, e.g. `/tenant` becomes `tenant`.
    pub fn partition_key_field(&self) -> Option<&str> {
        self.partition_key
            .paths
            .first()
            .map(|path| path.trim_start_matches('/'))
    }
}

/// Resolves a collection name (within a database) to its properties, including the resource id.
#[async_trait]
pub trait CollectionFetcher: Send + Sync + 'static {
    async fn fetch_collection(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<ContainerProperties, RoutingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_properties_read_gateway_fields() {
        let json = r#"{
            "id": "orders",
            "_rid": "f1BWAJ0z-wA=",
            "_etag": "\"00000000-0000\"",
            "partitionKey": {"paths": ["/tenant"], "kind": "Hash"}
        }"#;

        let properties: ContainerProperties = serde_json::from_str(json).unwrap();

        assert_eq!(properties.id, "orders");
        assert_eq!(properties.rid, "f1BWAJ0z-wA=");
        assert_eq!(properties.partition_key_field(), Some("tenant"));
    }
}
