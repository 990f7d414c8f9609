use common_routing::{ContainerProperties, PartitionKeyRange};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::request::{OperationType, ResourceType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseProperties {
    pub id: String,
    #[serde(rename = "_rid", default)]
    pub rid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProperties {
    pub id: String,
    #[serde(rename = "_rid", default)]
    pub rid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionProperties {
    pub id: String,
    #[serde(default)]
    pub permission_mode: String,
    #[serde(default)]
    pub resource: String,
    #[serde(rename = "_token", default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Deserialize)]
struct PartitionKeyRangeList {
    #[serde(rename = "PartitionKeyRanges", default)]
    ranges: Vec<PartitionKeyRange>,
}

#[derive(Deserialize)]
struct DocumentFeed {
    #[serde(rename = "Documents", default)]
    documents: Vec<serde_json::Value>,
}

/// A decoded response payload. The variant follows from the request's resource and operation type.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Document(serde_json::Value),
    Collection(ContainerProperties),
    Database(DatabaseProperties),
    Permission(PermissionProperties),
    User(UserProperties),
    PartitionKeyRanges(Vec<PartitionKeyRange>),
    /// One page of a query or feed read.
    Feed(Vec<serde_json::Value>),
}

impl Resource {
    /// Decodes a response body. Empty bodies (deletes, 204s) decode to `None`.
    pub fn decode(
        resource_type: ResourceType,
        operation: OperationType,
        body: &[u8],
    ) -> Result<Option<Resource>, GatewayError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        if matches!(operation, OperationType::Query | OperationType::ReadFeed) {
            return match resource_type {
                ResourceType::PartitionKeyRange => {
                    let list: PartitionKeyRangeList = serde_json::from_slice(body)?;
                    Ok(Some(Resource::PartitionKeyRanges(list.ranges)))
                }
                ResourceType::Document
                | ResourceType::Database
                | ResourceType::Collection
                | ResourceType::User
                | ResourceType::Permission
                | ResourceType::Offer => {
                    let feed: DocumentFeed = serde_json::from_slice(body)?;
                    Ok(Some(Resource::Feed(feed.documents)))
                }
            };
        }

        let resource = match resource_type {
            ResourceType::Document | ResourceType::Offer => {
                Resource::Document(serde_json::from_slice(body)?)
            }
            ResourceType::Collection => Resource::Collection(serde_json::from_slice(body)?),
            ResourceType::Database => Resource::Database(serde_json::from_slice(body)?),
            ResourceType::Permission => Resource::Permission(serde_json::from_slice(body)?),
            ResourceType::User => Resource::User(serde_json::from_slice(body)?),
            ResourceType::PartitionKeyRange => {
                Resource::PartitionKeyRanges(vec![serde_json::from_slice(body)?])
            }
        };

        Ok(Some(resource))
    }

    pub fn as_document(&self) -> Option<&serde_json::Value> {
        match self {
            Resource::Document(document) => Some(document),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&ContainerProperties> {
        match self {
            Resource::Collection(properties) => Some(properties),
            _ => None,
        }
    }

    pub fn into_feed(self) -> Option<Vec<serde_json::Value>> {
        match self {
            Resource::Feed(items) => Some(items),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_by_resource_type() {
        let document = Resource::decode(
            ResourceType::Document,
            OperationType::Read,
            br#"{"id":"1","tenant":"a"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            document.as_document(),
            Some(&json!({"id": "1", "tenant": "a"}))
        );

        let collection = Resource::decode(
            ResourceType::Collection,
            OperationType::Create,
            br#"{"id":"orders","_rid":"abc=","partitionKey":{"paths":["/tenant"]}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(collection.as_collection().unwrap().rid, "abc=");

        let permission = Resource::decode(
            ResourceType::Permission,
            OperationType::Replace,
            br#"{"id":"p","permissionMode":"Read","resource":"dbs/a/colls/b"}"#,
        )
        .unwrap()
        .unwrap();
        assert!(matches!(permission, Resource::Permission(p) if p.permission_mode == "Read"));

        let user = Resource::decode(ResourceType::User, OperationType::Read, br#"{"id":"u"}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(user, Resource::User(u) if u.id == "u"));
    }

    #[test]
    fn test_decode_feeds() {
        let page = Resource::decode(
            ResourceType::Document,
            OperationType::Query,
            br#"{"_rid":"abc=","Documents":[{"id":"1"},{"id":"2"}],"_count":2}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(page.into_feed().unwrap().len(), 2);

        let ranges = Resource::decode(
            ResourceType::PartitionKeyRange,
            OperationType::ReadFeed,
            br#"{"PartitionKeyRanges":[{"id":"0","minInclusive":"","maxExclusive":"FF"}]}"#,
        )
        .unwrap()
        .unwrap();
        assert!(matches!(ranges, Resource::PartitionKeyRanges(r) if r.len() == 1));
    }

    #[test]
    fn test_empty_body_decodes_to_nothing() {
        assert!(
            Resource::decode(ResourceType::Document, OperationType::Delete, b"")
                .unwrap()
                .is_none()
        );
        assert!(
            Resource::decode(ResourceType::Document, OperationType::Read, b"{not json")
                .is_err()
        );
    }
}
