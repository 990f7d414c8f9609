use std::time::Duration;

use common_session::ConsistencyLevel;
use reqwest::Method;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Lifecycle of one logical request inside the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestState {
    Created,
    Sent,
    Retrying,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Create,
    Read,
    Replace,
    Upsert,
    Delete,
    Query,
    ReadFeed,
}

impl OperationType {
    pub fn method(&self) -> Method {
        match self {
            OperationType::Create | OperationType::Upsert | OperationType::Query => Method::POST,
            OperationType::Read | OperationType::ReadFeed => Method::GET,
            OperationType::Replace => Method::PUT,
            OperationType::Delete => Method::DELETE,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            OperationType::Read | OperationType::Query | OperationType::ReadFeed
        )
    }

    pub fn is_write(&self) -> bool {
        !self.is_read_only()
    }
}

/// Kinds of resources the gateway serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Database,
    Collection,
    Document,
    User,
    Permission,
    PartitionKeyRange,
    Offer,
}

impl ResourceType {
    /// Metadata kept on the master partition. Requests for these never carry a session token.
    pub fn is_master_resource(&self) -> bool {
        match self {
            ResourceType::Database
            | ResourceType::Collection
            | ResourceType::User
            | ResourceType::Permission
            | ResourceType::Offer
            | ResourceType::PartitionKeyRange => true,
            ResourceType::Document => false,
        }
    }

    /// Path segment of the resource in a link, e.g. `docs` in `dbs/db/colls/coll/docs/id`.
    pub fn path_segment(&self) -> &'static str {
        match self {
            ResourceType::Database => "dbs",
            ResourceType::Collection => "colls",
            ResourceType::Document => "docs",
            ResourceType::User => "users",
            ResourceType::Permission => "permissions",
            ResourceType::PartitionKeyRange => "pkranges",
            ResourceType::Offer => "offers",
        }
    }
}

/// Per-operation knobs supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Relax the account consistency for this request. Stronger levels are rejected.
    pub consistency_level: Option<ConsistencyLevel>,
    /// Sent as-is instead of the token the client tracks.
    pub session_token: Option<String>,
    pub excluded_regions: Vec<String>,
    /// Allow retrying a write on timeouts and transient server errors.
    pub safe_to_retry: bool,
    /// Overrides the client's end-to-end timeout.
    pub end_to_end_timeout: Option<Duration>,
    pub if_match_etag: Option<String>,
    /// Scopes a query to one logical partition instead of fanning out.
    pub partition_key: Option<serde_json::Value>,
    pub max_item_count: Option<u32>,
    /// Observed before sending and while awaiting the response.
    pub cancellation: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn with_consistency_level(mut self, level: ConsistencyLevel) -> Self {
        self.consistency_level = Some(level);
        self
    }

    pub fn with_session_token(mut self, token: &str) -> Self {
        self.session_token = Some(token.to_owned());
        self
    }

    pub fn with_end_to_end_timeout(mut self, timeout: Duration) -> Self {
        self.end_to_end_timeout = Some(timeout);
        self
    }

    pub fn with_excluded_regions(mut self, regions: &[&str]) -> Self {
        self.excluded_regions = regions.iter().map(|r| (*r).to_owned()).collect();
        self
    }

    pub fn with_partition_key(mut self, partition_key: serde_json::Value) -> Self {
        self.partition_key = Some(partition_key);
        self
    }

    pub fn with_if_match_etag(mut self, etag: &str) -> Self {
        self.if_match_etag = Some(etag.to_owned());
        self
    }

    pub fn with_max_item_count(mut self, max_item_count: u32) -> Self {
        self.max_item_count = Some(max_item_count);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    pub fn safe_to_retry(mut self) -> Self {
        self.safe_to_retry = true;
        self
    }
}

/// Collection addressed by name, as `dbs/{database}/colls/{collection}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionAddress {
    pub database: String,
    pub collection: String,
}

impl CollectionAddress {
    pub fn new(database: &str, collection: &str) -> Self {
        Self {
            database: database.to_owned(),
            collection: collection.to_owned(),
        }
    }

    pub fn link(&self) -> String {
        format!("dbs/{}/colls/{}", self.database, self.collection)
    }

    /// Parses a collection link. Links of anything else, documents included, yield `None`.
    pub fn from_link(link: &str) -> Option<Self> {
        let mut segments = link.trim_matches('/').split('/');
        match (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) {
            (Some("dbs"), Some(database), Some("colls"), Some(collection), None)
                if !database.is_empty() && !collection.is_empty() =>
            {
                Some(Self::new(database, collection))
            }
            _ => None,
        }
    }
}

/// How a request picks its partition.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionTarget {
    /// Metadata requests and collection-level operations.
    None,
    /// A single logical partition, addressed by its partition key value.
    Key(serde_json::Value),
    /// One physical partition, addressed by range id (cross-partition query fan-out).
    Range(String),
}

/// A logical request handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub operation: OperationType,
    pub resource_type: ResourceType,
    /// Link relative to the endpoint, e.g. `dbs/shop/colls/orders/docs/42`.
    pub resource_link: String,
    /// Owning collection for data-plane requests.
    pub collection: Option<CollectionAddress>,
    pub partition: PartitionTarget,
    pub body: Option<Vec<u8>>,
    pub headers: Vec<(String, String)>,
    pub options: RequestOptions,
}

impl GatewayRequest {
    pub fn new(operation: OperationType, resource_type: ResourceType, resource_link: &str) -> Self {
        Self {
            operation,
            resource_type,
            resource_link: resource_link.trim_matches('/').to_owned(),
            collection: None,
            partition: PartitionTarget::None,
            body: None,
            headers: Vec::new(),
            options: RequestOptions::default(),
        }
    }

    pub fn in_collection(mut self, collection: CollectionAddress) -> Self {
        self.collection = Some(collection);
        self
    }

    pub fn with_partition(mut self, partition: PartitionTarget) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Name used in logs, metrics and diagnostics, e.g. `ReadDocument`.
    pub fn operation_name(&self) -> String {
        format!("{:?}{:?}", self.operation, self.resource_type)
    }

    /// Whether transient failures may be retried without risking a duplicate write.
    pub fn is_retry_safe(&self) -> bool {
        self.operation.is_read_only() || self.options.safe_to_retry
    }
}
