//! Gateway client for a partitioned document store: resolves collections and partition key ranges,
//! keeps the session consistent across requests, and reports what every request went through.

pub mod client;
pub mod config;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod metadata;
pub mod metrics_consts;
pub mod partition_key;
pub mod registry;
pub mod request;
pub mod resource;
pub mod retry;
pub mod transport;

pub use client::{Container, Database, GatewayClient, ItemResponse, QueryResponse};
pub use common_routing::{CollectionRoutingMap, ContainerProperties, PartitionKeyRange};
pub use common_session::ConsistencyLevel;
pub use config::{ClientOptions, Config};
pub use diagnostics::Diagnostics;
pub use dispatcher::{GatewayDispatcher, GatewayResponse};
pub use error::{DispatchError, GatewayError};
pub use registry::ActiveClientRegistry;
pub use request::{
    CollectionAddress, GatewayRequest, OperationType, PartitionTarget, RequestOptions,
    ResourceType,
};
pub use resource::Resource;
pub use retry::RetryPolicy;
pub use tokio_util::sync::CancellationToken;
