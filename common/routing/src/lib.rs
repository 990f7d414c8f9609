//! Partition routing for the gateway client: key ranges, routing maps, and the caches that keep
//! them fresh.

pub mod cache;
pub mod collection_cache;
pub mod error;
pub mod fetcher;
pub mod metrics_consts;
pub mod range;
pub mod routing_map;

pub use cache::PartitionKeyRangeCache;
pub use collection_cache::CollectionCache;
pub use error::RoutingError;
pub use fetcher::{
    CollectionFetcher, ContainerProperties, PartitionKeyDefinition, PartitionKeyRangeFeed,
    RoutingMapFetcher,
};
pub use range::{
    PartitionKeyRange, Range, MAX_EXCLUSIVE_EFFECTIVE_PARTITION_KEY,
    MIN_INCLUSIVE_EFFECTIVE_PARTITION_KEY,
};
pub use routing_map::CollectionRoutingMap;
