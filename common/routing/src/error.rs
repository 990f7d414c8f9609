use thiserror::Error;

/// Errors surfaced while resolving collection metadata and routing maps.
///
/// `NotFound` is the stale-routing signal: the collection behind a cached resource id no longer
/// exists. Callers match on it to invalidate their name binding and retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("collection {0} was not found while resolving routing metadata")]
    NotFound(String),
    #[error("partition key ranges of collection {collection} overlap: {detail}")]
    OverlappingRanges { collection: String, detail: String },
    #[error("routing map of collection {0} is incomplete after a full refresh")]
    IncompleteRoutingMap(String),
    #[error("timed out while fetching routing metadata")]
    Timeout,
    #[error("failed to fetch routing metadata: {0}")]
    Fetch(String),
}

impl RoutingError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RoutingError::NotFound(_))
    }
}
