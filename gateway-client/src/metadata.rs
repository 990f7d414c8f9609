use std::sync::Arc;

use async_trait::async_trait;
use common_routing::{
    CollectionFetcher, ContainerProperties, PartitionKeyRange, PartitionKeyRangeFeed,
    RoutingError, RoutingMapFetcher,
};
use dashmap::DashMap;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics_consts::METADATA_REQUESTS;
use crate::transport::{headers, GatewayTransport, RawResponse, TransportFailure};

#[derive(Deserialize)]
struct PartitionKeyRangePage {
    #[serde(rename = "PartitionKeyRanges", default)]
    ranges: Vec<PartitionKeyRange>,
}

/// Reads collection properties and partition key ranges from the gateway.
///
/// Range feeds are addressed by collection resource id under the owning database, so the fetcher
/// remembers which database every collection it has seen lives in.
#[derive(Clone)]
pub struct GatewayMetadataFetcher {
    transport: Arc<GatewayTransport>,
    database_by_rid: Arc<DashMap<String, String>>,
}

impl GatewayMetadataFetcher {
    pub fn new(transport: Arc<GatewayTransport>) -> Self {
        Self {
            transport,
            database_by_rid: Arc::new(DashMap::new()),
        }
    }

    /// Record where a collection lives, e.g. after it was created through the client.
    pub fn remember_collection(&self, database: &str, properties: &ContainerProperties) {
        if !properties.rid.is_empty() {
            self.database_by_rid
                .insert(properties.rid.clone(), database.to_owned());
        }
    }

    pub fn forget_collection(&self, collection_rid: &str) {
        self.database_by_rid.remove(collection_rid);
    }

    async fn get(
        &self,
        kind: &'static str,
        link: &str,
        extra_headers: &[(&str, &str)],
    ) -> Result<RawResponse, RoutingError> {
        let mut request = self
            .transport
            .request(Method::GET, link, Uuid::new_v4())
            .map_err(|e| RoutingError::Fetch(e.to_string()))?;
        for (name, value) in extra_headers {
            request = request.header(*name, *value);
        }

        let result = self.transport.send(request).await;
        let outcome = match &result {
            Ok(response) => response.status.as_str().to_owned(),
            Err(failure) => failure.label().to_owned(),
        };
        metrics::counter!(METADATA_REQUESTS, "kind" => kind, "outcome" => outcome).increment(1);

        result.map_err(|failure| match failure {
            TransportFailure::Timeout(_) => RoutingError::Timeout,
            other => RoutingError::Fetch(other.message().to_owned()),
        })
    }
}

fn unexpected_status(link: &str, response: &RawResponse) -> RoutingError {
    RoutingError::Fetch(format!(
        "{link} responded {}: {}",
        response.status,
        response.body_excerpt()
    ))
}

#[async_trait]
impl CollectionFetcher for GatewayMetadataFetcher {
    async fn fetch_collection(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<ContainerProperties, RoutingError> {
        let link = format!("dbs/{database}/colls/{collection}");
        let response = self.get("collection", &link, &[]).await?;

        match response.status {
            StatusCode::OK => {
                let properties: ContainerProperties = serde_json::from_slice(&response.body)
                    .map_err(|e| RoutingError::Fetch(format!("{link}: {e}")))?;
                self.remember_collection(database, &properties);
                debug!(%database, %collection, rid = %properties.rid, "resolved collection");
                Ok(properties)
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(RoutingError::NotFound(link)),
            _ => Err(unexpected_status(&link, &response)),
        }
    }
}

#[async_trait]
impl RoutingMapFetcher for GatewayMetadataFetcher {
    async fn fetch_ranges(
        &self,
        collection_rid: &str,
        if_none_match: Option<&str>,
    ) -> Result<PartitionKeyRangeFeed, RoutingError> {
        let Some(database) = self
            .database_by_rid
            .get(collection_rid)
            .map(|entry| entry.value().clone())
        else {
            // Unknown ids are treated as stale so the caller re-resolves the collection by name.
            return Err(RoutingError::NotFound(collection_rid.to_owned()));
        };

        let link = format!("dbs/{database}/colls/{collection_rid}/pkranges");
        let mut ranges = Vec::new();
        let mut etag = if_none_match.map(str::to_owned);
        let mut continuation: Option<String> = None;

        loop {
            let mut extra_headers = vec![(headers::INCREMENTAL_FEED, "Incremental feed")];
            if let Some(if_none_match) = if_none_match {
                extra_headers.push(("if-none-match", if_none_match));
            }
            if let Some(continuation) = continuation.as_deref() {
                extra_headers.push((headers::CONTINUATION, continuation));
            }

            let response = self.get("pkranges", &link, &extra_headers).await?;
            match response.status {
                StatusCode::NOT_MODIFIED => break,
                StatusCode::OK => {
                    let page: PartitionKeyRangePage = serde_json::from_slice(&response.body)
                        .map_err(|e| RoutingError::Fetch(format!("{link}: {e}")))?;
                    ranges.extend(page.ranges);
                    if let Some(next) = response.header(headers::ETAG) {
                        etag = Some(next.to_owned());
                    }
                }
                StatusCode::NOT_FOUND | StatusCode::GONE => {
                    self.forget_collection(collection_rid);
                    return Err(RoutingError::NotFound(collection_rid.to_owned()));
                }
                _ => {
                    warn!(collection_rid, status = %response.status, "partition key range fetch failed");
                    return Err(unexpected_status(&link, &response));
                }
            }

            continuation = response
                .header(headers::CONTINUATION)
                .filter(|next| !next.is_empty())
                .map(str::to_owned);
            if continuation.is_none() {
                break;
            }
        }

        debug!(
            collection_rid,
            ranges = ranges.len(),
            incremental = if_none_match.is_some(),
            "fetched partition key ranges"
        );
        Ok(PartitionKeyRangeFeed::new(ranges, etag.as_deref()))
    }
}
