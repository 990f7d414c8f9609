#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gateway_client::partition_key::effective_partition_key;
use gateway_client::{ActiveClientRegistry, ClientOptions, GatewayClient, RetryPolicy};
use httpmock::prelude::*;
use httpmock::Mock;
use serde_json::{json, Value};

pub const DATABASE: &str = "shop";
pub const COLLECTION: &str = "orders";
/// Splits the effective key space in two; effective keys start with 0-3.
pub const SPLIT_KEY: &str = "20";

pub fn options(server: &MockServer) -> ClientOptions {
    options_at(&server.base_url())
}

pub fn options_at(base_url: &str) -> ClientOptions {
    ClientOptions::new(base_url)
        .unwrap()
        .with_request_timeout(Duration::from_secs(5))
        .with_http_client_timeout(Duration::from_secs(5))
        .with_retry_policy(
            RetryPolicy::build(2, Duration::from_millis(10))
                .maximum_interval(Duration::from_millis(50))
                .max_attempts(3)
                .provide(),
        )
}

/// A client reporting to its own registry, so tests don't observe each other's clients.
pub fn isolated_client(options: ClientOptions) -> (GatewayClient, Arc<ActiveClientRegistry>) {
    let registry = Arc::new(ActiveClientRegistry::new());
    let client = GatewayClient::with_registry(options, Arc::clone(&registry)).unwrap();
    (client, registry)
}

pub fn collection_body(id: &str, rid: &str) -> Value {
    json!({
        "id": id,
        "_rid": rid,
        "partitionKey": {"paths": ["/tenant"], "kind": "Hash"}
    })
}

pub async fn mock_collection<'a>(server: &'a MockServer, rid: &str) -> Mock<'a> {
    let body = collection_body(COLLECTION, rid);
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/dbs/{DATABASE}/colls/{COLLECTION}"));
            then.status(200).json_body(body);
        })
        .await
}

pub async fn mock_ranges<'a>(server: &'a MockServer, rid: &str, ranges: Value) -> Mock<'a> {
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/dbs/{DATABASE}/colls/{rid}/pkranges"));
            then.status(200)
                .header("etag", "\"1\"")
                .json_body(json!({ "PartitionKeyRanges": ranges }));
        })
        .await
}

pub fn two_ranges() -> Value {
    json!([
        {"id": "0", "minInclusive": "", "maxExclusive": SPLIT_KEY},
        {"id": "1", "minInclusive": SPLIT_KEY, "maxExclusive": "FF"}
    ])
}

pub fn one_range() -> Value {
    json!([{"id": "0", "minInclusive": "", "maxExclusive": "FF"}])
}

/// Partition key values owned by range "0" and range "1" of [`two_ranges`].
pub fn keys_in_both_ranges() -> (String, String) {
    let mut low = None;
    let mut high = None;
    for i in 0.. {
        let key = format!("tenant-{i}");
        if effective_partition_key(&json!(key)).as_str() < SPLIT_KEY {
            low.get_or_insert(key);
        } else {
            high.get_or_insert(key);
        }
        if let (Some(low), Some(high)) = (&low, &high) {
            return (low.clone(), high.clone());
        }
    }
    unreachable!()
}

pub fn partition_key_header(key: &str) -> String {
    json!([key]).to_string()
}
