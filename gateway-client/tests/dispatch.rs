use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gateway_client::{
    CancellationToken, ConsistencyLevel, GatewayClient, GatewayError, RequestOptions,
};
use httpmock::prelude::*;
use serde_json::{json, Value};
use tokio::net::TcpListener;

mod common;
use common::*;

#[tokio::test]
async fn test_pre_cancelled_request_reports_diagnostics_and_message() {
    let server = MockServer::start_async().await;
    let collection = mock_collection(&server, "rid-orders").await;
    let (client, _registry) = isolated_client(options(&server));

    let cancellation = CancellationToken::new();
    cancellation.cancel();

    let error = client
        .database(DATABASE)
        .read_container(
            COLLECTION,
            RequestOptions::default().with_cancellation(cancellation),
        )
        .await
        .unwrap_err();

    assert!(matches!(error.error(), GatewayError::OperationCanceled { .. }));
    let description = error.to_string();
    assert!(description.contains(&error.diagnostics().to_string()));
    assert!(description.contains(&error.error().to_string()));
    assert!(description.contains("The operation was canceled."));
    assert_eq!(collection.hits_async().await, 0);
}

#[tokio::test]
async fn test_end_to_end_timeout_reports_triage_fields() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/dbs/shop/colls/orders");
            then.status(200)
                .delay(Duration::from_secs(3))
                .json_body(collection_body(COLLECTION, "rid-orders"));
        })
        .await;

    let (client, _registry) = isolated_client(
        options(&server).with_request_timeout(Duration::from_millis(200)),
    );
    let error = client
        .database(DATABASE)
        .read_container(COLLECTION, RequestOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(error.error(), GatewayError::Timeout { .. }));
    let message = error.error().to_string();
    for label in ["Start Time", "Total Duration", "Http Client Timeout", "Activity id"] {
        assert!(message.contains(label), "{label} missing from {message}");
    }
    assert!(message.contains(&error.diagnostics().activity_id.to_string()));
    assert!(error.diagnostics().total_duration < Duration::from_secs(3));
}

#[tokio::test]
async fn test_disposed_client_fails_fast_with_configuration() {
    let server = MockServer::start_async().await;
    let collection = mock_collection(&server, "rid-orders").await;
    let (client, registry) = isolated_client(options(&server));

    assert!(client.dispose());
    assert!(!client.dispose());
    assert!(client.is_disposed());
    assert_eq!(registry.count_active(), 0);

    let error = client
        .database(DATABASE)
        .read_container(COLLECTION, RequestOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(error.error(), GatewayError::ClientDisposed { .. }));
    let description = error.to_string();
    assert!(description.contains("Cannot access a disposed client"));
    assert!(description.contains("Client Configuration"));
    assert!(description.contains(&format!("Endpoint: {}", client.options().endpoint)));
    assert!(!description.contains("Activity id"));
    assert_eq!(collection.hits_async().await, 0);
}

#[tokio::test]
async fn test_internal_fault_reports_endpoint_without_disposal() {
    let server = MockServer::start_async().await;
    mock_collection(&server, "rid-orders").await;
    let (client, _registry) =
        isolated_client(options(&server).with_authorization("type=master&sig=bad\nvalue"));

    let error = client
        .database(DATABASE)
        .read_container(COLLECTION, RequestOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(error.error(), GatewayError::InternalFault { .. }));
    let description = error.to_string();
    assert!(description.contains(client.options().endpoint.as_str()));
    assert!(description.contains("Client Configuration"));
    assert!(!description.contains("disposed"));
    assert!(!description.contains("Activity id"));
}

#[tokio::test]
async fn test_active_client_count_is_reported_on_the_next_operation() {
    let server = MockServer::start_async().await;
    mock_collection(&server, "rid-orders").await;
    let (client, registry) = isolated_client(options(&server));

    let others: Vec<GatewayClient> = (0..4)
        .map(|_| GatewayClient::with_registry(options(&server), registry.clone()).unwrap())
        .collect();
    others[0].dispose();
    others[1].dispose();
    others[1].dispose();
    assert_eq!(registry.count_active(), 3);

    let response = client
        .database(DATABASE)
        .read_container(COLLECTION, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(response.diagnostics.active_clients, 3);
    assert_eq!(client.active_client_count(), 3);

    drop(others);
    assert_eq!(registry.count_active(), 1);
}

#[tokio::test]
async fn test_stronger_consistency_than_account_is_rejected() {
    let server = MockServer::start_async().await;
    let collection = mock_collection(&server, "rid-orders").await;
    let (client, _registry) =
        isolated_client(options(&server).with_consistency_level(ConsistencyLevel::Eventual));

    let error = client
        .database(DATABASE)
        .read_container(
            COLLECTION,
            RequestOptions::default().with_consistency_level(ConsistencyLevel::Strong),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        error.error(),
        GatewayError::ConsistencyViolation(_)
    ));
    let message = error.error().to_string();
    assert!(message.contains("Strong"));
    assert!(message.contains("Eventual"));
    assert_eq!(collection.hits_async().await, 0);
}

#[tokio::test]
async fn test_throttled_read_is_retried_until_it_succeeds() {
    let server = MockServer::start_async().await;
    mock_collection(&server, "rid-orders").await;
    mock_ranges(&server, "rid-orders", one_range()).await;
    let throttled = server
        .mock_async(|when, then| {
            when.method(GET).path("/dbs/shop/colls/orders/docs/a");
            then.status(429)
                .header("x-ms-substatus", "3200")
                .header("x-ms-retry-after-ms", "500");
        })
        .await;

    let (client, _registry) = isolated_client(
        options(&server).with_retry_policy(
            gateway_client::RetryPolicy::build(2, Duration::from_millis(10))
                .maximum_interval(Duration::from_secs(2))
                .max_attempts(3)
                .provide(),
        ),
    );
    let container = client.container(DATABASE, COLLECTION);
    let read = tokio::spawn(async move {
        container
            .read_item::<Value>(json!("t"), "a", RequestOptions::default())
            .await
    });

    while throttled.hits_async().await == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    throttled.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/dbs/shop/colls/orders/docs/a");
            then.status(200)
                .header("x-ms-request-charge", "1")
                .json_body(json!({"id": "a", "tenant": "t"}));
        })
        .await;

    let response = read.await.unwrap().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.diagnostics.retry_count, 1);
    assert_eq!(response.diagnostics.attempts[0].status, Some(429));
    assert_eq!(response.diagnostics.attempts[0].sub_status, Some(3200));
    assert_eq!(response.diagnostics.attempts[1].status, Some(200));
}

#[tokio::test]
async fn test_throttling_exhausts_the_attempt_budget() {
    let server = MockServer::start_async().await;
    mock_collection(&server, "rid-orders").await;
    mock_ranges(&server, "rid-orders", one_range()).await;
    let throttled = server
        .mock_async(|when, then| {
            when.method(POST).path("/dbs/shop/colls/orders/docs");
            then.status(429).header("x-ms-retry-after-ms", "1");
        })
        .await;

    let (client, _registry) = isolated_client(options(&server));
    let error = client
        .container(DATABASE, COLLECTION)
        .create_item(json!("t"), &json!({"id": "a", "tenant": "t"}), RequestOptions::default())
        .await
        .unwrap_err();

    assert_eq!(
        error.error().status(),
        Some(http::StatusCode::TOO_MANY_REQUESTS)
    );
    assert_eq!(throttled.hits_async().await, 3);
    assert_eq!(error.diagnostics().retry_count, 2);
}

#[tokio::test]
async fn test_server_errors_are_not_retried_for_writes() {
    let server = MockServer::start_async().await;
    mock_collection(&server, "rid-orders").await;
    mock_ranges(&server, "rid-orders", one_range()).await;
    let failing = server
        .mock_async(|when, then| {
            when.method(PUT).path("/dbs/shop/colls/orders/docs/a");
            then.status(503);
        })
        .await;

    let (client, _registry) = isolated_client(options(&server));
    let container = client.container(DATABASE, COLLECTION);
    let item = json!({"id": "a", "tenant": "t"});

    container
        .replace_item(json!("t"), "a", &item, RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(failing.hits_async().await, 1);

    container
        .replace_item(json!("t"), "a", &item, RequestOptions::default().safe_to_retry())
        .await
        .unwrap_err();
    assert_eq!(failing.hits_async().await, 4);
}

#[tokio::test]
async fn test_stale_routing_refreshes_the_collection_once() {
    let server = MockServer::start_async().await;
    let collection = mock_collection(&server, "rid-orders").await;
    let ranges = mock_ranges(&server, "rid-orders", one_range()).await;
    let gone = server
        .mock_async(|when, then| {
            when.method(GET).path("/dbs/shop/colls/orders/docs/a");
            then.status(410).header("x-ms-substatus", "1000");
        })
        .await;

    let (client, _registry) = isolated_client(options(&server));
    let error = client
        .container(DATABASE, COLLECTION)
        .read_item::<Value>(json!("t"), "a", RequestOptions::default())
        .await
        .unwrap_err();

    assert!(error.error().is_routing_not_found());
    assert_eq!(gone.hits_async().await, 2);
    assert_eq!(collection.hits_async().await, 2);
    assert_eq!(ranges.hits_async().await, 2);
}

#[tokio::test]
async fn test_query_fans_out_over_every_range() {
    let server = MockServer::start_async().await;
    mock_collection(&server, "rid-orders").await;
    mock_ranges(&server, "rid-orders", two_ranges()).await;
    for (range, id) in [("0", "a"), ("1", "b")] {
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/dbs/shop/colls/orders/docs")
                    .header("x-ms-documentdb-isquery", "True")
                    .header("x-ms-documentdb-partitionkeyrangeid", range);
                then.status(200)
                    .header("x-ms-request-charge", "2.5")
                    .json_body(json!({"Documents": [{"id": id}], "_count": 1}));
            })
            .await;
    }

    let (client, _registry) = isolated_client(options(&server));
    let response = client
        .container(DATABASE, COLLECTION)
        .query_items::<Value>(
            "SELECT * FROM c WHERE c.status = @status",
            &[("@status", json!("open"))],
            RequestOptions::default(),
        )
        .await
        .unwrap();

    let ids: Vec<&str> = response
        .items
        .iter()
        .filter_map(|item| item["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(response.diagnostics.len(), 2);
    assert_eq!(response.request_charge, 5.0);
}

/// Accepts connections and closes each one before answering.
async fn hang_up_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });

    (format!("http://{address}"), accepted)
}

#[tokio::test]
async fn test_dropped_connections_are_retried_for_reads() {
    let (base_url, accepted) = hang_up_server().await;
    let (client, _registry) = isolated_client(options_at(&base_url));

    let error = client
        .database(DATABASE)
        .read_container(COLLECTION, RequestOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(error.error(), GatewayError::Transport(_)));
    let outcomes: Vec<&str> = error
        .diagnostics()
        .attempts
        .iter()
        .map(|attempt| attempt.outcome.as_str())
        .collect();
    assert_eq!(outcomes, vec!["connection_lost"; 3]);
    assert_eq!(accepted.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_dropped_connection_is_not_retried_for_writes() {
    let (base_url, accepted) = hang_up_server().await;
    let (client, _registry) = isolated_client(options_at(&base_url));

    let error = client
        .database(DATABASE)
        .create_container(COLLECTION, "/tenant", RequestOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(error.error(), GatewayError::Transport(_)));
    assert_eq!(error.diagnostics().attempts.len(), 1);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_http_client_timeout_retries_reads_and_fails_writes() {
    let server = MockServer::start_async().await;
    let read = server
        .mock_async(|when, then| {
            when.method(GET).path("/dbs/shop/colls/orders");
            then.status(200)
                .delay(Duration::from_secs(1))
                .json_body(collection_body(COLLECTION, "rid-orders"));
        })
        .await;
    let create = server
        .mock_async(|when, then| {
            when.method(POST).path("/dbs/shop/colls");
            then.status(201)
                .delay(Duration::from_secs(1))
                .json_body(collection_body(COLLECTION, "rid-orders"));
        })
        .await;

    let (client, _registry) = isolated_client(
        options(&server).with_http_client_timeout(Duration::from_millis(200)),
    );
    let database = client.database(DATABASE);

    let error = database
        .read_container(COLLECTION, RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(error.error(), GatewayError::Timeout { .. }));
    assert_eq!(read.hits_async().await, 3);
    assert!(error
        .diagnostics()
        .attempts
        .iter()
        .all(|attempt| attempt.outcome == "transport_timeout"));

    let error = database
        .create_container(COLLECTION, "/tenant", RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(error.error(), GatewayError::Timeout { .. }));
    assert_eq!(create.hits_async().await, 1);
    let message = error.error().to_string();
    for label in ["Start Time", "Total Duration", "Http Client Timeout", "Activity id"] {
        assert!(message.contains(label), "{label} missing from {message}");
    }
}

#[tokio::test]
async fn test_disposing_during_a_request_fails_it() {
    let server = MockServer::start_async().await;
    mock_collection(&server, "rid-orders").await;
    mock_ranges(&server, "rid-orders", one_range()).await;
    let slow = server
        .mock_async(|when, then| {
            when.method(GET).path("/dbs/shop/colls/orders/docs/a");
            then.status(200)
                .delay(Duration::from_secs(3))
                .header("x-ms-session-token", "0:1#9")
                .json_body(json!({"id": "a", "tenant": "t"}));
        })
        .await;

    let (client, registry) = isolated_client(options(&server));
    let container = client.container(DATABASE, COLLECTION);
    let read = tokio::spawn(async move {
        container
            .read_item::<Value>(json!("t"), "a", RequestOptions::default())
            .await
    });

    while slow.hits_async().await == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(client.dispose());

    let error = read.await.unwrap().unwrap_err();
    assert!(matches!(error.error(), GatewayError::ClientDisposed { .. }));
    assert!(error.diagnostics().total_duration < Duration::from_secs(3));
    assert_eq!(registry.count_active(), 0);
    assert_eq!(client.session_token(DATABASE, COLLECTION), None);
}
