use anyhow::Context;
use envconfig::Envconfig;
use serde_json::json;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use gateway_client::{Config, GatewayClient, RequestOptions};

fn init_logging(debug: bool) {
    let base_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);

    let log_layer = if debug {
        base_layer
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_ansi(true)
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    } else {
        base_layer
            .json()
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

/// Resolves the configured container, writes and reads back a probe item, and logs the routing
/// and session state the client ends up with.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().context("invalid configuration")?;
    init_logging(*config.debug);

    let client = GatewayClient::from_config(&config).context("failed to build gateway client")?;
    tracing::info!("client configuration:\n{}", client.options());

    let container = client.container(&config.database, &config.container);
    let routing_map = container.routing_map(false).await?;
    tracing::info!(
        collection_rid = routing_map.collection_rid(),
        ranges = routing_map.len(),
        "resolved routing map"
    );

    let properties = container.read().await?;
    let Some(field) = properties.partition_key_field().map(str::to_owned) else {
        anyhow::bail!("container {} has no partition key path", properties.id);
    };

    let probe_id = uuid::Uuid::now_v7().to_string();
    let mut item = serde_json::Map::new();
    item.insert("id".to_owned(), json!(probe_id));
    item.insert(field, json!("gateway-probe"));
    let item = serde_json::Value::Object(item);
    let written = container
        .upsert_item(json!("gateway-probe"), &item, RequestOptions::default())
        .await?;
    tracing::info!(
        status = %written.status,
        request_charge = written.request_charge,
        diagnostics = %written.diagnostics,
        "wrote probe item"
    );

    let read = container
        .read_item::<serde_json::Value>(json!("gateway-probe"), &probe_id, RequestOptions::default())
        .await?;
    tracing::info!(
        status = %read.status,
        diagnostics = %read.diagnostics,
        session_token = ?container.session_token(),
        "read probe item back"
    );

    container
        .delete_item(json!("gateway-probe"), &probe_id, RequestOptions::default())
        .await?;
    client.dispose();
    Ok(())
}
