use std::sync::Arc;

use common_routing::{CollectionRoutingMap, ContainerProperties, PartitionKeyRange};
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::config::{ClientOptions, Config};
use crate::diagnostics::Diagnostics;
use crate::dispatcher::{GatewayDispatcher, GatewayResponse};
use crate::error::{DispatchError, GatewayError};
use crate::registry::ActiveClientRegistry;
use crate::request::{
    CollectionAddress, GatewayRequest, OperationType, PartitionTarget, RequestOptions,
    ResourceType,
};
use crate::resource::Resource;
use crate::transport::headers;

/// Entry point for talking to a gateway.
///
/// Cloning is cheap and every clone shares the same caches and session. The client is disposed
/// explicitly with [`GatewayClient::dispose`] or when its last clone (including the `Database`
/// and `Container` handles derived from it) is dropped.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<GatewayDispatcher>,
}

impl GatewayClient {
    /// A client tracked by the process-wide registry.
    pub fn new(options: ClientOptions) -> Result<Self, GatewayError> {
        Self::with_registry(options, ActiveClientRegistry::global())
    }

    pub fn with_registry(
        options: ClientOptions,
        registry: Arc<ActiveClientRegistry>,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            inner: Arc::new(GatewayDispatcher::new(options, registry)?),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        Self::new(ClientOptions::try_from(config)?)
    }

    pub fn database(&self, id: &str) -> Database {
        Database {
            client: self.clone(),
            id: id.to_owned(),
        }
    }

    pub fn container(&self, database: &str, id: &str) -> Container {
        Container {
            client: self.clone(),
            address: CollectionAddress::new(database, id),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.client_id()
    }

    pub fn options(&self) -> &ClientOptions {
        self.inner.options()
    }

    /// Returns whether this call disposed the client; later calls are no-ops.
    pub fn dispose(&self) -> bool {
        self.inner.dispose()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// The session token covering every partition of a collection this client has written to.
    pub fn session_token(&self, database: &str, collection: &str) -> Option<String> {
        self.inner
            .session_token(&CollectionAddress::new(database, collection))
    }

    /// Live clients in the registry this client reports to.
    pub fn active_client_count(&self) -> usize {
        self.inner.registry().count_active()
    }

    pub async fn dispatch(&self, request: GatewayRequest) -> Result<GatewayResponse, DispatchError> {
        let cancellation = request.options.cancellation.clone().unwrap_or_default();
        self.inner.dispatch(request, &cancellation).await
    }

    fn reject(&self, request: &GatewayRequest, error: GatewayError) -> DispatchError {
        self.inner
            .reject(&request.operation_name(), &request.resource_link, error)
    }

    fn reject_unsent(
        &self,
        operation: &str,
        resource_link: &str,
        error: GatewayError,
    ) -> DispatchError {
        self.inner.reject(operation, resource_link, error)
    }
}

/// Typed view of a single-resource response.
#[derive(Debug, Clone)]
pub struct ItemResponse<T> {
    pub status: StatusCode,
    pub resource: Option<T>,
    pub headers: HeaderMap,
    pub session_token: Option<String>,
    pub request_charge: f64,
    pub diagnostics: Diagnostics,
}

impl<T> ItemResponse<T> {
    pub fn etag(&self) -> Option<&str> {
        self.headers
            .get(headers::ETAG)
            .and_then(|value| value.to_str().ok())
    }
}

fn into_item_response<T, F>(
    response: GatewayResponse,
    extract: F,
) -> Result<ItemResponse<T>, DispatchError>
where
    F: FnOnce(Resource) -> Result<Option<T>, GatewayError>,
{
    let resource = match response.resource {
        Some(resource) => match extract(resource) {
            Ok(resource) => resource,
            Err(error) => return Err(DispatchError::new(error, response.diagnostics)),
        },
        None => None,
    };

    Ok(ItemResponse {
        status: response.status,
        resource,
        headers: response.headers,
        session_token: response.session_token,
        request_charge: response.request_charge,
        diagnostics: response.diagnostics,
    })
}

fn document<T: DeserializeOwned>(resource: Resource) -> Result<Option<T>, GatewayError> {
    match resource {
        Resource::Document(value) => Ok(Some(serde_json::from_value(value)?)),
        other => Err(unexpected_resource("document", &other)),
    }
}

fn collection(resource: Resource) -> Result<Option<ContainerProperties>, GatewayError> {
    match resource {
        Resource::Collection(properties) => Ok(Some(properties)),
        other => Err(unexpected_resource("collection", &other)),
    }
}

fn unexpected_resource(expected: &str, resource: &Resource) -> GatewayError {
    let found = match resource {
        Resource::Document(_) => "document",
        Resource::Collection(_) => "collection",
        Resource::Database(_) => "database",
        Resource::Permission(_) => "permission",
        Resource::User(_) => "user",
        Resource::PartitionKeyRanges(_) => "partition key ranges",
        Resource::Feed(_) => "feed",
    };
    GatewayError::InvalidRequest(format!("expected a {expected} in the response, got a {found}"))
}

/// Every page of a query, concatenated.
#[derive(Debug, Clone)]
pub struct QueryResponse<T> {
    pub items: Vec<T>,
    pub request_charge: f64,
    /// One entry per page fetched.
    pub diagnostics: Vec<Diagnostics>,
}

#[derive(Serialize)]
struct QueryParameter<'a> {
    name: &'a str,
    value: &'a serde_json::Value,
}

#[derive(Serialize)]
struct QuerySpec<'a> {
    query: &'a str,
    parameters: Vec<QueryParameter<'a>>,
}

#[derive(Clone)]
pub struct Database {
    client: GatewayClient,
    id: String,
}

impl Database {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn container(&self, id: &str) -> Container {
        self.client.container(&self.id, id)
    }

    pub async fn create_container(
        &self,
        id: &str,
        partition_key_path: &str,
        options: RequestOptions,
    ) -> Result<ItemResponse<ContainerProperties>, DispatchError> {
        let link = format!("dbs/{}/colls", self.id);
        let request = GatewayRequest::new(OperationType::Create, ResourceType::Collection, &link)
            .with_options(options);

        let body = match serde_json::to_vec(&ContainerProperties::new(id, "", partition_key_path)) {
            Ok(body) => body,
            Err(e) => return Err(self.client.reject(&request, e.into())),
        };

        let response = self.client.dispatch(request.with_body(body)).await?;
        into_item_response(response, collection)
    }

    pub async fn read_container(
        &self,
        id: &str,
        options: RequestOptions,
    ) -> Result<ItemResponse<ContainerProperties>, DispatchError> {
        let link = CollectionAddress::new(&self.id, id).link();
        let request = GatewayRequest::new(OperationType::Read, ResourceType::Collection, &link)
            .with_options(options);

        let response = self.client.dispatch(request).await?;
        into_item_response(response, collection)
    }

    /// Deleting a collection also drops its session tokens and cached routing.
    pub async fn delete_container(
        &self,
        id: &str,
        options: RequestOptions,
    ) -> Result<ItemResponse<ContainerProperties>, DispatchError> {
        let link = CollectionAddress::new(&self.id, id).link();
        let request = GatewayRequest::new(OperationType::Delete, ResourceType::Collection, &link)
            .with_options(options);

        let response = self.client.dispatch(request).await?;
        into_item_response(response, collection)
    }
}

/// Item operations against one collection.
#[derive(Clone)]
pub struct Container {
    client: GatewayClient,
    address: CollectionAddress,
}

impl Container {
    pub fn address(&self) -> &CollectionAddress {
        &self.address
    }

    fn docs_link(&self) -> String {
        format!("{}/docs", self.address.link())
    }

    fn item_link(&self, id: &str) -> String {
        format!("{}/docs/{}", self.address.link(), id)
    }

    fn item_request(
        &self,
        operation: OperationType,
        link: &str,
        partition_key: serde_json::Value,
        options: RequestOptions,
    ) -> GatewayRequest {
        GatewayRequest::new(operation, ResourceType::Document, link)
            .in_collection(self.address.clone())
            .with_partition(PartitionTarget::Key(partition_key))
            .with_options(options)
    }

    async fn write_item<T: Serialize + DeserializeOwned>(
        &self,
        request: GatewayRequest,
        item: &T,
    ) -> Result<ItemResponse<T>, DispatchError> {
        let body = match serde_json::to_vec(item) {
            Ok(body) => body,
            Err(e) => return Err(self.client.reject(&request, e.into())),
        };

        let response = self.client.dispatch(request.with_body(body)).await?;
        into_item_response(response, document)
    }

    pub async fn create_item<T: Serialize + DeserializeOwned>(
        &self,
        partition_key: serde_json::Value,
        item: &T,
        options: RequestOptions,
    ) -> Result<ItemResponse<T>, DispatchError> {
        let request = self.item_request(
            OperationType::Create,
            &self.docs_link(),
            partition_key,
            options,
        );
        self.write_item(request, item).await
    }

    pub async fn upsert_item<T: Serialize + DeserializeOwned>(
        &self,
        partition_key: serde_json::Value,
        item: &T,
        options: RequestOptions,
    ) -> Result<ItemResponse<T>, DispatchError> {
        let request = self.item_request(
            OperationType::Upsert,
            &self.docs_link(),
            partition_key,
            options,
        );
        self.write_item(request, item).await
    }

    pub async fn replace_item<T: Serialize + DeserializeOwned>(
        &self,
        partition_key: serde_json::Value,
        id: &str,
        item: &T,
        options: RequestOptions,
    ) -> Result<ItemResponse<T>, DispatchError> {
        let request = self.item_request(
            OperationType::Replace,
            &self.item_link(id),
            partition_key,
            options,
        );
        self.write_item(request, item).await
    }

    pub async fn read_item<T: DeserializeOwned>(
        &self,
        partition_key: serde_json::Value,
        id: &str,
        options: RequestOptions,
    ) -> Result<ItemResponse<T>, DispatchError> {
        let request =
            self.item_request(OperationType::Read, &self.item_link(id), partition_key, options);

        let response = self.client.dispatch(request).await?;
        into_item_response(response, document)
    }

    pub async fn delete_item(
        &self,
        partition_key: serde_json::Value,
        id: &str,
        options: RequestOptions,
    ) -> Result<ItemResponse<serde_json::Value>, DispatchError> {
        let request = self.item_request(
            OperationType::Delete,
            &self.item_link(id),
            partition_key,
            options,
        );

        let response = self.client.dispatch(request).await?;
        into_item_response(response, document)
    }

    /// Runs a query to completion.
    ///
    /// With a partition key in `options` the query goes to that logical partition only. Otherwise
    /// it is sent to every partition key range in turn and the pages are concatenated in range
    /// order. A range that split mid-way restarts the fan-out once against a refreshed map.
    pub async fn query_items<T: DeserializeOwned>(
        &self,
        query: &str,
        parameters: &[(&str, serde_json::Value)],
        options: RequestOptions,
    ) -> Result<QueryResponse<T>, DispatchError> {
        let spec = QuerySpec {
            query,
            parameters: parameters
                .iter()
                .map(|(name, value)| QueryParameter { name: *name, value })
                .collect(),
        };
        let body = serde_json::to_vec(&spec).map_err(|e| {
            self.client
                .reject_unsent("QueryDocument", &self.docs_link(), e.into())
        })?;

        if let Some(partition_key) = options.partition_key.clone() {
            let target = PartitionTarget::Key(partition_key);
            let mut response = QueryResponse {
                items: Vec::new(),
                request_charge: 0.0,
                diagnostics: Vec::new(),
            };
            self.drain_query(&body, target, &options, &mut response)
                .await?;
            return Ok(response);
        }

        let mut force_refresh = false;
        loop {
            let routing_map = self
                .routing_map(force_refresh)
                .await
                .map_err(|e| self.client.reject_unsent("QueryDocument", &self.docs_link(), e))?;

            match self
                .fan_out(&body, routing_map.ordered_ranges(), &options)
                .await
            {
                Err(error) if error.error().is_routing_not_found() && !force_refresh => {
                    force_refresh = true;
                }
                other => return other,
            }
        }
    }

    async fn fan_out<T: DeserializeOwned>(
        &self,
        body: &[u8],
        ranges: &[PartitionKeyRange],
        options: &RequestOptions,
    ) -> Result<QueryResponse<T>, DispatchError> {
        let mut response = QueryResponse {
            items: Vec::new(),
            request_charge: 0.0,
            diagnostics: Vec::new(),
        };
        for range in ranges {
            let target = PartitionTarget::Range(range.id.clone());
            self.drain_query(body, target, options, &mut response)
                .await?;
        }
        Ok(response)
    }

    async fn drain_query<T: DeserializeOwned>(
        &self,
        body: &[u8],
        target: PartitionTarget,
        options: &RequestOptions,
        into: &mut QueryResponse<T>,
    ) -> Result<(), DispatchError> {
        let mut continuation: Option<String> = None;
        loop {
            let mut request =
                GatewayRequest::new(OperationType::Query, ResourceType::Document, &self.docs_link())
                    .in_collection(self.address.clone())
                    .with_partition(target.clone())
                    .with_body(body.to_vec())
                    .with_options(options.clone());
            if let Some(continuation) = &continuation {
                request = request.with_header(headers::CONTINUATION, continuation);
            }

            let page = self.client.dispatch(request).await?;
            into.request_charge += page.request_charge;

            let items = page
                .resource
                .and_then(Resource::into_feed)
                .unwrap_or_default();
            for item in items {
                match serde_json::from_value(item) {
                    Ok(item) => into.items.push(item),
                    Err(e) => return Err(DispatchError::new(e.into(), page.diagnostics)),
                }
            }
            into.diagnostics.push(page.diagnostics);

            continuation = page.continuation.filter(|next| !next.is_empty());
            if continuation.is_none() {
                return Ok(());
            }
        }
    }

    /// Collection properties as currently bound to this container's name.
    pub async fn read(&self) -> Result<ContainerProperties, GatewayError> {
        self.client.inner.collection_properties(&self.address).await
    }

    pub async fn routing_map(
        &self,
        force_refresh: bool,
    ) -> Result<Arc<CollectionRoutingMap>, GatewayError> {
        self.client
            .inner
            .routing_map(&self.address, force_refresh)
            .await
    }

    pub fn session_token(&self) -> Option<String> {
        self.client.inner.session_token(&self.address)
    }
}
