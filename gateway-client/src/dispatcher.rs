use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common_routing::{
    CollectionCache, CollectionRoutingMap, ContainerProperties, PartitionKeyRange,
    PartitionKeyRangeCache,
};
use common_session::{ConsistencyLevel, SessionTokenStore, TokenScope};
use http::{HeaderMap, StatusCode};
use reqwest::{header, RequestBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClientOptions;
use crate::diagnostics::{AttemptRecord, Diagnostics, DiagnosticsRecorder};
use crate::error::{DispatchError, GatewayError};
use crate::metadata::GatewayMetadataFetcher;
use crate::metrics_consts::{
    DISPATCH_ATTEMPTS, DISPATCH_DURATION, DISPATCH_REQUESTS, DISPATCH_REQUEST_CHARGE,
    DISPATCH_RETRIES, DISPATCH_TIMEOUTS, STALE_ROUTING_RETRIES,
};
use crate::partition_key::{effective_partition_key, partition_key_header, partition_key_range};
use crate::registry::{ActiveClientRegistry, ClientRegistration};
use crate::request::{
    CollectionAddress, GatewayRequest, OperationType, PartitionTarget, RequestState, ResourceType,
};
use crate::resource::Resource;
use crate::transport::{
    headers, is_retryable_status, parse_retry_after_header, sub_status, GatewayTransport,
    RawResponse, TransportFailure,
};

/// Outcome of a dispatched operation.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub resource: Option<Resource>,
    /// The session token the gateway returned, if any.
    pub session_token: Option<String>,
    pub continuation: Option<String>,
    /// Summed over every attempt.
    pub request_charge: f64,
    pub diagnostics: Diagnostics,
}

struct Completed {
    status: StatusCode,
    headers: HeaderMap,
    resource: Option<Resource>,
    session_token: Option<String>,
    continuation: Option<String>,
}

/// A data-plane request after name and partition resolution.
struct CollectionTarget<'a> {
    address: &'a CollectionAddress,
    properties: &'a ContainerProperties,
    ranges: Vec<PartitionKeyRange>,
}

enum Outcome {
    Finished(Result<Completed, GatewayError>),
    Canceled,
    Disposed,
    TimedOut,
}

/// Sends logical requests to the gateway on behalf of one client.
///
/// Each dispatcher owns its collection cache, routing cache and session token store; only the
/// registry it reports to is shared between clients. A request moves through
/// `Created -> Sent -> {Succeeded, Retrying, Failed}` and every transition ends up in the
/// diagnostics returned with the result.
pub struct GatewayDispatcher {
    options: ClientOptions,
    configuration: String,
    region: Option<String>,
    transport: Arc<GatewayTransport>,
    metadata: GatewayMetadataFetcher,
    collections: CollectionCache<GatewayMetadataFetcher>,
    routing: PartitionKeyRangeCache<GatewayMetadataFetcher>,
    sessions: SessionTokenStore,
    registry: Arc<ActiveClientRegistry>,
    registration: ClientRegistration,
    disposed_at: OnceLock<DateTime<Utc>>,
    shutdown: CancellationToken,
}

impl GatewayDispatcher {
    pub fn new(
        options: ClientOptions,
        registry: Arc<ActiveClientRegistry>,
    ) -> Result<Self, GatewayError> {
        let transport = Arc::new(GatewayTransport::new(&options)?);
        let metadata = GatewayMetadataFetcher::new(Arc::clone(&transport));
        let collections = CollectionCache::new(metadata.clone(), options.collection_cache_ttl);
        let routing = PartitionKeyRangeCache::new(metadata.clone());
        let region = options
            .region
            .clone()
            .or_else(|| options.endpoint.host_str().map(str::to_owned));
        let registration = registry.register(options.endpoint.as_str());

        info!(
            client_id = %registration.id(),
            endpoint = %options.endpoint,
            consistency = %options.account_consistency_level,
            "gateway client created"
        );

        Ok(Self {
            configuration: options.to_string(),
            options,
            region,
            transport,
            metadata,
            collections,
            routing,
            sessions: SessionTokenStore::new(),
            registry,
            registration,
            disposed_at: OnceLock::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn client_id(&self) -> Uuid {
        self.registration.id()
    }

    pub fn sessions(&self) -> &SessionTokenStore {
        &self.sessions
    }

    pub fn registry(&self) -> &ActiveClientRegistry {
        &self.registry
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed_at.get().is_some()
    }

    /// Tears the client down: in-flight requests fail with `ClientDisposed`, and the client leaves
    /// the registry. Returns whether this call did the disposing.
    pub fn dispose(&self) -> bool {
        if self.disposed_at.set(Utc::now()).is_err() {
            return false;
        }

        self.shutdown.cancel();
        self.registry.deregister(&self.registration);
        info!(client_id = %self.registration.id(), "gateway client disposed");
        true
    }

    /// Every tracked partition's token for a collection.
    pub fn session_token(&self, address: &CollectionAddress) -> Option<String> {
        self.sessions
            .resolve_global_token(TokenScope::CollectionName(&address.link()))
    }

    pub async fn collection_properties(
        &self,
        address: &CollectionAddress,
    ) -> Result<ContainerProperties, GatewayError> {
        self.ensure_live()?;
        Ok(self
            .collections
            .resolve(&address.database, &address.collection)
            .await?)
    }

    /// The routing map of a collection, refreshing the name binding once if it turns out stale.
    pub async fn routing_map(
        &self,
        address: &CollectionAddress,
        force_refresh: bool,
    ) -> Result<Arc<CollectionRoutingMap>, GatewayError> {
        let properties = self.collection_properties(address).await?;
        match self
            .routing
            .resolve_routing_map(&properties.rid, force_refresh)
            .await
        {
            Err(error) if error.is_not_found() => {
                self.invalidate_collection(address, &properties.rid).await;
                let properties = self.collection_properties(address).await?;
                Ok(self
                    .routing
                    .resolve_routing_map(&properties.rid, force_refresh)
                    .await?)
            }
            other => Ok(other?),
        }
    }

    /// Fails a request that never reached the wire, e.g. because its body did not serialize.
    pub fn reject(&self, operation: &str, resource_link: &str, error: GatewayError) -> DispatchError {
        let mut recorder = DiagnosticsRecorder::new(
            operation,
            resource_link,
            self.options.request_timeout,
            self.options.http_client_timeout,
        );
        recorder.set_active_clients(self.registry.count_active());
        recorder.transition(RequestState::Failed);
        DispatchError::new(error, recorder.snapshot())
    }

    pub async fn dispatch(
        &self,
        request: GatewayRequest,
        cancellation: &CancellationToken,
    ) -> Result<GatewayResponse, DispatchError> {
        let operation = request.operation_name();
        let timeout = request
            .options
            .end_to_end_timeout
            .unwrap_or(self.options.request_timeout);

        let mut recorder = DiagnosticsRecorder::new(
            &operation,
            &request.resource_link,
            timeout,
            self.options.http_client_timeout,
        );
        recorder.set_active_clients(self.registry.count_active());
        recorder.set_excluded_regions(&self.excluded_regions(&request));

        let result = self
            .run(&request, cancellation, timeout, &mut recorder)
            .await;
        metrics::histogram!(DISPATCH_DURATION, "operation" => operation.clone())
            .record(recorder.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(completed) => {
                recorder.transition(RequestState::Succeeded);
                let diagnostics = recorder.snapshot();
                metrics::counter!(DISPATCH_REQUESTS, "operation" => operation, "outcome" => "success")
                    .increment(1);
                metrics::histogram!(DISPATCH_REQUEST_CHARGE).record(diagnostics.request_charge);

                Ok(GatewayResponse {
                    status: completed.status,
                    headers: completed.headers,
                    resource: completed.resource,
                    session_token: completed.session_token,
                    continuation: completed.continuation,
                    request_charge: diagnostics.request_charge,
                    diagnostics,
                })
            }
            Err(error) => {
                recorder.transition(RequestState::Failed);
                warn!(
                    activity_id = %recorder.activity_id(),
                    operation = %operation,
                    kind = error.kind(),
                    "gateway request failed: {error}"
                );
                metrics::counter!(DISPATCH_REQUESTS, "operation" => operation, "outcome" => error.kind())
                    .increment(1);
                Err(DispatchError::new(error, recorder.snapshot()))
            }
        }
    }

    async fn run(
        &self,
        request: &GatewayRequest,
        cancellation: &CancellationToken,
        timeout: Duration,
        recorder: &mut DiagnosticsRecorder,
    ) -> Result<Completed, GatewayError> {
        self.ensure_live()?;
        if cancellation.is_cancelled() {
            return Err(GatewayError::operation_canceled());
        }

        let consistency = ConsistencyLevel::effective(
            self.options.account_consistency_level,
            request.options.consistency_level,
        )?;

        let outcome = tokio::select! {
            biased;

            _ = cancellation.cancelled() => Outcome::Canceled,
            _ = self.shutdown.cancelled() => Outcome::Disposed,
            result = tokio::time::timeout(timeout, self.execute(request, consistency, recorder)) => {
                match result {
                    Ok(result) => Outcome::Finished(result),
                    Err(_) => Outcome::TimedOut,
                }
            }
        };

        match outcome {
            Outcome::Finished(result) => result,
            Outcome::Canceled => {
                debug!(activity_id = %recorder.activity_id(), "request canceled by caller");
                Err(GatewayError::operation_canceled())
            }
            Outcome::Disposed => Err(self.disposed_error()),
            Outcome::TimedOut => {
                metrics::counter!(DISPATCH_TIMEOUTS).increment(1);
                Err(GatewayError::Timeout {
                    message: recorder.snapshot().timeout_message(),
                })
            }
        }
    }

    async fn execute(
        &self,
        request: &GatewayRequest,
        consistency: ConsistencyLevel,
        recorder: &mut DiagnosticsRecorder,
    ) -> Result<Completed, GatewayError> {
        let Some(address) = &request.collection else {
            return self.send(request, consistency, None, recorder).await;
        };

        let mut refreshed = false;
        loop {
            let properties = self
                .collections
                .resolve(&address.database, &address.collection)
                .await?;

            let result = match self.resolve_target(request, address, &properties).await {
                Ok(target) => self.send(request, consistency, Some(&target), recorder).await,
                Err(error) => Err(error),
            };

            match result {
                Err(error) if error.is_routing_not_found() && !refreshed => {
                    refreshed = true;
                    warn!(
                        activity_id = %recorder.activity_id(),
                        collection = %address.link(),
                        rid = %properties.rid,
                        "stale routing metadata, refreshing once: {error}"
                    );
                    metrics::counter!(STALE_ROUTING_RETRIES).increment(1);
                    self.collections
                        .invalidate(&address.database, &address.collection)
                        .await;
                    self.routing.invalidate(&properties.rid);
                    recorder.transition(RequestState::Retrying);
                }
                other => return other,
            }
        }
    }

    async fn resolve_target<'a>(
        &self,
        request: &GatewayRequest,
        address: &'a CollectionAddress,
        properties: &'a ContainerProperties,
    ) -> Result<CollectionTarget<'a>, GatewayError> {
        let routing_map = self
            .routing
            .resolve_routing_map(&properties.rid, false)
            .await?;

        Ok(CollectionTarget {
            address,
            properties,
            ranges: target_ranges(&routing_map, &request.partition)?,
        })
    }

    async fn send(
        &self,
        request: &GatewayRequest,
        consistency: ConsistencyLevel,
        target: Option<&CollectionTarget<'_>>,
        recorder: &mut DiagnosticsRecorder,
    ) -> Result<Completed, GatewayError> {
        let session_token = self.request_session_token(request, consistency, target);
        let policy = &self.options.retry_policy;
        let retry_safe = request.is_retry_safe();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let builder = self.build_request(
                request,
                consistency,
                session_token.as_deref(),
                target,
                recorder.activity_id(),
            )?;

            recorder.transition(RequestState::Sent);
            let started = Instant::now();
            let result = self.transport.send(builder).await;
            let duration = started.elapsed();

            let retry_after = match result {
                Ok(response) => {
                    let status = response.status;
                    let sub_status = response.sub_status();
                    recorder.add_request_charge(response.request_charge());
                    metrics::counter!(DISPATCH_ATTEMPTS, "status" => status.as_str().to_owned())
                        .increment(1);

                    if status.is_success() || status == StatusCode::NOT_MODIFIED {
                        recorder.record_attempt(self.attempt_record(
                            attempt,
                            Some(status),
                            sub_status,
                            duration,
                            "succeeded",
                        ));
                        return self.complete(request, target, response).await;
                    }

                    self.capture_failure_session_token(request, target, &response);

                    if is_stale_routing(status, sub_status) {
                        recorder.record_attempt(self.attempt_record(
                            attempt,
                            Some(status),
                            sub_status,
                            duration,
                            "stale_routing",
                        ));
                        return Err(GatewayError::RoutingNotFound {
                            resource: request.resource_link.clone(),
                            reason: format!(
                                "gateway responded {status} with sub-status {}",
                                sub_status.unwrap_or(0)
                            ),
                        });
                    }

                    if !(is_retryable_status(status, retry_safe) && policy.has_attempts_left(attempt))
                    {
                        recorder.record_attempt(self.attempt_record(
                            attempt,
                            Some(status),
                            sub_status,
                            duration,
                            "failed",
                        ));
                        return Err(GatewayError::Status {
                            status,
                            sub_status,
                            message: response.body_excerpt(),
                        });
                    }

                    recorder.record_attempt(self.attempt_record(
                        attempt,
                        Some(status),
                        sub_status,
                        duration,
                        "retrying",
                    ));
                    parse_retry_after_header(&response.headers)
                }
                Err(failure) => {
                    recorder.record_attempt(self.attempt_record(
                        attempt,
                        None,
                        None,
                        duration,
                        failure.label(),
                    ));
                    metrics::counter!(DISPATCH_ATTEMPTS, "status" => failure.label()).increment(1);

                    match failure {
                        TransportFailure::Fault(message) => {
                            return Err(self.internal_fault(message));
                        }
                        TransportFailure::Timeout(_)
                        | TransportFailure::Connect(_)
                        | TransportFailure::Transient(_)
                            if retry_safe && policy.has_attempts_left(attempt) =>
                        {
                            None
                        }
                        TransportFailure::Timeout(_) => {
                            return Err(GatewayError::Timeout {
                                message: recorder.snapshot().timeout_message(),
                            });
                        }
                        other => return Err(GatewayError::Transport(other.message().to_owned())),
                    }
                }
            };

            let interval = policy.retry_interval(attempt, retry_after);
            recorder.transition(RequestState::Retrying);
            metrics::counter!(DISPATCH_RETRIES).increment(1);
            debug!(
                activity_id = %recorder.activity_id(),
                attempt,
                interval_ms = interval.as_millis() as u64,
                "retrying gateway request"
            );
            tokio::time::sleep(interval).await;
        }
    }

    fn build_request(
        &self,
        request: &GatewayRequest,
        consistency: ConsistencyLevel,
        session_token: Option<&str>,
        target: Option<&CollectionTarget<'_>>,
        activity_id: Uuid,
    ) -> Result<RequestBuilder, GatewayError> {
        let mut builder = self
            .transport
            .request(request.operation.method(), &request.resource_link, activity_id)?
            .header(headers::CONSISTENCY_LEVEL, consistency.as_header_value());

        if let Some(token) = session_token {
            builder = builder.header(headers::SESSION_TOKEN, token);
        }

        match &request.partition {
            PartitionTarget::Key(value) => {
                builder = builder.header(headers::PARTITION_KEY, partition_key_header(value));
            }
            PartitionTarget::Range(range_id) => {
                builder = builder.header(headers::PARTITION_KEY_RANGE_ID, range_id.as_str());
            }
            PartitionTarget::None => {
                if request.operation == OperationType::Query && target.is_some() {
                    builder = builder.header(headers::ENABLE_CROSS_PARTITION, "True");
                }
            }
        }

        match request.operation {
            OperationType::Query => {
                builder = builder
                    .header(headers::IS_QUERY, "True")
                    .header(header::CONTENT_TYPE, "application/query+json");
            }
            OperationType::Upsert => {
                builder = builder.header(headers::IS_UPSERT, "True");
            }
            OperationType::Create
            | OperationType::Read
            | OperationType::Replace
            | OperationType::Delete
            | OperationType::ReadFeed => {}
        }

        if let Some(etag) = &request.options.if_match_etag {
            builder = builder.header(header::IF_MATCH, etag.as_str());
        }
        if let Some(max_item_count) = request.options.max_item_count {
            builder = builder.header(headers::MAX_ITEM_COUNT, max_item_count.to_string());
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        Ok(builder)
    }

    /// A caller supplied token wins; otherwise the token narrowed to the target ranges. Master
    /// resources and non-session requests never carry one.
    fn request_session_token(
        &self,
        request: &GatewayRequest,
        consistency: ConsistencyLevel,
        target: Option<&CollectionTarget<'_>>,
    ) -> Option<String> {
        if consistency != ConsistencyLevel::Session || request.resource_type.is_master_resource()
        {
            return None;
        }
        if let Some(token) = &request.options.session_token {
            return Some(token.clone());
        }

        let target = target?;
        self.sessions
            .resolve_request_token(&target.properties.rid, &target.ranges)
    }

    async fn complete(
        &self,
        request: &GatewayRequest,
        target: Option<&CollectionTarget<'_>>,
        response: RawResponse,
    ) -> Result<Completed, GatewayError> {
        let session_token = response.header(headers::SESSION_TOKEN).map(str::to_owned);
        if let (Some(target), Some(token)) = (target, session_token.as_deref()) {
            if !request.resource_type.is_master_resource() {
                self.record_session_token(target, token);
            }
        }

        let resource = Resource::decode(request.resource_type, request.operation, &response.body)?;
        if request.resource_type == ResourceType::Collection {
            self.observe_collection(request, resource.as_ref()).await;
        }

        Ok(Completed {
            status: response.status,
            continuation: response.header(headers::CONTINUATION).map(str::to_owned),
            headers: response.headers,
            resource,
            session_token,
        })
    }

    /// Conflicts, failed preconditions and plain not-founds still advance the session.
    fn capture_failure_session_token(
        &self,
        request: &GatewayRequest,
        target: Option<&CollectionTarget<'_>>,
        response: &RawResponse,
    ) {
        let Some(target) = target else {
            return;
        };
        if request.resource_type.is_master_resource() {
            return;
        }

        let captures = match response.status {
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => true,
            StatusCode::NOT_FOUND => {
                response.sub_status() != Some(sub_status::READ_SESSION_NOT_AVAILABLE)
            }
            _ => false,
        };

        if let (true, Some(token)) = (captures, response.header(headers::SESSION_TOKEN)) {
            self.record_session_token(target, token);
        }
    }

    fn record_session_token(&self, target: &CollectionTarget<'_>, token: &str) {
        if let Err(error) = self.sessions.record_response(
            &target.properties.rid,
            Some(target.address.link().as_str()),
            token,
        ) {
            warn!(
                collection = %target.address.link(),
                "ignoring malformed session token in response: {error}"
            );
        }
    }

    /// Keeps the caches in step with collection creates, reads and deletes made through this
    /// client.
    async fn observe_collection(&self, request: &GatewayRequest, resource: Option<&Resource>) {
        if request.operation == OperationType::Delete {
            if let Some(address) = CollectionAddress::from_link(&request.resource_link) {
                let rid = match self.sessions.resource_id_of(&address.link()) {
                    Some(rid) => Some(rid),
                    None => self
                        .collections
                        .cached(&address.database, &address.collection)
                        .await
                        .map(|properties| properties.rid),
                };
                self.sessions.clear_by_collection_name(&address.link());
                match rid {
                    Some(rid) => self.invalidate_collection(&address, &rid).await,
                    None => {
                        self.collections
                            .invalidate(&address.database, &address.collection)
                            .await
                    }
                }
            }
            return;
        }

        let (Some(Resource::Collection(properties)), Some(database)) =
            (resource, database_of_link(&request.resource_link))
        else {
            return;
        };

        let address = CollectionAddress::new(database, &properties.id);
        if let Some(previous) = self.sessions.resource_id_of(&address.link()) {
            if previous != properties.rid {
                self.sessions.clear_by_resource_id(&previous);
                self.routing.invalidate(&previous);
                self.metadata.forget_collection(&previous);
            }
        }
        self.metadata.remember_collection(database, properties);
        self.collections.insert(database, properties.clone()).await;
    }

    async fn invalidate_collection(&self, address: &CollectionAddress, collection_rid: &str) {
        self.collections
            .invalidate(&address.database, &address.collection)
            .await;
        self.routing.invalidate(collection_rid);
        self.metadata.forget_collection(collection_rid);
    }

    fn excluded_regions(&self, request: &GatewayRequest) -> Vec<String> {
        let mut regions = self.options.excluded_regions.clone();
        for region in &request.options.excluded_regions {
            if !regions.contains(region) {
                regions.push(region.clone());
            }
        }
        regions
    }

    fn attempt_record(
        &self,
        attempt: u32,
        status: Option<StatusCode>,
        sub_status: Option<u32>,
        duration: Duration,
        outcome: &str,
    ) -> AttemptRecord {
        AttemptRecord {
            attempt,
            status: status.map(|s| s.as_u16()),
            sub_status,
            duration,
            region: self.region.clone(),
            outcome: outcome.to_owned(),
        }
    }

    fn ensure_live(&self) -> Result<(), GatewayError> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }
        Ok(())
    }

    fn disposed_error(&self) -> GatewayError {
        GatewayError::ClientDisposed {
            configuration: self.configuration.clone(),
            disposed_at: self.disposed_at.get().copied().unwrap_or_else(Utc::now),
        }
    }

    fn internal_fault(&self, message: String) -> GatewayError {
        if self.is_disposed() {
            return self.disposed_error();
        }
        GatewayError::InternalFault {
            endpoint: self.options.endpoint.to_string(),
            configuration: self.configuration.clone(),
            message,
        }
    }
}

impl Drop for GatewayDispatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn target_ranges(
    routing_map: &CollectionRoutingMap,
    partition: &PartitionTarget,
) -> Result<Vec<PartitionKeyRange>, GatewayError> {
    let stale = |reason: String| GatewayError::RoutingNotFound {
        resource: routing_map.collection_rid().to_owned(),
        reason,
    };

    match partition {
        PartitionTarget::Key(value) => {
            let ranges: Vec<PartitionKeyRange> = routing_map
                .overlapping_ranges(&[partition_key_range(value)])
                .into_iter()
                .cloned()
                .collect();
            if ranges.is_empty() {
                return Err(stale(format!(
                    "no partition key range owns {}",
                    effective_partition_key(value)
                )));
            }
            Ok(ranges)
        }
        PartitionTarget::Range(range_id) => match routing_map.range_by_id(range_id) {
            Some(range) => Ok(vec![range.clone()]),
            None if routing_map.is_gone(range_id) => {
                Err(stale(format!("partition key range {range_id} was split")))
            }
            None => Err(stale(format!("partition key range {range_id} is unknown"))),
        },
        PartitionTarget::None => Ok(routing_map.ordered_ranges().to_vec()),
    }
}

/// Name cache stale, partition gone or splitting, or the owning collection was recreated.
fn is_stale_routing(status: StatusCode, sub_status: Option<u32>) -> bool {
    match status {
        StatusCode::GONE => true,
        StatusCode::NOT_FOUND => sub_status == Some(sub_status::OWNER_RESOURCE_NOT_FOUND),
        _ => false,
    }
}

/// `shop` in `dbs/shop/colls`.
fn database_of_link(link: &str) -> Option<&str> {
    let mut segments = link.trim_matches('/').split('/');
    match (segments.next(), segments.next()) {
        (Some("dbs"), Some(database)) if !database.is_empty() => Some(database),
        _ => None,
    }
}
