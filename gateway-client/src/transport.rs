use std::time;

use chrono::Utc;
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use url::Url;
use uuid::Uuid;

use crate::config::ClientOptions;
use crate::error::GatewayError;

pub mod headers {
    pub const CONSISTENCY_LEVEL: &str = "x-ms-consistency-level";
    pub const SESSION_TOKEN: &str = "x-ms-session-token";
    pub const PARTITION_KEY: &str = "x-ms-documentdb-partitionkey";
    pub const PARTITION_KEY_RANGE_ID: &str = "x-ms-documentdb-partitionkeyrangeid";
    pub const ACTIVITY_ID: &str = "x-ms-activity-id";
    pub const VERSION: &str = "x-ms-version";
    pub const DATE: &str = "x-ms-date";
    pub const SUB_STATUS: &str = "x-ms-substatus";
    pub const REQUEST_CHARGE: &str = "x-ms-request-charge";
    pub const RETRY_AFTER_MS: &str = "x-ms-retry-after-ms";
    pub const CONTINUATION: &str = "x-ms-continuation";
    pub const MAX_ITEM_COUNT: &str = "x-ms-max-item-count";
    pub const IS_QUERY: &str = "x-ms-documentdb-isquery";
    pub const IS_UPSERT: &str = "x-ms-documentdb-is-upsert";
    pub const ENABLE_CROSS_PARTITION: &str = "x-ms-documentdb-query-enablecrosspartition";
    pub const INCREMENTAL_FEED: &str = "a-im";
    pub const ETAG: &str = "etag";
}

pub mod sub_status {
    pub const NAME_CACHE_IS_STALE: u32 = 1000;
    pub const PARTITION_KEY_RANGE_GONE: u32 = 1002;
    pub const OWNER_RESOURCE_NOT_FOUND: u32 = 1003;
    pub const COMPLETING_SPLIT: u32 = 1007;
    // Shares its code with PARTITION_KEY_RANGE_GONE; the status tells them apart (404 vs 410).
    pub const READ_SESSION_NOT_AVAILABLE: u32 = 1002;
}

/// How much of a failed response body ends up in an error message.
pub const MAX_ERROR_BODY: usize = 1024;

/// Build a client for gateway requests. `request_timeout` bounds a single wire send, independently
/// of the end-to-end budget the dispatcher enforces.
pub fn build_http_client(request_timeout: time::Duration) -> reqwest::Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        header::ACCEPT,
        header::HeaderValue::from_static("application/json"),
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent(concat!("gateway-client/", env!("CARGO_PKG_VERSION")))
        .timeout(request_timeout)
        .build()
}

/// A response read off the wire in full.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    pub fn sub_status(&self) -> Option<u32> {
        self.header(headers::SUB_STATUS)
            .and_then(|value| value.trim().parse().ok())
    }

    pub fn request_charge(&self) -> f64 {
        self.header(headers::REQUEST_CHARGE)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0.0)
    }

    pub fn body_excerpt(&self) -> String {
        first_n_chars_of_body(&self.body, MAX_ERROR_BODY)
    }
}

/// Why a send produced no response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// The per-send timeout of the HTTP client elapsed.
    Timeout(String),
    Connect(String),
    /// The connection broke mid-exchange: reset, or closed before the response was complete.
    Transient(String),
    /// The request could not be built, e.g. a header value with control characters.
    Fault(String),
    Other(String),
}

impl TransportFailure {
    pub fn label(&self) -> &'static str {
        match self {
            TransportFailure::Timeout(_) => "transport_timeout",
            TransportFailure::Connect(_) => "connect_error",
            TransportFailure::Transient(_) => "connection_lost",
            TransportFailure::Fault(_) => "internal_fault",
            TransportFailure::Other(_) => "transport_error",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            TransportFailure::Timeout(message)
            | TransportFailure::Connect(message)
            | TransportFailure::Transient(message)
            | TransportFailure::Fault(message)
            | TransportFailure::Other(message) => message,
        }
    }

    fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_builder() {
            TransportFailure::Fault(error.to_string())
        } else if error.is_timeout() {
            TransportFailure::Timeout(error.to_string())
        } else if error.is_connect() {
            TransportFailure::Connect(error.to_string())
        } else if error.is_request() || error.is_body() {
            TransportFailure::Transient(error.to_string())
        } else {
            TransportFailure::Other(error.to_string())
        }
    }
}

/// HTTP plumbing shared by the dispatcher and the metadata fetcher.
#[derive(Debug)]
pub struct GatewayTransport {
    client: Client,
    endpoint: Url,
    authorization: Option<String>,
    api_version: String,
}

impl GatewayTransport {
    pub fn new(options: &ClientOptions) -> Result<Self, GatewayError> {
        let client = build_http_client(options.http_client_timeout).map_err(|e| {
            GatewayError::InvalidConfiguration(format!("failed to construct http client: {e}"))
        })?;

        Ok(Self {
            client,
            endpoint: options.endpoint.clone(),
            authorization: options.authorization.clone(),
            api_version: options.api_version.clone(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Absolute url of a resource link such as `dbs/shop/colls/orders`.
    pub fn url(&self, resource_link: &str) -> Result<Url, GatewayError> {
        let base = self.endpoint.as_str().trim_end_matches('/');
        let link = resource_link.trim_matches('/');
        Url::parse(&format!("{base}/{link}"))
            .map_err(|e| GatewayError::InvalidRequest(format!("resource link {link}: {e}")))
    }

    /// A request carrying the headers every gateway call needs.
    pub fn request(
        &self,
        method: Method,
        resource_link: &str,
        activity_id: Uuid,
    ) -> Result<RequestBuilder, GatewayError> {
        let mut builder = self
            .client
            .request(method, self.url(resource_link)?)
            .header(headers::VERSION, &self.api_version)
            .header(headers::DATE, http_date())
            .header(headers::ACTIVITY_ID, activity_id.to_string());

        if let Some(authorization) = &self.authorization {
            builder = builder.header(header::AUTHORIZATION, authorization);
        }

        Ok(builder)
    }

    pub async fn send(&self, request: RequestBuilder) -> Result<RawResponse, TransportFailure> {
        let response = request
            .send()
            .await
            .map_err(TransportFailure::from_reqwest)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(TransportFailure::from_reqwest)?;

        Ok(RawResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

/// RFC 1123 date, as the gateway expects in `x-ms-date`.
fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Decode at most `n` characters of a response body, replacing invalid UTF-8.
pub fn first_n_chars_of_body(body: &[u8], n: usize) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(n) {
        Some((cut, _)) => text[..cut].to_owned(),
        None => text.into_owned(),
    }
}

/// Whether a failed attempt may be sent again. Throttling never applied the write, so it is
/// retried regardless of `retry_safe`.
pub fn is_retryable_status(status: StatusCode, retry_safe: bool) -> bool {
    match status {
        StatusCode::TOO_MANY_REQUESTS => true,
        StatusCode::REQUEST_TIMEOUT
        | StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::SERVICE_UNAVAILABLE => retry_safe,
        _ => false,
    }
}

/// Attempt to parse how long the gateway asked us to back off.
/// `x-ms-retry-after-ms` takes precedence; a standard Retry-After header can specify a date in
/// RFC2822 or a number of seconds, and we try to parse both.
pub fn parse_retry_after_header(header_map: &HeaderMap) -> Option<time::Duration> {
    if let Some(millis) = header_str(header_map, headers::RETRY_AFTER_MS) {
        if let Ok(millis) = millis.trim().parse::<u64>() {
            return Some(time::Duration::from_millis(millis));
        }
    }

    let retry_after = header_map.get(header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after_header() {
        let mut header_map = HeaderMap::new();
        header_map.insert(header::RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(
            parse_retry_after_header(&header_map),
            Some(time::Duration::from_secs(120))
        );

        header_map.insert(headers::RETRY_AFTER_MS, "250".parse().unwrap());
        assert_eq!(
            parse_retry_after_header(&header_map),
            Some(time::Duration::from_millis(250))
        );
    }

    #[test]
    fn test_parse_retry_after_header_date() {
        let mut header_map = HeaderMap::new();
        let in_a_minute = Utc::now() + chrono::Duration::seconds(60);
        header_map.insert(
            header::RETRY_AFTER,
            in_a_minute.to_rfc2822().parse().unwrap(),
        );

        let duration = parse_retry_after_header(&header_map).unwrap();
        assert!(duration <= time::Duration::from_secs(60));
        assert!(duration >= time::Duration::from_secs(55));

        let mut past = HeaderMap::new();
        past.insert(
            header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(parse_retry_after_header(&past), None);
        assert_eq!(parse_retry_after_header(&HeaderMap::new()), None);
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS, false));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE, true));
        assert!(!is_retryable_status(StatusCode::SERVICE_UNAVAILABLE, false));
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT, true));
        assert!(!is_retryable_status(StatusCode::CONFLICT, true));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND, true));
    }

    #[test]
    fn test_body_excerpt_respects_char_boundaries() {
        assert_eq!(first_n_chars_of_body("héllo".as_bytes(), 2), "hé");
        assert_eq!(first_n_chars_of_body(b"short", 100), "short");
        assert_eq!(first_n_chars_of_body(&[0xff, b'a'], 5), "\u{fffd}a");
    }

    #[test]
    fn test_url_joins_links_under_endpoint_path() {
        let options = ClientOptions::new("http://localhost:8081/gateway/").unwrap();
        let transport = GatewayTransport::new(&options).unwrap();

        assert_eq!(
            transport.url("/dbs/shop/colls/orders").unwrap().as_str(),
            "http://localhost:8081/gateway/dbs/shop/colls/orders"
        );
    }
}
