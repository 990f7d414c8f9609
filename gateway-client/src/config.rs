use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::time;

use common_session::ConsistencyLevel;
use envconfig::Envconfig;
use url::Url;

use crate::error::GatewayError;
use crate::retry::RetryPolicy;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "GATEWAY_ENDPOINT", default = "http://localhost:8081")]
    pub endpoint: String,

    // Sent verbatim as the authorization header; request signing happens upstream.
    #[envconfig(from = "GATEWAY_AUTHORIZATION", default = "")]
    pub authorization: String,

    #[envconfig(from = "GATEWAY_DATABASE", default = "probe")]
    pub database: String,

    #[envconfig(from = "GATEWAY_CONTAINER", default = "items")]
    pub container: String,

    #[envconfig(from = "ACCOUNT_CONSISTENCY_LEVEL", default = "Session")]
    pub account_consistency_level: ConsistencyLevel,

    #[envconfig(from = "API_VERSION", default = "2018-12-31")]
    pub api_version: String,

    // End-to-end budget of one operation, retries included
    #[envconfig(from = "REQUEST_TIMEOUT_MS", default = "60000")]
    pub request_timeout: EnvMsDuration,

    // Per-attempt timeout of the HTTP client
    #[envconfig(from = "HTTP_CLIENT_TIMEOUT_MS", default = "65000")]
    pub http_client_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(from = "GATEWAY_REGION")]
    pub region: Option<NonEmptyString>,

    #[envconfig(from = "EXCLUDED_REGIONS", default = "")]
    pub excluded_regions: RegionList,

    #[envconfig(from = "COLLECTION_CACHE_TTL_SECONDS", default = "300")]
    pub collection_cache_ttl_seconds: u64,

    #[envconfig(from = "DEBUG", default = "false")]
    pub debug: FlexBool,
}

impl Config {
    pub fn default_test_config() -> Self {
        Self {
            endpoint: "http://localhost:8081".to_string(),
            authorization: String::new(),
            database: "probe".to_string(),
            container: "items".to_string(),
            account_consistency_level: ConsistencyLevel::Session,
            api_version: "2018-12-31".to_string(),
            request_timeout: EnvMsDuration(time::Duration::from_secs(60)),
            http_client_timeout: EnvMsDuration(time::Duration::from_secs(65)),
            retry_policy: RetryPolicyConfig {
                backoff_coefficient: 2,
                initial_interval: EnvMsDuration(time::Duration::from_millis(100)),
                maximum_interval: EnvMsDuration(time::Duration::from_secs(5)),
                max_attempts: 3,
            },
            region: None,
            excluded_regions: RegionList::default(),
            collection_cache_ttl_seconds: 300,
            debug: FlexBool(false),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "RETRY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "RETRY_INITIAL_INTERVAL_MS", default = "100")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_MAXIMUM_INTERVAL_MS", default = "5000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(from = "MAX_RETRY_ATTEMPTS", default = "3")]
    pub max_attempts: u32,
}

impl RetryPolicyConfig {
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy::build(self.backoff_coefficient, self.initial_interval.0)
            .maximum_interval(self.maximum_interval.0)
            .max_attempts(self.max_attempts)
            .provide()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlexBool(pub bool);

impl FromStr for FlexBool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(FlexBool(true)),
            "false" | "0" | "no" | "off" | "" => Ok(FlexBool(false)),
            _ => Err(format!("Invalid boolean value: {}", s)),
        }
    }
}

impl Deref for FlexBool {
    type Target = bool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Comma separated region names, e.g. `West US,East US 2`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionList(pub Vec<String>);

impl FromStr for RegionList {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(RegionList(
            s.split(',')
                .map(str::trim)
                .filter(|region| !region.is_empty())
                .map(str::to_owned)
                .collect(),
        ))
    }
}

/// Settings of one [`crate::GatewayClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub endpoint: Url,
    pub authorization: Option<String>,
    pub account_consistency_level: ConsistencyLevel,
    pub api_version: String,
    pub request_timeout: time::Duration,
    pub http_client_timeout: time::Duration,
    pub retry_policy: RetryPolicy,
    pub region: Option<String>,
    pub excluded_regions: Vec<String>,
    pub collection_cache_ttl: Option<time::Duration>,
}

impl ClientOptions {
    pub fn new(endpoint: &str) -> Result<Self, GatewayError> {
        Ok(Self {
            endpoint: parse_endpoint(endpoint)?,
            authorization: None,
            account_consistency_level: ConsistencyLevel::Session,
            api_version: "2018-12-31".to_owned(),
            request_timeout: time::Duration::from_secs(60),
            http_client_timeout: time::Duration::from_secs(65),
            retry_policy: RetryPolicy::default(),
            region: None,
            excluded_regions: Vec::new(),
            collection_cache_ttl: Some(time::Duration::from_secs(300)),
        })
    }

    pub fn with_authorization(mut self, authorization: &str) -> Self {
        self.authorization = Some(authorization.to_owned());
        self
    }

    pub fn with_consistency_level(mut self, level: ConsistencyLevel) -> Self {
        self.account_consistency_level = level;
        self
    }

    pub fn with_request_timeout(mut self, timeout: time::Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_http_client_timeout(mut self, timeout: time::Duration) -> Self {
        self.http_client_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_region(mut self, region: &str) -> Self {
        self.region = Some(region.to_owned());
        self
    }

    pub fn with_excluded_regions(mut self, regions: &[&str]) -> Self {
        self.excluded_regions = regions.iter().map(|r| (*r).to_owned()).collect();
        self
    }
}

impl TryFrom<&Config> for ClientOptions {
    type Error = GatewayError;

    fn try_from(config: &Config) -> Result<Self, Self::Error> {
        Ok(Self {
            endpoint: parse_endpoint(&config.endpoint)?,
            authorization: Some(config.authorization.clone()).filter(|a| !a.is_empty()),
            account_consistency_level: config.account_consistency_level,
            api_version: config.api_version.clone(),
            request_timeout: config.request_timeout.0,
            http_client_timeout: config.http_client_timeout.0,
            retry_policy: config.retry_policy.provide(),
            region: config.region.as_ref().map(|r| r.as_str().to_owned()),
            excluded_regions: config.excluded_regions.0.clone(),
            collection_cache_ttl: Some(time::Duration::from_secs(
                config.collection_cache_ttl_seconds,
            ))
            .filter(|ttl| !ttl.is_zero()),
        })
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, GatewayError> {
    let url = Url::parse(endpoint)
        .map_err(|e| GatewayError::InvalidConfiguration(format!("endpoint {endpoint}: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(GatewayError::InvalidConfiguration(format!(
            "endpoint {endpoint} cannot be used as a base url"
        )));
    }
    Ok(url)
}

/// Human readable configuration block, attached to disposal and internal fault errors.
impl fmt::Display for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ConnectionMode: Gateway")?;
        writeln!(f, "Endpoint: {}", self.endpoint)?;
        writeln!(f, "ConsistencyLevel: {}", self.account_consistency_level)?;
        writeln!(f, "ApiVersion: {}", self.api_version)?;
        writeln!(
            f,
            "RequestTimeout: {} Ms",
            self.request_timeout.as_millis()
        )?;
        writeln!(
            f,
            "HttpClientTimeout: {} Ms",
            self.http_client_timeout.as_millis()
        )?;
        writeln!(f, "MaxRetryAttempts: {}", self.retry_policy.max_attempts)?;
        writeln!(
            f,
            "Region: {}",
            self.region.as_deref().unwrap_or("(not set)")
        )?;
        write!(f, "ExcludedRegions: [{}]", self.excluded_regions.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::init_from_hashmap(&Default::default()).unwrap();

        assert_eq!(config.endpoint, "http://localhost:8081");
        assert_eq!(config.account_consistency_level, ConsistencyLevel::Session);
        assert_eq!(config.request_timeout.0, time::Duration::from_secs(60));
        assert_eq!(config.http_client_timeout.0, time::Duration::from_secs(65));
        assert_eq!(config.retry_policy.max_attempts, 3);
        assert!(config.region.is_none());
        assert!(config.excluded_regions.0.is_empty());
        assert_eq!(config.debug, FlexBool(false));
    }

    #[test]
    fn test_config_from_env_values() {
        let env = [
            ("GATEWAY_ENDPOINT", "https://acct.example.net:443/"),
            ("ACCOUNT_CONSISTENCY_LEVEL", "Eventual"),
            ("REQUEST_TIMEOUT_MS", "1500"),
            ("MAX_RETRY_ATTEMPTS", "5"),
            ("GATEWAY_REGION", "West US"),
            ("EXCLUDED_REGIONS", "East US, North Europe"),
            ("DEBUG", "yes"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = Config::init_from_hashmap(&env).unwrap();
        let options = ClientOptions::try_from(&config).unwrap();

        assert_eq!(options.account_consistency_level, ConsistencyLevel::Eventual);
        assert_eq!(options.request_timeout, time::Duration::from_millis(1500));
        assert_eq!(options.retry_policy.max_attempts, 5);
        assert_eq!(options.region.as_deref(), Some("West US"));
        assert_eq!(options.excluded_regions, vec!["East US", "North Europe"]);
        assert!(options.authorization.is_none());
        assert!(*config.debug);
    }

    #[test]
    fn test_configuration_block_lists_settings() {
        let options = ClientOptions::new("http://localhost:8081")
            .unwrap()
            .with_excluded_regions(&["East US"]);
        let block = options.to_string();

        assert!(block.contains("Endpoint: http://localhost:8081/"));
        assert!(block.contains("ConsistencyLevel: Session"));
        assert!(block.contains("HttpClientTimeout: 65000 Ms"));
        assert!(block.contains("ExcludedRegions: [East US]"));
    }

    #[test]
    fn test_invalid_endpoint_is_rejected() {
        assert!(matches!(
            ClientOptions::new("not a url"),
            Err(GatewayError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            ClientOptions::new("mailto:someone@example.com"),
            Err(GatewayError::InvalidConfiguration(_))
        ));
    }
}
