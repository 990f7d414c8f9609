use std::fmt;

use chrono::{DateTime, Utc};
use common_routing::RoutingError;
use common_session::{ConsistencyViolation, SessionTokenError};
use http::StatusCode;
use thiserror::Error;

use crate::diagnostics::Diagnostics;

/// Enumeration of failures a gateway operation can end with.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Collection or partition metadata is stale or the collection is gone.
    #[error("routing metadata for {resource} is stale or gone ({reason})")]
    RoutingNotFound { resource: String, reason: String },
    /// `message` carries the start time, durations and activity id of the timed out operation.
    #[error("{message}")]
    Timeout { message: String },
    #[error("Cannot access a disposed client (disposed at {disposed_at}).\nClient Configuration:\n{configuration}")]
    ClientDisposed {
        configuration: String,
        disposed_at: DateTime<Utc>,
    },
    #[error("internal fault in the client for {endpoint}: {message}\nClient Configuration:\n{configuration}")]
    InternalFault {
        endpoint: String,
        configuration: String,
        message: String,
    },
    #[error("{message}")]
    OperationCanceled { message: String },
    #[error(transparent)]
    ConsistencyViolation(#[from] ConsistencyViolation),
    #[error("gateway responded {status}{}: {message}", sub_status_suffix(.sub_status))]
    Status {
        status: StatusCode,
        sub_status: Option<u32>,
        message: String,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("failed to (de)serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Routing(RoutingError),
    #[error(transparent)]
    SessionToken(#[from] SessionTokenError),
}

impl GatewayError {
    pub fn operation_canceled() -> Self {
        GatewayError::OperationCanceled {
            message: "The operation was canceled.".to_owned(),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            GatewayError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_routing_not_found(&self) -> bool {
        matches!(self, GatewayError::RoutingNotFound { .. })
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::RoutingNotFound { .. } => "routing_not_found",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::ClientDisposed { .. } => "client_disposed",
            GatewayError::InternalFault { .. } => "internal_fault",
            GatewayError::OperationCanceled { .. } => "operation_canceled",
            GatewayError::ConsistencyViolation(_) => "consistency_violation",
            GatewayError::Status { .. } => "status",
            GatewayError::Transport(_) => "transport",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::InvalidConfiguration(_) => "invalid_configuration",
            GatewayError::Serialization(_) => "serialization",
            GatewayError::Routing(_) => "routing",
            GatewayError::SessionToken(_) => "session_token",
        }
    }
}

fn sub_status_suffix(sub_status: &Option<u32>) -> String {
    sub_status
        .map(|s| format!(" (sub-status {s})"))
        .unwrap_or_default()
}

impl From<RoutingError> for GatewayError {
    fn from(error: RoutingError) -> Self {
        match error {
            RoutingError::NotFound(resource) => GatewayError::RoutingNotFound {
                resource,
                reason: "partition key ranges not found".to_owned(),
            },
            other => GatewayError::Routing(other),
        }
    }
}

/// Terminal failure of a dispatched operation. Always carries the operation's diagnostics.
#[derive(Error, Debug)]
pub struct DispatchError {
    #[source]
    pub error: GatewayError,
    pub diagnostics: Diagnostics,
}

impl DispatchError {
    pub fn new(error: GatewayError, diagnostics: Diagnostics) -> Self {
        Self { error, diagnostics }
    }

    pub fn error(&self) -> &GatewayError {
        &self.error
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }
}

/// Disposal and internal fault descriptions stop at the configuration block; every other failure
/// appends the diagnostics so a single log line is enough for triage.
impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            GatewayError::ClientDisposed { .. } | GatewayError::InternalFault { .. } => {
                write!(f, "{}", self.error)
            }
            _ => write!(f, "{}\n{}", self.error, self.diagnostics),
        }
    }
}
