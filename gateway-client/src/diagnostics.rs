use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use tracing::debug;
use uuid::Uuid;

use crate::request::RequestState;

fn duration_ms<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

/// One send of a request over the wire.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub status: Option<u16>,
    pub sub_status: Option<u32>,
    #[serde(serialize_with = "duration_ms")]
    pub duration: Duration,
    pub region: Option<String>,
    pub outcome: String,
}

impl fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ", self.attempt)?;
        match (self.status, self.sub_status) {
            (Some(status), Some(sub_status)) => write!(f, "{status}/{sub_status}")?,
            (Some(status), None) => write!(f, "{status}")?,
            (None, _) => write!(f, "-")?,
        }
        write!(
            f,
            " {} {:.3} Ms",
            self.outcome,
            self.duration.as_secs_f64() * 1000.0
        )
    }
}

/// What happened while serving one operation. Attached to every response and every failure.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub activity_id: Uuid,
    pub operation: String,
    pub resource_link: String,
    pub start_time: DateTime<Utc>,
    #[serde(serialize_with = "duration_ms")]
    pub total_duration: Duration,
    #[serde(serialize_with = "duration_ms")]
    pub request_timeout: Duration,
    #[serde(serialize_with = "duration_ms")]
    pub http_client_timeout: Duration,
    pub retry_count: u32,
    pub regions_contacted: Vec<String>,
    pub excluded_regions: Vec<String>,
    pub active_clients: usize,
    pub request_charge: f64,
    pub final_state: RequestState,
    pub transitions: Vec<RequestState>,
    pub attempts: Vec<AttemptRecord>,
}

impl Diagnostics {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Description of an operation that ran out of its end-to-end budget.
    pub fn timeout_message(&self) -> String {
        format!(
            "GatewayStoreClient Request Timeout. Start Time UTC:{}; Total Duration:{:.3} Ms; \
             Request Timeout {} Ms; Http Client Timeout:{} Ms; Activity id: {};",
            self.start_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.total_duration.as_secs_f64() * 1000.0,
            self.request_timeout.as_millis(),
            self.http_client_timeout.as_millis(),
            self.activity_id,
        )
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Diagnostics {{ Activity id: {}; Operation: {}; Resource: {}; Start Time: {}; \
             Total Duration: {:.3} Ms; Request Timeout: {} Ms; Http Client Timeout: {} Ms; \
             Retry Count: {}; Regions Contacted: [{}]; Excluded Regions: [{}]; \
             Active Clients: {}; Request Charge: {}; State: {:?}; Attempts: [",
            self.activity_id,
            self.operation,
            self.resource_link,
            self.start_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.total_duration.as_secs_f64() * 1000.0,
            self.request_timeout.as_millis(),
            self.http_client_timeout.as_millis(),
            self.retry_count,
            self.regions_contacted.join(", "),
            self.excluded_regions.join(", "),
            self.active_clients,
            self.request_charge,
            self.final_state,
        )?;
        for (i, attempt) in self.attempts.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{attempt}")?;
        }
        write!(f, "] }}")
    }
}

/// Accumulates diagnostics while a request moves through its states.
pub struct DiagnosticsRecorder {
    activity_id: Uuid,
    operation: String,
    resource_link: String,
    start_time: DateTime<Utc>,
    started: Instant,
    request_timeout: Duration,
    http_client_timeout: Duration,
    excluded_regions: Vec<String>,
    active_clients: usize,
    regions_contacted: Vec<String>,
    request_charge: f64,
    state: RequestState,
    transitions: Vec<RequestState>,
    attempts: Vec<AttemptRecord>,
}

impl DiagnosticsRecorder {
    pub fn new(
        operation: &str,
        resource_link: &str,
        request_timeout: Duration,
        http_client_timeout: Duration,
    ) -> Self {
        Self {
            activity_id: Uuid::new_v4(),
            operation: operation.to_owned(),
            resource_link: resource_link.to_owned(),
            start_time: Utc::now(),
            started: Instant::now(),
            request_timeout,
            http_client_timeout,
            excluded_regions: Vec::new(),
            active_clients: 0,
            regions_contacted: Vec::new(),
            request_charge: 0.0,
            state: RequestState::Created,
            transitions: vec![RequestState::Created],
            attempts: Vec::new(),
        }
    }

    pub fn activity_id(&self) -> Uuid {
        self.activity_id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn set_active_clients(&mut self, active_clients: usize) {
        self.active_clients = active_clients;
    }

    pub fn set_excluded_regions(&mut self, regions: &[String]) {
        self.excluded_regions = regions.to_vec();
    }

    pub fn transition(&mut self, next: RequestState) {
        debug!(
            activity_id = %self.activity_id,
            operation = %self.operation,
            from = ?self.state,
            to = ?next,
            "request state transition"
        );
        self.state = next;
        self.transitions.push(next);
    }

    pub fn record_attempt(&mut self, attempt: AttemptRecord) {
        if let Some(region) = &attempt.region {
            if !self.regions_contacted.contains(region) {
                self.regions_contacted.push(region.clone());
            }
        }
        self.attempts.push(attempt);
    }

    pub fn add_request_charge(&mut self, charge: f64) {
        self.request_charge += charge;
    }

    pub fn snapshot(&self) -> Diagnostics {
        Diagnostics {
            activity_id: self.activity_id,
            operation: self.operation.clone(),
            resource_link: self.resource_link.clone(),
            start_time: self.start_time,
            total_duration: self.elapsed(),
            request_timeout: self.request_timeout,
            http_client_timeout: self.http_client_timeout,
            retry_count: u32::try_from(self.attempts.len().saturating_sub(1)).unwrap_or(u32::MAX),
            regions_contacted: self.regions_contacted.clone(),
            excluded_regions: self.excluded_regions.clone(),
            active_clients: self.active_clients,
            request_charge: self.request_charge,
            final_state: self.state,
            transitions: self.transitions.clone(),
            attempts: self.attempts.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> DiagnosticsRecorder {
        DiagnosticsRecorder::new(
            "ReadItem",
            "dbs/shop/colls/orders/docs/1",
            Duration::from_secs(5),
            Duration::from_secs(65),
        )
    }

    #[test]
    fn test_display_carries_triage_labels() {
        let mut recorder = recorder();
        recorder.set_active_clients(3);
        recorder.set_excluded_regions(&["East US".to_owned()]);
        recorder.transition(RequestState::Sent);
        recorder.record_attempt(AttemptRecord {
            attempt: 1,
            status: Some(429),
            sub_status: Some(3200),
            duration: Duration::from_millis(4),
            region: Some("West US".to_owned()),
            outcome: "retrying".to_owned(),
        });
        recorder.transition(RequestState::Retrying);
        recorder.transition(RequestState::Sent);
        recorder.record_attempt(AttemptRecord {
            attempt: 2,
            status: Some(200),
            sub_status: None,
            duration: Duration::from_millis(6),
            region: Some("West US".to_owned()),
            outcome: "succeeded".to_owned(),
        });
        recorder.add_request_charge(1.5);
        recorder.transition(RequestState::Succeeded);

        let diagnostics = recorder.snapshot();
        let text = diagnostics.to_string();

        for label in [
            "Start Time",
            "Total Duration",
            "Http Client Timeout",
            "Activity id",
            "Active Clients: 3",
            "Retry Count: 1",
            "Regions Contacted: [West US]",
            "Excluded Regions: [East US]",
            "Request Charge: 1.5",
        ] {
            assert!(text.contains(label), "missing '{label}' in {text}");
        }
        assert!(text.contains(&diagnostics.activity_id.to_string()));
        assert_eq!(diagnostics.final_state, RequestState::Succeeded);
        assert_eq!(
            diagnostics.transitions,
            vec![
                RequestState::Created,
                RequestState::Sent,
                RequestState::Retrying,
                RequestState::Sent,
                RequestState::Succeeded
            ]
        );
    }

    #[test]
    fn test_timeout_message_has_required_fields() {
        let diagnostics = recorder().snapshot();
        let message = diagnostics.timeout_message();

        assert!(message.contains("Start Time"));
        assert!(message.contains("Total Duration"));
        assert!(message.contains("Http Client Timeout:65000 Ms"));
        assert!(message.contains(&format!("Activity id: {}", diagnostics.activity_id)));
    }

    #[test]
    fn test_json_uses_milliseconds() {
        let json: serde_json::Value =
            serde_json::from_str(&recorder().snapshot().to_json().unwrap()).unwrap();

        assert_eq!(json["http_client_timeout"], serde_json::json!(65000.0));
        assert_eq!(json["final_state"], serde_json::json!("Created"));
        assert_eq!(json["retry_count"], serde_json::json!(0));
    }
}
