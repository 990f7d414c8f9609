pub const ACTIVE_CLIENTS_GAUGE: &str = "gateway_client_active_clients";

// Labeled with operation and outcome=success|<error kind>
pub const DISPATCH_REQUESTS: &str = "gateway_dispatch_requests_total";
pub const DISPATCH_DURATION: &str = "gateway_dispatch_duration_ms";
// One per wire send, labeled with status
pub const DISPATCH_ATTEMPTS: &str = "gateway_dispatch_attempts_total";
pub const DISPATCH_RETRIES: &str = "gateway_dispatch_retries_total";
pub const DISPATCH_TIMEOUTS: &str = "gateway_dispatch_timeouts_total";
pub const DISPATCH_REQUEST_CHARGE: &str = "gateway_dispatch_request_charge";
pub const STALE_ROUTING_RETRIES: &str = "gateway_stale_routing_retries_total";

pub const METADATA_REQUESTS: &str = "gateway_metadata_requests_total";
