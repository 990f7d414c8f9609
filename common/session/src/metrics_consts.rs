// Labeled with outcome=advanced|unchanged
pub const SESSION_TOKENS_RECORDED: &str = "session_tokens_recorded_total";
pub const SESSION_COLLECTIONS_REBOUND: &str = "session_collections_rebound_total";
pub const SESSION_TOKENS_CLEARED: &str = "session_tokens_cleared_total";
