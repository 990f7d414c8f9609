// Counter names for routing map cache metrics
pub const ROUTING_CACHE_HIT_COUNTER: &str = "routing_map_cache_hit_total";
pub const ROUTING_CACHE_MISS_COUNTER: &str = "routing_map_cache_miss_total";
// A caller waited on a refresh started by someone else and reused its result
pub const ROUTING_CACHE_COALESCED_COUNTER: &str = "routing_map_cache_coalesced_total";
// Labeled with mode=incremental|full and outcome=success|not_found|error
pub const ROUTING_MAP_FETCH_COUNTER: &str = "routing_map_fetch_total";
pub const ROUTING_MAP_FETCH_TIME: &str = "routing_map_fetch_ms";
pub const ROUTING_CACHE_INVALIDATIONS: &str = "routing_map_cache_invalidations_total";
pub const ROUTING_CACHE_ENTRIES_GAUGE: &str = "routing_map_cache_entries";

pub const COLLECTION_CACHE_HIT_COUNTER: &str = "collection_cache_hit_total";
pub const COLLECTION_CACHE_MISS_COUNTER: &str = "collection_cache_miss_total";
pub const COLLECTION_FETCH_ERRORS_COUNTER: &str = "collection_fetch_errors_total";
