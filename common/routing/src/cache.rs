use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::RoutingError;
use crate::fetcher::{PartitionKeyRangeFeed, RoutingMapFetcher};
use crate::metrics_consts::{
    ROUTING_CACHE_COALESCED_COUNTER, ROUTING_CACHE_ENTRIES_GAUGE, ROUTING_CACHE_HIT_COUNTER,
    ROUTING_CACHE_INVALIDATIONS, ROUTING_CACHE_MISS_COUNTER, ROUTING_MAP_FETCH_COUNTER,
    ROUTING_MAP_FETCH_TIME,
};
use crate::routing_map::CollectionRoutingMap;

#[derive(Default)]
struct SlotState {
    map: Option<Arc<CollectionRoutingMap>>,
    // Bumped every time a fetched map is stored.
    generation: u64,
}

/// Per-collection cache entry. The refresh lock serializes fetches for one collection only.
#[derive(Default)]
struct RoutingSlot {
    state: RwLock<SlotState>,
    refresh: tokio::sync::Mutex<()>,
}

impl RoutingSlot {
    fn snapshot(&self) -> (Option<Arc<CollectionRoutingMap>>, u64) {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        (state.map.clone(), state.generation)
    }

    fn store(&self, map: Arc<CollectionRoutingMap>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.map = Some(map);
        state.generation += 1;
    }
}

/// PartitionKeyRangeCache maps a collection resource id to its current routing map.
///
/// Features:
/// - **Forced refresh**: callers that hit a routing error ask for a fresh map; the new map
///   replaces the old one atomically, readers never see a partial map.
/// - **Coalescing**: concurrent resolutions of the same collection during one refresh cycle
///   share a single backend fetch. A caller that queued behind an in-flight refresh reuses its
///   result instead of fetching again. Different collections never wait on each other.
/// - **Incremental refresh**: with a map cached, a refresh asks only for the ranges changed since
///   the map's version marker and combines them. If that leaves a hole the cache falls back to a
///   full fetch.
///
/// ```text
/// PartitionKeyRangeCache {
///     fetcher: HttpRoutingMapFetcher { .. },
///     slots: {
///         "f1BWAJ0z-wA=": RoutingSlot { map: Some(CollectionRoutingMap { 3 ranges }), generation: 2 },
///         "k2CXBK1a-xB=": RoutingSlot { map: None, generation: 0 },
///     },
/// }
/// ```
pub struct PartitionKeyRangeCache<F: RoutingMapFetcher> {
    fetcher: Arc<F>,
    slots: Arc<DashMap<String, Arc<RoutingSlot>>>,
    fetch_count: Arc<AtomicU64>,
}

impl<F: RoutingMapFetcher> PartitionKeyRangeCache<F> {
    pub fn new(fetcher: F) -> Self {
        Self::with_shared_fetcher(Arc::new(fetcher))
    }

    pub fn with_shared_fetcher(fetcher: Arc<F>) -> Self {
        Self {
            fetcher,
            slots: Arc::new(DashMap::new()),
            fetch_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the routing map of `collection_rid`, fetching it when absent or when
    /// `force_refresh` is set.
    pub async fn resolve_routing_map(
        &self,
        collection_rid: &str,
        force_refresh: bool,
    ) -> Result<Arc<CollectionRoutingMap>, RoutingError> {
        let slot = self.slot(collection_rid);
        let (seen, seen_generation) = slot.snapshot();

        if !force_refresh {
            if let Some(map) = seen {
                metrics::counter!(ROUTING_CACHE_HIT_COUNTER).increment(1);
                return Ok(map);
            }
        }

        metrics::counter!(ROUTING_CACHE_MISS_COUNTER).increment(1);
        let _refreshing = slot.refresh.lock().await;

        let (current, generation) = slot.snapshot();
        if generation != seen_generation {
            if let Some(map) = current {
                debug!(
                    collection_rid,
                    generation, "reusing routing map refreshed by a concurrent caller"
                );
                metrics::counter!(ROUTING_CACHE_COALESCED_COUNTER).increment(1);
                return Ok(map);
            }
        }

        let refreshed = match self.fetch(collection_rid, current.as_deref()).await {
            Ok(map) => Arc::new(map),
            Err(e) => {
                if current.is_none() {
                    self.release_empty_slot(collection_rid, &slot);
                }
                return Err(e);
            }
        };
        slot.store(Arc::clone(&refreshed));
        metrics::gauge!(ROUTING_CACHE_ENTRIES_GAUGE).set(self.slots.len() as f64);

        Ok(refreshed)
    }

    /// Drops the cached map; the next resolution fetches from scratch.
    pub fn invalidate(&self, collection_rid: &str) {
        if self.slots.remove(collection_rid).is_some() {
            debug!(collection_rid, "invalidated routing map");
            metrics::counter!(ROUTING_CACHE_INVALIDATIONS).increment(1);
        }
    }

    /// The cached map, without fetching.
    pub fn cached(&self, collection_rid: &str) -> Option<Arc<CollectionRoutingMap>> {
        self.slots
            .get(collection_rid)
            .and_then(|slot| slot.snapshot().0)
    }

    /// Number of collections with a slot, cached map or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of backend fetches issued so far, incremental and full.
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    fn slot(&self, collection_rid: &str) -> Arc<RoutingSlot> {
        if let Some(slot) = self.slots.get(collection_rid) {
            return slot.value().clone();
        }
        self.slots
            .entry(collection_rid.to_owned())
            .or_default()
            .value()
            .clone()
    }

    /// Drops a slot that never held a map, unless another caller is queued on it.
    fn release_empty_slot(&self, collection_rid: &str, slot: &Arc<RoutingSlot>) {
        // One reference lives in the map, one in the caller.
        self.slots.remove_if(collection_rid, |_, existing| {
            Arc::ptr_eq(existing, slot) && Arc::strong_count(existing) <= 2
        });
    }

    async fn fetch(
        &self,
        collection_rid: &str,
        previous: Option<&CollectionRoutingMap>,
    ) -> Result<CollectionRoutingMap, RoutingError> {
        if let Some(previous) = previous {
            let feed = self
                .timed_fetch(collection_rid, previous.change_feed_etag(), "incremental")
                .await?;
            let etag = feed
                .etag
                .or_else(|| previous.change_feed_etag().map(str::to_owned));

            if let Some(combined) = previous.try_combine(feed.ranges, etag)? {
                return Ok(combined);
            }

            warn!(
                collection_rid,
                "incremental routing refresh left the key space uncovered, fetching every range"
            );
        }

        let feed = self.timed_fetch(collection_rid, None, "full").await?;
        CollectionRoutingMap::try_create_complete(collection_rid, feed.ranges, feed.etag)?
            .ok_or_else(|| RoutingError::IncompleteRoutingMap(collection_rid.to_owned()))
    }

    async fn timed_fetch(
        &self,
        collection_rid: &str,
        if_none_match: Option<&str>,
        mode: &'static str,
    ) -> Result<PartitionKeyRangeFeed, RoutingError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let result = self
            .fetcher
            .fetch_ranges(collection_rid, if_none_match)
            .await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(RoutingError::NotFound(_)) => "not_found",
            Err(_) => "error",
        };
        metrics::counter!(ROUTING_MAP_FETCH_COUNTER, "mode" => mode, "outcome" => outcome)
            .increment(1);
        metrics::histogram!(ROUTING_MAP_FETCH_TIME, "mode" => mode)
            .record(started.elapsed().as_millis() as f64);

        match &result {
            Ok(feed) => debug!(
                collection_rid,
                mode,
                ranges = feed.ranges.len(),
                "fetched partition key ranges"
            ),
            Err(e) => warn!(collection_rid, mode, error = %e, "partition key range fetch failed"),
        }

        result
    }
}

impl<F: RoutingMapFetcher> Clone for PartitionKeyRangeCache<F> {
    fn clone(&self) -> Self {
        Self {
            fetcher: Arc::clone(&self.fetcher),
            slots: Arc::clone(&self.slots),
            fetch_count: Arc::clone(&self.fetch_count),
        }
    }
}
