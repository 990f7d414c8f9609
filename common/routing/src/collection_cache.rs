use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::error::RoutingError;
use crate::fetcher::{CollectionFetcher, ContainerProperties};
use crate::metrics_consts::{
    COLLECTION_CACHE_HIT_COUNTER, COLLECTION_CACHE_MISS_COUNTER, COLLECTION_FETCH_ERRORS_COUNTER,
};

/// CollectionCache binds collection names to their properties (resource id and partition key
/// definition) using `moka`.
///
/// Concurrent lookups of the same name coalesce into one fetch through `try_get_with`; lookups of
/// different names proceed in parallel. A binding goes stale silently when a collection is deleted
/// and recreated under the same name; callers detect that downstream (a routing `NotFound`) and
/// call [`CollectionCache::invalidate`].
///
/// ```text
/// CollectionCache {
///     cache: Cache<"dbs/shop/colls/orders", ContainerProperties { id: "orders", rid: "f1BWAJ0z-wA=", .. }>
/// }
/// ```
pub struct CollectionCache<F: CollectionFetcher> {
    fetcher: Arc<F>,
    cache: Cache<String, ContainerProperties>,
}

impl<F: CollectionFetcher> CollectionCache<F> {
    const DEFAULT_MAX_ENTRIES: u64 = 10_000;

    pub fn new(fetcher: F, ttl: Option<Duration>) -> Self {
        let mut builder = Cache::builder().max_capacity(Self::DEFAULT_MAX_ENTRIES);
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }

        Self {
            fetcher: Arc::new(fetcher),
            cache: builder.build(),
        }
    }

    fn key(database: &str, collection: &str) -> String {
        format!("dbs/{database}/colls/{collection}")
    }

    pub async fn resolve(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<ContainerProperties, RoutingError> {
        let key = Self::key(database, collection);
        if let Some(cached) = self.cache.get(&key).await {
            metrics::counter!(COLLECTION_CACHE_HIT_COUNTER).increment(1);
            return Ok(cached);
        }

        metrics::counter!(COLLECTION_CACHE_MISS_COUNTER).increment(1);
        let fetcher = Arc::clone(&self.fetcher);
        let (database, collection) = (database.to_owned(), collection.to_owned());

        self.cache
            .try_get_with(key, async move {
                fetcher
                    .fetch_collection(&database, &collection)
                    .await
                    .inspect_err(|e| {
                        metrics::counter!(COLLECTION_FETCH_ERRORS_COUNTER).increment(1);
                        tracing::warn!(%database, %collection, error = %e, "collection lookup failed");
                    })
            })
            .await
            .map_err(|arc_err| (*arc_err).clone())
    }

    /// The current binding of a name, without fetching.
    pub async fn cached(&self, database: &str, collection: &str) -> Option<ContainerProperties> {
        self.cache.get(&Self::key(database, collection)).await
    }

    /// Forgets the name binding, e.g. after the collection was deleted or found stale.
    pub async fn invalidate(&self, database: &str, collection: &str) {
        self.cache.invalidate(&Self::key(database, collection)).await;
        tracing::debug!(database, collection, "invalidated collection binding");
    }

    /// Binds a name to properties the caller already holds, e.g. from a create response.
    pub async fn insert(&self, database: &str, properties: ContainerProperties) {
        self.cache
            .insert(Self::key(database, &properties.id), properties)
            .await;
    }
}

impl<F: CollectionFetcher> Clone for CollectionCache<F> {
    fn clone(&self) -> Self {
        Self {
            fetcher: Arc::clone(&self.fetcher),
            cache: self.cache.clone(),
        }
    }
}
