use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use common_routing::PartitionKeyRange;
use dashmap::DashMap;
use tracing::debug;

use crate::error::SessionTokenError;
use crate::metrics_consts::{
    SESSION_COLLECTIONS_REBOUND, SESSION_TOKENS_CLEARED, SESSION_TOKENS_RECORDED,
};
use crate::token::{format_session_header, parse_session_header, SessionToken};

/// Selects a collection either by its resource id or by its full name (`dbs/{db}/colls/{coll}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenScope<'a> {
    ResourceId(&'a str),
    CollectionName(&'a str),
}

#[derive(Default)]
struct Bindings {
    rid_by_name: HashMap<String, String>,
    name_by_rid: HashMap<String, String>,
}

/// Per-client store of the latest session token seen for every partition of every collection.
///
/// Tokens are kept by collection resource id, then by partition key range id. Names are bound to
/// resource ids as responses arrive; when a name shows up with a new resource id the collection
/// was recreated and the old id's tokens are dropped.
///
/// ```text
/// SessionTokenStore {
///     tokens: {
///         "f1BWAJ0z-wA=": { "0": 1#100#4=90, "1": 1#57 },
///     },
///     bindings: { "dbs/shop/colls/orders" <-> "f1BWAJ0z-wA=" },
/// }
/// ```
#[derive(Default)]
pub struct SessionTokenStore {
    tokens: DashMap<String, DashMap<String, SessionToken>>,
    bindings: RwLock<Bindings>,
}

impl SessionTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `token` into the stored token of one partition. Returns whether the stored token
    /// advanced; an older or equal token leaves it untouched.
    pub fn record_token(
        &self,
        collection_rid: &str,
        partition_key_range_id: &str,
        token: SessionToken,
    ) -> bool {
        let partitions = self.tokens.entry(collection_rid.to_owned()).or_default();

        let advanced = match partitions.get_mut(partition_key_range_id) {
            Some(mut existing) => {
                let merged = existing.merge(&token);
                let advanced = merged != *existing;
                *existing = merged;
                advanced
            }
            None => {
                partitions.insert(partition_key_range_id.to_owned(), token);
                true
            }
        };

        let outcome = if advanced { "advanced" } else { "unchanged" };
        metrics::counter!(SESSION_TOKENS_RECORDED, "outcome" => outcome).increment(1);
        advanced
    }

    /// Records every entry of a response's `x-ms-session-token` header.
    ///
    /// With `collection_name` given, the name is bound to `collection_rid` first. The header is
    /// validated before anything is stored.
    pub fn record_response(
        &self,
        collection_rid: &str,
        collection_name: Option<&str>,
        header: &str,
    ) -> Result<usize, SessionTokenError> {
        let entries = parse_session_header(header)?;

        match collection_name {
            Some(name) if !self.is_bound(name, collection_rid) => {
                let mut bindings = self.write_bindings();
                self.rebind(&mut bindings, name, collection_rid);
                Ok(self.record_entries(collection_rid, entries))
            }
            _ => {
                let _bindings = self.read_bindings();
                Ok(self.record_entries(collection_rid, entries))
            }
        }
    }

    fn record_entries(
        &self,
        collection_rid: &str,
        entries: Vec<(String, SessionToken)>,
    ) -> usize {
        let count = entries.len();
        for (range_id, token) in entries {
            self.record_token(collection_rid, &range_id, token);
        }
        count
    }

    fn is_bound(&self, name: &str, collection_rid: &str) -> bool {
        let bindings = self.read_bindings();
        bindings.rid_by_name.get(name).map(String::as_str) == Some(collection_rid)
            && bindings.name_by_rid.get(collection_rid).map(String::as_str) == Some(name)
    }

    fn rebind(&self, bindings: &mut Bindings, name: &str, collection_rid: &str) {
        if let Some(previous_rid) = bindings.rid_by_name.get(name).cloned() {
            if previous_rid != collection_rid {
                debug!(
                    collection = name,
                    previous_rid,
                    collection_rid,
                    "collection name rebound, dropping tokens of the previous resource id"
                );
                self.tokens.remove(&previous_rid);
                bindings.name_by_rid.remove(&previous_rid);
                metrics::counter!(SESSION_COLLECTIONS_REBOUND).increment(1);
            }
        }
        if let Some(previous_name) = bindings.name_by_rid.get(collection_rid).cloned() {
            if previous_name != name {
                bindings.rid_by_name.remove(&previous_name);
            }
        }

        bindings
            .rid_by_name
            .insert(name.to_owned(), collection_rid.to_owned());
        bindings
            .name_by_rid
            .insert(collection_rid.to_owned(), name.to_owned());
    }

    /// The token to send with a request targeting `target_ranges`: one entry per target range.
    ///
    /// A range without a token of its own (a fresh split child) inherits the merge of its
    /// parents' tokens. Returns `None` when no target range has anything to send.
    pub fn resolve_request_token(
        &self,
        collection_rid: &str,
        target_ranges: &[PartitionKeyRange],
    ) -> Option<String> {
        let entries: Vec<(String, SessionToken)> = target_ranges
            .iter()
            .filter_map(|range| {
                self.resolve_partition_token(collection_rid, range)
                    .map(|token| (range.id.clone(), token))
            })
            .collect();

        if entries.is_empty() {
            return None;
        }

        Some(format_session_header(
            entries.iter().map(|(id, token)| (id.as_str(), token)),
        ))
    }

    /// The token of one partition, falling back to the merge of its parents' tokens.
    pub fn resolve_partition_token(
        &self,
        collection_rid: &str,
        range: &PartitionKeyRange,
    ) -> Option<SessionToken> {
        let partitions = self.tokens.get(collection_rid)?;

        if let Some(token) = partitions.get(&range.id) {
            return Some(token.value().clone());
        }

        range
            .parents
            .iter()
            .filter_map(|parent| partitions.get(parent).map(|token| token.value().clone()))
            .reduce(|merged, token| merged.merge(&token))
    }

    /// Every tracked partition's entry for the collection, ordered by range id.
    pub fn resolve_global_token(&self, scope: TokenScope<'_>) -> Option<String> {
        let collection_rid = self.scope_rid(scope)?;
        let partitions = self.tokens.get(&collection_rid)?;

        let mut entries: Vec<(String, SessionToken)> = partitions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        if entries.is_empty() {
            return None;
        }
        entries.sort_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

        Some(format_session_header(
            entries.iter().map(|(id, token)| (id.as_str(), token)),
        ))
    }

    /// Number of partitions with a token for the collection.
    pub fn tracked_partitions(&self, collection_rid: &str) -> usize {
        self.tokens
            .get(collection_rid)
            .map(|partitions| partitions.len())
            .unwrap_or(0)
    }

    pub fn resource_id_of(&self, collection_name: &str) -> Option<String> {
        self.read_bindings().rid_by_name.get(collection_name).cloned()
    }

    pub fn clear_by_resource_id(&self, collection_rid: &str) {
        let mut bindings = self.write_bindings();
        if let Some(name) = bindings.name_by_rid.remove(collection_rid) {
            bindings.rid_by_name.remove(&name);
        }
        if self.tokens.remove(collection_rid).is_some() {
            metrics::counter!(SESSION_TOKENS_CLEARED).increment(1);
            debug!(collection_rid, "cleared session tokens");
        }
    }

    pub fn clear_by_collection_name(&self, collection_name: &str) {
        let mut bindings = self.write_bindings();
        if let Some(collection_rid) = bindings.rid_by_name.remove(collection_name) {
            bindings.name_by_rid.remove(&collection_rid);
            if self.tokens.remove(&collection_rid).is_some() {
                metrics::counter!(SESSION_TOKENS_CLEARED).increment(1);
                debug!(
                    collection = collection_name,
                    collection_rid, "cleared session tokens"
                );
            }
        }
    }

    fn scope_rid(&self, scope: TokenScope<'_>) -> Option<String> {
        match scope {
            TokenScope::ResourceId(rid) => Some(rid.to_owned()),
            TokenScope::CollectionName(name) => self.resource_id_of(name),
        }
    }

    fn read_bindings(&self) -> std::sync::RwLockReadGuard<'_, Bindings> {
        self.bindings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_bindings(&self) -> std::sync::RwLockWriteGuard<'_, Bindings> {
        self.bindings.write().unwrap_or_else(PoisonError::into_inner)
    }
}
