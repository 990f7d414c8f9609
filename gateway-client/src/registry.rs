use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use tracing::debug;
use uuid::Uuid;

use crate::metrics_consts::ACTIVE_CLIENTS_GAUGE;

static GLOBAL_REGISTRY: Lazy<Arc<ActiveClientRegistry>> =
    Lazy::new(|| Arc::new(ActiveClientRegistry::new()));

/// A live client as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEntry {
    pub id: Uuid,
    pub endpoint: String,
    pub created_at: DateTime<Utc>,
}

/// Handle returned by [`ActiveClientRegistry::register`]. Releasing it twice is a no-op.
#[derive(Debug)]
pub struct ClientRegistration {
    id: Uuid,
    released: AtomicBool,
}

impl ClientRegistration {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Tracks the client instances alive in this process.
///
/// Clients register on construction and deregister on disposal; the count is reported in the
/// diagnostics of every operation so that client proliferation shows up early. Registration is
/// rare, so a single mutex guards the table.
#[derive(Debug, Default)]
pub struct ActiveClientRegistry {
    clients: Mutex<HashMap<Uuid, ClientEntry>>,
}

impl ActiveClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every client of the process.
    pub fn global() -> Arc<ActiveClientRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    pub fn register(&self, endpoint: &str) -> ClientRegistration {
        let entry = ClientEntry {
            id: Uuid::now_v7(),
            endpoint: endpoint.to_owned(),
            created_at: Utc::now(),
        };
        let id = entry.id;

        let active = {
            let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
            clients.insert(id, entry);
            clients.len()
        };

        metrics::gauge!(ACTIVE_CLIENTS_GAUGE).set(active as f64);
        debug!(client_id = %id, endpoint, active, "registered client");

        ClientRegistration {
            id,
            released: AtomicBool::new(false),
        }
    }

    /// Removes the client. Returns whether this call removed it.
    pub fn deregister(&self, registration: &ClientRegistration) -> bool {
        if registration.released.swap(true, Ordering::SeqCst) {
            return false;
        }

        let (removed, active) = {
            let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
            let removed = clients.remove(&registration.id).is_some();
            (removed, clients.len())
        };

        metrics::gauge!(ACTIVE_CLIENTS_GAUGE).set(active as f64);
        debug!(client_id = %registration.id, active, "deregistered client");
        removed
    }

    pub fn count_active(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn entries(&self) -> Vec<ClientEntry> {
        let mut entries: Vec<ClientEntry> = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.created_at);
        entries
    }
}
