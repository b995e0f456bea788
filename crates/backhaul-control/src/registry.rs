//! Client registry
//!
//! Concurrent map from client identifier to the client's active control
//! connection. At most one registration is live per identifier: a newer
//! registration forcibly closes and replaces the older one (last writer
//! wins, no grace period). Removal is identity-checked so a stale removal
//! can never delete a registration that already superseded it.

use crate::client::Client;
use crate::events::ClientEvents;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ClientRegistry {
    clients: DashMap<String, Arc<Client>>,
    events: ClientEvents,
}

impl ClientRegistry {
    pub fn new(events: ClientEvents) -> Self {
        Self {
            clients: DashMap::new(),
            events,
        }
    }

    /// Register `client`, superseding any live registration with the same
    /// identifier. Emits a connected event on success.
    ///
    /// Returns false only when racing an identical add, in which case the
    /// other add already produced an equivalent registration.
    pub async fn add(&self, client: Arc<Client>) -> bool {
        if let Some((_, superseded)) = self.clients.remove(client.id()) {
            info!(client_id = %client.id(), "superseding existing registration");
            superseded.close().await;
        }

        match self.clients.entry(client.id().to_owned()) {
            Entry::Occupied(_) => {
                debug!(client_id = %client.id(), "lost registration race");
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(client.clone());
            }
        }

        info!(
            client_id = %client.id(),
            transport = %client.transport(),
            remote_addr = ?client.remote_addr(),
            "client connected"
        );
        self.events.publish(&client, true);
        true
    }

    /// Remove `client` if it is still the registered instance for its
    /// identifier. Emits a disconnected event on success.
    pub fn remove(&self, client: &Arc<Client>) -> bool {
        let removed = self
            .clients
            .remove_if(client.id(), |_, stored| Arc::ptr_eq(stored, client))
            .is_some();
        if removed {
            info!(client_id = %client.id(), "client disconnected");
            self.events.publish(client, false);
        }
        removed
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Client>> {
        self.clients.get(client_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Point-in-time snapshot, safe against concurrent mutation.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(ClientEvents::disabled())
    }
}
