//! Tunnel rendezvous
//!
//! Matching is a promise keyed by token: `create_tunnel` parks a
//! single-resolution slot in a concurrent map, tells the client to dial
//! back, and waits; `resolve` is called when the tagged data connection
//! arrives and completes the slot in the same map operation that removes
//! it, so no token can be honored twice. The pending entry is removed on
//! every exit path — resolution, timeout, cancellation, even the requesting
//! future being dropped.

use crate::connection::ClientConnection;
use crate::tunnel::Tunnel;
use backhaul_proto::TunnelId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Failure to establish a tunnel. Scoped to one request; never fatal to the
/// broker.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Two live tunnels drew the same 128-bit token. Practically
    /// unreachable; reported rather than silently clobbering the slot.
    #[error("tunnel token collision on {0}")]
    TokenCollision(TunnelId),

    #[error("timed out waiting for tunnel {0}")]
    RendezvousTimeout(TunnelId),

    #[error("tunnel request cancelled")]
    Cancelled,

    #[error("failed to signal client: {0}")]
    Signal(#[from] io::Error),

    #[error("control connection closed during rendezvous")]
    ConnectionClosed,
}

pub struct TunnelFactory {
    pending: DashMap<TunnelId, oneshot::Sender<Tunnel>>,
}

/// Removes the pending entry when the request leaves scope, however it
/// leaves scope.
struct PendingGuard<'a> {
    factory: &'a TunnelFactory,
    id: TunnelId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.factory.pending.remove(&self.id);
    }
}

impl TunnelFactory {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Ask `connection`'s client for a new data connection and wait for it
    /// to arrive, bounded by `timeout` and by `cancel`.
    ///
    /// On success the returned tunnel is bound to its owner and the owner's
    /// tunnel counter has been incremented. On any failure the pending
    /// token is gone and no counter was touched.
    pub async fn create_tunnel(
        &self,
        connection: &Arc<ClientConnection>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Tunnel, TunnelError> {
        let id = TunnelId::random();
        let (slot, arrival) = oneshot::channel();
        match self.pending.entry(id) {
            Entry::Occupied(_) => return Err(TunnelError::TokenCollision(id)),
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
            }
        }
        let _guard = PendingGuard { factory: self, id };

        let client_id = connection.client_id().to_owned();
        let started = Instant::now();
        info!(client_id = %client_id, tunnel_id = %id, "requesting tunnel");

        let outcome = async {
            connection.open_tunnel(id).await?;
            tokio::select! {
                arrived = arrival => arrived.map_err(|_| TunnelError::ConnectionClosed),
                _ = tokio::time::sleep(timeout) => Err(TunnelError::RendezvousTimeout(id)),
                _ = cancel.cancelled() => Err(TunnelError::Cancelled),
            }
        }
        .await;

        match outcome {
            Ok(tunnel) => {
                let tunnel_count = connection.increment_tunnel_count();
                tunnel.bind_connection(connection.clone());
                info!(
                    client_id = %client_id,
                    transport = %tunnel.transport(),
                    tunnel_id = %id,
                    elapsed = ?started.elapsed(),
                    tunnel_count,
                    "tunnel established"
                );
                Ok(tunnel)
            }
            Err(err) => {
                warn!(client_id = %client_id, tunnel_id = %id, error = %err, "tunnel request failed");
                Err(err)
            }
        }
    }

    /// Complete the pending request for `tunnel`'s token.
    ///
    /// Removal and resolution are one map operation, so a token resolves at
    /// most once. The tunnel comes back as the error when the token is
    /// unknown or its requester already gave up; the caller must dispose
    /// it.
    pub fn resolve(&self, tunnel: Tunnel) -> Result<(), Tunnel> {
        match self.pending.remove(&tunnel.id()) {
            Some((_, slot)) => slot.send(tunnel),
            None => Err(tunnel),
        }
    }

    /// Cheap existence check for a pending token.
    pub fn contains(&self, id: TunnelId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Number of requests currently awaiting rendezvous.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for TunnelFactory {
    fn default() -> Self {
        Self::new()
    }
}
