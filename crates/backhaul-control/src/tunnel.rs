//! Bound data tunnels
//!
//! A `Tunnel` is one matched data connection in use by a forwarding caller.
//! It reads and writes straight through to the negotiated stream and owns
//! the close accounting: the first close — explicit shutdown or drop, local
//! or remote — decrements the owning connection's tunnel counter exactly
//! once, records the elapsed lifetime, and fires the closed notification.

use crate::connection::ClientConnection;
use backhaul_proto::{TransportKind, TunnelId};
use backhaul_transport::BoxedDuplex;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{ready, Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Tunnel {
    id: TunnelId,
    transport: TransportKind,
    stream: BoxedDuplex,
    owner: OnceLock<Arc<ClientConnection>>,
    opened_at: Instant,
    closed: CancellationToken,
    close_once: AtomicBool,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    pub fn new(id: TunnelId, transport: TransportKind, stream: BoxedDuplex) -> Self {
        Self {
            id,
            transport,
            stream,
            owner: OnceLock::new(),
            opened_at: Instant::now(),
            closed: CancellationToken::new(),
            close_once: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Assign the owning connection for counter and lifetime reporting.
    /// Must be called exactly once, before the tunnel is put to use.
    pub fn bind_connection(&self, connection: Arc<ClientConnection>) {
        if self.owner.set(connection).is_err() {
            debug!(tunnel_id = %self.id, "bind_connection called twice");
        }
    }

    /// The owning connection, if already bound.
    pub fn owner(&self) -> Option<&Arc<ClientConnection>> {
        self.owner.get()
    }

    /// Token that fires once, on first close.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn mark_closed(&self) {
        if self.close_once.swap(true, Ordering::AcqRel) {
            return;
        }
        let lifetime = self.opened_at.elapsed();
        match self.owner.get() {
            Some(connection) => {
                let tunnel_count = connection.decrement_tunnel_count();
                info!(
                    client_id = %connection.client_id(),
                    transport = %self.transport,
                    tunnel_id = %self.id,
                    lifetime = ?lifetime,
                    tunnel_count,
                    "tunnel closed"
                );
            }
            None => {
                debug!(
                    transport = %self.transport,
                    tunnel_id = %self.id,
                    lifetime = ?lifetime,
                    "unbound tunnel closed"
                );
            }
        }
        self.closed.cancel();
    }
}

impl AsyncRead for Tunnel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Tunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = ready!(Pin::new(&mut this.stream).poll_shutdown(cx));
        this.mark_closed();
        Poll::Ready(result)
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.mark_closed();
    }
}
