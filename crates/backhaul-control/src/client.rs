//! Registered clients
//!
//! A `Client` couples a control connection with the request-scoped metadata
//! captured at registration time: where the client dialed in from, which
//! transport carried it, and when.

use crate::connection::ClientConnection;
use backhaul_proto::TransportKind;
use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

pub struct Client {
    connection: Arc<ClientConnection>,
    transport: TransportKind,
    remote_addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
}

impl Client {
    pub fn new(
        connection: Arc<ClientConnection>,
        transport: TransportKind,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            connection,
            transport,
            remote_addr,
            connected_at: Utc::now(),
        }
    }

    /// The externally supplied client identifier.
    pub fn id(&self) -> &str {
        self.connection.client_id()
    }

    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn tunnel_count(&self) -> usize {
        self.connection.tunnel_count()
    }

    /// Close the underlying control connection. Idempotent.
    pub async fn close(&self) {
        self.connection.close().await;
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}
