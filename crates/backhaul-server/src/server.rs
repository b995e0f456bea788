//! Broker server
//!
//! One TCP listener, one hyper connection builder configured for all three
//! transports: HTTP/1.1 with upgrades, and HTTP/2 with the extended CONNECT
//! protocol enabled. Connection-level failures are scoped to the connection
//! that had them.

use crate::dispatch::{self, BrokerState};
use backhaul_control::{ClientRegistry, TunnelFactory};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: SocketAddr,
    /// Keep-alive interval for control connections; `None` disables it.
    pub keep_alive_interval: Option<Duration>,
    /// How long a forwarding caller waits for its tunnel to rendezvous.
    pub tunnel_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("valid default address"),
            keep_alive_interval: Some(Duration::from_secs(30)),
            tunnel_timeout: Duration::from_secs(60),
        }
    }
}

pub struct BrokerServer {
    config: BrokerConfig,
    state: Arc<BrokerState>,
}

impl BrokerServer {
    pub fn new(
        config: BrokerConfig,
        registry: Arc<ClientRegistry>,
        tunnels: Arc<TunnelFactory>,
    ) -> Self {
        let state = Arc::new(BrokerState {
            registry,
            tunnels,
            keep_alive_interval: config.keep_alive_interval,
            tunnel_timeout: config.tunnel_timeout,
            shutdown: CancellationToken::new(),
        });
        Self { config, state }
    }

    /// Token that stops the accept loop and cancels in-flight rendezvous
    /// waits when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn start(self) -> Result<(), BrokerError> {
        let bind_addr = self.config.bind_addr;
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| BrokerError::BindError {
                address: bind_addr.to_string(),
                reason: e.to_string(),
            })?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), BrokerError> {
        let local_addr = listener.local_addr()?;
        info!("broker listening on {}", local_addr);

        let shutdown = self.state.shutdown.clone();
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("broker shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };
            let (stream, remote_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "failed to accept connection");
                    continue;
                }
            };

            let state = self.state.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let state = state.clone();
                    async move {
                        Ok::<_, Infallible>(dispatch::handle(state, remote_addr, req).await)
                    }
                });

                let mut builder = auto::Builder::new(TokioExecutor::new());
                builder.http2().enable_connect_protocol();
                if let Err(err) = builder.serve_connection_with_upgrades(io, service).await {
                    debug!(remote_addr = %remote_addr, error = %err, "connection ended");
                }
            });
        }
    }
}
