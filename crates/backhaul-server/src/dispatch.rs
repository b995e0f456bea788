//! Inbound request dispatch
//!
//! Routes the broker's three paths. Handshake responses go back on the HTTP
//! connection first; the accepted stream is then driven from a spawned task
//! so one slow tunnel never holds up the connection's other requests.

use crate::splice::splice;
use backhaul_control::{
    Client, ClientConnection, ClientRegistry, ConnectionConfig, Tunnel, TunnelError,
    TunnelFactory,
};
use backhaul_proto::TunnelId;
use backhaul_transport::Negotiation;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Shared state behind every inbound request.
pub struct BrokerState {
    pub registry: Arc<ClientRegistry>,
    pub tunnels: Arc<TunnelFactory>,
    pub keep_alive_interval: Option<Duration>,
    pub tunnel_timeout: Duration,
    /// Cancels in-flight rendezvous waits on broker shutdown.
    pub shutdown: CancellationToken,
}

pub async fn handle<B>(
    state: Arc<BrokerState>,
    remote_addr: SocketAddr,
    req: Request<B>,
) -> Response<Full<Bytes>>
where
    B: Send + 'static,
{
    match req.uri().path() {
        "/server" => {
            if let Some(client_id) = query_param(&req, "clientId") {
                serve_control(state, remote_addr, req, client_id)
            } else if let Some(tunnel_id) = query_param(&req, "tunnelId") {
                serve_tunnel(state, req, tunnel_id)
            } else {
                status(StatusCode::BAD_REQUEST)
            }
        }
        "/client" => forward(state, req).await,
        _ => status(StatusCode::NOT_FOUND),
    }
}

/// Control-plane registration: `/server?clientId=…`.
fn serve_control<B>(
    state: Arc<BrokerState>,
    remote_addr: SocketAddr,
    mut req: Request<B>,
    client_id: String,
) -> Response<Full<Bytes>> {
    let Some(negotiation) = Negotiation::negotiate(&mut req) else {
        return status(StatusCode::METHOD_NOT_ALLOWED);
    };
    let transport = negotiation.transport();
    let response = negotiation.response();

    tokio::spawn(async move {
        let stream = match negotiation.accept().await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(client_id = %client_id, error = %err, "control upgrade failed");
                return;
            }
        };
        let connection = Arc::new(ClientConnection::new(
            client_id,
            stream,
            &ConnectionConfig {
                keep_alive_interval: state.keep_alive_interval,
            },
        ));
        let client = Arc::new(Client::new(connection.clone(), transport, Some(remote_addr)));

        if state.registry.add(client.clone()).await {
            connection.run().await;
            state.registry.remove(&client);
        } else {
            connection.close().await;
        }
    });

    response
}

/// Data-plane tunnel arrival: `/server?tunnelId=…`.
fn serve_tunnel<B>(
    state: Arc<BrokerState>,
    mut req: Request<B>,
    tunnel_id: String,
) -> Response<Full<Bytes>> {
    let Some(negotiation) = Negotiation::negotiate(&mut req) else {
        return status(StatusCode::METHOD_NOT_ALLOWED);
    };
    let Ok(token) = tunnel_id.parse::<TunnelId>() else {
        return status(StatusCode::BAD_REQUEST);
    };
    // Cheap rejection of unknown tokens before accepting any stream.
    if !state.tunnels.contains(token) {
        return status(StatusCode::NOT_FOUND);
    }

    let transport = negotiation.transport();
    let response = negotiation.response();

    tokio::spawn(async move {
        let stream = match negotiation.accept().await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(tunnel_id = %token, error = %err, "tunnel upgrade failed");
                return;
            }
        };
        let tunnel = Tunnel::new(token, transport, stream);
        let closed = tunnel.closed_token();
        match state.tunnels.resolve(tunnel) {
            Ok(()) => closed.cancelled().await,
            Err(orphan) => {
                // Requester gave up first, or the token was never real.
                debug!(tunnel_id = %token, "no pending request for arriving tunnel, disposing");
                drop(orphan);
            }
        }
    });

    response
}

/// Forwarding entry: `/client?clientId=…`.
async fn forward<B>(state: Arc<BrokerState>, mut req: Request<B>) -> Response<Full<Bytes>> {
    let Some(client_id) = query_param(&req, "clientId") else {
        return status(StatusCode::BAD_REQUEST);
    };
    let Some(negotiation) = Negotiation::negotiate(&mut req) else {
        return status(StatusCode::METHOD_NOT_ALLOWED);
    };
    let Some(client) = state.registry.get(&client_id) else {
        return status(StatusCode::NOT_FOUND);
    };

    let tunnel = match state
        .tunnels
        .create_tunnel(client.connection(), state.tunnel_timeout, &state.shutdown)
        .await
    {
        Ok(tunnel) => tunnel,
        Err(TunnelError::RendezvousTimeout(_) | TunnelError::Cancelled) => {
            return status(StatusCode::GATEWAY_TIMEOUT);
        }
        Err(_) => return status(StatusCode::BAD_GATEWAY),
    };

    let response = negotiation.response();
    tokio::spawn(async move {
        match negotiation.accept().await {
            Ok(caller) => splice(caller, tunnel).await,
            Err(err) => {
                debug!(client_id = %client_id, error = %err, "caller upgrade failed");
                drop(tunnel);
            }
        }
    });
    response
}

fn query_param<B>(req: &Request<B>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn status(code: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .body(Full::new(Bytes::new()))
        .expect("static response parts are valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_extracts_and_rejects_empty() {
        let req = Request::builder()
            .uri("/server?clientId=alice&tunnelId=")
            .body(())
            .unwrap();
        assert_eq!(query_param(&req, "clientId").as_deref(), Some("alice"));
        assert_eq!(query_param(&req, "tunnelId"), None);
        assert_eq!(query_param(&req, "missing"), None);
    }

    #[test]
    fn query_param_decodes_percent_encoding() {
        let req = Request::builder()
            .uri("/server?clientId=team%2Falice")
            .body(())
            .unwrap();
        assert_eq!(query_param(&req, "clientId").as_deref(), Some("team/alice"));
    }
}
