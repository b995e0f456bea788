//! Transport negotiation
//!
//! Inspects an inbound request and decides, in order, whether it is a
//! WebSocket handshake carrying the backhaul subprotocol, an HTTP/2
//! extended CONNECT with `:protocol = backhaul`, or an HTTP/1.1
//! `Upgrade: backhaul`. The first match wins; anything else is rejected by
//! the caller with a method-not-allowed response and no state is created.
//!
//! A successful negotiation captures the request's upgrade future. The
//! handshake response must be sent back through the HTTP connection before
//! [`Negotiation::accept`] resolves to the duplex stream.

use crate::{BoxedDuplex, TransportError, WsByteStream};
use backhaul_proto::{TransportKind, PROTOCOL_NAME};
use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode, Version};
use http_body_util::Full;
use hyper::ext::Protocol;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

/// Outcome of matching an inbound request against the supported transports.
pub struct Negotiation {
    kind: TransportKind,
    on_upgrade: OnUpgrade,
    /// `Sec-WebSocket-Accept` value for an HTTP/1.1 WebSocket handshake.
    ws_accept: Option<String>,
}

impl Negotiation {
    /// Try to negotiate a transport for `req`.
    ///
    /// Returns `None` when no supported transport matches; the request is
    /// left otherwise untouched so the caller can reject it.
    pub fn negotiate<B>(req: &mut Request<B>) -> Option<Self> {
        let (kind, ws_accept) = match_websocket(req)
            .or_else(|| match_h2_connect(req).map(|k| (k, None)))
            .or_else(|| match_h1_upgrade(req).map(|k| (k, None)))?;

        let on_upgrade = hyper::upgrade::on(req);
        Some(Self {
            kind,
            on_upgrade,
            ws_accept,
        })
    }

    /// Which transport matched.
    pub fn transport(&self) -> TransportKind {
        self.kind
    }

    /// Handshake response to send back on the HTTP connection.
    pub fn response(&self) -> Response<Full<Bytes>> {
        let mut builder = Response::builder();
        match self.kind {
            TransportKind::Http11 => {
                builder = builder
                    .status(StatusCode::SWITCHING_PROTOCOLS)
                    .header(header::CONNECTION, "upgrade")
                    .header(header::UPGRADE, PROTOCOL_NAME);
            }
            TransportKind::Http2 => {
                builder = builder.status(StatusCode::OK);
            }
            TransportKind::WebSocketHttp11 => {
                builder = builder
                    .status(StatusCode::SWITCHING_PROTOCOLS)
                    .header(header::CONNECTION, "upgrade")
                    .header(header::UPGRADE, "websocket")
                    .header(header::SEC_WEBSOCKET_PROTOCOL, PROTOCOL_NAME);
                if let Some(accept) = &self.ws_accept {
                    builder = builder.header(header::SEC_WEBSOCKET_ACCEPT, accept.as_str());
                }
            }
            TransportKind::WebSocketHttp2 => {
                builder = builder
                    .status(StatusCode::OK)
                    .header(header::SEC_WEBSOCKET_PROTOCOL, PROTOCOL_NAME);
            }
        }
        builder
            .body(Full::new(Bytes::new()))
            .expect("static response parts are valid")
    }

    /// Wait for the upgrade to complete and return the duplex stream.
    ///
    /// WebSocket transports are wrapped so that binary message framing is
    /// invisible to the caller.
    pub async fn accept(self) -> Result<BoxedDuplex, TransportError> {
        let upgraded = self.on_upgrade.await?;
        let io = TokioIo::new(upgraded);
        if self.kind.is_websocket() {
            let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
            Ok(Box::new(WsByteStream::new(ws)))
        } else {
            Ok(Box::new(io))
        }
    }
}

fn header_token_match(value: &HeaderValue, token: &str) -> bool {
    value
        .to_str()
        .map(|v| v.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
        .unwrap_or(false)
}

fn has_backhaul_subprotocol<B>(req: &Request<B>) -> bool {
    req.headers()
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .any(|value| header_token_match(value, PROTOCOL_NAME))
}

/// WebSocket handshake with the backhaul subprotocol, either the classic
/// HTTP/1.1 GET handshake or RFC 8441 extended CONNECT.
fn match_websocket<B>(req: &Request<B>) -> Option<(TransportKind, Option<String>)> {
    // Extended CONNECT form: :method = CONNECT, :protocol = websocket.
    if req.method() == Method::CONNECT {
        let is_ws = req
            .extensions()
            .get::<Protocol>()
            .map(|p| p.as_str().eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        if is_ws && has_backhaul_subprotocol(req) {
            return Some((TransportKind::WebSocketHttp2, None));
        }
        return None;
    }

    // Classic handshake: GET + Connection: Upgrade + Upgrade: websocket.
    let headers = req.headers();
    let wants_websocket = headers
        .get(header::UPGRADE)
        .map(|v| header_token_match(v, "websocket"))
        .unwrap_or(false)
        && headers
            .get(header::CONNECTION)
            .map(|v| header_token_match(v, "upgrade"))
            .unwrap_or(false);

    if !wants_websocket || !has_backhaul_subprotocol(req) {
        return None;
    }

    let key = headers.get(header::SEC_WEBSOCKET_KEY)?;
    let accept = derive_accept_key(key.as_bytes());
    Some((TransportKind::WebSocketHttp11, Some(accept)))
}

/// HTTP/2 extended CONNECT with `:protocol = backhaul`.
fn match_h2_connect<B>(req: &Request<B>) -> Option<TransportKind> {
    if req.method() != Method::CONNECT {
        return None;
    }
    req.extensions()
        .get::<Protocol>()
        .filter(|p| p.as_str().eq_ignore_ascii_case(PROTOCOL_NAME))
        .map(|_| TransportKind::Http2)
}

/// HTTP/1.1 request carrying `Upgrade: backhaul`.
fn match_h1_upgrade<B>(req: &Request<B>) -> Option<TransportKind> {
    if req.version() != Version::HTTP_11 {
        return None;
    }
    req.headers()
        .get(header::UPGRADE)
        .filter(|v| header_token_match(v, PROTOCOL_NAME))
        .map(|_| TransportKind::Http11)
}
