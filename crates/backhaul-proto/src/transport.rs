//! Transport tags
//!
//! Every negotiated duplex stream is tagged with the transport that produced
//! it. The tag is diagnostic only: once a stream is accepted, the broker
//! treats all transports identically.

use serde::Serialize;
use std::fmt;

/// Which of the supported upgrade transports produced a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportKind {
    /// HTTP/1.1 `Upgrade: backhaul`.
    Http11,
    /// HTTP/2 extended CONNECT with `:protocol = backhaul`.
    Http2,
    /// WebSocket handshake over HTTP/1.1 with the backhaul subprotocol.
    WebSocketHttp11,
    /// WebSocket over HTTP/2 extended CONNECT with the backhaul subprotocol.
    WebSocketHttp2,
}

impl TransportKind {
    /// Whether the stream needs WebSocket message framing underneath.
    pub fn is_websocket(&self) -> bool {
        matches!(self, Self::WebSocketHttp11 | Self::WebSocketHttp2)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Http11 => "http/1.1",
            Self::Http2 => "http/2",
            Self::WebSocketHttp11 => "websocket+http/1.1",
            Self::WebSocketHttp2 => "websocket+http/2",
        };
        f.write_str(name)
    }
}
