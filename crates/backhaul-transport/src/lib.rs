//! Transport negotiation and stream plumbing for the backhaul broker
//!
//! Three upgrade transports can carry a tunnel: HTTP/2 extended CONNECT,
//! a WebSocket handshake with the backhaul subprotocol, and a plain
//! HTTP/1.1 `Upgrade`. Negotiation picks one and yields a single
//! capability — a boxed duplex byte stream — so everything downstream is
//! transport-agnostic.

pub mod negotiate;
pub mod serialized;
pub mod websocket;

pub use negotiate::Negotiation;
pub use serialized::{split_serialized, SerializedWriter};
pub use websocket::WsByteStream;

use tokio::io::{AsyncRead, AsyncWrite};

/// A duplex byte stream, whatever transport produced it.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// Owned duplex stream handed out by transport negotiation.
pub type BoxedDuplex = Box<dyn Duplex>;

/// Errors accepting a negotiated stream.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection upgrade failed: {0}")]
    Upgrade(#[from] hyper::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
