//! Backhaul protocol definitions
//!
//! This crate defines the protocol vocabulary shared by the broker and its
//! clients: the upgrade protocol name, the control-channel keep-alive lines,
//! tunnel tokens, and the transport tag attached to negotiated streams.

pub mod token;
pub mod transport;

pub use token::{TokenParseError, TunnelId};
pub use transport::TransportKind;

/// Protocol name used during transport negotiation.
///
/// Appears as the WebSocket subprotocol, the `:protocol` pseudo-header of an
/// HTTP/2 extended CONNECT, or the HTTP/1.1 `Upgrade` token.
pub const PROTOCOL_NAME: &str = "backhaul";

/// Keep-alive probe line payload.
pub const PING: &str = "PING";

/// Keep-alive reply line payload.
pub const PONG: &str = "PONG";

/// Wire form of a keep-alive probe.
pub const PING_LINE: &[u8] = b"PING\r\n";

/// Wire form of a keep-alive reply.
pub const PONG_LINE: &[u8] = b"PONG\r\n";

/// Upper bound on a single control-channel line.
///
/// Real lines are a token (36 chars) or a 4-char keep-alive word; anything
/// longer is a misbehaving peer.
pub const MAX_LINE_LENGTH: usize = 1024;
