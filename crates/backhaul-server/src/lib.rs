//! Backhaul broker host
//!
//! Binds one listening socket and serves all three inbound paths over it:
//! control-plane registrations (`/server?clientId=…`), data-plane tunnel
//! arrivals (`/server?tunnelId=…`), and forwarding callers
//! (`/client?clientId=…`). HTTP/1.1 upgrades, WebSocket handshakes, and
//! HTTP/2 extended CONNECT all work on the same port.

pub mod dispatch;
pub mod server;
pub mod splice;

pub use server::{BrokerConfig, BrokerError, BrokerServer};
pub use splice::splice;
