//! Control plane for the backhaul broker
//!
//! Owns the long-lived side of the rendezvous protocol: per-client control
//! connections and their keep-alive loops, the registry of connected
//! clients, the pending-tunnel rendezvous map, and the bound data tunnels
//! with their lifecycle accounting.

pub mod client;
pub mod connection;
pub mod events;
pub mod factory;
pub mod registry;
pub mod tunnel;

pub use client::Client;
pub use connection::{ClientConnection, ConnectionConfig, KEEP_ALIVE_GRACE};
pub use events::{ClientEvent, ClientEvents};
pub use factory::{TunnelError, TunnelFactory};
pub use registry::ClientRegistry;
pub use tunnel::Tunnel;
