//! Client connect/disconnect event feed
//!
//! The registry announces every successful add and remove on this feed so a
//! persistence layer can record connection history without ever sitting on
//! the tunnel path. The feed is unbounded and best-effort: with no
//! subscriber configured, publishing is a no-op, and a subscriber that goes
//! away just means further events are dropped.

use crate::client::Client;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One registry state change.
#[derive(Clone)]
pub struct ClientEvent {
    pub client: Arc<Client>,
    /// True for a registration, false for a removal.
    pub connected: bool,
}

/// Publisher half of the event feed.
#[derive(Clone, Default)]
pub struct ClientEvents {
    tx: Option<mpsc::UnboundedSender<ClientEvent>>,
}

impl ClientEvents {
    /// Feed with no subscriber; every publish is dropped cheaply.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Feed with a single subscriber.
    pub fn subscribed() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Publish without blocking, whatever the subscriber is doing.
    pub fn publish(&self, client: &Arc<Client>, connected: bool) {
        let Some(tx) = &self.tx else {
            return;
        };
        let _ = tx.send(ClientEvent {
            client: client.clone(),
            connected,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ClientConnection, ConnectionConfig};
    use backhaul_proto::TransportKind;

    fn test_client(id: &str) -> Arc<Client> {
        let (near, _far) = tokio::io::duplex(64);
        let connection = Arc::new(ClientConnection::new(
            id.to_string(),
            Box::new(near),
            &ConnectionConfig {
                keep_alive_interval: None,
            },
        ));
        Arc::new(Client::new(connection, TransportKind::Http11, None))
    }

    #[tokio::test]
    async fn subscriber_sees_events_in_order() {
        let (events, mut rx) = ClientEvents::subscribed();
        let client = test_client("alice");

        events.publish(&client, true);
        events.publish(&client, false);

        let first = rx.recv().await.unwrap();
        assert!(first.connected);
        assert_eq!(first.client.id(), "alice");
        let second = rx.recv().await.unwrap();
        assert!(!second.connected);
    }

    #[tokio::test]
    async fn disabled_feed_drops_events() {
        let events = ClientEvents::disabled();
        events.publish(&test_client("alice"), true);
    }

    #[tokio::test]
    async fn dropped_subscriber_never_blocks_publishing() {
        let (events, rx) = ClientEvents::subscribed();
        drop(rx);
        events.publish(&test_client("alice"), true);
    }
}
