//! Rendezvous integration tests
//!
//! Drives the control plane end to end over in-memory duplex streams: a
//! "client" task answers token lines by presenting the matching data
//! connection, exactly as a real client would over the network.

use backhaul_control::{
    ClientConnection, ConnectionConfig, Tunnel, TunnelError, TunnelFactory,
};
use backhaul_proto::{TransportKind, TunnelId};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio_util::sync::CancellationToken;

fn no_keep_alive() -> ConnectionConfig {
    ConnectionConfig {
        keep_alive_interval: None,
    }
}

fn control_pair() -> (Arc<ClientConnection>, DuplexStream) {
    let (near, far) = tokio::io::duplex(4096);
    let connection = Arc::new(ClientConnection::new(
        "alice".to_string(),
        Box::new(near),
        &no_keep_alive(),
    ));
    (connection, far)
}

#[tokio::test]
async fn full_rendezvous_binds_and_splices() {
    let factory = Arc::new(TunnelFactory::new());
    let (connection, control_far) = control_pair();

    // The "client": waits for a token line, then presents the data
    // connection tagged with that token.
    let client = tokio::spawn({
        let factory = factory.clone();
        async move {
            let mut lines = BufReader::new(control_far).lines();
            let token: TunnelId = lines
                .next_line()
                .await
                .unwrap()
                .unwrap()
                .parse()
                .expect("broker sent a canonical token line");

            let (near, far) = tokio::io::duplex(4096);
            let tunnel = Tunnel::new(token, TransportKind::Http11, Box::new(near));
            assert!(factory.resolve(tunnel).is_ok(), "token was pending");
            far
        }
    });

    let cancel = CancellationToken::new();
    let mut tunnel = factory
        .create_tunnel(&connection, Duration::from_secs(5), &cancel)
        .await
        .expect("rendezvous completes");

    let mut client_side = client.await.unwrap();

    // Counter reflects the bound tunnel, pending map is clean.
    assert_eq!(connection.tunnel_count(), 1);
    assert_eq!(factory.pending_count(), 0);
    assert!(!factory.contains(tunnel.id()));

    // Caller bytes reach the client side, client bytes come back.
    tunnel.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    client_side.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    client_side.write_all(b"world").await.unwrap();
    tunnel.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");

    // Closing the tunnel releases the counter exactly once.
    drop(tunnel);
    assert_eq!(connection.tunnel_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn rendezvous_timeout_leaves_no_pending_token() {
    let factory = Arc::new(TunnelFactory::new());
    let (connection, control_far) = control_pair();

    let cancel = CancellationToken::new();
    let err = factory
        .create_tunnel(&connection, Duration::from_secs(60), &cancel)
        .await
        .unwrap_err();
    let token = match err {
        TunnelError::RendezvousTimeout(token) => token,
        other => panic!("expected timeout, got {other:?}"),
    };

    assert_eq!(factory.pending_count(), 0);
    assert!(!factory.contains(token));
    assert_eq!(connection.tunnel_count(), 0);

    // A data connection arriving with the expired token is turned away and
    // never increments any counter.
    let (near, _far) = tokio::io::duplex(64);
    let late = Tunnel::new(token, TransportKind::Http11, Box::new(near));
    let orphan = factory.resolve(late).unwrap_err();
    drop(orphan);
    assert_eq!(connection.tunnel_count(), 0);

    drop(control_far);
}

#[tokio::test]
async fn cancellation_aborts_the_wait() {
    let factory = Arc::new(TunnelFactory::new());
    let (connection, _control_far) = control_pair();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = factory
        .create_tunnel(&connection, Duration::from_secs(60), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::Cancelled));
    assert_eq!(factory.pending_count(), 0);
}

#[tokio::test]
async fn unknown_token_arrival_is_disposed() {
    let factory = TunnelFactory::new();
    let (near, _far) = tokio::io::duplex(64);
    let stray = Tunnel::new(TunnelId::random(), TransportKind::WebSocketHttp11, Box::new(near));
    let closed = stray.closed_token();

    let orphan = factory.resolve(stray).unwrap_err();
    drop(orphan);
    assert!(closed.is_cancelled());
}

#[tokio::test]
async fn dropped_requester_cleans_up_its_entry() {
    let factory = Arc::new(TunnelFactory::new());
    let (connection, _control_far) = control_pair();

    let request = tokio::spawn({
        let factory = factory.clone();
        let connection = connection.clone();
        async move {
            let cancel = CancellationToken::new();
            let _ = factory
                .create_tunnel(&connection, Duration::from_secs(3600), &cancel)
                .await;
        }
    });

    // Let the request park its pending entry, then kill the caller the way
    // a disconnecting forwarder would.
    while factory.pending_count() == 0 {
        tokio::task::yield_now().await;
    }
    request.abort();
    let _ = request.await;

    assert_eq!(factory.pending_count(), 0);
}

#[tokio::test]
async fn signal_failure_surfaces_and_cleans_up() {
    let factory = TunnelFactory::new();
    let (connection, control_far) = control_pair();

    // Close the control stream first; signaling the client must fail.
    connection.close().await;
    drop(control_far);

    let cancel = CancellationToken::new();
    let err = factory
        .create_tunnel(&connection, Duration::from_secs(5), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::Signal(_)));
    assert_eq!(factory.pending_count(), 0);
    assert_eq!(connection.tunnel_count(), 0);
}
