//! Client control connections
//!
//! One `ClientConnection` owns the duplex stream a client keeps open to the
//! broker. It runs the line-oriented keep-alive loop, signals tunnel tokens
//! to the client, and tracks how many data tunnels the client currently has
//! open. Writes from the keep-alive timer, the PONG reply path, and token
//! signaling all go through the serialized write handle, so lines never
//! interleave.

use backhaul_proto::{TunnelId, MAX_LINE_LENGTH, PING, PING_LINE, PONG, PONG_LINE};
use backhaul_transport::{split_serialized, BoxedDuplex, SerializedWriter};
use futures_util::StreamExt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::ReadHalf;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Extra slack past the keep-alive interval before a silent peer is
/// presumed dead.
pub const KEEP_ALIVE_GRACE: Duration = Duration::from_secs(10);

/// Tuning for a control connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Interval between broker-sent PING lines. `None` disables keep-alive,
    /// and with it the dead-peer read timeout.
    pub keep_alive_interval: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// The broker side of one client's control channel.
pub struct ClientConnection {
    client_id: String,
    writer: SerializedWriter,
    reader: Mutex<FramedRead<ReadHalf<BoxedDuplex>, LinesCodec>>,
    read_timeout: Option<Duration>,
    tunnels: AtomicUsize,
    shutdown: CancellationToken,
}

enum Next {
    Line(String),
    Eof,
    TimedOut,
    Failed(tokio_util::codec::LinesCodecError),
}

impl ClientConnection {
    /// Wrap an accepted control stream. Starts the keep-alive task when an
    /// interval is configured.
    pub fn new(client_id: String, stream: BoxedDuplex, config: &ConnectionConfig) -> Self {
        let (read_half, writer) = split_serialized(stream);
        let reader = Mutex::new(FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        ));
        let shutdown = CancellationToken::new();

        if let Some(interval) = config.keep_alive_interval.filter(|i| !i.is_zero()) {
            spawn_keep_alive(client_id.clone(), writer.clone(), shutdown.clone(), interval);
        }

        Self {
            read_timeout: config
                .keep_alive_interval
                .filter(|i| !i.is_zero())
                .map(|i| i + KEEP_ALIVE_GRACE),
            client_id,
            writer,
            reader,
            tunnels: AtomicUsize::new(0),
            shutdown,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Number of data tunnels this client currently has open.
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.load(Ordering::Acquire)
    }

    /// Returns the new count.
    pub fn increment_tunnel_count(&self) -> usize {
        self.tunnels.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the new count. Saturates at zero.
    pub fn decrement_tunnel_count(&self) -> usize {
        let previous = self
            .tunnels
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Tell the client to originate a data connection tagged with `id`.
    ///
    /// Fire-and-forget: matching the arriving connection to its requester
    /// is the rendezvous factory's job.
    pub async fn open_tunnel(&self, id: TunnelId) -> io::Result<()> {
        self.writer.write(format!("{id}\r\n").as_bytes()).await
    }

    /// Read and answer control lines until the peer goes away, a read times
    /// out, or the connection is closed. Always leaves the connection
    /// closed on return.
    pub async fn run(&self) {
        let mut reader = self.reader.lock().await;
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = Self::next_line(&mut reader, self.read_timeout) => next,
            };
            match next {
                Next::Line(line) => {
                    if !self.handle_line(&line).await {
                        break;
                    }
                }
                Next::Eof => {
                    debug!(client_id = %self.client_id, "control channel closed by peer");
                    break;
                }
                Next::TimedOut => {
                    warn!(
                        client_id = %self.client_id,
                        "no traffic within keep-alive window, presuming peer dead"
                    );
                    break;
                }
                Next::Failed(err) => {
                    debug!(client_id = %self.client_id, error = %err, "control channel read failed");
                    break;
                }
            }
        }
        drop(reader);
        self.close().await;
    }

    async fn next_line(
        reader: &mut FramedRead<ReadHalf<BoxedDuplex>, LinesCodec>,
        read_timeout: Option<Duration>,
    ) -> Next {
        let item = match read_timeout {
            Some(limit) => match tokio::time::timeout(limit, reader.next()).await {
                Ok(item) => item,
                Err(_) => return Next::TimedOut,
            },
            None => reader.next().await,
        };
        match item {
            Some(Ok(line)) => Next::Line(line),
            Some(Err(err)) => Next::Failed(err),
            None => Next::Eof,
        }
    }

    /// Returns false when the loop should stop.
    async fn handle_line(&self, line: &str) -> bool {
        match line {
            PING => {
                debug!(client_id = %self.client_id, "received PING");
                if self.writer.write(PONG_LINE).await.is_err() {
                    return false;
                }
            }
            PONG => {
                debug!(client_id = %self.client_id, "received PONG");
            }
            "" => {}
            other => {
                debug!(client_id = %self.client_id, line = other, "unrecognized control line");
            }
        }
        true
    }

    /// Tear the connection down. Idempotent and safe to call concurrently
    /// from the read loop, a superseding registration, or an error path.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.writer.shutdown().await;
    }

    /// Whether `close` has been requested.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

fn spawn_keep_alive(
    client_id: String,
    writer: SerializedWriter,
    shutdown: CancellationToken,
    interval: Duration,
) {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if writer.write(PING_LINE).await.is_err() {
                        // Peer presumed dead; the read loop will reap it.
                        break;
                    }
                    debug!(client_id = %client_id, "sent PING");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    fn connection(
        config: &ConnectionConfig,
    ) -> (Arc<ClientConnection>, DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        let conn = Arc::new(ClientConnection::new(
            "alice".to_string(),
            Box::new(near),
            config,
        ));
        (conn, far)
    }

    fn no_keep_alive() -> ConnectionConfig {
        ConnectionConfig {
            keep_alive_interval: None,
        }
    }

    #[tokio::test]
    async fn replies_pong_to_ping() {
        let (conn, far) = connection(&no_keep_alive());
        let runner = tokio::spawn({
            let conn = conn.clone();
            async move { conn.run().await }
        });

        let (read, mut write) = tokio::io::split(far);
        write.write_all(b"PING\r\n").await.unwrap();

        let mut lines = BufReader::new(read).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "PONG");

        conn.close().await;
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_lines_keep_the_loop_alive() {
        let (conn, far) = connection(&no_keep_alive());
        let runner = tokio::spawn({
            let conn = conn.clone();
            async move { conn.run().await }
        });

        let (read, mut write) = tokio::io::split(far);
        write.write_all(b"definitely-not-a-command\r\n").await.unwrap();
        write.write_all(b"PING\r\n").await.unwrap();

        let mut lines = BufReader::new(read).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "PONG");

        conn.close().await;
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn eof_ends_the_loop() {
        let (conn, far) = connection(&no_keep_alive());
        drop(far);
        conn.run().await;
        assert!(conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_sends_ping_lines() {
        let config = ConnectionConfig {
            keep_alive_interval: Some(Duration::from_secs(5)),
        };
        let (conn, far) = connection(&config);

        let (read, _write) = tokio::io::split(far);
        let mut lines = BufReader::new(read).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "PING");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "PING");

        conn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_reaped_after_grace() {
        let config = ConnectionConfig {
            keep_alive_interval: Some(Duration::from_secs(5)),
        };
        let (conn, far) = connection(&config);
        // Keep `far` open so no EOF is seen; the timeout has to fire.
        let run = conn.run();
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => {}
            _ = tokio::time::sleep(Duration::from_secs(60)) => panic!("read loop never timed out"),
        }
        assert!(conn.is_closed());
        drop(far);
    }

    #[tokio::test(start_paused = true)]
    async fn answering_pings_keeps_the_connection_alive() {
        let config = ConnectionConfig {
            keep_alive_interval: Some(Duration::from_secs(5)),
        };
        let (conn, far) = connection(&config);
        let runner = tokio::spawn({
            let conn = conn.clone();
            async move { conn.run().await }
        });

        let (read, mut write) = tokio::io::split(far);
        let mut lines = BufReader::new(read).lines();
        // Bounce a few PINGs back; the loop must survive well past the
        // interval + grace window.
        for _ in 0..6 {
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "PING");
            write.write_all(b"PONG\r\n").await.unwrap();
        }
        assert!(!conn.is_closed());

        conn.close().await;
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn open_tunnel_writes_the_token_line() {
        let (conn, far) = connection(&no_keep_alive());
        let id = TunnelId::random();
        conn.open_tunnel(id).await.unwrap();

        let (read, _write) = tokio::io::split(far);
        let mut lines = BufReader::new(read).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), id.to_string());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (conn, _far) = connection(&no_keep_alive());
        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
        assert!(conn.open_tunnel(TunnelId::random()).await.is_err());
    }

    #[tokio::test]
    async fn tunnel_counter_never_goes_negative() {
        let (conn, _far) = connection(&no_keep_alive());
        assert_eq!(conn.increment_tunnel_count(), 1);
        assert_eq!(conn.increment_tunnel_count(), 2);
        assert_eq!(conn.decrement_tunnel_count(), 1);
        assert_eq!(conn.decrement_tunnel_count(), 0);
        assert_eq!(conn.decrement_tunnel_count(), 0);
        assert_eq!(conn.tunnel_count(), 0);
    }
}
