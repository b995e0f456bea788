//! Bidirectional splice
//!
//! Copies bytes both ways between the forwarding caller's stream and a
//! bound tunnel. The pairing is over as soon as either direction finishes,
//! cleanly or not; dropping both halves then closes both underlying
//! streams, which unblocks whatever the other direction was waiting on.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

pub async fn splice<A, B>(caller: A, tunnel: B)
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut caller_read, mut caller_write) = tokio::io::split(caller);
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel);

    tokio::select! {
        result = tokio::io::copy(&mut caller_read, &mut tunnel_write) => {
            match result {
                Ok(bytes) => debug!(bytes, "caller-to-tunnel copy finished"),
                Err(err) => debug!(error = %err, "caller-to-tunnel copy failed"),
            }
        }
        result = tokio::io::copy(&mut tunnel_read, &mut caller_write) => {
            match result {
                Ok(bytes) => debug!(bytes, "tunnel-to-caller copy finished"),
                Err(err) => debug!(error = %err, "tunnel-to-caller copy failed"),
            }
        }
    }
}
