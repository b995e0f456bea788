//! Serialized-write stream decorator
//!
//! A control channel has several logical writers: the keep-alive timer, the
//! PONG reply path, and tunnel-token signaling. Each `write` here holds a
//! one-slot lock for the whole write-then-flush, so lines never interleave
//! on the wire. Shutdown closes the write side exactly once, from whichever
//! teardown path gets there first.

use crate::BoxedDuplex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// Cloneable, mutually exclusive write handle over a duplex stream.
#[derive(Clone)]
pub struct SerializedWriter {
    inner: Arc<Mutex<WriteHalf<BoxedDuplex>>>,
    closed: Arc<AtomicBool>,
}

/// Split a duplex stream into its read half and a serialized write handle.
pub fn split_serialized(stream: BoxedDuplex) -> (ReadHalf<BoxedDuplex>, SerializedWriter) {
    let (reader, writer) = tokio::io::split(stream);
    (
        reader,
        SerializedWriter {
            inner: Arc::new(Mutex::new(writer)),
            closed: Arc::new(AtomicBool::new(false)),
        },
    )
}

impl SerializedWriter {
    /// Write `bytes` as one unit and flush before releasing the lock.
    pub async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream already shut down",
            ));
        }
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Close the write side. Idempotent; later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.inner.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Whether the write side has been shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn concurrent_writers_do_not_interleave() {
        let (near, far) = tokio::io::duplex(4096);
        let (_reader, writer) = split_serialized(Box::new(near));

        let mut tasks = Vec::new();
        for i in 0..16 {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                let line = format!("writer-{i}-payload-{i}\r\n");
                writer.write(line.as_bytes()).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        writer.shutdown().await;

        let mut lines = BufReader::new(far).lines();
        let mut seen = 0;
        while let Some(line) = lines.next_line().await.unwrap() {
            let i: usize = line
                .strip_prefix("writer-")
                .and_then(|rest| rest.split('-').next())
                .and_then(|n| n.parse().ok())
                .expect("line arrived intact");
            assert_eq!(line, format!("writer-{i}-payload-{i}"));
            seen += 1;
        }
        assert_eq!(seen, 16);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_fails_later_writes() {
        let (near, _far) = tokio::io::duplex(64);
        let (_reader, writer) = split_serialized(Box::new(near));

        writer.shutdown().await;
        writer.shutdown().await;
        assert!(writer.is_closed());

        let err = writer.write(b"late\r\n").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
