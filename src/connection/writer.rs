// src/connection/writer.rs

//! Defines `ClientWriter`, the shared, lock-guarded write half of a client
//! connection.
//!
//! Status lines from the command loop and data lines from stream readers or
//! message pumps all go through the same writer. The lock is held for one
//! complete message (a line plus its payload) so the peer never sees two
//! messages interleaved.

use crate::core::SamError;
use crate::core::protocol::{Reply, SamCodec};
use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::Encoder;

pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Clone)]
pub struct ClientWriter {
    inner: Arc<Mutex<Option<BoxedWrite>>>,
}

impl ClientWriter {
    pub fn new(io: BoxedWrite) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(io))),
        }
    }

    /// Writes one reply line.
    pub async fn send(&self, reply: Reply) -> Result<(), SamError> {
        self.send_with_payload(reply, &[]).await
    }

    /// Writes a reply line immediately followed by `payload`.
    pub async fn send_with_payload(&self, reply: Reply, payload: &[u8]) -> Result<(), SamError> {
        let mut buf = BytesMut::with_capacity(128 + payload.len());
        SamCodec.encode(reply, &mut buf)?;
        buf.extend_from_slice(payload);
        self.send_raw(&buf).await
    }

    /// Writes bytes with no framing at all.
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<(), SamError> {
        let mut guard = self.inner.lock().await;
        let io = guard.as_mut().ok_or_else(detached)?;
        io.write_all(bytes).await?;
        io.flush().await?;
        Ok(())
    }

    /// Detaches the underlying stream, leaving later writes to fail.
    pub async fn take(&self) -> Option<BoxedWrite> {
        self.inner.lock().await.take()
    }

    /// Shuts the stream down and detaches it.
    pub async fn close(&self) {
        if let Some(mut io) = self.take().await {
            let _ = io.shutdown().await;
        }
    }

    pub async fn is_attached(&self) -> bool {
        self.inner.lock().await.is_some()
    }
}

fn detached() -> SamError {
    SamError::Io(Arc::new(io::Error::new(
        io::ErrorKind::NotConnected,
        "client connection is closed",
    )))
}
