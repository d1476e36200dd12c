// src/core/sessions/stream/splice.rs

//! Direct byte forwarding between a client socket and a transport socket.
//!
//! Once spliced, the client connection no longer speaks the line protocol:
//! two pipe tasks copy bytes in each direction until both sides are done.

use crate::connection::BoxedWrite;
use crate::core::lifecycle::LifecycleGroup;
use crate::core::metrics;
use crate::transport::TransportSocket;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// A client connection taken out of the command loop.
pub struct ClientIo {
    pub reader: BoxedRead,
    /// Bytes the line decoder had already read past the last command.
    pub buffered: BytesMut,
    pub writer: BoxedWrite,
}

impl ClientIo {
    pub fn new(reader: BoxedRead, buffered: BytesMut, writer: BoxedWrite) -> Self {
        Self {
            reader,
            buffered,
            writer,
        }
    }
}

/// Lives until both pipes of one splice have finished.
struct SpliceHold<H> {
    _held: H,
}

impl<H> SpliceHold<H> {
    fn new(held: H) -> Self {
        metrics::OPEN_STREAMS.inc();
        Self { _held: held }
    }
}

impl<H> Drop for SpliceHold<H> {
    fn drop(&mut self) {
        metrics::OPEN_STREAMS.dec();
    }
}

/// Starts the two pipe tasks in `group`. `held` is dropped once both finish.
/// Returns `false` if the group was already closed.
pub fn splice<H>(group: &LifecycleGroup, client: ClientIo, socket: TransportSocket, held: H) -> bool
where
    H: Send + Sync + 'static,
{
    let hold = Arc::new(SpliceHold::new(held));
    let (transport_read, transport_write) = tokio::io::split(socket.io);
    let ClientIo {
        reader,
        buffered,
        writer,
    } = client;
    let peer = socket.peer;

    let outbound_hold = hold.clone();
    let outbound = group.spawn(async move {
        let _hold = outbound_hold;
        pipe(reader, transport_write, buffered).await;
    });
    let Some(outbound) = outbound else {
        return false;
    };

    let inbound = group.spawn(async move {
        let _hold = hold;
        pipe(transport_read, writer, BytesMut::new()).await;
        debug!(
            "Splice with {} finished.",
            peer.get(..12).unwrap_or(&peer)
        );
    });
    if inbound.is_none() {
        outbound.abort();
        return false;
    }
    true
}

/// Copies `reader` into `writer`, starting with `pending`, then shuts the
/// writer down.
async fn pipe<R, W>(mut reader: R, mut writer: W, pending: BytesMut)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !pending.is_empty() && writer.write_all(&pending).await.is_err() {
        return;
    }
    if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
        debug!("Splice pipe ended with error: {e}");
    }
    let _ = writer.shutdown().await;
}
