// src/core/sessions/stream/worker.rs

//! The reader and sender workers behind one framed (protocol 1 and 2) stream.

use super::{StreamSession, STREAM_BUFFER_CEILING};
use crate::core::SamError;
use crate::core::protocol::Reply;
use crate::transport::SocketIo;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

/// Upper bound on one `STREAM RECEIVED` block.
const READ_CHUNK: usize = 32 * 1024;

/// One `STREAM SEND` payload queued for the transport.
pub(super) struct Chunk {
    pub data: Bytes,
    /// Present when the command loop waits for the write to finish.
    pub ack: Option<oneshot::Sender<Result<(), SamError>>>,
}

/// Which worker ended a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Worker {
    Reader,
    Sender,
}

/// Why a stream ended, as far as the client is told.
pub(super) enum StreamEnd {
    /// The peer closed its side.
    Closed,
    /// The transport socket failed.
    Failed(String),
    /// The client connection is gone; there is nobody to notify.
    ClientGone,
}

/// Drains queued chunks to the transport socket in order, then shuts the
/// socket's write side down once the queue is closed.
///
/// Under credit flow control, a `STREAM READY_TO_SEND` notice goes out each
/// time the queued byte count drops from at or above the ceiling to below it.
pub(super) async fn run_sender(
    session: Arc<StreamSession>,
    id: i64,
    mut chunks: mpsc::UnboundedReceiver<Chunk>,
    mut io: WriteHalf<Box<dyn SocketIo>>,
    queued: Arc<AtomicUsize>,
) {
    while let Some(chunk) = chunks.recv().await {
        let len = chunk.data.len();
        let written = match io.write_all(&chunk.data).await {
            Ok(()) => io.flush().await,
            Err(e) => Err(e),
        };
        let before = queued.fetch_sub(len, Ordering::AcqRel);
        let after = before.saturating_sub(len);

        match written {
            Ok(()) => {
                if let Some(ack) = chunk.ack {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(e) => {
                let message = e.to_string();
                if let Some(ack) = chunk.ack {
                    let _ = ack.send(Err(SamError::from(e)));
                }
                session
                    .finish_stream(id, Worker::Sender, StreamEnd::Failed(message))
                    .await;
                return;
            }
        }

        // A stream closed by the client is still drained, but gets no notices.
        let crossed = before >= STREAM_BUFFER_CEILING && after < STREAM_BUFFER_CEILING;
        if session.notifies_credit() && crossed && session.open_handle(id, |_| ()).is_ok() {
            let notice = Reply::new("STREAM READY_TO_SEND").field("ID", id);
            if session.owner_writer().send(notice).await.is_err() {
                return;
            }
        }
    }
    let _ = io.shutdown().await;
    debug!("Sender for stream {id} stopped: queue closed.");
}

/// Forwards transport bytes to the client as `STREAM RECEIVED` blocks,
/// honouring the byte quota set through `STREAM RECEIVE`.
pub(super) async fn run_reader(
    session: Arc<StreamSession>,
    id: i64,
    mut io: ReadHalf<Box<dyn SocketIo>>,
    mut quota: watch::Receiver<Option<u64>>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut delivered: u64 = 0;

    let end = loop {
        let Some(allowed) = wait_for_quota(&mut quota, delivered).await else {
            // The stream entry was dropped; whoever dropped it reported the close.
            return;
        };
        // A new limit applies to the read already waiting.
        let read = tokio::select! {
            read = io.read(&mut buf[..allowed]) => read,
            changed = quota.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
        };
        let n = match read {
            Ok(0) => break StreamEnd::Closed,
            Ok(n) => n,
            Err(e) => break StreamEnd::Failed(e.to_string()),
        };
        delivered += n as u64;

        let header = Reply::new("STREAM RECEIVED").field("ID", id).field("SIZE", n);
        if session
            .owner_writer()
            .send_with_payload(header, &buf[..n])
            .await
            .is_err()
        {
            break StreamEnd::ClientGone;
        }
    };
    session.finish_stream(id, Worker::Reader, end).await;
}

/// Returns how many bytes may be read next, waiting while the quota is spent.
/// `None` once the quota channel is closed.
async fn wait_for_quota(quota: &mut watch::Receiver<Option<u64>>, delivered: u64) -> Option<usize> {
    loop {
        let limit = *quota.borrow_and_update();
        match limit {
            None => return Some(READ_CHUNK),
            Some(limit) if limit > delivered => {
                let left = usize::try_from(limit - delivered).unwrap_or(usize::MAX);
                return Some(left.min(READ_CHUNK));
            }
            Some(_) => {
                if quota.changed().await.is_err() {
                    return None;
                }
            }
        }
    }
}
