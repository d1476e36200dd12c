// src/core/sessions/stream/mod.rs

//! Stream sessions: many connection-oriented sockets multiplexed under one
//! transport identity.
//!
//! Protocol 1 and 2 clients address streams by integer id and exchange data as
//! framed `STREAM SEND`/`STREAM RECEIVED` blocks on the command connection;
//! each open stream gets a reader and a sender worker. Protocol 3 clients open
//! a fresh connection per stream, which is spliced byte-for-byte onto the
//! transport socket.

mod splice;
mod worker;

pub use splice::{BoxedRead, ClientIo, splice};

use super::Owner;
use crate::connection::{BoxedWrite, ClientWriter};
use crate::core::lifecycle::LifecycleGroup;
use crate::core::protocol::{Capabilities, Reply, SendPolicy};
use crate::core::{metrics, ResultCode, SamError};
use crate::transport::{ConnectOptions, TransportSession, TransportSocket};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{OwnedMutexGuard, mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use worker::{Chunk, StreamEnd, Worker};

/// Queued-but-unsent bytes at which credit flow control reports `BUFFER_FULL`.
pub const STREAM_BUFFER_CEILING: usize = 32768;
/// Largest `STREAM SEND` payload.
pub const MAX_SEND_SIZE: usize = 32768;
/// Inbound sockets waiting for an accept.
const INBOUND_BACKLOG: usize = 16;
/// Bytes buffered from a protocol 3 client still waiting for its peer.
const MAX_EARLY_BYTES: usize = 64 * 1024;

pub type InboundSockets = mpsc::Receiver<TransportSocket>;

/// Exclusive right to take inbound sockets off a session. At most one
/// `STREAM ACCEPT` or `STREAM FORWARD` holds it at a time.
pub type AcceptTicket = OwnedMutexGuard<InboundSockets>;

/// Which way a protocol 1 or 2 stream session may open streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Direction {
    #[default]
    Both,
    /// Outbound only.
    Create,
    /// Inbound only.
    Receive,
}

impl Direction {
    pub fn can_connect(&self) -> bool {
        *self != Direction::Receive
    }

    pub fn can_accept(&self) -> bool {
        *self != Direction::Create
    }
}

/// Outcome of a credit-controlled `STREAM SEND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued. `buffer_full` tells the client to hold off until `READY_TO_SEND`.
    Queued { buffer_full: bool },
    /// Not queued because the buffer was already full.
    Rejected,
}

/// The queue is unbounded; admission goes by the `queued` byte count alone.
struct StreamHandle {
    chunks: mpsc::UnboundedSender<Chunk>,
    queued: Arc<AtomicUsize>,
    quota: watch::Sender<Option<u64>>,
    reader: AbortHandle,
    sender: AbortHandle,
}

impl StreamHandle {
    fn abort(&self, keep: Option<Worker>) {
        if keep != Some(Worker::Reader) {
            self.reader.abort();
        }
        if keep != Some(Worker::Sender) {
            self.sender.abort();
        }
    }
}

enum StreamSlot {
    /// A connect for this id is in flight.
    Pending,
    Open(StreamHandle),
}

pub struct StreamSessionConfig {
    pub nickname: String,
    pub caps: Capabilities,
    pub direction: Direction,
    pub connect_timeout: Duration,
}

pub struct StreamSession {
    nickname: String,
    caps: Capabilities,
    direction: Direction,
    connect_timeout: Duration,
    transport: Arc<dyn TransportSession>,
    owns_transport: bool,
    owner: Owner,
    group: Arc<LifecycleGroup>,
    inbound: Arc<tokio::sync::Mutex<InboundSockets>>,
    streams: Mutex<HashMap<i64, StreamSlot>>,
    next_inbound_id: AtomicI64,
}

/// A channel carrying inbound sockets to a stream session.
pub fn inbound_channel() -> (mpsc::Sender<TransportSocket>, InboundSockets) {
    mpsc::channel(INBOUND_BACKLOG)
}

impl StreamSession {
    pub fn new(
        config: StreamSessionConfig,
        transport: Arc<dyn TransportSession>,
        owns_transport: bool,
        owner: Owner,
        group: Arc<LifecycleGroup>,
        inbound: InboundSockets,
    ) -> Arc<Self> {
        Arc::new(Self {
            nickname: config.nickname,
            caps: config.caps,
            direction: config.direction,
            connect_timeout: config.connect_timeout,
            transport,
            owns_transport,
            owner,
            group,
            inbound: Arc::new(tokio::sync::Mutex::new(inbound)),
            streams: Mutex::new(HashMap::new()),
            next_inbound_id: AtomicI64::new(-1),
        })
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn destination(&self) -> &str {
        self.transport.destination()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub(super) fn owner_writer(&self) -> &ClientWriter {
        &self.owner.writer
    }

    fn notifies_credit(&self) -> bool {
        self.caps.send_policy == SendPolicy::Credit
    }

    /// Starts the session's background workers. A session that owns its
    /// transport binding pumps inbound sockets into `inbound_tx`; protocol 1
    /// and 2 sessions also auto-accept them.
    pub fn start(self: &Arc<Self>, inbound_tx: Option<mpsc::Sender<TransportSocket>>) {
        if let Some(tx) = inbound_tx {
            let session = self.clone();
            self.group.spawn(async move {
                loop {
                    match session.transport.accept().await {
                        Some(socket) => {
                            if tx.send(socket).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            session.owner.transport_lost(&session.nickname).await;
                            break;
                        }
                    }
                }
            });
        }

        if self.caps.auto_accept {
            let session = self.clone();
            let inbound = self.inbound.clone();
            self.group.spawn(async move {
                let mut sockets = inbound.lock_owned().await;
                while let Some(socket) = sockets.recv().await {
                    if !session.direction.can_accept() {
                        debug!(
                            "Session '{}' is outbound only; refusing inbound stream.",
                            session.nickname
                        );
                        continue;
                    }
                    session.auto_accept(socket).await;
                }
            });
        }
    }

    /// Announces an inbound stream with a fresh negative id and opens it.
    async fn auto_accept(self: &Arc<Self>, socket: TransportSocket) {
        let id = self.next_inbound_id.fetch_sub(1, Ordering::Relaxed);
        let notice = Reply::new("STREAM CONNECTED")
            .field("DESTINATION", &socket.peer)
            .field("ID", id);
        if self.owner.writer.send(notice).await.is_err() {
            return;
        }
        if let Err(e) = self.open(id, socket, false) {
            warn!("Session '{}': could not open inbound stream {id}: {e}", self.nickname);
        }
    }

    /// Opens an outbound socket under the session's connect timeout.
    pub async fn connect_socket(
        &self,
        destination: &str,
        mut options: ConnectOptions,
    ) -> Result<TransportSocket, SamError> {
        let timeout = options.timeout.unwrap_or(self.connect_timeout);
        options.timeout = Some(timeout);
        match tokio::time::timeout(timeout, self.transport.connect(destination, options)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SamError::Timeout),
        }
    }

    // --- Framed streams (protocol 1 and 2) ---

    /// Claims `id` for an outbound stream.
    pub fn reserve(&self, id: i64) -> Result<(), SamError> {
        if !self.direction.can_connect() {
            return Err(SamError::InvalidDirection);
        }
        let mut streams = self.streams.lock();
        if streams.contains_key(&id) {
            return Err(SamError::InvalidId(format!("{id} is already in use")));
        }
        streams.insert(id, StreamSlot::Pending);
        Ok(())
    }

    /// Connects the reserved `id` to `destination` and opens the stream.
    pub async fn connect(
        self: &Arc<Self>,
        id: i64,
        destination: &str,
        options: ConnectOptions,
    ) -> Result<(), SamError> {
        match self.connect_socket(destination, options).await {
            Ok(socket) => self.open(id, socket, true),
            Err(e) => {
                let mut streams = self.streams.lock();
                if matches!(streams.get(&id), Some(StreamSlot::Pending)) {
                    streams.remove(&id);
                }
                Err(e)
            }
        }
    }

    /// Runs `connect` in a worker and reports the outcome as a `STREAM STATUS` line.
    pub fn spawn_connect(self: &Arc<Self>, id: i64, destination: String, options: ConnectOptions) {
        let session = self.clone();
        self.group.spawn(async move {
            let reply = match session.connect(id, &destination, options).await {
                Ok(()) => Reply::new("STREAM STATUS")
                    .result(ResultCode::Ok)
                    .field("ID", id),
                Err(e) => Reply::error("STREAM STATUS", &e).field("ID", id),
            };
            let _ = session.owner.writer.send(reply).await;
        });
    }

    /// Installs the workers for `socket` under `id`. With `expect_pending`
    /// the id must still be reserved; a stream closed while connecting is dropped.
    fn open(self: &Arc<Self>, id: i64, socket: TransportSocket, expect_pending: bool) -> Result<(), SamError> {
        let (read_half, write_half) = tokio::io::split(socket.io);
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (quota_tx, quota_rx) = watch::channel(None);
        let queued = Arc::new(AtomicUsize::new(0));

        // The map stays locked until the entry is in place, so a worker that
        // ends at once still finds it.
        let mut streams = self.streams.lock();
        match streams.get(&id) {
            Some(StreamSlot::Pending) if expect_pending => {}
            None if !expect_pending => {}
            _ => return Err(SamError::InvalidId(format!("{id} was closed while connecting"))),
        }

        let reader = self
            .group
            .spawn(worker::run_reader(self.clone(), id, read_half, quota_rx));
        let sender = self.group.spawn(worker::run_sender(
            self.clone(),
            id,
            chunk_rx,
            write_half,
            queued.clone(),
        ));
        let (Some(reader), Some(sender)) = (reader.clone(), sender.clone()) else {
            streams.remove(&id);
            for handle in [reader, sender].into_iter().flatten() {
                handle.abort();
            }
            return Err(SamError::InvalidState("session is closing".to_string()));
        };

        streams.insert(
            id,
            StreamSlot::Open(StreamHandle {
                chunks: chunk_tx,
                queued,
                quota: quota_tx,
                reader,
                sender,
            }),
        );
        metrics::OPEN_STREAMS.inc();
        debug!("Session '{}': stream {id} open.", self.nickname);
        Ok(())
    }

    fn open_handle<T>(&self, id: i64, f: impl FnOnce(&StreamHandle) -> T) -> Result<T, SamError> {
        match self.streams.lock().get(&id) {
            Some(StreamSlot::Open(handle)) => Ok(f(handle)),
            _ => Err(SamError::InvalidId(id.to_string())),
        }
    }

    /// Writes `data` to stream `id` and waits until the transport took it.
    pub async fn send_blocking(&self, id: i64, data: Bytes) -> Result<(), SamError> {
        let len = data.len();
        let (chunks, queued) = self.open_handle(id, |h| (h.chunks.clone(), h.queued.clone()))?;
        let (ack_tx, ack_rx) = oneshot::channel();
        queued.fetch_add(len, Ordering::AcqRel);
        let chunk = Chunk {
            data,
            ack: Some(ack_tx),
        };
        if chunks.send(chunk).is_err() {
            queued.fetch_sub(len, Ordering::AcqRel);
            return Err(SamError::InvalidId(id.to_string()));
        }
        ack_rx
            .await
            .map_err(|_| SamError::InvalidId(id.to_string()))?
    }

    /// Queues `data` on stream `id` without waiting, under credit flow control.
    pub fn send_credit(&self, id: i64, data: Bytes) -> Result<SendOutcome, SamError> {
        let len = data.len();
        let (chunks, queued) = self.open_handle(id, |h| (h.chunks.clone(), h.queued.clone()))?;
        if queued.load(Ordering::Acquire) >= STREAM_BUFFER_CEILING {
            return Ok(SendOutcome::Rejected);
        }
        let now = queued.fetch_add(len, Ordering::AcqRel) + len;
        if chunks.send(Chunk { data, ack: None }).is_err() {
            queued.fetch_sub(len, Ordering::AcqRel);
            return Err(SamError::InvalidId(id.to_string()));
        }
        Ok(SendOutcome::Queued {
            buffer_full: now >= STREAM_BUFFER_CEILING,
        })
    }

    /// Sets the total number of bytes stream `id` may deliver; `None` lifts the limit.
    pub fn set_receive_limit(&self, id: i64, limit: Option<u64>) -> Result<(), SamError> {
        self.open_handle(id, |h| {
            h.quota.send_replace(limit);
        })
    }

    /// Closes stream `id` at the client's request. Inbound data stops at
    /// once; chunks already queued are still written before the transport
    /// socket is shut down.
    pub fn close_stream(&self, id: i64) -> Result<(), SamError> {
        let removed = self.streams.lock().remove(&id);
        match removed {
            None => Err(SamError::InvalidId(id.to_string())),
            Some(StreamSlot::Pending) => Ok(()),
            Some(StreamSlot::Open(handle)) => {
                // Dropping the handle closes the chunk queue, so the sender
                // drains and exits on its own.
                handle.abort(Some(Worker::Sender));
                metrics::OPEN_STREAMS.dec();
                debug!("Session '{}': stream {id} closed by client.", self.nickname);
                Ok(())
            }
        }
    }

    /// Called by a worker when its side of the stream ends. Whoever removes the
    /// entry first reports `STREAM CLOSED`.
    async fn finish_stream(&self, id: i64, by: Worker, end: StreamEnd) {
        let removed = self.streams.lock().remove(&id);
        let Some(StreamSlot::Open(handle)) = removed else {
            return;
        };
        handle.abort(Some(by));
        metrics::OPEN_STREAMS.dec();

        let reply = match end {
            StreamEnd::ClientGone => return,
            StreamEnd::Closed => Reply::new("STREAM CLOSED")
                .result(ResultCode::Ok)
                .field("ID", id),
            StreamEnd::Failed(message) => Reply::new("STREAM CLOSED")
                .result(ResultCode::I2pError)
                .field("ID", id)
                .field("MESSAGE", message),
        };
        let _ = self.owner.writer.send(reply).await;
    }

    // --- Spliced streams (protocol 3) ---

    /// Takes the session's accept ticket.
    pub fn try_accept(&self) -> Result<AcceptTicket, SamError> {
        self.inbound
            .clone()
            .try_lock_owned()
            .map_err(|_| SamError::AlreadyAccepting)
    }

    /// Waits for the next inbound socket and splices `client` onto it.
    /// `held` lives as long as the splice. Returns `false` if the session is closing.
    pub fn accept_and_splice<H>(
        self: &Arc<Self>,
        mut ticket: AcceptTicket,
        mut client: ClientIo,
        silent: bool,
        held: H,
    ) -> bool
    where
        H: Send + Sync + 'static,
    {
        let session = self.clone();
        self.group
            .spawn(async move {
                let socket = loop {
                    tokio::select! {
                        socket = ticket.recv() => match socket {
                            Some(socket) => break socket,
                            None => return,
                        },
                        read = client.reader.read_buf(&mut client.buffered),
                            if client.buffered.len() < MAX_EARLY_BYTES => match read {
                            Ok(0) | Err(_) => {
                                debug!("Client left '{}' while accepting.", session.nickname);
                                return;
                            }
                            Ok(_) => {}
                        },
                    }
                };
                drop(ticket);

                if !silent {
                    let line = peer_line(&socket);
                    if write_raw(&mut client.writer, &line).await.is_err() {
                        return;
                    }
                }
                splice(&session.group, client, socket, held);
            })
            .is_some()
    }

    /// Connects to `destination` and splices `client` onto the new socket.
    /// Unless `silent`, the outcome is reported as `STREAM STATUS` first; on
    /// failure the client connection is shut down either way.
    pub fn connect_and_splice<H>(
        self: &Arc<Self>,
        destination: String,
        options: ConnectOptions,
        mut client: ClientIo,
        silent: bool,
        held: H,
    ) -> bool
    where
        H: Send + Sync + 'static,
    {
        let session = self.clone();
        self.group
            .spawn(async move {
                match session.connect_socket(&destination, options).await {
                    Ok(socket) => {
                        if !silent {
                            let ok = Reply::new("STREAM STATUS").result(ResultCode::Ok);
                            if write_line(&mut client.writer, &ok).await.is_err() {
                                return;
                            }
                        }
                        splice(&session.group, client, socket, held);
                    }
                    Err(e) => {
                        debug!("Session '{}': connect failed: {e}", session.nickname);
                        if !silent {
                            let _ = write_line(&mut client.writer, &Reply::error("STREAM STATUS", &e)).await;
                        }
                        let _ = client.writer.shutdown().await;
                    }
                }
            })
            .is_some()
    }

    /// Keeps accepting inbound sockets and splices each onto a new TCP
    /// connection to `target`. Runs until aborted or the session closes.
    pub fn forward(
        self: &Arc<Self>,
        mut ticket: AcceptTicket,
        target: SocketAddr,
        silent: bool,
    ) -> Option<AbortHandle> {
        let session = self.clone();
        info!("Session '{}' forwarding inbound streams to {target}.", self.nickname);
        self.group.spawn(async move {
            while let Some(socket) = ticket.recv().await {
                let tcp = match TcpStream::connect(target).await {
                    Ok(tcp) => tcp,
                    Err(e) => {
                        warn!(
                            "Session '{}': forward target {target} unreachable: {e}",
                            session.nickname
                        );
                        continue;
                    }
                };
                let (read_half, write_half) = tcp.into_split();
                let mut writer: BoxedWrite = Box::new(write_half);
                if !silent {
                    let line = peer_line(&socket);
                    if write_raw(&mut writer, &line).await.is_err() {
                        continue;
                    }
                }
                let client = ClientIo::new(Box::new(read_half), BytesMut::new(), writer);
                splice(&session.group, client, socket, ());
            }
        })
    }

    pub async fn close(&self) {
        let opened = {
            let mut streams = self.streams.lock();
            let opened = streams
                .values()
                .filter(|slot| matches!(slot, StreamSlot::Open(_)))
                .count();
            for slot in streams.values() {
                if let StreamSlot::Open(handle) = slot {
                    handle.abort(None);
                }
            }
            streams.clear();
            opened
        };
        metrics::OPEN_STREAMS.sub(opened as f64);
        if self.owns_transport {
            self.transport.close().await;
        }
    }
}

/// The `<peer destination> FROM_PORT=f TO_PORT=t` line sent ahead of spliced data.
fn peer_line(socket: &TransportSocket) -> String {
    format!(
        "{} FROM_PORT={} TO_PORT={}\n",
        socket.peer, socket.remote_port, socket.local_port
    )
}

async fn write_raw(writer: &mut BoxedWrite, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

async fn write_line(writer: &mut BoxedWrite, reply: &Reply) -> std::io::Result<()> {
    write_raw(writer, &reply.to_line()).await
}
