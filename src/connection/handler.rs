// src/connection/handler.rs

//! Defines the `ConnectionHandler` which manages the full lifecycle of a client connection.

use super::guard::ConnectionGuard;
use super::session::{ConnectionInfo, SessionState};
use super::writer::ClientWriter;
use crate::core::handler::command_router::{HandOff, RouteResponse, Router, error_reply};
use crate::core::protocol::{Capabilities, CommandLine, Reply, SamCodec, SendPolicy};
use crate::core::sessions::message::{DATAGRAM_MAX_SIZE, RAW_MAX_SIZE};
use crate::core::sessions::stream::{ClientIo, MAX_SEND_SIZE};
use crate::core::state::{GatewayState, KillSender};
use crate::core::{ResultCode, SamError};
use bytes::Bytes;
use futures::StreamExt;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::broadcast;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

/// The next step for the connection's main loop to take.
enum NextAction {
    Continue,
    ExitLoop,
    /// The socket now belongs to a stream session.
    HandedOff,
}

/// One event from the read side of the connection.
enum Inbound {
    Line(CommandLine),
    Failed(SamError),
    Idle,
    Closed,
}

/// Manages the full lifecycle of a client connection.
pub struct ConnectionHandler {
    reader: Option<FramedRead<OwnedReadHalf, SamCodec>>,
    info: ConnectionInfo,
    state: Arc<GatewayState>,
    kill_rx: broadcast::Receiver<()>,
    global_shutdown_rx: broadcast::Receiver<()>,
    session: SessionState,
}

impl ConnectionHandler {
    /// Creates a new `ConnectionHandler`. `kill` ends this connection when
    /// sent to.
    pub fn new(
        socket: TcpStream,
        addr: SocketAddr,
        state: Arc<GatewayState>,
        conn_id: u64,
        kill: KillSender,
        global_shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (read_half, write_half) = socket.into_split();
        let kill_rx = kill.subscribe();
        Self {
            reader: Some(FramedRead::new(read_half, SamCodec)),
            info: ConnectionInfo {
                conn_id,
                addr,
                writer: ClientWriter::new(Box::new(write_half)),
                kill,
            },
            state,
            kill_rx,
            global_shutdown_rx,
            session: SessionState::new(),
        }
    }

    /// The main event loop for the connection, handling incoming lines and signals.
    pub async fn run(mut self) -> Result<(), SamError> {
        let mut guard = Some(ConnectionGuard::new(
            self.state.clone(),
            self.info.conn_id,
            self.info.addr,
        ));
        let mut handed_off = false;

        'main_loop: loop {
            let idle = self.idle_timeout();
            let Some(reader) = self.reader.as_mut() else {
                break 'main_loop;
            };

            tokio::select! {
                // Prioritize shutdown signals over other events.
                biased;
                _ = self.global_shutdown_rx.recv() => {
                    info!("Connection handler for {} received GLOBAL shutdown signal.", self.info.addr);
                    let notice = Reply::new("SESSION STATUS")
                        .result(ResultCode::I2pError)
                        .field("MESSAGE", "gateway shutting down");
                    let _ = self.info.writer.send(notice).await;
                    break 'main_loop;
                }
                _ = self.kill_rx.recv() => {
                    info!("Connection handler for {} received kill signal.", self.info.addr);
                    break 'main_loop;
                }
                inbound = next_line(reader, idle) => {
                    let action = match inbound {
                        Inbound::Line(line) => self.process_line(line, &mut guard).await,
                        Inbound::Idle => self.on_idle().await,
                        Inbound::Failed(e) => {
                            if is_normal_disconnect(&e) {
                                debug!("Connection from {} closed by peer: {}", self.info.addr, e);
                            } else {
                                warn!("Unreadable command from {}: {}", self.info.addr, e);
                                let _ = self.info.writer.send(error_reply("", &Default::default(), &e)).await;
                            }
                            break 'main_loop;
                        }
                        Inbound::Closed => {
                            debug!("Connection from {} closed by peer.", self.info.addr);
                            break 'main_loop;
                        }
                    };
                    match action {
                        Ok(NextAction::Continue) => {}
                        Ok(NextAction::ExitLoop) => break 'main_loop,
                        Ok(NextAction::HandedOff) => {
                            handed_off = true;
                            break 'main_loop;
                        }
                        Err(e) => {
                            if !is_normal_disconnect(&e) {
                                warn!("Connection error for {}: {}", self.info.addr, e);
                            }
                            break 'main_loop;
                        }
                    }
                }
            }
        }

        if !handed_off {
            self.cleanup().await;
        }
        Ok(())
    }

    /// Before `HELLO` the handshake timeout applies; afterwards protocol 3
    /// connections are probed with `PING` when idle.
    fn idle_timeout(&self) -> Option<Duration> {
        match &self.session.caps {
            None => Some(self.state.config.hello_timeout),
            Some(caps) if caps.keepalive => Some(self.state.config.ping_interval),
            Some(_) => None,
        }
    }

    /// Sends a keepalive probe, or gives up on a peer that left the last one
    /// unanswered.
    async fn on_idle(&mut self) -> Result<NextAction, SamError> {
        if self.session.caps.is_none() {
            info!("Client {} sent no HELLO in time.", self.info.addr);
            return Ok(NextAction::ExitLoop);
        }
        if let Some(nonce) = &self.session.ping.outstanding {
            warn!(
                "Client {} did not answer PING {nonce}; closing.",
                self.info.addr
            );
            let notice = Reply::new("SESSION STATUS")
                .result(ResultCode::I2pError)
                .field("MESSAGE", "PONG timeout");
            let _ = self.info.writer.send(notice).await;
            return Ok(NextAction::ExitLoop);
        }
        let nonce = hex::encode(rand::thread_rng().r#gen::<[u8; 8]>());
        self.info
            .writer
            .send(Reply::raw(format!("PING {nonce}")))
            .await?;
        self.session.ping.outstanding = Some(nonce);
        Ok(NextAction::Continue)
    }

    /// Runs one command line and writes whatever it produces. Command errors
    /// are answered in the command's reply vocabulary; fatal ones end the loop.
    async fn process_line(
        &mut self,
        line: CommandLine,
        guard: &mut Option<ConnectionGuard>,
    ) -> Result<NextAction, SamError> {
        debug!(
            "Connection {}: Received command: {}",
            self.info.conn_id,
            line.name()
        );
        let domain = line.domain.clone();
        let props = line.props.clone();
        // A PONG counts only when it matches the probe.
        if domain != "PONG" {
            self.session.ping.saw_activity();
        }

        match self.execute(line, guard).await {
            Ok(action) => Ok(action),
            Err(e) => {
                debug!(
                    "Connection {}: {} failed: {}",
                    self.info.conn_id, domain, e
                );
                self.info.writer.send(error_reply(&domain, &props, &e)).await?;
                if e.is_fatal() {
                    Ok(NextAction::ExitLoop)
                } else {
                    Ok(NextAction::Continue)
                }
            }
        }
    }

    async fn execute(
        &mut self,
        line: CommandLine,
        guard: &mut Option<ConnectionGuard>,
    ) -> Result<NextAction, SamError> {
        let payload = match payload_size(self.session.caps.as_ref(), &line)? {
            Some(size) => Some(self.read_payload(size).await?),
            None => None,
        };

        let mut router = Router::new(self.state.clone(), &self.info, &mut self.session);
        match router.route(line, payload).await? {
            RouteResponse::Reply(reply) => {
                self.info.writer.send(reply).await?;
                Ok(NextAction::Continue)
            }
            RouteResponse::NoReply => Ok(NextAction::Continue),
            RouteResponse::Close(reply) => {
                self.info.writer.send(reply).await?;
                Ok(NextAction::ExitLoop)
            }
            RouteResponse::HandOff(hand_off) => self.hand_off(hand_off, guard).await,
        }
    }

    /// Reads exactly `size` payload bytes, starting with what the line decoder
    /// already buffered.
    async fn read_payload(&mut self, size: usize) -> Result<Bytes, SamError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| SamError::Internal("connection reader already taken".to_string()))?;
        let mut payload = vec![0u8; size];
        let buffered = reader.read_buffer_mut();
        let mut filled = buffered.len().min(size);
        payload[..filled].copy_from_slice(&buffered.split_to(filled));

        while filled < size {
            let n = reader.get_mut().read(&mut payload[filled..]).await?;
            if n == 0 {
                return Err(SamError::PayloadTruncated {
                    declared: size,
                    read: filled,
                });
            }
            filled += n;
        }
        Ok(Bytes::from(payload))
    }

    /// Moves the client socket, with any bytes already buffered, out of the
    /// command loop and into a stream session.
    async fn hand_off(
        &mut self,
        hand_off: HandOff,
        guard: &mut Option<ConnectionGuard>,
    ) -> Result<NextAction, SamError> {
        if let HandOff::Accept { silent: false, .. } = &hand_off {
            self.info
                .writer
                .send(Reply::new("STREAM STATUS").result(ResultCode::Ok))
                .await?;
        }

        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| SamError::Internal("connection reader already taken".to_string()))?;
        let buffered = std::mem::take(reader.read_buffer_mut());
        let writer = self
            .info
            .writer
            .take()
            .await
            .ok_or_else(|| SamError::Internal("connection writer already taken".to_string()))?;
        let client = ClientIo::new(Box::new(reader.into_inner()), buffered, writer);
        // The guard lives as long as the splice, so the client stays counted.
        let held = guard.take();

        let started = match hand_off {
            HandOff::Accept {
                session,
                ticket,
                silent,
            } => session.accept_and_splice(ticket, client, silent, held),
            HandOff::Connect {
                session,
                destination,
                options,
                silent,
            } => session.connect_and_splice(destination, options, client, silent, held),
        };
        if started {
            debug!("Connection {} handed off to a stream.", self.info.conn_id);
        } else {
            debug!(
                "Connection {} dropped: its stream session is closing.",
                self.info.conn_id
            );
        }
        Ok(NextAction::HandedOff)
    }

    /// Releases everything this connection owns.
    async fn cleanup(&mut self) {
        for forwarder in self.session.forwarders.drain(..) {
            forwarder.abort();
        }
        if let Some(record) = self.session.session.take() {
            self.state.registry.close(&record.nickname).await;
        }
        self.info.writer.close().await;
    }
}

async fn next_line(reader: &mut FramedRead<OwnedReadHalf, SamCodec>, idle: Option<Duration>) -> Inbound {
    let next = match idle {
        Some(idle) => match tokio::time::timeout(idle, reader.next()).await {
            Ok(next) => next,
            Err(_) => return Inbound::Idle,
        },
        None => reader.next().await,
    };
    match next {
        Some(Ok(line)) => Inbound::Line(line),
        Some(Err(e)) => Inbound::Failed(e),
        None => Inbound::Closed,
    }
}

/// The payload size a command declares, if it carries one. Sizes out of range
/// are rejected before anything is read.
fn payload_size(caps: Option<&Capabilities>, line: &CommandLine) -> Result<Option<usize>, SamError> {
    let Some(caps) = caps else {
        return Ok(None);
    };
    let max = match (line.domain.as_str(), line.opcode.as_deref()) {
        ("STREAM", Some("SEND")) if caps.send_policy != SendPolicy::Spliced => MAX_SEND_SIZE,
        ("DATAGRAM", Some("SEND")) => DATAGRAM_MAX_SIZE,
        ("RAW", Some("SEND")) => RAW_MAX_SIZE,
        _ => return Ok(None),
    };
    let size = line
        .props
        .parse::<usize>("SIZE")?
        .ok_or(SamError::MissingProperty("SIZE"))?;
    if size == 0 || size > max {
        return Err(SamError::InvalidSize(size));
    }
    Ok(Some(size))
}

/// Helper function to check for non-critical disconnection errors.
fn is_normal_disconnect(e: &SamError) -> bool {
    matches!(e, SamError::Io(arc_err) if matches!(
        arc_err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionAborted
    ))
}
