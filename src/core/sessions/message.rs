// src/core/sessions/message.rs

//! Repliable (`DATAGRAM`) and raw (`RAW`) message sessions.
//!
//! A repliable datagram travels as `[u16 sender length][sender][payload]` so the
//! receiving side can reply; a raw datagram is the bare payload.

use super::Owner;
use crate::core::lifecycle::LifecycleGroup;
use crate::core::metrics;
use crate::core::protocol::{Props, Reply};
use crate::core::SamError;
use crate::transport::{InboundMessage, PROTO_DATAGRAM, PROTO_RAW, TransportSession};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Largest repliable datagram payload.
pub const DATAGRAM_MAX_SIZE: usize = 31744;
/// Largest raw datagram payload.
pub const RAW_MAX_SIZE: usize = 32768;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStyle {
    Datagram,
    Raw,
}

impl MessageStyle {
    pub fn max_size(&self) -> usize {
        match self {
            MessageStyle::Datagram => DATAGRAM_MAX_SIZE,
            MessageStyle::Raw => RAW_MAX_SIZE,
        }
    }

    pub fn default_protocol(&self) -> u8 {
        match self {
            MessageStyle::Datagram => PROTO_DATAGRAM,
            MessageStyle::Raw => PROTO_RAW,
        }
    }

    /// The reply domain, `DATAGRAM` or `RAW`.
    pub fn domain(&self) -> &'static str {
        match self {
            MessageStyle::Datagram => "DATAGRAM",
            MessageStyle::Raw => "RAW",
        }
    }
}

/// Per-session defaults applied to sends that don't override them.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageDefaults {
    pub protocol: u8,
    pub from_port: u16,
    pub to_port: u16,
}

impl MessageDefaults {
    /// Reads `PROTOCOL`, `FROM_PORT` and `TO_PORT` from session properties.
    pub fn from_props(style: MessageStyle, props: &Props) -> Result<Self, SamError> {
        let protocol = match style {
            MessageStyle::Raw => props.parse::<u8>("PROTOCOL")?.unwrap_or(PROTO_RAW),
            MessageStyle::Datagram => PROTO_DATAGRAM,
        };
        Ok(Self {
            protocol,
            from_port: props.parse::<u16>("FROM_PORT")?.unwrap_or(0),
            to_port: props.parse::<u16>("TO_PORT")?.unwrap_or(0),
        })
    }
}

/// Where inbound messages go.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// As `DATAGRAM RECEIVED`/`RAW RECEIVED` lines on the owning connection.
    Client,
    /// As packets to an address the client registered with `HOST`/`PORT`.
    Forward {
        socket: Arc<UdpSocket>,
        target: SocketAddr,
        /// Raw only: prefix each packet with its protocol and ports.
        header: bool,
    },
}

pub struct MessageSessionConfig {
    pub nickname: String,
    pub style: MessageStyle,
    pub defaults: MessageDefaults,
    pub delivery: Delivery,
    /// Include protocol and ports when reporting inbound messages.
    pub report_ports: bool,
}

pub struct MessageSession {
    nickname: String,
    style: MessageStyle,
    defaults: MessageDefaults,
    delivery: Delivery,
    report_ports: bool,
    transport: Arc<dyn TransportSession>,
    /// `false` for sub-sessions, which borrow their primary's binding.
    owns_transport: bool,
    owner: Owner,
}

impl MessageSession {
    pub fn new(
        config: MessageSessionConfig,
        transport: Arc<dyn TransportSession>,
        owns_transport: bool,
        owner: Owner,
    ) -> Arc<Self> {
        Arc::new(Self {
            nickname: config.nickname,
            style: config.style,
            defaults: config.defaults,
            delivery: config.delivery,
            report_ports: config.report_ports,
            transport,
            owns_transport,
            owner,
        })
    }

    pub fn style(&self) -> MessageStyle {
        self.style
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn protocol(&self) -> u8 {
        self.defaults.protocol
    }

    pub fn destination(&self) -> &str {
        self.transport.destination()
    }

    /// Starts the inbound pump. Sub-sessions receive through their primary instead.
    pub fn start(self: &Arc<Self>, group: &LifecycleGroup) {
        if !self.owns_transport {
            return;
        }
        let session = self.clone();
        group.spawn(async move {
            loop {
                match session.transport.recv_message().await {
                    Some(message) => session.deliver(message).await,
                    None => {
                        session.owner.transport_lost(&session.nickname).await;
                        break;
                    }
                }
            }
        });
    }

    /// Sends one message. `overrides` may carry `PROTOCOL` (raw only),
    /// `FROM_PORT` and `TO_PORT`. Returns whether the transport accepted it.
    pub async fn send(
        &self,
        destination: &str,
        payload: Bytes,
        overrides: &Props,
    ) -> Result<bool, SamError> {
        if payload.is_empty() || payload.len() > self.style.max_size() {
            return Err(SamError::InvalidSize(payload.len()));
        }
        let protocol = match self.style {
            MessageStyle::Raw => overrides
                .parse::<u8>("PROTOCOL")?
                .unwrap_or(self.defaults.protocol),
            MessageStyle::Datagram => self.defaults.protocol,
        };
        let from_port = overrides
            .parse::<u16>("FROM_PORT")?
            .unwrap_or(self.defaults.from_port);
        let to_port = overrides
            .parse::<u16>("TO_PORT")?
            .unwrap_or(self.defaults.to_port);

        let body = match self.style {
            MessageStyle::Datagram => wrap_repliable(self.transport.destination(), &payload),
            MessageStyle::Raw => payload,
        };
        let accepted = self
            .transport
            .send_message(destination, body, protocol, from_port, to_port)
            .await?;
        if accepted {
            metrics::DATAGRAMS_SENT_TOTAL.inc();
        } else {
            metrics::DATAGRAMS_DROPPED_TOTAL.inc();
            debug!(
                "Session '{}': transport refused a {} message.",
                self.nickname,
                self.style.domain()
            );
        }
        Ok(accepted)
    }

    /// Hands one inbound message to the client.
    pub async fn deliver(&self, message: InboundMessage) {
        let result = match self.style {
            MessageStyle::Datagram => {
                let Some((source, payload)) = unwrap_repliable(&message.payload) else {
                    warn!(
                        "Session '{}': dropping malformed repliable datagram.",
                        self.nickname
                    );
                    metrics::DATAGRAMS_DROPPED_TOTAL.inc();
                    return;
                };
                self.deliver_datagram(&source, payload, &message).await
            }
            MessageStyle::Raw => self.deliver_raw(&message).await,
        };
        match result {
            Ok(()) => metrics::DATAGRAMS_RECEIVED_TOTAL.inc(),
            Err(e) => {
                metrics::DATAGRAMS_DROPPED_TOTAL.inc();
                debug!(
                    "Session '{}': could not deliver message: {e}",
                    self.nickname
                );
            }
        }
    }

    async fn deliver_datagram(
        &self,
        source: &str,
        payload: &[u8],
        message: &InboundMessage,
    ) -> Result<(), SamError> {
        match &self.delivery {
            Delivery::Client => {
                let mut reply = Reply::new("DATAGRAM RECEIVED")
                    .field("DESTINATION", source)
                    .field("SIZE", payload.len());
                if self.report_ports {
                    reply = reply
                        .field("FROM_PORT", message.from_port)
                        .field("TO_PORT", message.to_port);
                }
                self.owner.writer.send_with_payload(reply, payload).await
            }
            Delivery::Forward { socket, target, .. } => {
                let mut header = source.to_string();
                if self.report_ports {
                    header.push_str(&format!(
                        " FROM_PORT={} TO_PORT={}",
                        message.from_port, message.to_port
                    ));
                }
                header.push('\n');
                forward(socket, *target, header.as_bytes(), payload).await
            }
        }
    }

    async fn deliver_raw(&self, message: &InboundMessage) -> Result<(), SamError> {
        let payload = &message.payload[..];
        match &self.delivery {
            Delivery::Client => {
                let mut reply = Reply::new("RAW RECEIVED").field("SIZE", payload.len());
                if self.report_ports {
                    reply = reply
                        .field("PROTOCOL", message.protocol)
                        .field("FROM_PORT", message.from_port)
                        .field("TO_PORT", message.to_port);
                }
                self.owner.writer.send_with_payload(reply, payload).await
            }
            Delivery::Forward {
                socket,
                target,
                header,
            } => {
                let prefix = if *header {
                    format!(
                        "PROTOCOL={} FROM_PORT={} TO_PORT={}\n",
                        message.protocol, message.from_port, message.to_port
                    )
                } else {
                    String::new()
                };
                forward(socket, *target, prefix.as_bytes(), payload).await
            }
        }
    }

    pub async fn close(&self) {
        if self.owns_transport {
            self.transport.close().await;
        }
    }
}

async fn forward(
    socket: &UdpSocket,
    target: SocketAddr,
    header: &[u8],
    payload: &[u8],
) -> Result<(), SamError> {
    let mut packet = Vec::with_capacity(header.len() + payload.len());
    packet.extend_from_slice(header);
    packet.extend_from_slice(payload);
    socket.send_to(&packet, target).await?;
    Ok(())
}

/// Prefixes `payload` with the sender's destination.
pub fn wrap_repliable(source: &str, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + source.len() + payload.len());
    buf.put_u16(source.len() as u16);
    buf.put_slice(source.as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

/// Splits a repliable datagram into its sender and payload.
pub fn unwrap_repliable(body: &[u8]) -> Option<(String, &[u8])> {
    let len_bytes = body.get(..2)?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    let source = body.get(2..2 + len)?;
    let source = std::str::from_utf8(source).ok()?;
    if source.is_empty() {
        return None;
    }
    Some((source.to_string(), &body[2 + len..]))
}
