// src/core/datagram_server.rs

//! The UDP side channel: clients send messages through a session without
//! holding its command connection.
//!
//! Each packet is `3.x NICKNAME DESTINATION [PROTOCOL=p] [FROM_PORT=f] [TO_PORT=t]\n<payload>`.
//! The legacy `NICKNAME DESTINATION\n<payload>` header is also accepted.
//! Nothing is ever sent back; bad packets are logged and dropped.

use crate::core::metrics;
use crate::core::protocol::{CommandLine, Props};
use crate::core::state::GatewayState;
use crate::core::SamError;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const MAX_PACKET: usize = 64 * 1024;

/// A parsed side-channel header.
#[derive(Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub nickname: String,
    pub destination: String,
    pub options: Props,
}

/// Splits a packet into its header and payload.
pub fn parse_packet(packet: &[u8]) -> Result<(PacketHeader, &[u8]), SamError> {
    let newline = packet
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| SamError::Malformed("missing header line".to_string()))?;
    let header = std::str::from_utf8(&packet[..newline])?;
    let payload = &packet[newline + 1..];

    let tokens: Vec<&str> = header.split_whitespace().collect();
    let (nickname, destination, rest) = match tokens.as_slice() {
        [version, nickname, destination, rest @ ..] if !destination.contains('=') => {
            if !version.starts_with('3') {
                return Err(SamError::Malformed(format!("unsupported version '{version}'")));
            }
            (*nickname, *destination, rest.join(" "))
        }
        [nickname, destination, rest @ ..] => (*nickname, *destination, rest.join(" ")),
        _ => return Err(SamError::Malformed(format!("bad header '{header}'"))),
    };

    // Reuse the command tokenizer for the option tail.
    let options = if rest.is_empty() {
        Props::new()
    } else {
        CommandLine::parse(&format!("OPTIONS {rest}"))?.props
    };
    Ok((
        PacketHeader {
            nickname: nickname.to_string(),
            destination: destination.to_string(),
            options,
        },
        payload,
    ))
}

/// Runs the side-channel receive loop until shutdown.
pub async fn run(
    socket: Arc<UdpSocket>,
    state: Arc<GatewayState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    if let Ok(addr) = socket.local_addr() {
        info!("Datagram side channel listening on {addr}");
    }
    let mut buf = vec![0u8; MAX_PACKET];
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                info!("Datagram side channel shutting down.");
                return;
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => {
                    if let Err(e) = handle_packet(&state, &buf[..n], from).await {
                        debug!("Dropping side-channel packet from {from}: {e}");
                        metrics::DATAGRAMS_DROPPED_TOTAL.inc();
                    }
                }
                Err(e) => {
                    warn!("Datagram side channel receive error: {e}");
                }
            }
        }
    }
}

async fn handle_packet(state: &GatewayState, packet: &[u8], from: SocketAddr) -> Result<(), SamError> {
    let (header, payload) = parse_packet(packet)?;
    let record = state
        .registry
        .get(&header.nickname)
        .ok_or_else(|| SamError::InvalidId(header.nickname.clone()))?;
    let session = record
        .session()
        .and_then(|s| s.as_message().cloned())
        .ok_or_else(|| {
            SamError::InvalidState(format!("'{}' is not a message session", header.nickname))
        })?;
    let destination = state.resolve_destination(&header.destination).await?;
    let accepted = session
        .send(&destination, Bytes::copy_from_slice(payload), &header.options)
        .await?;
    if !accepted {
        debug!("Transport refused side-channel message from {from}.");
    }
    Ok(())
}
