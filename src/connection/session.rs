// src/connection/session.rs

//! Defines the state associated with a single client connection.

use super::writer::ClientWriter;
use crate::core::protocol::Capabilities;
use crate::core::registry::SessionRecord;
use crate::core::state::KillSender;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::AbortHandle;

/// Fixed facts about a connection, shared with the sessions it creates.
#[derive(Clone)]
pub struct ConnectionInfo {
    pub conn_id: u64,
    pub addr: SocketAddr,
    pub writer: ClientWriter,
    pub kill: KillSender,
}

/// The gateway-originated keepalive probe, one per connection.
#[derive(Debug, Default)]
pub struct PingSlot {
    /// The nonce of the unanswered `PING`, if any.
    pub outstanding: Option<String>,
}

impl PingSlot {
    /// Clears the slot if `text` answers the outstanding probe.
    pub fn answer(&mut self, text: &str) -> bool {
        match &self.outstanding {
            Some(nonce) if nonce == text.trim() => {
                self.outstanding = None;
                true
            }
            _ => false,
        }
    }

    /// Any other command from the client shows it is alive.
    pub fn saw_activity(&mut self) {
        self.outstanding = None;
    }
}

/// Holds the state specific to a single client connection.
#[derive(Default)]
pub struct SessionState {
    /// Set by `HELLO`; `None` while awaiting the handshake.
    pub caps: Option<Capabilities>,
    /// True once the client presented valid credentials.
    pub is_authenticated: bool,
    /// The session this connection created, if any.
    pub session: Option<Arc<SessionRecord>>,
    /// `STREAM FORWARD` loops started from this connection.
    pub forwarders: Vec<AbortHandle>,
    pub ping: PingSlot,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nickname(&self) -> Option<&str> {
        self.session.as_ref().map(|r| r.nickname.as_str())
    }
}
