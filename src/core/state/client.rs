// src/core/state/client.rs

//! Contains state definitions related to client connections.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::broadcast;

pub type KillSender = broadcast::Sender<()>;
pub type ClientMap = DashMap<u64, ClientHandle>;

/// A live command connection, as seen from outside its handler.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub addr: SocketAddr,
    /// Ends the connection's command loop.
    pub kill: KillSender,
    pub connected_at: Instant,
}
