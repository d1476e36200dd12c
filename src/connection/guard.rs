// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard for connection resource management.

use crate::core::metrics;
use crate::core::state::GatewayState;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// An RAII guard to ensure connection resources are always cleaned up when a
/// connection is done, including after its socket was handed to a splice.
pub struct ConnectionGuard {
    pub(crate) state: Arc<GatewayState>,
    pub(crate) conn_id: u64,
    pub(crate) addr: SocketAddr,
}

impl ConnectionGuard {
    pub(crate) fn new(state: Arc<GatewayState>, conn_id: u64, addr: SocketAddr) -> Self {
        Self {
            state,
            conn_id,
            addr,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        metrics::CONNECTED_CLIENTS.dec();
        debug!(
            "ConnectionGuard dropping, cleaning up resources for connection {}",
            self.addr
        );

        if self.state.clients.remove(&self.conn_id).is_none() {
            debug!(
                "Client {} was not in the global client map upon cleanup.",
                self.addr
            );
        }
    }
}
