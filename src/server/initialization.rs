// src/server/initialization.rs

//! Handles the gateway initialization process: shared state, the command
//! listener and the datagram side channel.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::state::GatewayState;
use crate::transport::{NamingService, Transport};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Initializes all gateway components before starting the main loop.
pub async fn setup(
    config: Config,
    transport: Arc<dyn Transport>,
    naming: Arc<dyn NamingService>,
) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let state = GatewayState::initialize(config, transport, naming)
        .await
        .context("Failed to initialize gateway state")?;
    info!(
        "Gateway state initialized ({} named destinations loaded).",
        state.keys.len()
    );

    let config = state.config.clone();
    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    info!("SAM gateway listening on {}", listener.local_addr()?);

    let datagram_socket = if config.udp.enabled {
        let socket = UdpSocket::bind((config.udp.host.as_str(), config.udp.port))
            .await
            .with_context(|| {
                format!(
                    "Failed to bind datagram port {}:{}",
                    config.udp.host, config.udp.port
                )
            })?;
        let socket = Arc::new(socket);
        state.set_datagram_socket(socket.clone());
        Some(socket)
    } else {
        info!("Datagram side channel is disabled.");
        None
    };

    let connection_permits = Arc::new(Semaphore::new(config.max_clients));

    Ok(ServerContext {
        state,
        listener,
        datagram_socket,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        connection_permits,
    })
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    if config.is_exposed() && !config.auth.enabled {
        warn!("--------------------------------------------------------------------------------");
        warn!("SECURITY WARNING:");
        warn!(
            " - The command port is bound to '{}' and authentication is disabled.",
            config.host
        );
        warn!(" - Any host that can reach it can create sessions on this gateway.");
        warn!("--------------------------------------------------------------------------------");
    }
    info!(
        "Gateway configured for up to {} clients; hello timeout {:?}, keepalive interval {:?}.",
        config.max_clients, config.hello_timeout, config.ping_interval
    );
}
