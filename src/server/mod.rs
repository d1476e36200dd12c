// src/server/mod.rs

use crate::config::Config;
use crate::core::state::GatewayState;
use crate::transport::memory::MemoryNetwork;
use crate::transport::{NamingService, Transport};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

mod connection_loop;
mod context;
mod initialization;
mod metrics_server;
mod spawner;

/// The main gateway startup function, orchestrating all setup phases.
/// Runs until SIGINT or SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let network = MemoryNetwork::new();
    info!("Using the in-process transport; destinations are reachable from this gateway only.");

    // 1. Initialize state, listeners, etc.
    let mut server_context = initialization::setup(config, network.clone(), network).await?;

    // 2. Spawn all background tasks.
    spawner::spawn_all(&mut server_context)?;

    // 3. Start the main connection acceptance loop. This function will run until shutdown.
    connection_loop::run(server_context, shutdown_signal()).await;

    Ok(())
}

/// A gateway running on the current runtime.
pub struct RunningGateway {
    /// The bound command listener address.
    pub command_addr: SocketAddr,
    /// The bound datagram side-channel address, if enabled.
    pub datagram_addr: Option<SocketAddr>,
    pub state: Arc<GatewayState>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RunningGateway {
    /// Stops accepting connections and waits for the gateway to shut down.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            error!("Gateway task failed during shutdown: {e:?}");
        }
    }
}

/// Starts a gateway over the given transport and returns once it is
/// listening. Dropping the returned handle also stops it.
pub async fn spawn(
    config: Config,
    transport: Arc<dyn Transport>,
    naming: Arc<dyn NamingService>,
) -> Result<RunningGateway> {
    let mut server_context = initialization::setup(config, transport, naming).await?;
    spawner::spawn_all(&mut server_context)?;

    let command_addr = server_context.listener.local_addr()?;
    let datagram_addr = match &server_context.datagram_socket {
        Some(socket) => Some(socket.local_addr()?),
        None => None,
    };
    let state = server_context.state.clone();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(connection_loop::run(server_context, async move {
        let _ = stop_rx.await;
    }));

    Ok(RunningGateway {
        command_addr,
        datagram_addr,
        state,
        stop: Some(stop_tx),
        task,
    })
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, initiating graceful shutdown."),
        _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
    }
}
