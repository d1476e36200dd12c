// src/server/spawner.rs

//! Spawns all of the gateway's long-running background tasks.

use super::context::ServerContext;
use super::metrics_server;
use crate::core::datagram_server;
use anyhow::Result;
use tracing::info;

/// Spawns the metrics exporter and the datagram side channel, as configured.
pub fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    if ctx.state.config.metrics.enabled {
        let state = ctx.state.clone();
        let shutdown_rx = ctx.shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            metrics_server::run_metrics_server(state, shutdown_rx).await
        });
    }

    if let Some(socket) = ctx.datagram_socket.clone() {
        let state = ctx.state.clone();
        let shutdown_rx = ctx.shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            datagram_server::run(socket, state, shutdown_rx).await;
            Ok(())
        });
    }

    info!(
        "{} background task(s) started.",
        ctx.background_tasks.len()
    );
    Ok(())
}
