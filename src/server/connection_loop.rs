// src/server/connection_loop.rs

//! Contains the main gateway loop for accepting connections and handling graceful shutdown.

use super::context::ServerContext;
use crate::connection::ConnectionHandler;
use crate::core::metrics;
use crate::core::state::ClientHandle;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// How long connections get to wind down after the shutdown notice.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The main loop that accepts connections until `stop` resolves, then shuts
/// everything down.
pub async fn run(mut ctx: ServerContext, stop: impl Future<Output = ()>) {
    let mut client_tasks = JoinSet::new();
    tokio::pin!(stop);

    loop {
        tokio::select! {
            biased;

            _ = &mut stop => {
                info!("Shutdown requested.");
                break;
            }

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            },

            res = ctx.listener.accept() => {
                match res {
                    Ok((socket, addr)) => match ctx.connection_permits.clone().try_acquire_owned() {
                        Ok(permit) => {
                            info!("Accepted new connection from: {}", addr);
                            metrics::CONNECTIONS_RECEIVED_TOTAL.inc();
                            metrics::CONNECTED_CLIENTS.inc();

                            let conn_id = ctx.state.next_connection_id();
                            let (kill_tx, _) = broadcast::channel(1);
                            ctx.state.clients.insert(conn_id, ClientHandle {
                                addr,
                                kill: kill_tx.clone(),
                                connected_at: Instant::now(),
                            });

                            let state = ctx.state.clone();
                            let global_shutdown_rx = ctx.shutdown_tx.subscribe();
                            client_tasks.spawn(async move {
                                let _permit = permit;
                                let handler = ConnectionHandler::new(socket, addr, state, conn_id, kill_tx, global_shutdown_rx);
                                if let Err(e) = handler.run().await {
                                    warn!("Connection from {} terminated unexpectedly: {}", addr, e);
                                }
                            });
                        }
                        Err(_) => {
                            warn!("Rejecting connection from {addr}: max_clients reached.");
                        }
                    },
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            },

            Some(res) = client_tasks.join_next() => {
                if let Err(e) = res
                    && e.is_panic()
                {
                    error!("A client handler panicked: {e:?}");
                }
            },
        }
    }

    info!("Shutting down. Sending signal to all tasks.");
    if ctx.shutdown_tx.send(()).is_err() {
        info!("No tasks were listening for the shutdown signal.");
    }

    if tokio::time::timeout(DRAIN_TIMEOUT, async {
        while client_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for client connections to close.");
    }
    client_tasks.shutdown().await;
    info!("All client connections closed.");

    ctx.state.registry.shutdown_all().await;
    info!("All sessions closed.");

    info!("Waiting for background tasks to finish...");
    if tokio::time::timeout(DRAIN_TIMEOUT, async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    };
    info!("Gateway shutdown complete.");
}
