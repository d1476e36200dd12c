// src/core/state/core.rs

//! Defines the central `GatewayState` struct, holding all shared gateway-wide state.

use super::client::*;
use crate::config::Config;
use crate::core::SamError;
use crate::core::auth::{AuthManager, CredentialStore, FileCredentialStore};
use crate::core::keys::KeyStore;
use crate::core::registry::SessionRegistry;
use crate::transport::{NamingService, Transport};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tracing::info;

/// The central struct holding all shared, gateway-wide state.
/// It is wrapped in an `Arc` and handed to every connection handler and
/// background task.
pub struct GatewayState {
    /// The resolved configuration. Immutable after startup.
    pub config: Arc<Config>,
    /// Every live session, keyed by nickname.
    pub registry: Arc<SessionRegistry>,
    /// All open command connections, keyed by connection id.
    pub clients: ClientMap,
    pub transport: Arc<dyn Transport>,
    pub naming: Arc<dyn NamingService>,
    /// Named keystreams for protocol 1 and 2 `DESTINATION=<name>`.
    pub keys: KeyStore,
    pub auth: AuthManager,
    /// The side-channel socket, once bound. Sessions forwarding messages to
    /// `HOST`/`PORT` send from it.
    datagram_socket: RwLock<Option<Arc<UdpSocket>>>,
    next_conn_id: AtomicU64,
}

impl GatewayState {
    /// Builds the state, loading the key store and credential file from disk.
    pub async fn initialize(
        config: Config,
        transport: Arc<dyn Transport>,
        naming: Arc<dyn NamingService>,
    ) -> Result<Arc<Self>, SamError> {
        let keys = if config.keys_file.is_empty() {
            KeyStore::in_memory()
        } else {
            KeyStore::open(&config.keys_file).await?
        };

        let store: Arc<dyn CredentialStore> = if config.auth.credentials_file.is_empty() {
            Arc::new(FileCredentialStore::in_memory())
        } else {
            Arc::new(FileCredentialStore::open(&config.auth.credentials_file).await?)
        };
        let auth = AuthManager::new(config.auth.enabled, store);
        if config.auth.enabled {
            info!("Client authentication is required.");
        }

        Ok(Arc::new(Self {
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
            clients: ClientMap::new(),
            transport,
            naming,
            keys,
            auth,
            datagram_socket: RwLock::new(None),
            next_conn_id: AtomicU64::new(1),
        }))
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolves a `DESTINATION=` value: a valid destination is used as-is,
    /// anything else goes through the naming service.
    pub async fn resolve_destination(&self, name: &str) -> Result<String, SamError> {
        if self.transport.validate_destination(name).is_ok() {
            return Ok(name.to_string());
        }
        self.naming
            .lookup(name)
            .await
            .ok_or_else(|| SamError::InvalidKey(format!("cannot resolve '{name}'")))
    }

    pub fn set_datagram_socket(&self, socket: Arc<UdpSocket>) {
        *self.datagram_socket.write() = Some(socket);
    }

    pub fn datagram_socket(&self) -> Option<Arc<UdpSocket>> {
        self.datagram_socket.read().clone()
    }

    /// Asks connection `conn_id` to stop. Returns `false` if it is not connected.
    pub fn kill_client(&self, conn_id: u64) -> bool {
        match self.clients.get(&conn_id) {
            Some(client) => client.kill.send(()).is_ok(),
            None => false,
        }
    }
}
