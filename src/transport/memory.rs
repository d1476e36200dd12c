// src/transport/memory.rs

//! An in-process network implementing the transport and naming interfaces.
//!
//! Every session created on a `MemoryNetwork` is reachable by its destination
//! from every other session on the same network. Sockets are in-memory duplex
//! pipes, messages are queued per destination. The binary runs against this
//! network, and so does the test suite.

use super::encoding;
use super::{
    ConnectOptions, InboundMessage, KeyPair, NamingService, SignatureType, Transport,
    TransportError, TransportSession, TransportSocket,
};
use crate::core::protocol::Props;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

const SECRET_LEN: usize = 32;
const PUBLIC_LEN: usize = 2 + 32 + 32;
const PRIVATE_LEN: usize = PUBLIC_LEN + SECRET_LEN;
const SOCKET_BACKLOG: usize = 16;
const MESSAGE_BACKLOG: usize = 256;
const PIPE_CAPACITY: usize = 64 * 1024;

struct Endpoint {
    id: u64,
    sockets: mpsc::Sender<TransportSocket>,
    messages: mpsc::Sender<InboundMessage>,
}

#[derive(Default)]
struct Routes {
    endpoints: DashMap<String, Endpoint>,
    hosts: DashMap<String, String>,
    next_id: AtomicU64,
}

impl Routes {
    /// Removes the endpoint only if it still belongs to session `id`.
    fn release(&self, destination: &str, id: u64) {
        self.endpoints
            .remove_if(destination, |_, endpoint| endpoint.id == id);
    }
}

/// The shared in-process network. Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    routes: Arc<Routes>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publishes `name` in the local host table.
    pub fn add_host(&self, name: &str, destination: &str) {
        self.routes
            .hosts
            .insert(name.to_string(), destination.to_string());
    }

    /// Drops the endpoint for `destination` as if the router disconnected it.
    pub fn disconnect(&self, destination: &str) -> bool {
        self.routes.endpoints.remove(destination).is_some()
    }

    pub fn is_online(&self, destination: &str) -> bool {
        self.routes.endpoints.contains_key(destination)
    }

    fn public_from(sig: u16, secret: &[u8]) -> Vec<u8> {
        let mut public = Vec::with_capacity(PUBLIC_LEN);
        public.extend_from_slice(&sig.to_be_bytes());
        public.extend_from_slice(&Sha256::new().chain_update(b"sign").chain_update(secret).finalize());
        public.extend_from_slice(&Sha256::new().chain_update(b"crypt").chain_update(secret).finalize());
        public
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn generate_keys(&self, sig: SignatureType) -> Result<KeyPair, TransportError> {
        if sig != SignatureType::EdDsaSha512Ed25519 {
            return Err(TransportError::Unsupported(format!("signature type {sig:?}")));
        }
        let mut secret = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        let public = Self::public_from(sig.code(), &secret);
        let mut private = public.clone();
        private.extend_from_slice(&secret);
        Ok(KeyPair {
            public: encoding::encode(&public),
            private: encoding::encode(&private),
        })
    }

    fn destination_of(&self, keystream: &str) -> Result<String, TransportError> {
        let invalid = || TransportError::InvalidKey("not a private keystream".to_string());
        let raw = encoding::decode(keystream).ok_or_else(invalid)?;
        if raw.len() != PRIVATE_LEN {
            return Err(invalid());
        }
        let (public, secret) = raw.split_at(PUBLIC_LEN);
        let sig = u16::from_be_bytes([public[0], public[1]]);
        if Self::public_from(sig, secret) != public {
            return Err(invalid());
        }
        Ok(encoding::encode(public))
    }

    fn validate_destination(&self, destination: &str) -> Result<(), TransportError> {
        match encoding::decode(destination) {
            Some(raw) if raw.len() == PUBLIC_LEN => Ok(()),
            _ => Err(TransportError::InvalidKey("not a destination".to_string())),
        }
    }

    async fn create_session(
        &self,
        keystream: &str,
        options: &Props,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let destination = self.destination_of(keystream)?;
        let (socket_tx, socket_rx) = mpsc::channel(SOCKET_BACKLOG);
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_BACKLOG);
        let id = self.routes.next_id.fetch_add(1, Ordering::Relaxed);

        match self.routes.endpoints.entry(destination.clone()) {
            Entry::Occupied(_) => return Err(TransportError::DuplicateDestination),
            Entry::Vacant(slot) => {
                slot.insert(Endpoint {
                    id,
                    sockets: socket_tx,
                    messages: message_tx,
                });
            }
        }
        info!(
            "Memory transport session {} online with {} options.",
            short(&destination),
            options.len()
        );

        Ok(Arc::new(MemorySession {
            routes: self.routes.clone(),
            id,
            destination,
            sockets: Mutex::new(socket_rx),
            messages: Mutex::new(message_rx),
        }))
    }
}

#[async_trait]
impl NamingService for MemoryNetwork {
    async fn lookup(&self, name: &str) -> Option<String> {
        if let Some(dest) = self.routes.hosts.get(name) {
            return Some(dest.value().clone());
        }
        // A full destination resolves to itself.
        self.validate_destination(name).ok().map(|_| name.to_string())
    }
}

struct MemorySession {
    routes: Arc<Routes>,
    id: u64,
    destination: String,
    sockets: Mutex<mpsc::Receiver<TransportSocket>>,
    messages: Mutex<mpsc::Receiver<InboundMessage>>,
}

#[async_trait]
impl TransportSession for MemorySession {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn connect(
        &self,
        destination: &str,
        options: ConnectOptions,
    ) -> Result<TransportSocket, TransportError> {
        let sockets = match self.routes.endpoints.get(destination) {
            Some(endpoint) => endpoint.sockets.clone(),
            None => return Err(TransportError::CantReachPeer),
        };

        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        let inbound = TransportSocket {
            peer: self.destination.clone(),
            local_port: options.to_port,
            remote_port: options.from_port,
            io: Box::new(theirs),
        };
        sockets.try_send(inbound).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::ConnectionRefused,
            mpsc::error::TrySendError::Closed(_) => TransportError::CantReachPeer,
        })?;
        debug!(
            "Memory transport: {} -> {} port {}",
            short(&self.destination),
            short(destination),
            options.to_port
        );

        Ok(TransportSocket {
            peer: destination.to_string(),
            local_port: options.from_port,
            remote_port: options.to_port,
            io: Box::new(ours),
        })
    }

    async fn accept(&self) -> Option<TransportSocket> {
        self.sockets.lock().await.recv().await
    }

    async fn send_message(
        &self,
        destination: &str,
        payload: Bytes,
        protocol: u8,
        from_port: u16,
        to_port: u16,
    ) -> Result<bool, TransportError> {
        let messages = match self.routes.endpoints.get(destination) {
            Some(endpoint) => endpoint.messages.clone(),
            None => return Ok(false),
        };
        let message = InboundMessage {
            payload,
            protocol,
            from_port,
            to_port,
        };
        Ok(messages.try_send(message).is_ok())
    }

    async fn recv_message(&self) -> Option<InboundMessage> {
        self.messages.lock().await.recv().await
    }

    async fn close(&self) {
        self.routes.release(&self.destination, self.id);
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.routes.release(&self.destination, self.id);
    }
}

fn short(destination: &str) -> &str {
    destination.get(..12).unwrap_or(destination)
}
