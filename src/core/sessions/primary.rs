// src/core/sessions/primary.rs

//! A primary session holds one transport binding and shares it between
//! sub-sessions added with `SESSION ADD`.
//!
//! Inbound traffic is routed by `(protocol, listen port)`: an exact port match
//! wins, then a sub-session listening on port 0, otherwise the traffic is
//! dropped.

use super::{MessageSession, Owner};
use crate::core::lifecycle::LifecycleGroup;
use crate::core::{metrics, SamError};
use crate::transport::{PROTO_STREAMING, TransportSession, TransportSocket};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Where a sub-session wants its inbound traffic.
#[derive(Clone)]
pub enum SubTarget {
    /// A stream sub-session's inbound socket queue.
    Stream(mpsc::Sender<TransportSocket>),
    Message(Arc<MessageSession>),
}

#[derive(Clone)]
struct SubSession {
    protocol: u8,
    port: u16,
    target: SubTarget,
}

pub struct PrimarySession {
    nickname: String,
    transport: Arc<dyn TransportSession>,
    owner: Owner,
    subs: Mutex<HashMap<String, SubSession>>,
}

impl PrimarySession {
    pub fn new(nickname: String, transport: Arc<dyn TransportSession>, owner: Owner) -> Arc<Self> {
        Arc::new(Self {
            nickname,
            transport,
            owner,
            subs: Mutex::new(HashMap::new()),
        })
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn destination(&self) -> &str {
        self.transport.destination()
    }

    /// The shared binding sub-sessions are built on.
    pub fn transport(&self) -> Arc<dyn TransportSession> {
        self.transport.clone()
    }

    /// Starts the socket acceptor and message pump that feed sub-sessions.
    pub fn start(self: &Arc<Self>, group: &LifecycleGroup) {
        let session = self.clone();
        group.spawn(async move {
            loop {
                match session.transport.accept().await {
                    Some(socket) => session.route_socket(socket).await,
                    None => {
                        session.owner.transport_lost(&session.nickname).await;
                        break;
                    }
                }
            }
        });

        let session = self.clone();
        group.spawn(async move {
            loop {
                match session.transport.recv_message().await {
                    Some(message) => {
                        let target = session.lookup(message.protocol, message.to_port);
                        match target {
                            Some(SubTarget::Message(sub)) => sub.deliver(message).await,
                            _ => {
                                debug!(
                                    "Primary '{}': no sub-session for protocol {} port {}.",
                                    session.nickname, message.protocol, message.to_port
                                );
                                metrics::DATAGRAMS_DROPPED_TOTAL.inc();
                            }
                        }
                    }
                    None => {
                        session.owner.transport_lost(&session.nickname).await;
                        break;
                    }
                }
            }
        });
    }

    async fn route_socket(&self, socket: TransportSocket) {
        match self.lookup(PROTO_STREAMING, socket.local_port) {
            Some(SubTarget::Stream(queue)) => {
                if queue.send(socket).await.is_err() {
                    debug!("Primary '{}': stream sub-session went away.", self.nickname);
                }
            }
            _ => warn!(
                "Primary '{}': no stream sub-session on port {}; dropping inbound stream.",
                self.nickname, socket.local_port
            ),
        }
    }

    fn lookup(&self, protocol: u8, port: u16) -> Option<SubTarget> {
        let subs = self.subs.lock();
        let find = |port: u16| {
            subs.values()
                .find(|s| s.protocol == protocol && s.port == port)
                .map(|s| s.target.clone())
        };
        find(port).or_else(|| find(0))
    }

    /// Registers a sub-session's route. Two sub-sessions may not listen on the
    /// same protocol and port.
    pub fn add(&self, nickname: &str, protocol: u8, port: u16, target: SubTarget) -> Result<(), SamError> {
        let mut subs = self.subs.lock();
        if subs.values().any(|s| s.protocol == protocol && s.port == port) {
            return Err(SamError::InvalidState(format!(
                "another sub-session already listens on protocol {protocol} port {port}"
            )));
        }
        subs.insert(
            nickname.to_string(),
            SubSession {
                protocol,
                port,
                target,
            },
        );
        info!(
            "Primary '{}': sub-session '{nickname}' listens on protocol {protocol} port {port}.",
            self.nickname
        );
        Ok(())
    }

    pub fn remove(&self, nickname: &str) -> bool {
        self.subs.lock().remove(nickname).is_some()
    }

    pub fn sub_count(&self) -> usize {
        self.subs.lock().len()
    }

    pub async fn close(&self) {
        self.subs.lock().clear();
        self.transport.close().await;
    }
}
