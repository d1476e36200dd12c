// src/transport/mod.rs

//! The interface the gateway consumes from the anonymizing transport, plus
//! the naming collaborator.
//!
//! The gateway never touches key material beyond passing keystreams through:
//! identity generation, connection setup and message delivery all live
//! behind these traits.

pub mod encoding;
pub mod memory;

use crate::core::protocol::Props;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use memory::MemoryNetwork;

/// Streaming protocol number.
pub const PROTO_STREAMING: u8 = 6;
/// Repliable datagram protocol number.
pub const PROTO_DATAGRAM: u8 = 17;
/// Default raw datagram protocol number.
pub const PROTO_RAW: u8 = 18;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("connection refused")]
    ConnectionRefused,
    #[error("can't reach peer")]
    CantReachPeer,
    #[error("timed out")]
    Timeout,
    #[error("destination already in use")]
    DuplicateDestination,
    #[error("session closed")]
    Closed,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Other(String),
}

/// Signature types a destination can be generated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureType {
    DsaSha1,
    EcdsaSha256P256,
    EcdsaSha384P384,
    EcdsaSha512P521,
    RsaSha2562048,
    #[default]
    EdDsaSha512Ed25519,
}

impl SignatureType {
    pub fn code(&self) -> u16 {
        match self {
            SignatureType::DsaSha1 => 0,
            SignatureType::EcdsaSha256P256 => 1,
            SignatureType::EcdsaSha384P384 => 2,
            SignatureType::EcdsaSha512P521 => 3,
            SignatureType::RsaSha2562048 => 4,
            SignatureType::EdDsaSha512Ed25519 => 7,
        }
    }

    /// Accepts either the numeric code or the canonical name.
    pub fn parse(raw: &str) -> Option<Self> {
        let all = [
            (SignatureType::DsaSha1, "DSA_SHA1"),
            (SignatureType::EcdsaSha256P256, "ECDSA_SHA256_P256"),
            (SignatureType::EcdsaSha384P384, "ECDSA_SHA384_P384"),
            (SignatureType::EcdsaSha512P521, "ECDSA_SHA512_P521"),
            (SignatureType::RsaSha2562048, "RSA_SHA256_2048"),
            (SignatureType::EdDsaSha512Ed25519, "EdDSA_SHA512_Ed25519"),
        ];
        let raw = raw.trim();
        all.into_iter()
            .find(|(t, name)| name.eq_ignore_ascii_case(raw) || t.code().to_string() == raw)
            .map(|(t, _)| t)
    }
}

/// A freshly generated identity.
#[derive(Clone)]
pub struct KeyPair {
    /// The public destination.
    pub public: String,
    /// The private keystream (destination followed by private keys).
    pub private: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("private", &"<redacted>")
            .finish()
    }
}

/// Byte I/O of a connection-oriented transport socket.
pub trait SocketIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> SocketIo for T {}

/// An outbound or accepted connection-oriented socket.
pub struct TransportSocket {
    /// The remote destination.
    pub peer: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub io: Box<dyn SocketIo>,
}

impl fmt::Debug for TransportSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSocket")
            .field("peer", &self.peer)
            .field("local_port", &self.local_port)
            .field("remote_port", &self.remote_port)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    pub from_port: u16,
    pub to_port: u16,
    pub timeout: Option<Duration>,
}

/// A message delivered to a transport session.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub payload: Bytes,
    pub protocol: u8,
    pub from_port: u16,
    pub to_port: u16,
}

/// Creates identities and sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn generate_keys(&self, sig: SignatureType) -> Result<KeyPair, TransportError>;

    /// Extracts the public destination from a private keystream.
    fn destination_of(&self, keystream: &str) -> Result<String, TransportError>;

    fn validate_destination(&self, destination: &str) -> Result<(), TransportError>;

    async fn create_session(
        &self,
        keystream: &str,
        options: &Props,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}

/// A live binding between a private key and the network.
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn destination(&self) -> &str;

    async fn connect(
        &self,
        destination: &str,
        options: ConnectOptions,
    ) -> Result<TransportSocket, TransportError>;

    /// Waits for the next inbound socket. `None` once the session is gone.
    async fn accept(&self) -> Option<TransportSocket>;

    /// Returns whether the transport accepted the message for delivery.
    async fn send_message(
        &self,
        destination: &str,
        payload: Bytes,
        protocol: u8,
        from_port: u16,
        to_port: u16,
    ) -> Result<bool, TransportError>;

    /// Waits for the next inbound message. `None` means disconnected.
    async fn recv_message(&self) -> Option<InboundMessage>;

    async fn close(&self);
}

/// Resolves host names to destinations.
#[async_trait]
pub trait NamingService: Send + Sync {
    async fn lookup(&self, name: &str) -> Option<String>;
}
