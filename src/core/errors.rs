// src/core/errors.rs

//! Defines the error types used across the gateway and the result codes they
//! map onto when reported back to a client.

use crate::transport::TransportError;
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use thiserror::Error;

/// The `RESULT=` vocabulary shared by every reply domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Ok,
    #[strum(serialize = "I2P_ERROR")]
    I2pError,
    InvalidKey,
    InvalidId,
    DuplicatedId,
    DuplicatedDest,
    ConnectionRefused,
    CantReachPeer,
    PeerNotFound,
    Timeout,
    InvalidDirection,
    KeyNotFound,
    AlreadyAccepting,
    #[strum(serialize = "NOVERSION")]
    NoVersion,
}

/// Every failure a client connection can run into.
#[derive(Error, Debug)]
pub enum SamError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Malformed command line: {0}")]
    Malformed(String),

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Missing required property {0}")]
    MissingProperty(&'static str),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Declared size {0} is out of range")]
    InvalidSize(usize),

    #[error("Client sent {read} of {declared} declared bytes")]
    PayloadTruncated { declared: usize, read: usize },

    #[error("Line exceeds the maximum length of {0} bytes")]
    LineTooLong(usize),

    #[error("No compatible protocol version")]
    NoVersion,

    #[error("Duplicated id {0}")]
    DuplicatedId(String),

    #[error("Duplicated destination")]
    DuplicatedDest,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid id {0}")]
    InvalidId(String),

    #[error("Session direction does not allow this operation")]
    InvalidDirection,

    #[error("Name not found: {0}")]
    KeyNotFound(String),

    #[error("Already accepting")]
    AlreadyAccepting,

    #[error("Connection refused by peer")]
    ConnectionRefused,

    #[error("Can't reach peer")]
    CantReachPeer,

    #[error("Peer not found")]
    PeerNotFound,

    #[error("Timed out")]
    Timeout,

    #[error("Authentication required")]
    AuthRequired,

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Command not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SamError {
    /// The result code reported to the client for this error.
    pub fn result_code(&self) -> ResultCode {
        match self {
            SamError::NoVersion => ResultCode::NoVersion,
            SamError::DuplicatedId(_) => ResultCode::DuplicatedId,
            SamError::DuplicatedDest => ResultCode::DuplicatedDest,
            SamError::InvalidKey(_) => ResultCode::InvalidKey,
            SamError::InvalidId(_) => ResultCode::InvalidId,
            SamError::InvalidDirection => ResultCode::InvalidDirection,
            SamError::KeyNotFound(_) => ResultCode::KeyNotFound,
            SamError::AlreadyAccepting => ResultCode::AlreadyAccepting,
            SamError::ConnectionRefused => ResultCode::ConnectionRefused,
            SamError::CantReachPeer => ResultCode::CantReachPeer,
            SamError::PeerNotFound => ResultCode::PeerNotFound,
            SamError::Timeout => ResultCode::Timeout,
            _ => ResultCode::I2pError,
        }
    }

    /// Errors after which the command stream can no longer be trusted to be
    /// in sync, so the connection is terminated once the error is reported.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SamError::Io(_)
                | SamError::Malformed(_)
                | SamError::UnknownCommand(_)
                | SamError::MissingProperty(_)
                | SamError::InvalidValue { .. }
                | SamError::InvalidSize(_)
                | SamError::PayloadTruncated { .. }
                | SamError::LineTooLong(_)
                | SamError::NoVersion
                | SamError::AuthRequired
                | SamError::AuthFailed
        )
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
impl Clone for SamError {
    fn clone(&self) -> Self {
        match self {
            SamError::Io(e) => SamError::Io(Arc::clone(e)),
            SamError::Malformed(s) => SamError::Malformed(s.clone()),
            SamError::UnknownCommand(s) => SamError::UnknownCommand(s.clone()),
            SamError::MissingProperty(k) => SamError::MissingProperty(k),
            SamError::InvalidValue { key, value } => SamError::InvalidValue {
                key,
                value: value.clone(),
            },
            SamError::InvalidSize(n) => SamError::InvalidSize(*n),
            SamError::PayloadTruncated { declared, read } => SamError::PayloadTruncated {
                declared: *declared,
                read: *read,
            },
            SamError::LineTooLong(n) => SamError::LineTooLong(*n),
            SamError::NoVersion => SamError::NoVersion,
            SamError::DuplicatedId(s) => SamError::DuplicatedId(s.clone()),
            SamError::DuplicatedDest => SamError::DuplicatedDest,
            SamError::InvalidKey(s) => SamError::InvalidKey(s.clone()),
            SamError::InvalidId(s) => SamError::InvalidId(s.clone()),
            SamError::InvalidDirection => SamError::InvalidDirection,
            SamError::KeyNotFound(s) => SamError::KeyNotFound(s.clone()),
            SamError::AlreadyAccepting => SamError::AlreadyAccepting,
            SamError::ConnectionRefused => SamError::ConnectionRefused,
            SamError::CantReachPeer => SamError::CantReachPeer,
            SamError::PeerNotFound => SamError::PeerNotFound,
            SamError::Timeout => SamError::Timeout,
            SamError::AuthRequired => SamError::AuthRequired,
            SamError::AuthFailed => SamError::AuthFailed,
            SamError::InvalidState(s) => SamError::InvalidState(s.clone()),
            SamError::Transport(s) => SamError::Transport(s.clone()),
            SamError::Internal(s) => SamError::Internal(s.clone()),
        }
    }
}

impl PartialEq for SamError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SamError::Io(e1), SamError::Io(e2)) => e1.kind() == e2.kind(),
            (SamError::Malformed(a), SamError::Malformed(b)) => a == b,
            (SamError::UnknownCommand(a), SamError::UnknownCommand(b)) => a == b,
            (SamError::MissingProperty(a), SamError::MissingProperty(b)) => a == b,
            (SamError::InvalidSize(a), SamError::InvalidSize(b)) => a == b,
            (SamError::DuplicatedId(a), SamError::DuplicatedId(b)) => a == b,
            (SamError::InvalidKey(a), SamError::InvalidKey(b)) => a == b,
            (SamError::InvalidId(a), SamError::InvalidId(b)) => a == b,
            (SamError::KeyNotFound(a), SamError::KeyNotFound(b)) => a == b,
            (SamError::InvalidState(a), SamError::InvalidState(b)) => a == b,
            (SamError::Transport(a), SamError::Transport(b)) => a == b,
            (SamError::Internal(a), SamError::Internal(b)) => a == b,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for SamError {
    fn from(e: std::io::Error) -> Self {
        SamError::Io(Arc::new(e))
    }
}

impl From<std::str::Utf8Error> for SamError {
    fn from(_: std::str::Utf8Error) -> Self {
        SamError::Malformed("line is not valid UTF-8".to_string())
    }
}

impl From<TransportError> for SamError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::InvalidKey(s) => SamError::InvalidKey(s),
            TransportError::ConnectionRefused => SamError::ConnectionRefused,
            TransportError::CantReachPeer => SamError::CantReachPeer,
            TransportError::Timeout => SamError::Timeout,
            TransportError::DuplicateDestination => SamError::DuplicatedDest,
            other => SamError::Transport(other.to_string()),
        }
    }
}
