// src/core/mod.rs

//! The central module containing the gateway's protocol logic, session
//! machinery and shared state.

pub mod auth;
pub mod datagram_server;
pub mod errors;
pub mod handler;
pub mod keys;
pub mod lifecycle;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod sessions;
pub mod state;

pub use errors::{ResultCode, SamError};
pub use protocol::{CommandLine, Reply};
