// src/connection/mod.rs

//! Manages the lifecycle of a single client TCP connection, including command
//! parsing, execution routing, and per-connection state.

mod guard;
mod handler;
mod session;
mod writer;

pub use guard::ConnectionGuard;
pub use handler::ConnectionHandler;
pub use session::{ConnectionInfo, PingSlot, SessionState};
pub use writer::{BoxedWrite, ClientWriter};
