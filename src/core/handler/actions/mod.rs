// src/core/handler/actions/mod.rs

// Declare all action modules.
// The router will access them via `actions::module::function`.
pub mod auth;
pub mod connection;
pub mod dest;
pub mod message;
pub mod naming;
pub mod session;
pub mod stream;
