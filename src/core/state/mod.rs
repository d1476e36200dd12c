// src/core/state/mod.rs

//! Defines the central `GatewayState` struct and the per-client bookkeeping
//! it carries.

mod client;
mod core;

pub use client::*;
pub use core::GatewayState;
