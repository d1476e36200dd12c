// src/core/handler/mod.rs

mod actions;
mod pipeline;

pub mod command_router;
