// src/core/protocol/mod.rs

pub mod line;
pub mod props;
pub mod reply;
pub mod version;

pub use line::{CommandLine, MAX_LINE_LENGTH, SamCodec};
pub use props::Props;
pub use reply::Reply;
pub use version::{Capabilities, Generation, SendPolicy, Version};
