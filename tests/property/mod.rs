// tests/property/mod.rs

pub mod codec_test;
pub mod negotiation_test;
