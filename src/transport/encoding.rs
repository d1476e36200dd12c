// src/transport/encoding.rs

//! The network's base64 flavour, which swaps `+/` for `-~`.

use base64::alphabet::Alphabet;
use base64::engine::{GeneralPurpose, general_purpose::PAD};
use base64::Engine;

const ALPHABET: Alphabet =
    match Alphabet::new("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~") {
        Ok(a) => a,
        Err(_) => panic!("invalid base64 alphabet"),
    };

pub const ENGINE: GeneralPurpose = GeneralPurpose::new(&ALPHABET, PAD);

pub fn encode(bytes: &[u8]) -> String {
    ENGINE.encode(bytes)
}

pub fn decode(text: &str) -> Option<Vec<u8>> {
    ENGINE.decode(text.trim()).ok()
}
