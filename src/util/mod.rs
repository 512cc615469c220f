//! Small shared helpers.

pub mod hex;

pub use hex::{decode_hex, encode_hex, HexError};
