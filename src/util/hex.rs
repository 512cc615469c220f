//! Hex encoding/decoding helpers.
//!
//! Thin wrappers over the `hex` crate used for DV-keys, explanation traces,
//! key material and test frames. Whitespace and the `|`/`_` grouping
//! characters that appear in simulator scripts are accepted on input.

use thiserror::Error;

/// Errors from hex string decoding.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HexError {
    #[error("odd number of hex characters: {0}")]
    OddLength(usize),

    #[error("invalid hex string: {0}")]
    Invalid(String),
}

/// Encode bytes as a lowercase hex string.
pub fn encode_hex(data: &[u8]) -> String {
    hex::encode(data)
}

/// Encode bytes as an uppercase hex string.
///
/// DV-keys use uppercase so driver lookups like `"04FF07"` read the same as
/// the EN 13757 tables they come from.
pub fn encode_hex_upper(data: &[u8]) -> String {
    hex::encode_upper(data)
}

/// Decode a hex string, ignoring embedded whitespace and `|`/`_` grouping.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, HexError> {
    let cleaned: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '|' && *c != '_')
        .collect();

    if cleaned.len() % 2 != 0 {
        return Err(HexError::OddLength(cleaned.len()));
    }

    hex::decode(&cleaned).map_err(|e| HexError::Invalid(e.to_string()))
}
