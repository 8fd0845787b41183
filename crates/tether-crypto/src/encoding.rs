//! Binary-to-text encoding for keys and ciphertexts.
//!
//! Everything that crosses a relay, store, or data channel boundary is
//! standard (padded) base64.

use base64::{engine::general_purpose::STANDARD, DecodeError, Engine};

/// Encode bytes as standard base64.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64 text.
pub fn decode(text: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD.decode(text.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_byte_values() {
        let bytes: Vec<u8> = (0..=255u8).collect();
        let text = encode(&bytes);
        assert_eq!(decode(&text).unwrap(), bytes);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(encode(&[]), "");
        assert!(decode("").unwrap().is_empty());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(decode("not base64 at all!").is_err());
    }

    #[test]
    fn test_surrounding_whitespace_tolerated() {
        let text = format!("  {}\n", encode(b"hello"));
        assert_eq!(decode(&text).unwrap(), b"hello");
    }
}
