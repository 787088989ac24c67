//! Passkeys for the vendor unlock handshake.
//!
//! A passkey is configured as a hex string (the vendor app exports a base64
//! "encoded" form of the raw bytes). Writing `passkey || 0x01` to the Passkey
//! characteristic requests an unlock; the device echoes `passkey || 0x00`
//! through a notification once the key is accepted.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::ParseError;

/// The number of hex characters in a standard six-byte passkey.
pub const STANDARD_PASSKEY_LEN: usize = 12;

/// A validated vendor passkey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Passkey {
    hex: String,
}

impl Passkey {
    /// Create a passkey from a hex string.
    ///
    /// The string must be non-empty, even-length hex. It is stored
    /// uppercased so echo comparison is case-insensitive.
    pub fn new(hex_str: &str) -> Result<Self, ParseError> {
        let trimmed = hex_str.trim();
        if trimmed.is_empty() || trimmed.len() % 2 != 0 {
            return Err(ParseError::InvalidPasskey(format!(
                "expected even-length hex, got {} chars",
                trimmed.len()
            )));
        }
        if !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseError::InvalidPasskey(
                "contains non-hex characters".to_string(),
            ));
        }
        Ok(Self {
            hex: trimmed.to_ascii_uppercase(),
        })
    }

    /// Decode the vendor's base64 config representation.
    ///
    /// Unlike [`MacAddress::from_encoded`](crate::MacAddress::from_encoded),
    /// passkey bytes are *not* reversed; they are hex-formatted as-is.
    pub fn from_encoded(encoded: &str) -> Result<Self, ParseError> {
        let decoded = BASE64
            .decode(encoded.trim())
            .map_err(|e| ParseError::InvalidEncoding(format!("encoded_passkey: {e}")))?;
        if decoded.is_empty() {
            return Err(ParseError::InvalidEncoding(
                "encoded_passkey: empty".to_string(),
            ));
        }
        Self::new(&hex::encode_upper(decoded))
    }

    /// The passkey as an uppercase hex string.
    pub fn as_hex(&self) -> &str {
        &self.hex
    }

    /// Whether this passkey has the standard 12-character length.
    ///
    /// The write payload for other lengths follows the vendor app but has
    /// never been observed against real hardware; callers should log a
    /// warning before using it.
    pub fn is_standard_length(&self) -> bool {
        self.hex.len() == STANDARD_PASSKEY_LEN
    }

    /// The bytes to write to the Passkey characteristic for an unlock attempt.
    ///
    /// For a 12-character passkey this is the six key bytes followed by
    /// `0x01`. For any other length the vendor app drops the first two hex
    /// characters before appending `0x01`.
    pub fn unlock_payload(&self) -> Vec<u8> {
        let hex_str = if self.is_standard_length() {
            format!("{}01", self.hex)
        } else {
            format!("{}01", &self.hex[2..])
        };
        // Always even-length hex by construction.
        hex::decode(hex_str).expect("unlock payload is valid hex")
    }

    /// Whether a Passkey notification payload is the accepted-key echo
    /// (`passkey || 0x00`).
    pub fn matches_echo(&self, payload: &[u8]) -> bool {
        hex::encode_upper(payload) == format!("{}00", self.hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates_hex() {
        assert!(Passkey::new("000102030405").is_ok());
        assert!(Passkey::new("").is_err());
        assert!(Passkey::new("00010203040").is_err()); // odd length
        assert!(Passkey::new("00010203040G").is_err()); // non-hex
    }

    #[test]
    fn test_unlock_payload_standard_length() {
        let key = Passkey::new("000102030405").unwrap();
        assert!(key.is_standard_length());
        assert_eq!(key.unlock_payload(), vec![0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x01]);
    }

    #[test]
    fn test_unlock_payload_nonstandard_length() {
        // 14 chars: the first two hex chars are dropped before the 0x01 suffix.
        let key = Passkey::new("FF000102030405").unwrap();
        assert!(!key.is_standard_length());
        assert_eq!(key.unlock_payload(), vec![0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x01]);
    }

    #[test]
    fn test_matches_echo() {
        let key = Passkey::new("000102030405").unwrap();
        assert!(key.matches_echo(&[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x00]));
        // Wrong terminator byte.
        assert!(!key.matches_echo(&[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x01]));
        // Wrong key.
        assert!(!key.matches_echo(&[0x0A, 0x01, 0x02, 0x03, 0x04, 0x05, 0x00]));
        // Truncated.
        assert!(!key.matches_echo(&[0x00, 0x01, 0x02]));
    }

    #[test]
    fn test_matches_echo_is_case_insensitive() {
        let key = Passkey::new("aabbccddeeff").unwrap();
        assert!(key.matches_echo(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00]));
    }

    #[test]
    fn test_from_encoded() {
        // base64 of [0x00, 0x01, 0x02, 0x03, 0x04, 0x05]
        let key = Passkey::from_encoded("AAECAwQF").unwrap();
        assert_eq!(key.as_hex(), "000102030405");
    }

    #[test]
    fn test_from_encoded_rejects_garbage() {
        assert!(Passkey::from_encoded("!!!").is_err());
        assert!(Passkey::from_encoded("").is_err());
    }
}
