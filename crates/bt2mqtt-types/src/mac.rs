//! Bluetooth MAC addresses and their various serializations.
//!
//! A blind is keyed by its 48-bit address, which shows up in four forms:
//!
//! - canonical: six colon-separated uppercase hex bytes (`AA:BB:CC:DD:EE:FF`)
//! - BlueZ object-path segment: `dev_AA_BB_CC_DD_EE_FF`
//! - MQTT topic segment: `AA_BB_CC_DD_EE_FF`
//! - vendor "encoded" config value: base64 of the raw bytes in reverse order

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// A BLE device address in canonical form.
///
/// Stored as the six raw bytes in transmission order; all string forms are
/// derived on demand. Equality and hashing are byte-wise, so the same device
/// parsed from any serialization compares equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Create a MAC address from raw bytes in transmission order.
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// The raw bytes in transmission order.
    pub const fn bytes(&self) -> [u8; 6] {
        self.0
    }

    /// Decode the vendor's base64 config representation.
    ///
    /// The vendor app exports addresses as base64 of the raw bytes in
    /// *reverse* order; decoding reverses them back.
    pub fn from_encoded(encoded: &str) -> Result<Self, ParseError> {
        let decoded = BASE64
            .decode(encoded.trim())
            .map_err(|e| ParseError::InvalidEncoding(format!("encoded_mac: {e}")))?;
        let mut bytes: [u8; 6] = decoded.try_into().map_err(|v: Vec<u8>| {
            ParseError::InvalidEncoding(format!("encoded_mac: expected 6 bytes, got {}", v.len()))
        })?;
        bytes.reverse();
        Ok(Self(bytes))
    }

    /// The raw bytes in the vendor's reversed order.
    pub fn to_reversed_bytes(&self) -> [u8; 6] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    /// The BlueZ object-path segment for this device
    /// (`dev_AA_BB_CC_DD_EE_FF`).
    pub fn device_id(&self) -> String {
        format!("dev_{}", self.joined('_'))
    }

    /// Parse a BlueZ object-path segment back into an address.
    pub fn from_device_id(id: &str) -> Result<Self, ParseError> {
        let rest = id
            .strip_prefix("dev_")
            .ok_or_else(|| ParseError::InvalidMac(format!("not a device id: {id}")))?;
        rest.replace('_', ":").parse()
    }

    /// The MQTT topic segment for this device (`AA_BB_CC_DD_EE_FF`).
    pub fn topic_segment(&self) -> String {
        self.joined('_')
    }

    fn joined(&self, sep: char) -> String {
        let mut out = String::with_capacity(17);
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(sep);
            }
            out.push_str(&format!("{b:02X}"));
        }
        out
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined(':'))
    }
}

impl FromStr for MacAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(ParseError::InvalidMac(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(ParseError::InvalidMac(s.to_string()));
            }
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| ParseError::InvalidMac(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
