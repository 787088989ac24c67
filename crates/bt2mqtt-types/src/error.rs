//! Error types for data parsing in bt2mqtt-types.

use thiserror::Error;

/// Errors that can occur when parsing smart-blind protocol data.
///
/// This error type is transport-agnostic and does not include
/// bus-specific errors (those belong in bt2mqtt-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Failed to parse data due to insufficient bytes.
    #[error("Insufficient bytes: expected {expected}, got {actual}")]
    InsufficientBytes {
        /// Expected number of bytes.
        expected: usize,
        /// Actual number of bytes received.
        actual: usize,
    },

    /// A MAC address that is not six colon-separated hex bytes.
    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    /// A passkey that is not an even-length hex string.
    #[error("Invalid passkey: {0}")]
    InvalidPasskey(String),

    /// A base64 "encoded" config value that did not decode.
    #[error("Invalid encoded value: {0}")]
    InvalidEncoding(String),

    /// Invalid or unrecognized value encountered during parsing.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

impl ParseError {
    /// Create an `InvalidValue` error with a descriptive message.
    #[must_use]
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::InvalidValue(message.into())
    }
}

/// Result type alias using bt2mqtt-types' [`ParseError`] type.
pub type ParseResult<T> = core::result::Result<T, ParseError>;
