//! Error types for bt2mqtt-core.
//!
//! # Recovery strategies
//!
//! | Error | Strategy |
//! |-------|----------|
//! | [`Error::NotConnected`] | Drop the queued command; the reconnect policy re-establishes the session |
//! | [`Error::Bus`] | Retry through the command queue up to the command's retry cap |
//! | [`Error::NotInitialized`] | Do not retry; the bus was used before `connect()` or after `disconnect()` |
//! | [`Error::CharacteristicMissing`] | Do not retry; log and skip the operation |
//! | [`Error::InvalidInput`] | Do not retry; reject the caller's value |
//! | [`Error::Timeout`] | Log and continue; discovery keeps running in the background |

use std::time::Duration;

use thiserror::Error;

use bt2mqtt_types::CharacteristicSlot;

/// Errors that can occur when talking to the Bluetooth daemon.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The bus was used before `connect()` completed or after `disconnect()`.
    #[error("Bus not initialized")]
    NotInitialized,

    /// A bus call failed because the BLE transport is gone.
    ///
    /// Produced by [`Error::from_bus`] when the daemon reports
    /// "Not connected"; the command queue drops the in-flight command and
    /// leaves recovery to the reconnect policy.
    #[error("Not connected")]
    NotConnected,

    /// An operation was attempted on a characteristic slot that was never
    /// bound on this connection.
    #[error("Characteristic not bound: {slot}")]
    CharacteristicMissing {
        /// The slot that was expected.
        slot: CharacteristicSlot,
    },

    /// A caller-supplied value was rejected.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// The component was already disposed.
    #[error("Component disposed")]
    Disposed,

    /// Failed to parse data received from a characteristic.
    #[error(transparent)]
    Parse(#[from] bt2mqtt_types::ParseError),

    /// Any other D-Bus failure.
    #[error("Bus error: {0}")]
    Bus(zbus::Error),
}

impl Error {
    /// Classify a raw bus error.
    ///
    /// The daemon signals transport loss with an error whose message contains
    /// "Not connected"; everything else propagates unchanged.
    pub fn from_bus(err: zbus::Error) -> Self {
        if err.to_string().contains("Not connected") {
            Error::NotConnected
        } else {
            Error::Bus(err)
        }
    }

    /// Create an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Whether this error indicates the BLE transport is gone.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Error::NotConnected)
    }
}

/// Result type alias using bt2mqtt-core's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bus_classifies_not_connected() {
        let err = Error::from_bus(zbus::Error::Failure("Not connected".to_string()));
        assert!(err.is_not_connected());

        let err = Error::from_bus(zbus::Error::Failure(
            "br-connection-canceled: Not connected".to_string(),
        ));
        assert!(err.is_not_connected());
    }

    #[test]
    fn test_from_bus_passes_other_errors() {
        let err = Error::from_bus(zbus::Error::Failure("Device busy".to_string()));
        assert!(!err.is_not_connected());
        assert!(matches!(err, Error::Bus(_)));
    }

    #[test]
    fn test_display() {
        let err = Error::CharacteristicMissing {
            slot: CharacteristicSlot::Angle,
        };
        assert_eq!(err.to_string(), "Characteristic not bound: angle");

        let err = Error::timeout("discovery", Duration::from_secs(60));
        assert!(err.to_string().contains("discovery"));
        assert!(err.to_string().contains("60s"));
    }
}
