//! Error types for the smart-temp-ble crate.

use thiserror::Error;

use crate::ble::connection::SessionPhase;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No discovered device has the requested identifier.
    #[error("Device not found: {identifier}")]
    DeviceNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// A connection session is already in progress or established.
    #[error("A session with {identifier} is already active")]
    SessionActive {
        /// Identifier of the peripheral owning the active session.
        identifier: String,
    },

    /// The active connection session ended with an error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// The device manager's event loop is no longer running.
    #[error("Device manager event loop has stopped")]
    ChannelClosed,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure decoding a temperature notification payload.
///
/// A disconnected probe is not an error; it decodes to
/// [`TemperatureReading::Absent`](crate::data::TemperatureReading::Absent).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer is shorter than the fixed payload layout.
    #[error("Payload too short: {len} bytes (need at least {required})")]
    TooShort {
        /// Length of the received buffer.
        len: usize,
        /// Minimum length of a valid payload.
        required: usize,
    },
}

/// Terminal error of a connection session.
///
/// Stored inside [`ConnectionState::Failed`](crate::ConnectionState::Failed), so it
/// is cheap to clone and comparable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionError {
    /// The platform could not establish the connection.
    #[error("Connection failed: {reason}")]
    ConnectFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The peripheral does not expose the temperature service.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// The temperature service lacks the notification characteristic.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// No callback arrived within the configured window.
    #[error("Timed out while {phase}")]
    Timeout {
        /// The phase that was waiting.
        phase: SessionPhase,
    },

    /// A platform call made on behalf of the session failed.
    #[error("Bluetooth operation failed: {reason}")]
    Platform {
        /// Description reported by the platform.
        reason: String,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::TooShort {
            len: 4,
            required: 7,
        };
        assert_eq!(
            err.to_string(),
            "Payload too short: 4 bytes (need at least 7)"
        );
    }

    #[test]
    fn test_session_error_converts() {
        let err: Error = SessionError::Timeout {
            phase: SessionPhase::DiscoveringServices,
        }
        .into();
        assert!(matches!(err, Error::Session(SessionError::Timeout { .. })));
        assert_eq!(err.to_string(), "Timed out while discovering services");
    }
}
