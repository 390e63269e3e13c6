//! Error types for the ble-link crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The specified peripheral was never discovered (or was forgotten).
    #[error("Peripheral not found: {identifier}")]
    PeripheralNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// Operation requires a ready connection but there is none.
    #[error("Peripheral not connected")]
    NotConnected,

    /// A connect attempt is already in flight or a connection is established.
    #[error("Connection already in progress")]
    ConnectionInProgress,

    /// The command is not valid in the current connection state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state the manager was in.
        state: crate::ble::connection::ConnectionState,
    },

    /// The transport reported a failure.
    #[error(transparent)]
    Link(#[from] LinkFailure),

    /// The requested operation is not supported by the characteristic.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// Characteristic not found among the discovered services.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Configuration rejected by validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The lifecycle actor has shut down.
    #[error("Link manager stopped")]
    ManagerStopped,
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Transport failure reported to observers.
///
/// Unlike [`Error`] this is cheap to clone, so it can ride along on
/// broadcast events. Reasons are the transport's own description.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LinkFailure {
    /// Scanning could not be started or was aborted by the platform.
    #[error("Scan failed with code {code}")]
    Scan {
        /// Platform error code, [`SCAN_CODE_UNSPECIFIED`] when none was given.
        code: i32,
    },

    /// The connection attempt did not succeed.
    #[error("Connection failed: {reason}")]
    Connect {
        /// Description of why the connection failed.
        reason: String,
    },

    /// Service discovery failed after connecting.
    #[error("Service discovery failed: {reason}")]
    Discovery {
        /// Description of why discovery failed.
        reason: String,
    },

    /// Reading a characteristic failed.
    #[error("Read of {uuid} failed: {reason}")]
    Read {
        /// Characteristic that was read.
        uuid: uuid::Uuid,
        /// Description of the failure.
        reason: String,
    },

    /// Writing a characteristic failed.
    #[error("Write to {uuid} failed: {reason}")]
    Write {
        /// Characteristic that was written.
        uuid: uuid::Uuid,
        /// Description of the failure.
        reason: String,
    },

    /// Enabling notifications failed.
    #[error("Subscribe to {uuid} failed: {reason}")]
    Subscribe {
        /// Characteristic that was subscribed.
        uuid: uuid::Uuid,
        /// Description of the failure.
        reason: String,
    },

    /// The link dropped without the caller asking for it.
    #[error("Disconnected unexpectedly: {reason}")]
    UnsolicitedDisconnect {
        /// Description reported by the transport.
        reason: String,
    },
}

/// Scan failure code used when the transport gives no platform code.
pub const SCAN_CODE_UNSPECIFIED: i32 = 0;

impl Error {
    /// Scan failure code carried by this error, if it came from a scan.
    pub fn scan_code(&self) -> i32 {
        match self {
            Self::Link(LinkFailure::Scan { code }) => *code,
            _ => SCAN_CODE_UNSPECIFIED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::connection::ConnectionState;

    #[test]
    fn test_invalid_state_message() {
        let err = Error::InvalidState {
            operation: "connect",
            state: ConnectionState::Idle,
        };
        assert_eq!(err.to_string(), "Cannot connect while Idle");
    }

    #[test]
    fn test_link_failure_is_transparent() {
        let err: Error = LinkFailure::Connect {
            reason: "timeout".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "Connection failed: timeout");
    }

    #[test]
    fn test_scan_code() {
        assert_eq!(Error::from(LinkFailure::Scan { code: 2 }).scan_code(), 2);
        assert_eq!(Error::NotConnected.scan_code(), SCAN_CODE_UNSPECIFIED);
    }
}
