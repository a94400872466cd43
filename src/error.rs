//! Error types for the ultrasound-probe-ble crate.

use thiserror::Error;

use crate::session::ServiceKind;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No probe with the given name is in the device registry.
    #[error("Probe not found: {name}")]
    NotFound {
        /// The name that was searched for.
        name: String,
    },

    /// A connection attempt is already in progress or established.
    #[error("Connection already in progress")]
    AlreadyConnecting,

    /// Operation requires a connected probe.
    #[error("Probe not connected")]
    NotConnected,

    /// The service has not finished resolving its characteristics.
    #[error("{service} service not ready")]
    NotReady {
        /// The service the operation targeted.
        service: ServiceKind,
    },

    /// An invalid argument was provided.
    #[error("Invalid argument: {name} ({reason})")]
    InvalidArgument {
        /// The name of the argument.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The BLE stack reported a failure.
    #[error("Adapter failure during {operation}: {reason}")]
    AdapterFailure {
        /// The operation that failed.
        operation: String,
        /// Description reported by the adapter.
        reason: String,
    },

    /// The link dropped while connected.
    #[error("Connection lost")]
    LinkLost,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check whether this error is a caller precondition violation.
    ///
    /// Precondition errors never change controller state.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::AlreadyConnecting
                | Self::NotConnected
                | Self::NotReady { .. }
                | Self::InvalidArgument { .. }
        )
    }
}

/// Why a link or a pending operation failed.
///
/// Carried inside events, so unlike [`Error`] it is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FailureReason {
    /// The BLE stack reported an error.
    Adapter {
        /// The operation that failed.
        operation: String,
        /// Description reported by the adapter.
        reason: String,
    },
    /// The link dropped while connected.
    LinkLost,
    /// The link was closed on request before the operation completed.
    Disconnected,
}

impl FailureReason {
    /// Build an adapter failure reason.
    pub fn adapter(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Adapter {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adapter { operation, reason } => write!(f, "{} failed: {}", operation, reason),
            Self::LinkLost => write!(f, "link lost"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

impl From<FailureReason> for Error {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::Adapter { operation, reason } => {
                Error::AdapterFailure { operation, reason }
            }
            FailureReason::LinkLost => Error::LinkLost,
            FailureReason::Disconnected => Error::NotConnected,
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
