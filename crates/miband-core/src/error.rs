//! Error types for miband-core.
//!
//! Errors come in two layers:
//!
//! - [`LinkError`]: failures of the radio link itself (connect, read,
//!   discovery, dropped connections). These are what retry budgets count.
//! - [`Error`]: everything a session operation can fail with, including
//!   payload decode failures and exhausted budgets.
//!
//! # Retry vs Give Up
//!
//! | Error | Strategy | Rationale |
//! |-------|----------|-----------|
//! | [`LinkError::Timeout`] | Retry | Transient radio congestion |
//! | [`LinkError::NotConnected`] | Restart the cycle | Link dropped |
//! | [`LinkError::Bluetooth`] | Retry | Often transient |
//! | [`LinkError::DeviceNotFound`] | Retry unless no adapter | Band asleep or out of range |
//! | [`LinkError::CharacteristicNotFound`] | Do not retry | Firmware variant |
//! | [`Error::Decode`] | Do not retry | Suppresses one reading only |
//! | [`Error::ConnectExhausted`] | Do not retry | Next scheduled poll retries |
//! | [`Error::Cancelled`] | Do not retry | Host shutdown |

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use miband_types::DecodeError;

/// Failures of the radio link.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LinkError {
    /// Bluetooth Low Energy stack error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Operation attempted while not connected, or the link dropped mid-call.
    #[error("Not connected to device")]
    NotConnected,

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Attribute discovery failed or returned an unusable table.
    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    /// Connection could not be established.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer could not be located.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceNotFoundReason),

    /// Required characteristic not present in the attribute table.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: Uuid,
    },
}

/// Reason why a device was not found.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeviceNotFoundReason {
    /// Device with the specified address not seen during scanning.
    NotFound { identifier: String },
    /// No Bluetooth adapter available.
    NoAdapter,
}

impl std::fmt::Display for DeviceNotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { identifier } => write!(f, "device '{}' not found", identifier),
            Self::NoAdapter => write!(f, "no Bluetooth adapter available"),
        }
    }
}

impl LinkError {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(DeviceNotFoundReason::NotFound {
            identifier: identifier.into(),
        })
    }

    /// Whether this error means the link is gone (as opposed to one
    /// operation failing on a live link).
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::NotConnected | Self::ConnectionFailed(_))
    }
}

/// Errors returned by session-level operations.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Radio link failure.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Payload received from the band could not be decoded.
    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// Every connect attempt in the budget failed.
    #[error("Failed to connect after {attempts} attempt(s): {source}")]
    ConnectExhausted {
        /// Number of connect attempts made.
        attempts: u32,
        /// The last connect error.
        #[source]
        source: LinkError,
    },

    /// The session was cancelled by the host.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Result type alias using miband-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
