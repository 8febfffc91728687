//! Error types for payload decoding in miband-types.

use thiserror::Error;

/// Errors that can occur when decoding payloads received from the band.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in miband-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// Payload is too short for the expected layout.
    #[error("Malformed payload: expected at least {expected} bytes, got {actual}")]
    MalformedPayload {
        /// Minimum number of bytes required.
        expected: usize,
        /// Number of bytes received.
        actual: usize,
    },

    /// Decoded value lies outside its valid range.
    #[error("Value {value} out of range (max {max})")]
    OutOfRange {
        /// The raw decoded value.
        value: u32,
        /// The largest valid value.
        max: u32,
    },
}

impl DecodeError {
    /// Create a malformed payload error.
    pub fn malformed(expected: usize, actual: usize) -> Self {
        Self::MalformedPayload { expected, actual }
    }
}

/// Result type alias using miband-types' DecodeError type.
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// A device address string that cannot identify a peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid device address '{0}'")]
pub struct AddressError(pub String);
