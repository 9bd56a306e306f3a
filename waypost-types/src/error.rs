//! Error types for the waypost wire format.

use thiserror::Error;

/// Errors produced while decoding waypost frames.
///
/// Every variant means "malformed message": the relay drops the frame and
/// sends nothing back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Buffer shorter than the layout requires
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum number of bytes for this layout
        expected: usize,
        /// Bytes actually present
        actual: usize,
    },

    /// Low nibble of the type byte is not a known subtype
    #[error("invalid message type: {0:#04x}")]
    InvalidMessageType(u8),

    /// Fixed-width field has the wrong length
    #[error("invalid {field} length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Field name
        field: &'static str,
        /// Required width
        expected: usize,
        /// Width supplied
        actual: usize,
    },

    /// Hex text could not be decoded
    #[error("invalid hex: {0}")]
    InvalidHex(String),
}
