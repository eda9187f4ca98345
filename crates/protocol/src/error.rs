//! Protocol error types

use thiserror::Error;

/// Why a frame header could not be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Malformation {
    /// Declared body length is above the configured maximum
    #[error("declared length {declared} exceeds maximum {max}")]
    LengthExceedsMax { declared: usize, max: usize },

    /// Declared body length cannot hold a sequence id and opcode
    #[error("declared length {declared} is below minimum {min}")]
    LengthBelowMinimum { declared: usize, min: usize },

    /// A partial frame stopped receiving bytes and was abandoned
    #[error("incomplete frame abandoned with {buffered} bytes buffered")]
    Incomplete { buffered: usize },
}

/// Protocol-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Trailing checksum does not match the frame contents
    #[error("Checksum mismatch: frame carries {expected:#x}, computed {computed:#x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    /// Frame header is unusable; the decoder resynchronises at the next start marker
    #[error("Malformed frame: {0}")]
    MalformedFrame(Malformation),

    /// Outbound frame does not fit the configured limits
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Incompatible protocol version detected
    #[error(
        "Incompatible protocol version: {major}.{minor} (expected {expected_major}.{expected_minor})"
    )]
    IncompatibleVersion {
        major: u8,
        minor: u8,
        expected_major: u8,
        expected_minor: u8,
    },

    /// Version payload too short
    #[error("Invalid version payload: expected 2 bytes, got {0}")]
    InvalidVersionPayload(usize),

    /// Frame-length width other than 1, 2 or 4 bytes
    #[error("Unsupported length width: {0} (expected 1, 2 or 4)")]
    UnsupportedLengthWidth(u8),

    /// Unknown checksum algorithm name
    #[error("Unknown checksum algorithm: {0}")]
    UnknownChecksum(String),
}

impl ProtocolError {
    /// Framing anomalies are recovered locally by resynchronising
    pub fn is_framing_anomaly(&self) -> bool {
        matches!(
            self,
            ProtocolError::ChecksumMismatch { .. } | ProtocolError::MalformedFrame(_)
        )
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
