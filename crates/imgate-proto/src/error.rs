//! Error types for the imgate-proto crate.

use thiserror::Error;

/// Errors raised while decoding frames or typed payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The raw frame exceeds the configured maximum length.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// The frame ended before a required field was complete.
    #[error("truncated frame: needed {needed} more bytes for {field}")]
    Truncated {
        /// Field being read when input ran out.
        field: &'static str,
        /// Bytes still required.
        needed: usize,
    },

    /// The declared packet type is not part of the protocol.
    #[error("unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    /// Reserved flag bits were set.
    #[error("invalid flags: {0:#010b}")]
    InvalidFlags(u8),

    /// The declared payload length disagrees with the bytes present.
    #[error("payload length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch {
        /// Length from the header.
        declared: usize,
        /// Bytes remaining in the frame.
        actual: usize,
    },

    /// A text field was not valid UTF-8.
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    /// A typed payload violated its schema.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
