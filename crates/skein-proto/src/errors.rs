//! Codec and framing errors.

use thiserror::Error;

/// Result alias for wire-level operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Failures while turning messages into bytes or bytes back into messages.
///
/// None of these are fatal for a receive loop on their own. The exception is
/// [`CodecError::FrameTooLarge`]: once a peer announces an impossible length
/// the byte stream can no longer be resynchronised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The codec could not serialize a message.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The bytes did not decode into the expected message type.
    #[error("decode failed: {0}")]
    Decode(String),

    /// A frame violated the wire layout (bad flag bits, missing control byte).
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A length prefix exceeded the configured maximum.
    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared payload size.
        size: usize,
        /// Maximum accepted payload size.
        max: usize,
    },

    /// The compression hook failed.
    #[error("compression failed: {0}")]
    Compression(String),

    /// The encryption hook failed.
    #[error("encryption failed: {0}")]
    Encryption(String),
}
