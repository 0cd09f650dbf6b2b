//! Flex framing control byte.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::errors::{CodecError, Result};

bitflags! {
    /// Optional transforms applied to a flex frame's payload.
    ///
    /// Encoding applies encryption first and compression second, so decoding
    /// must decompress before it decrypts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FrameFlags: u8 {
        /// Payload is compressed.
        const COMPRESSED = 0b0000_0001;
        /// Payload is encrypted.
        const ENCRYPTED = 0b0000_0010;
    }
}

impl FrameFlags {
    /// Build flags from the two independent booleans.
    pub fn from_options(compressed: bool, encrypted: bool) -> Self {
        let mut flags = Self::empty();
        flags.set(Self::COMPRESSED, compressed);
        flags.set(Self::ENCRYPTED, encrypted);
        flags
    }

    /// Parse a control byte, rejecting unknown bits.
    pub fn from_control_byte(byte: u8) -> Result<Self> {
        Self::from_bits(byte).ok_or_else(|| {
            CodecError::MalformedFrame(format!("unknown flex control bits {byte:#010b}"))
        })
    }

    /// Split a flex frame into its control byte and payload.
    pub fn split_frame(frame: &[u8]) -> Result<(Self, &[u8])> {
        let (&control, payload) = frame
            .split_first()
            .ok_or_else(|| CodecError::MalformedFrame("flex frame has no control byte".into()))?;
        Ok((Self::from_control_byte(control)?, payload))
    }

    /// Whether the compressed bit is set.
    pub fn compressed(self) -> bool {
        self.contains(Self::COMPRESSED)
    }

    /// Whether the encrypted bit is set.
    pub fn encrypted(self) -> bool {
        self.contains(Self::ENCRYPTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_options_set_both_bits() {
        let flags = FrameFlags::from_options(true, true);
        assert_eq!(flags.bits(), 0b11);
        assert!(flags.compressed());
        assert!(flags.encrypted());
    }

    #[test]
    fn bits_are_independent() {
        assert_eq!(FrameFlags::from_options(true, false).bits(), 0b01);
        assert_eq!(FrameFlags::from_options(false, true).bits(), 0b10);
        assert_eq!(FrameFlags::from_options(false, false).bits(), 0);
    }

    #[test]
    fn unknown_bits_are_rejected() {
        let result = FrameFlags::from_control_byte(0b100);
        assert!(matches!(result, Err(CodecError::MalformedFrame(_))));
    }

    #[test]
    fn empty_frame_has_no_control_byte() {
        assert!(matches!(FrameFlags::split_frame(&[]), Err(CodecError::MalformedFrame(_))));
    }

    #[test]
    fn split_frame_separates_payload() {
        let (flags, payload) = FrameFlags::split_frame(&[0b10, 7, 8]).unwrap();
        assert_eq!(flags, FrameFlags::ENCRYPTED);
        assert_eq!(payload, &[7, 8]);
    }
}
