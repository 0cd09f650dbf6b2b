//! Length-prefixed framing for the TCP channel.
//!
//! TCP is a byte stream, so one `write` on the sender does not map to one
//! `read` on the receiver. Every payload is prefixed with its length and
//! [`FrameReader`] reassembles partial and coalesced reads.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::{CodecError, Result};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest payload accepted from a peer (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Prefix a payload with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge { size: payload.len(), max: MAX_FRAME_SIZE });
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Reassembles length-prefixed frames from arbitrary read boundaries.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    max_frame_size: usize,
}

impl FrameReader {
    /// Create a reader whose buffer starts at `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: BytesMut::with_capacity(capacity), max_frame_size: MAX_FRAME_SIZE }
    }

    /// Override the maximum accepted payload size.
    #[must_use]
    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Buffer that socket reads append to.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Append bytes received from the peer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed. An oversized length
    /// prefix is reported once and leaves the buffer untouched; the caller
    /// is expected to drop the connection.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX_SIZE]);
        let size = u32::from_be_bytes(prefix) as usize;

        if size > self.max_frame_size {
            return Err(CodecError::FrameTooLarge { size, max: self.max_frame_size });
        }

        if self.buf.len() < LENGTH_PREFIX_SIZE + size {
            self.buf.reserve(LENGTH_PREFIX_SIZE + size - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(self.buf.split_to(size).freeze()))
    }
}
