//! Flex framing: optional compression and encryption behind a control byte.
//!
//! The algorithms are hook points. [`Passthrough`] is the identity for both,
//! which still exercises the control byte and the ordering rules.

use std::{fmt, sync::Arc};

use skein_proto::{CodecError, FrameFlags, Result};

/// Compression hook.
pub trait Compressor: fmt::Debug + Send + Sync {
    /// Compress a payload.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    /// Reverse [`Compressor::compress`].
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Encryption hook.
pub trait Cipher: fmt::Debug + Send + Sync {
    /// Encrypt a payload.
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
    /// Reverse [`Cipher::encrypt`].
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Identity compressor and cipher.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Compressor for Passthrough {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

impl Cipher for Passthrough {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Which optional transforms a sender applies, and the algorithms for them.
///
/// The receiver honours whatever the control byte says, so `compress` and
/// `encrypt` only affect the sending side. Both ends still need matching
/// algorithms registered.
#[derive(Debug, Clone)]
pub struct FlexOptions {
    /// Compress outgoing payloads.
    pub compress: bool,
    /// Encrypt outgoing payloads.
    pub encrypt: bool,
    /// Compression algorithm.
    pub compressor: Arc<dyn Compressor>,
    /// Encryption algorithm.
    pub cipher: Arc<dyn Cipher>,
}

impl FlexOptions {
    /// Flex framing with the given flags and identity algorithms.
    pub fn new(compress: bool, encrypt: bool) -> Self {
        Self { compress, encrypt, compressor: Arc::new(Passthrough), cipher: Arc::new(Passthrough) }
    }

    /// Replace the compression algorithm.
    #[must_use]
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Replace the encryption algorithm.
    #[must_use]
    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = cipher;
        self
    }

    /// Flags this sender sets.
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_options(self.compress, self.encrypt)
    }

    /// Encrypt, then compress, then prepend the control byte.
    pub fn seal(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut body = payload.to_vec();
        if self.encrypt {
            body = self.cipher.encrypt(&body)?;
        }
        if self.compress {
            body = self.compressor.compress(&body)?;
        }

        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(self.flags().bits());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Read the control byte, then decompress, then decrypt.
    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let (flags, payload) = FrameFlags::split_frame(frame)?;

        let mut body = payload.to_vec();
        if flags.compressed() {
            body = self.compressor.decompress(&body)?;
        }
        if flags.encrypted() {
            body = self.cipher.decrypt(&body)?;
        }
        Ok(body)
    }
}

impl Default for FlexOptions {
    fn default() -> Self {
        Self::new(false, false)
    }
}

/// XOR cipher with a repeating key.
///
/// Obfuscation only. Exists so the encryption hook has a non-identity
/// implementation to exercise.
#[derive(Debug, Clone)]
pub struct XorCipher {
    key: Vec<u8>,
}

impl XorCipher {
    /// Create a cipher. An empty key is rejected.
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(CodecError::Encryption("xor key must not be empty".into()));
        }
        Ok(Self { key })
    }

    fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.iter().zip(self.key.iter().cycle()).map(|(b, k)| b ^ k).collect()
    }
}

impl Cipher for XorCipher {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.apply(data))
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.apply(data))
    }
}
