//! Message-to-bytes codecs.

use serde::{Serialize, de::DeserializeOwned};

use crate::errors::{CodecError, Result};

/// Serialization format used by the base of a transform chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Codec {
    /// CBOR via `ciborium`. Compact and self-describing.
    #[default]
    Cbor,
    /// JSON via `serde_json`. Useful when reading captures by eye.
    Json,
}

impl Codec {
    /// Serialize a value.
    pub fn encode<M: Serialize + ?Sized>(self, message: &M) -> Result<Vec<u8>> {
        match self {
            Self::Cbor => {
                let mut buf = Vec::new();
                ciborium::ser::into_writer(message, &mut buf)
                    .map_err(|e| CodecError::Encode(e.to_string()))?;
                Ok(buf)
            },
            Self::Json => serde_json::to_vec(message).map_err(|e| CodecError::Encode(e.to_string())),
        }
    }

    /// Deserialize a value.
    pub fn decode<M: DeserializeOwned>(self, bytes: &[u8]) -> Result<M> {
        match self {
            Self::Cbor => {
                ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
            },
            Self::Json => serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string())),
        }
    }
}
