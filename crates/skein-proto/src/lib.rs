//! Wire vocabulary for the skein networking substrate.
//!
//! A TCP frame is a 4-byte big-endian length prefix followed by the payload
//! produced by a transform chain. The payload is a codec-encoded
//! [`Envelope`], optionally preceded by a one-byte [`FrameFlags`] control byte
//! when both peers agreed on flex framing out of band.
//!
//! ```text
//! ┌────────────────┬──────────────┬───────────────────────────────┐
//! │ length (u32 BE)│ flags (flex) │ codec-encoded Envelope<M>     │
//! └────────────────┴──────────────┴───────────────────────────────┘
//! ```
//!
//! Multicast datagrams skip all of this: one datagram is one codec-encoded
//! message, with no length prefix, no envelope and no flags.
//!
//! The codec itself is treated as an external capability. [`Codec`] picks
//! between CBOR (the default) and JSON; nothing above this crate depends on
//! which one is active.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod envelope;
pub mod errors;
pub mod flags;
pub mod framing;
pub mod message;

pub use codec::Codec;
pub use envelope::{Envelope, RequestId};
pub use errors::{CodecError, Result};
pub use flags::FrameFlags;
pub use framing::{FrameReader, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
pub use message::{ClientMessage, Message, Requestable, ServerMessage};
