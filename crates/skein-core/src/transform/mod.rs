//! Transform chain between messages and wire payloads.
//!
//! A chain is a nest of layers around a base codec. Each layer
//! wraps exactly one inner layer and adds one cross-cutting behaviour
//! without changing the wire contract of the layers below it.
//!
//! ```text
//! encode:  message ─► Codec ─► Flex ─► Faults ─► Metered ─► Logged ─► bytes
//! decode:  bytes ─► Logged ─► Metered ─► Faults ─► Flex ─► Codec ─► message
//! ```
//!
//! The order above is only an example. Layers run in construction order:
//! the last `with_*` call is the outermost layer.
//!
//! # Drops
//!
//! A layer may end decoding early with `Ok(None)`. To the receive loop this
//! is identical to "nothing arrived", which is how drop simulation stays
//! invisible to subscribers while traffic counters still see the bytes.

mod fault;
mod flex;
mod stats;

use std::{any::type_name, sync::Arc};

use bytes::Bytes;
pub use fault::FaultInjection;
pub use flex::{Cipher, Compressor, FlexOptions, Passthrough, XorCipher};
use serde::{Serialize, de::DeserializeOwned};
use skein_proto::{Codec, Result};
pub use stats::{TrafficSnapshot, TrafficStats};
use tracing::debug;

/// One layer of a transform chain.
#[derive(Debug, Clone)]
pub(crate) enum Transform {
    /// Base layer: plain codec encode/decode.
    Codec(Codec),
    /// Control-byte framing with optional compression and encryption.
    Flex {
        /// Wrapped layer.
        inner: Box<Transform>,
        /// Flags and algorithms.
        options: FlexOptions,
    },
    /// Inbound lag and drop simulation.
    Faults {
        /// Wrapped layer.
        inner: Box<Transform>,
        /// Shared, adjustable settings.
        faults: Arc<FaultInjection>,
    },
    /// Traffic accounting.
    Metered {
        /// Wrapped layer.
        inner: Box<Transform>,
        /// Shared counters.
        stats: Arc<TrafficStats>,
    },
    /// Debug log records per message.
    Logged {
        /// Wrapped layer.
        inner: Box<Transform>,
    },
}

impl Transform {
    fn inner(&self) -> Option<&Self> {
        match self {
            Self::Codec(_) => None,
            Self::Flex { inner, .. }
            | Self::Faults { inner, .. }
            | Self::Metered { inner, .. }
            | Self::Logged { inner } => Some(inner),
        }
    }

    /// Layers from outermost to the base codec.
    fn layers(&self) -> impl Iterator<Item = &Self> {
        std::iter::successors(Some(self), |layer| layer.inner())
    }
}

/// A composed transform chain.
#[derive(Debug, Clone)]
pub struct TransformChain {
    root: Transform,
}

impl TransformChain {
    /// Chain with only the base codec.
    pub fn new(codec: Codec) -> Self {
        Self { root: Transform::Codec(codec) }
    }

    /// Debug chain: logging around metering around fault injection.
    ///
    /// Returns the chain with the fault and traffic handles so callers can
    /// steer and observe it.
    pub fn instrumented(codec: Codec) -> (Self, Arc<FaultInjection>, Arc<TrafficStats>) {
        let faults = Arc::new(FaultInjection::new());
        let stats = Arc::new(TrafficStats::new());
        let chain = Self::new(codec)
            .with_faults(Arc::clone(&faults))
            .with_traffic_stats(Arc::clone(&stats))
            .with_logging();
        (chain, faults, stats)
    }

    fn wrap(self, layer: impl FnOnce(Box<Transform>) -> Transform) -> Self {
        Self { root: layer(Box::new(self.root)) }
    }

    /// Add flex framing around the current chain.
    #[must_use]
    pub fn with_flex(self, options: FlexOptions) -> Self {
        self.wrap(|inner| Transform::Flex { inner, options })
    }

    /// Add fault injection around the current chain.
    #[must_use]
    pub fn with_faults(self, faults: Arc<FaultInjection>) -> Self {
        self.wrap(|inner| Transform::Faults { inner, faults })
    }

    /// Add traffic accounting around the current chain.
    #[must_use]
    pub fn with_traffic_stats(self, stats: Arc<TrafficStats>) -> Self {
        self.wrap(|inner| Transform::Metered { inner, stats })
    }

    /// Add debug logging around the current chain.
    #[must_use]
    pub fn with_logging(self) -> Self {
        self.wrap(|inner| Transform::Logged { inner })
    }

    /// Codec at the base of the chain.
    pub fn codec(&self) -> Codec {
        self.root
            .layers()
            .find_map(|layer| match layer {
                Transform::Codec(codec) => Some(*codec),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Whether any layer applies flex framing.
    pub fn is_flex(&self) -> bool {
        self.root.layers().any(|layer| matches!(layer, Transform::Flex { .. }))
    }

    /// Encode a message into a wire payload.
    ///
    /// Runs the codec first, then every wrapping layer from the inside out.
    pub fn encode<M: Serialize>(&self, message: &M) -> Result<Bytes> {
        let layers: Vec<&Transform> = self.root.layers().collect();

        let mut bytes = Vec::new();
        for layer in layers.into_iter().rev() {
            match layer {
                Transform::Codec(codec) => bytes = codec.encode(message)?,
                Transform::Flex { options, .. } => bytes = options.seal(&bytes)?,
                Transform::Faults { .. } => {},
                Transform::Metered { stats, .. } => stats.record_sent(bytes.len()),
                Transform::Logged { .. } => {
                    debug!(message = type_name::<M>(), bytes = bytes.len(), "sending message");
                },
            }
        }
        Ok(Bytes::from(bytes))
    }

    /// Decode a wire payload into a message.
    ///
    /// Walks the layers from the outside in. `Ok(None)` means a layer
    /// swallowed the frame on purpose. A lag fault suspends the caller for
    /// the configured duration before decoding continues, which stalls the
    /// receiving connection's loop exactly like a slow link would.
    pub async fn decode<M: DeserializeOwned>(&self, bytes: Bytes) -> Result<Option<M>> {
        let mut payload = bytes;
        let mut logged = false;

        for layer in self.root.layers() {
            match layer {
                Transform::Codec(codec) => {
                    let message = codec.decode(&payload)?;
                    if logged {
                        debug!(message = type_name::<M>(), "received message");
                    }
                    return Ok(Some(message));
                },
                Transform::Flex { options, .. } => payload = Bytes::from(options.open(&payload)?),
                Transform::Faults { faults, .. } => {
                    if let Some(lag) = faults.lag() {
                        tokio::time::sleep(lag).await;
                    }
                    if faults.should_drop() {
                        debug!(bytes = payload.len(), "dropping inbound frame");
                        return Ok(None);
                    }
                },
                Transform::Metered { stats, .. } => stats.record_received(payload.len()),
                Transform::Logged { .. } => logged = true,
            }
        }

        Ok(None)
    }
}

impl Default for TransformChain {
    fn default() -> Self {
        Self::new(Codec::default())
    }
}
