//! Shared networking machinery for skein clients and servers.
//!
//! This crate holds everything that both ends of a session need:
//!
//! - [`transform`]: the composable pipeline between messages and wire bytes
//! - [`connection`]: one tuned TCP stream with its receive loop
//! - [`socket`]: fixed socket tuning, liveness and reachability probes
//! - [`multicast`]: the best-effort UDP side channel
//! - [`error`]: the network error taxonomy
//!
//! Callers never see raw transport errors from background loops. Loops log
//! failures and surface them as events on an [`Events`] channel.
#![forbid(unsafe_code)]

pub mod connection;
pub mod error;
pub mod multicast;
pub mod socket;
pub mod transform;

pub use connection::{CloseReason, Connection, ConnectionState, FrameHandler, SendOutcome};
pub use error::{NetError, Result};
pub use multicast::{MULTICAST_PORT_OFFSET, MulticastConfig, MulticastSender};
pub use socket::SocketTuning;
pub use transform::{FaultInjection, FlexOptions, TrafficStats, TransformChain};

/// Receiving end of an event stream. Events arrive in the order they were
/// produced for any one connection.
pub type Events<E> = tokio::sync::mpsc::UnboundedReceiver<E>;
