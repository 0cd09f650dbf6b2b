//! Server side of the skein networking substrate.
//!
//! A [`Server`] accepts TCP clients, keeps them in a [`Registry`] keyed by
//! [`ConnectionId`], and reports every arrival, message, request and loss on
//! an event stream. Sends go to explicit id lists or to everyone registered
//! at the time of the call.
//!
//! A failed connection is kicked on its own. Nothing about one client's
//! failure reaches the listener or the other clients.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
pub mod registry;
mod server;

pub use config::{DEFAULT_PORT, ServerConfig};
pub use registry::{ConnectionId, Registry};
pub use server::{Server, ServerEvent};
pub use skein_core::{Events, NetError, Result, TransformChain};
