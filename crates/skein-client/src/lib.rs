//! Client side of the skein networking substrate.
//!
//! A [`Client`] keeps exactly one TCP connection to a server, sends
//! fire-and-forget messages and correlated requests, and reports everything
//! it receives on an event stream.
//!
//! ```no_run
//! # use skein_client::{Client, ClientConfig, ClientEvent};
//! # use skein_proto::{ClientMessage, Message, ServerMessage};
//! # #[derive(Debug, serde::Serialize, serde::Deserialize)] struct Hello;
//! # impl Message for Hello {} impl ClientMessage for Hello {}
//! # #[derive(Debug, serde::Serialize, serde::Deserialize)] struct Welcome;
//! # impl Message for Welcome {} impl ServerMessage for Welcome {}
//! # async fn run() -> skein_client::Result<()> {
//! let (client, mut events) = Client::<Hello, Welcome>::new(ClientConfig::default());
//! client.connect("127.0.0.1:7000".parse().unwrap()).await?;
//! client.send_message(&Hello).await;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ClientEvent::MessageReceived(welcome) => tracing::info!(?welcome, "server says hello"),
//!         ClientEvent::MulticastReceived(_) => {},
//!         ClientEvent::ConnectionLost => break,
//!     }
//! }
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;

pub use client::{Client, ClientEvent};
pub use config::ClientConfig;
pub use skein_core::{ConnectionState, Events, NetError, Result, TransformChain};
