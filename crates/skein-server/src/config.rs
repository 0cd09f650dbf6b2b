//! Server configuration.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use skein_core::{MulticastConfig, TransformChain};

/// Default TCP control port.
pub const DEFAULT_PORT: u16 = 7000;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to. Port 0 picks a free port.
    pub bind_addr: SocketAddr,
    /// Interval of the background heartbeat sweep. `None` disables it;
    /// [`crate::Server::heartbeat_connections`] still works on demand.
    pub heartbeat_interval: Option<Duration>,
    /// Open a multicast sender on the channel next to the control port.
    pub multicast: Option<MulticastConfig>,
    /// Initial transform chain.
    pub transform: TransformChain,
}

impl ServerConfig {
    /// Default configuration listening on `bind_addr`.
    pub fn bind(bind_addr: SocketAddr) -> Self {
        Self { bind_addr, ..Self::default() }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            heartbeat_interval: Some(Duration::from_secs(10)),
            multicast: None,
            transform: TransformChain::default(),
        }
    }
}
