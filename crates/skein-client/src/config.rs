//! Client configuration.

use std::time::Duration;

use skein_core::{MulticastConfig, TransformChain};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bind the outbound socket to this local port. `None` picks an
    /// ephemeral port.
    pub local_port: Option<u16>,
    /// Bound on the reachability probe that gates a reconnect attempt.
    pub repair_probe_timeout: Duration,
    /// Give up waiting for an answer after this long. `None` waits until the
    /// answer arrives or the connection drops.
    pub request_timeout: Option<Duration>,
    /// Join a multicast group on connect.
    pub multicast: Option<MulticastConfig>,
    /// Initial transform chain.
    pub transform: TransformChain,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_port: None,
            repair_probe_timeout: Duration::from_millis(250),
            request_timeout: None,
            multicast: None,
            transform: TransformChain::default(),
        }
    }
}
