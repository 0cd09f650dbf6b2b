//! Network error taxonomy.

use std::{io, net::SocketAddr};

use skein_proto::CodecError;
use thiserror::Error;

/// Errors surfaced by connection, client and server operations.
///
/// Receive loops never return these to callers. They log them and turn the
/// outcome into state transitions and `ConnectionLost` notifications. Only
/// explicit operations like connecting or hosting report them directly.
#[derive(Debug, Error)]
pub enum NetError {
    /// A hostname resolved to no usable IPv4 address.
    #[error("could not resolve {host}: no IPv4 address found")]
    Resolution {
        /// Hostname that failed to resolve.
        host: String,
    },

    /// A socket operation failed for a reason other than a timeout.
    #[error("{operation} failed: {source}")]
    Socket {
        /// Operation that failed (`bind`, `connect`, `accept`, ...).
        operation: &'static str,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A bounded operation ran out of time.
    #[error("{operation} timed out")]
    Timeout {
        /// Operation that timed out.
        operation: &'static str,
    },

    /// Bytes could not be converted to or from a message.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A liveness probe found the peer gone.
    #[error("peer {remote} shows no heartbeat")]
    Liveness {
        /// Remote endpoint of the dead connection.
        remote: SocketAddr,
    },

    /// The operation needs a hosting server.
    #[error("server is not hosting")]
    NotHosting,

    /// The session has no multicast channel configured or open.
    #[error("multicast channel unavailable")]
    MulticastUnavailable,
}

impl NetError {
    /// Wrap an I/O error, classifying timeouts separately.
    pub fn socket(operation: &'static str, source: io::Error) -> Self {
        if is_timeout(&source) { Self::Timeout { operation } } else { Self::Socket { operation, source } }
    }
}

/// Result alias for network operations.
pub type Result<T> = std::result::Result<T, NetError>;

/// Whether an I/O error is an expected idle timeout.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_classified_separately() {
        let err = NetError::socket("read", io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(err, NetError::Timeout { operation: "read" }));
    }

    #[test]
    fn liveness_names_the_dead_peer() {
        let err = NetError::Liveness { remote: "127.0.0.1:7000".parse().unwrap() };
        assert_eq!(err.to_string(), "peer 127.0.0.1:7000 shows no heartbeat");
    }

    #[test]
    fn other_io_errors_are_socket_failures() {
        let err = NetError::socket("connect", io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(matches!(err, NetError::Socket { operation: "connect", .. }));
    }
}
