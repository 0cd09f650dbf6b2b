//! Socket tuning and liveness probes.
//!
//! Every TCP connection, inbound or outbound, gets the same fixed tuning.
//! The values are part of the protocol's operating envelope and are not
//! exposed as configuration.

use std::{
    io,
    mem::MaybeUninit,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use socket2::SockRef;
use tokio::net::{TcpSocket, TcpStream};

use crate::error::{NetError, Result};

/// Fixed socket options applied at connection setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketTuning {
    /// Grace period for unsent data on close.
    pub linger: Duration,
    /// Disable Nagle's algorithm.
    pub no_delay: bool,
    /// `SO_SNDBUF` in bytes.
    pub send_buffer_size: usize,
    /// `SO_RCVBUF` in bytes.
    pub recv_buffer_size: usize,
    /// Bound on a single frame write.
    pub send_timeout: Duration,
    /// Bound on a single blocking read. Expiry is an idle tick, not an error.
    pub recv_timeout: Duration,
    /// Bound on establishing an outbound connection.
    pub connect_timeout: Duration,
}

impl SocketTuning {
    /// The tuning every connection uses.
    pub const STANDARD: Self = Self {
        linger: Duration::from_secs(3),
        no_delay: true,
        send_buffer_size: 16 * 1024,
        recv_buffer_size: 16 * 1024,
        send_timeout: Duration::from_secs(5),
        recv_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
    };

    /// Apply linger, no-delay and buffer sizes to an established stream.
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.no_delay)?;
        let sock = SockRef::from(stream);
        sock.set_linger(Some(self.linger))?;
        sock.set_send_buffer_size(self.send_buffer_size)?;
        sock.set_recv_buffer_size(self.recv_buffer_size)?;
        Ok(())
    }
}

impl Default for SocketTuning {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// Receive buffer capacity the kernel reports for this socket.
///
/// Falls back to the requested tuning if the option cannot be read.
pub fn recommended_recv_capacity(stream: &TcpStream, tuning: &SocketTuning) -> usize {
    SockRef::from(stream).recv_buffer_size().unwrap_or(tuning.recv_buffer_size)
}

/// Open a tuned outbound connection.
///
/// Binds to `local_port` on all interfaces when given, otherwise to an
/// ephemeral port.
pub async fn connect_tuned(
    remote: SocketAddr,
    local_port: Option<u16>,
    tuning: &SocketTuning,
) -> Result<TcpStream> {
    let socket = match remote {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|e| NetError::socket("socket", e))?;

    if let Some(port) = local_port {
        socket.set_reuseaddr(true).map_err(|e| NetError::socket("bind", e))?;
        let local = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        socket.bind(local).map_err(|e| NetError::socket("bind", e))?;
    }

    let stream = tokio::time::timeout(tuning.connect_timeout, socket.connect(remote))
        .await
        .map_err(|_| NetError::Timeout { operation: "connect" })?
        .map_err(|e| NetError::socket("connect", e))?;

    tuning.apply(&stream).map_err(|e| NetError::socket("configure", e))?;
    Ok(stream)
}

/// Whether the transport still reports itself connected and error-free.
///
/// Checks that the peer address is known, that no socket error is pending,
/// and that a non-blocking peek does not report end-of-stream. Never
/// consumes data.
pub fn is_connection_valid(stream: &TcpStream) -> bool {
    if stream.peer_addr().is_err() {
        return false;
    }

    let sock = SockRef::from(stream);
    if !matches!(sock.take_error(), Ok(None)) {
        return false;
    }

    let mut probe = [MaybeUninit::<u8>::uninit(); 1];
    match sock.peek(&mut probe) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) => e.kind() == io::ErrorKind::WouldBlock,
    }
}

/// Ping-equivalent reachability check.
///
/// Attempts a TCP connection to `remote` within `timeout` and closes it
/// immediately. ICMP would need raw sockets, so the control port itself
/// stands in for the host.
pub async fn probe_reachable(remote: SocketAddr, timeout: Duration) -> bool {
    matches!(tokio::time::timeout(timeout, TcpStream::connect(remote)).await, Ok(Ok(_)))
}

#[cfg(test)]
mod tests {
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    use super::*;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = connect_tuned(addr, None, &SocketTuning::STANDARD).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn tuning_is_applied_on_connect() {
        let (client, _server) = pair().await;
        assert!(client.nodelay().unwrap());
        let linger = SockRef::from(&client).linger().unwrap();
        assert_eq!(linger, Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn live_connection_is_valid() {
        let (client, _server) = pair().await;
        assert!(is_connection_valid(&client));
    }

    #[tokio::test]
    async fn pending_data_does_not_invalidate() {
        let (client, mut server) = pair().await;
        server.write_all(b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(is_connection_valid(&client));
    }

    #[tokio::test]
    async fn peer_close_invalidates() {
        let (client, server) = pair().await;
        drop(server);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!is_connection_valid(&client));
    }

    #[tokio::test]
    async fn reachability_follows_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(probe_reachable(addr, Duration::from_millis(250)).await);

        drop(listener);
        assert!(!probe_reachable(addr, Duration::from_millis(250)).await);
    }

    #[tokio::test]
    async fn refused_connect_is_a_socket_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect_tuned(addr, None, &SocketTuning::STANDARD).await.unwrap_err();
        assert!(matches!(err, NetError::Socket { operation: "connect", .. }));
    }
}
