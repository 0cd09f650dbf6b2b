//! Best-effort UDP multicast side channel.
//!
//! The channel listens on the control port plus [`MULTICAST_PORT_OFFSET`].
//! One datagram carries one codec-encoded message: no length prefix, no
//! envelope, no flags. Nothing is acknowledged, retried or ordered.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::{Serialize, de::DeserializeOwned};
use skein_proto::Codec;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::{net::UdpSocket, sync::watch, task::JoinHandle};
use tracing::{debug, trace, warn};

use crate::error::{NetError, Result};

/// Distance between the TCP control port and the multicast port.
pub const MULTICAST_PORT_OFFSET: u16 = 1;

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Multicast port that belongs to a control port, or `None` when the offset
/// runs past the port range.
pub fn multicast_port(control_port: u16) -> Option<u16> {
    control_port.checked_add(MULTICAST_PORT_OFFSET)
}

/// Multicast group membership for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastConfig {
    /// Group address (224.0.0.0/4).
    pub group: Ipv4Addr,
    /// Local interface used to join and send. Unspecified lets the kernel
    /// pick.
    pub interface: Ipv4Addr,
    /// Hop limit for outgoing datagrams.
    pub ttl: u32,
    /// Deliver our own datagrams back to local listeners.
    pub loopback: bool,
    /// Only datagrams from this source are accepted. `None` means the group
    /// address itself.
    pub trusted_sender: Option<IpAddr>,
}

impl MulticastConfig {
    /// Join `group` with defaults for everything else.
    pub fn new(group: Ipv4Addr) -> Self {
        Self { group, ..Self::default() }
    }

    /// Accept datagrams from `sender` instead of the group address.
    #[must_use]
    pub fn with_trusted_sender(mut self, sender: IpAddr) -> Self {
        self.trusted_sender = Some(sender);
        self
    }

    /// Source address a datagram must come from.
    pub fn expected_sender(&self) -> IpAddr {
        self.trusted_sender.unwrap_or(IpAddr::V4(self.group))
    }
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 42, 99),
            interface: Ipv4Addr::UNSPECIFIED,
            ttl: 1,
            loopback: true,
            trusted_sender: None,
        }
    }
}

/// Filter a datagram by source, then decode it.
///
/// Both a foreign source and an undecodable payload yield `None`.
pub fn admit_datagram<M: DeserializeOwned>(
    codec: Codec,
    expected_sender: IpAddr,
    source: SocketAddr,
    datagram: &[u8],
) -> Option<M> {
    if source.ip() != expected_sender {
        trace!(%source, %expected_sender, "datagram from untrusted sender");
        return None;
    }
    match codec.decode(datagram) {
        Ok(message) => Some(message),
        Err(e) => {
            trace!(%source, error = %e, "undecodable datagram");
            None
        },
    }
}

fn udp_socket(operation: &'static str) -> Result<Socket> {
    Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetError::socket(operation, e))
}

fn into_tokio(socket: Socket, operation: &'static str) -> Result<UdpSocket> {
    socket.set_nonblocking(true).map_err(|e| NetError::socket(operation, e))?;
    UdpSocket::from_std(socket.into()).map_err(|e| NetError::socket(operation, e))
}

/// Bind a receiving socket on `port` and join the group.
pub fn bind_receiver(config: &MulticastConfig, port: u16) -> Result<UdpSocket> {
    let op = "multicast bind";
    let socket = udp_socket(op)?;
    socket.set_reuse_address(true).map_err(|e| NetError::socket(op, e))?;
    let local = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&SockAddr::from(local)).map_err(|e| NetError::socket(op, e))?;

    let op = "multicast join";
    socket.join_multicast_v4(&config.group, &config.interface).map_err(|e| NetError::socket(op, e))?;
    socket.set_multicast_loop_v4(config.loopback).map_err(|e| NetError::socket(op, e))?;

    into_tokio(socket, op)
}

/// Sends datagrams to a multicast group.
#[derive(Debug)]
pub struct MulticastSender {
    socket: UdpSocket,
    destination: SocketAddr,
}

impl MulticastSender {
    /// Open a sender for the group on the channel that belongs to
    /// `control_port`.
    ///
    /// Fails with [`NetError::MulticastUnavailable`] when `control_port` has
    /// no multicast port.
    pub fn open(config: &MulticastConfig, control_port: u16) -> Result<Self> {
        let op = "multicast sender";
        let port = multicast_port(control_port).ok_or(NetError::MulticastUnavailable)?;
        let socket = udp_socket(op)?;
        socket.set_multicast_ttl_v4(config.ttl).map_err(|e| NetError::socket(op, e))?;
        socket.set_multicast_loop_v4(config.loopback).map_err(|e| NetError::socket(op, e))?;
        if !config.interface.is_unspecified() {
            socket.set_multicast_if_v4(&config.interface).map_err(|e| NetError::socket(op, e))?;
        }
        let local = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        socket.bind(&SockAddr::from(local)).map_err(|e| NetError::socket(op, e))?;

        let destination = SocketAddr::V4(SocketAddrV4::new(config.group, port));
        Ok(Self { socket: into_tokio(socket, op)?, destination })
    }

    /// Group endpoint datagrams go to.
    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Encode and send one message. Unacknowledged.
    pub async fn send<M: Serialize>(&self, codec: Codec, message: &M) -> Result<usize> {
        let datagram = codec.encode(message)?;
        self.socket
            .send_to(&datagram, self.destination)
            .await
            .map_err(|e| NetError::socket("multicast send", e))
    }
}

/// Receive datagrams until `shutdown` flips, passing admitted messages to
/// `deliver`.
///
/// Receive errors are logged and skipped; the channel has no liveness.
pub fn spawn_receiver<M, F>(
    socket: UdpSocket,
    codec: Codec,
    expected_sender: IpAddr,
    mut shutdown: watch::Receiver<bool>,
    deliver: F,
) -> JoinHandle<()>
where
    M: DeserializeOwned + Send + 'static,
    F: Fn(M) + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, source)) => {
                        if let Some(message) = admit_datagram(codec, expected_sender, source, &buf[..len]) {
                            deliver(message);
                        }
                    },
                    Err(e) => warn!(error = %e, "multicast receive failed"),
                },
            }
        }
        debug!("multicast receive loop stopped");
    })
}
