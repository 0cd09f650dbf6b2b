//! Loopback harness for end-to-end skein scenarios.
//!
//! Runs a real [`Server`] and real [`Client`]s over `127.0.0.1`, with a small
//! chat vocabulary as fixture messages. Every wait is bounded by [`STEP`] so
//! a broken scenario fails instead of hanging.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use skein_client::{Client, ClientConfig, ClientEvent};
use skein_core::{Events, NetError, Result};
use skein_proto::{ClientMessage, Message, Requestable, ServerMessage};
use skein_server::{ConnectionId, Server, ServerConfig, ServerEvent};
use tracing::debug;

/// Upper bound on any single wait.
pub const STEP: Duration = Duration::from_secs(5);

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Up {
    /// A chat line.
    Say(String),
    /// Liveness request carrying a nonce.
    Ping(u32),
}

impl Message for Up {}
impl ClientMessage for Up {}

/// Request form of [`Up::Ping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping(pub u32);

impl Message for Ping {}
impl Requestable for Ping {}

impl From<Ping> for Up {
    fn from(ping: Ping) -> Self {
        Self::Ping(ping.0)
    }
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Down {
    /// A relayed chat line.
    Said {
        /// Raw connection id of the speaker.
        from: u32,
        /// The line.
        text: String,
    },
    /// Answer to [`Ping`], echoing its nonce.
    Pong(u32),
}

impl Message for Down {}
impl ServerMessage for Down {}

/// Server speaking the fixture vocabulary.
pub type ChatServer = Server<Down, Up>;

/// Client speaking the fixture vocabulary.
pub type ChatClient = Client<Up, Down>;

/// Server configuration on a free loopback port with the sweep disabled.
pub fn loopback() -> ServerConfig {
    let mut config = ServerConfig::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)));
    config.heartbeat_interval = None;
    config
}

/// Receive the next event, giving up after `limit`.
pub async fn recv_within<E>(events: &mut Events<E>, limit: Duration) -> Option<E> {
    tokio::time::timeout(limit, events.recv()).await.ok().flatten()
}

/// Poll `condition` until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Create a client and connect it to `addr`.
pub async fn connect_client(
    addr: SocketAddr,
    config: ClientConfig,
) -> Result<(ChatClient, Events<ClientEvent<Down>>)> {
    let (client, events) = Client::new(config);
    client.connect(addr).await?;
    Ok((client, events))
}

/// A hosting server and its event stream.
pub struct Lobby {
    /// The server.
    pub server: ChatServer,
    /// Its events.
    pub events: Events<ServerEvent<Up>>,
    /// Bound listener address.
    pub addr: SocketAddr,
}

/// A connected client together with the id the server gave it.
pub struct Member {
    /// The client.
    pub client: ChatClient,
    /// Its events.
    pub events: Events<ClientEvent<Down>>,
    /// Server-side id.
    pub id: ConnectionId,
}

impl Member {
    /// Next client event within [`STEP`].
    pub async fn next_event(&mut self) -> Option<ClientEvent<Down>> {
        recv_within(&mut self.events, STEP).await
    }

    /// Next plain message within [`STEP`], skipping other events.
    pub async fn next_message(&mut self) -> Option<Down> {
        loop {
            if let ClientEvent::MessageReceived(message) = self.next_event().await? {
                return Some(message);
            }
        }
    }
}

impl Lobby {
    /// Start hosting `config`.
    pub async fn open(config: ServerConfig) -> Result<Self> {
        let (server, events) = ChatServer::new(config);
        let addr = server.host().await?;
        Ok(Self { server, events, addr })
    }

    /// Connect a client and wait until the server has registered it.
    pub async fn join(&mut self, config: ClientConfig) -> Result<Member> {
        let (client, events) = connect_client(self.addr, config).await?;
        let id = self.next_connected().await.ok_or(NetError::Timeout { operation: "join" })?;
        debug!(%id, "member joined");
        Ok(Member { client, events, id })
    }

    /// Join `count` clients with default configuration, in order.
    pub async fn join_many(&mut self, count: usize) -> Result<Vec<Member>> {
        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            members.push(self.join(ClientConfig::default()).await?);
        }
        Ok(members)
    }

    /// Next server event within [`STEP`].
    pub async fn next_event(&mut self) -> Option<ServerEvent<Up>> {
        recv_within(&mut self.events, STEP).await
    }

    /// Id of the next `ClientConnected`, skipping other events.
    pub async fn next_connected(&mut self) -> Option<ConnectionId> {
        loop {
            if let ServerEvent::ClientConnected { connection_id, .. } = self.next_event().await? {
                return Some(connection_id);
            }
        }
    }

    /// Id of the next `ConnectionLost`, skipping other events.
    pub async fn next_lost(&mut self) -> Option<ConnectionId> {
        loop {
            if let ServerEvent::ConnectionLost { connection_id } = self.next_event().await? {
                return Some(connection_id);
            }
        }
    }

    /// Next plain message and its origin, skipping connection churn.
    pub async fn next_message(&mut self) -> Option<(ConnectionId, Up)> {
        loop {
            if let ServerEvent::MessageReceived { connection_id, message } = self.next_event().await? {
                return Some((connection_id, message));
            }
        }
    }

    /// Whether no event arrives within `quiet`.
    pub async fn is_quiet_for(&mut self, quiet: Duration) -> bool {
        recv_within(&mut self.events, quiet).await.is_none()
    }
}
