//! Multi-client server.
//!
//! # Tasks
//!
//! ```text
//!              ┌──────────────┐  register   ┌──────────────────────┐
//!  listener ──>│ accept loop  │────────────>│ Registry<Connection> │
//!              └──────────────┘             └──────────────────────┘
//!                                              │  one receive loop
//!                                              ↓  per connection
//!                                         ServerEvent stream
//!              ┌──────────────┐  snapshot
//!              │ sweep (opt.) │────────────> liveness probe, kick dead
//!              └──────────────┘
//! ```
//!
//! A connection that fails only affects itself: its loop reports the loss,
//! a separate task removes it from the registry and emits `ConnectionLost`.
//! The accept loop and the other connections keep running.

use std::{
    marker::PhantomData,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use bytes::Bytes;
use serde::Serialize;
use skein_core::{
    CloseReason, Connection, Events, FrameHandler, MulticastSender, NetError, Result, SendOutcome,
    SocketTuning, TransformChain, connection::frame_message,
};
use skein_proto::{ClientMessage, Envelope, Message, RequestId, ServerMessage};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::ServerConfig,
    registry::{ConnectionId, Registry},
};

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Notifications from a server's background loops.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent<C> {
    /// A client was accepted and registered.
    ClientConnected {
        /// Assigned id.
        connection_id: ConnectionId,
        /// Client endpoint.
        remote: SocketAddr,
    },
    /// A plain message arrived.
    MessageReceived {
        /// Origin.
        connection_id: ConnectionId,
        /// The message.
        message: C,
    },
    /// A request arrived. Reply with [`Server::answer`].
    RequestReceived {
        /// Origin.
        connection_id: ConnectionId,
        /// Id to echo in the answer.
        request_id: RequestId,
        /// The request.
        message: C,
    },
    /// A connection was kicked: the peer left, the transport died, or
    /// [`Server::kick_client`] was called.
    ConnectionLost {
        /// The id that is gone.
        connection_id: ConnectionId,
    },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Server for many client connections.
///
/// Sends `S` and receives `C`. Cheap to clone; clones share the listener
/// and registry.
pub struct Server<S, C> {
    shared: Arc<Shared<C>>,
    _outbound: PhantomData<fn(S)>,
}

impl<S, C> Clone for Server<S, C> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared), _outbound: PhantomData }
    }
}

impl<S: ServerMessage, C: ClientMessage> Server<S, C> {
    /// Create a server that is not yet hosting, and its event stream.
    pub fn new(config: ServerConfig) -> (Self, Events<ServerEvent<C>>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            transform: ArcSwap::from_pointee(config.transform.clone()),
            config,
            events,
            registry: Registry::new(),
            hosting: tokio::sync::Mutex::new(None),
            is_hosting: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            multicast: Mutex::new(None),
        });
        (Self { shared, _outbound: PhantomData }, rx)
    }

    /// Bind the listener and start accepting. Returns the bound address.
    ///
    /// A no-op returning the current address when already hosting. A
    /// multicast sender that cannot be opened is logged and skipped.
    pub async fn host(&self) -> Result<SocketAddr> {
        let mut slot = self.shared.hosting.lock().await;
        if let Some(hosting) = slot.as_ref() {
            return Ok(hosting.local);
        }

        let listener = TcpListener::bind(self.shared.config.bind_addr)
            .await
            .map_err(|e| NetError::socket("bind", e))?;
        let local = listener.local_addr().map_err(|e| NetError::socket("bind", e))?;

        if let Some(config) = &self.shared.config.multicast {
            match MulticastSender::open(config, local.port()) {
                Ok(sender) => {
                    debug!(destination = %sender.destination(), "multicast sender open");
                    *lock(&self.shared.multicast) = Some(Arc::new(sender));
                },
                Err(e) => warn!(group = %config.group, error = %e, "multicast unavailable, continuing without it"),
            }
        }

        let (shutdown, signal) = watch::channel(false);
        let weak = Arc::downgrade(&self.shared);
        let accept = tokio::spawn(accept_loop(weak.clone(), listener, signal.clone()));
        let sweep = self
            .shared
            .config
            .heartbeat_interval
            .map(|interval| tokio::spawn(sweep_loop(weak, interval, signal)));

        *slot = Some(Hosting { local, shutdown, accept, sweep });
        *lock(&self.shared.local_addr) = Some(local);
        self.shared.is_hosting.store(true, Ordering::Release);
        info!(%local, "hosting");
        Ok(local)
    }

    /// Stop accepting, then disconnect every registered client. Idempotent.
    ///
    /// Clients disconnected here get no `ConnectionLost` event.
    pub async fn close(&self) {
        let mut slot = self.shared.hosting.lock().await;
        let Some(hosting) = slot.take() else {
            return;
        };

        self.shared.is_hosting.store(false, Ordering::Release);
        hosting.shutdown.send_replace(true);
        if let Err(e) = hosting.accept.await {
            warn!(error = %e, "accept loop ended abnormally");
        }
        if let Some(sweep) = hosting.sweep
            && let Err(e) = sweep.await
        {
            warn!(error = %e, "heartbeat sweep ended abnormally");
        }
        *lock(&self.shared.multicast) = None;

        for connection_id in self.shared.registry.ids() {
            self.shared.disconnect(connection_id).await;
        }
        *lock(&self.shared.local_addr) = None;
        info!(local = %hosting.local, "closed");
    }

    /// Send to the given connections. Unknown ids are skipped.
    ///
    /// Returns how many sends succeeded. A failed send triggers that peer's
    /// liveness check and does not stop delivery to the others.
    pub async fn send_message(&self, message: &S, connection_ids: &[ConnectionId]) -> usize {
        match self.shared.encode(&Envelope::plain(message)) {
            Some(frame) => self.shared.deliver_all(&frame, connection_ids).await,
            None => 0,
        }
    }

    /// Send to every connection registered at the time of the call.
    pub async fn broadcast(&self, message: &S) -> usize {
        let connection_ids = self.shared.registry.ids();
        self.send_message(message, &connection_ids).await
    }

    /// Reply to a request received as [`ServerEvent::RequestReceived`].
    pub async fn answer(&self, connection_id: ConnectionId, request_id: RequestId, message: &S) -> bool {
        match self.shared.encode(&Envelope::correlated(request_id, message)) {
            Some(frame) => self.shared.deliver_all(&frame, &[connection_id]).await == 1,
            None => false,
        }
    }

    /// Disconnect a client without a `ConnectionLost` event.
    ///
    /// Returns `false` if the id was already gone.
    pub async fn disconnect_client(&self, connection_id: ConnectionId) -> bool {
        self.shared.disconnect(connection_id).await
    }

    /// Disconnect a client and emit `ConnectionLost` for it.
    ///
    /// Returns `false` if the id was already gone.
    pub async fn kick_client(&self, connection_id: ConnectionId) -> bool {
        self.shared.kick(connection_id).await
    }

    /// Liveness-check every registered connection and kick the dead ones.
    ///
    /// Returns the ids that were kicked.
    pub async fn heartbeat_connections(&self) -> Vec<ConnectionId> {
        self.shared.heartbeat_connections().await
    }

    /// Send one datagram to the multicast group. Unacknowledged.
    pub async fn send_multicast_message(&self, message: &S) -> Result<usize> {
        if !self.is_hosting() {
            return Err(NetError::NotHosting);
        }
        let sender = lock(&self.shared.multicast).clone().ok_or(NetError::MulticastUnavailable)?;
        let codec = self.shared.transform.load().codec();
        sender.send(codec, message).await
    }

    /// Registered ids, ascending.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.shared.registry.ids()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Whether `connection_id` is registered.
    pub fn is_registered(&self, connection_id: ConnectionId) -> bool {
        self.shared.registry.contains(connection_id)
    }

    /// Remote endpoint of a registered connection.
    pub fn remote_addr(&self, connection_id: ConnectionId) -> Option<SocketAddr> {
        self.shared.registry.get(connection_id).map(|connection| connection.remote_addr())
    }

    /// Bound listener address while hosting.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.local_addr)
    }

    /// Whether the accept loop is running.
    pub fn is_hosting(&self) -> bool {
        self.shared.is_hosting.load(Ordering::Acquire)
    }

    /// Replace the transform chain. Takes effect for the next send and the
    /// next received frame on every connection.
    pub fn set_transform(&self, chain: TransformChain) {
        self.shared.transform.store(Arc::new(chain));
    }

    /// Active transform chain.
    pub fn transform(&self) -> Arc<TransformChain> {
        self.shared.transform.load_full()
    }
}

struct Hosting {
    local: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept: JoinHandle<()>,
    sweep: Option<JoinHandle<()>>,
}

struct Shared<C> {
    config: ServerConfig,
    transform: ArcSwap<TransformChain>,
    events: mpsc::UnboundedSender<ServerEvent<C>>,
    registry: Registry<Connection>,
    /// Serialises host and close.
    hosting: tokio::sync::Mutex<Option<Hosting>>,
    is_hosting: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    multicast: Mutex<Option<Arc<MulticastSender>>>,
}

impl<C: ClientMessage> Shared<C> {
    fn emit(&self, event: ServerEvent<C>) {
        if self.events.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }

    fn register(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let tuning = SocketTuning::STANDARD;
        if let Err(e) = tuning.apply(&stream) {
            warn!(%remote, error = %e, "could not tune accepted socket");
            return;
        }

        let registered = self.registry.register(|connection_id| {
            // Announced before the loop starts so no message can overtake it.
            self.emit(ServerEvent::ClientConnected { connection_id, remote });
            let handler = ServerHandler { shared: Arc::downgrade(self), connection_id };
            Connection::spawn(stream, &tuning, handler).inspect_err(|_| {
                self.emit(ServerEvent::ConnectionLost { connection_id });
            })
        });

        match registered {
            Ok((connection_id, _)) => info!(%connection_id, %remote, "client connected"),
            Err(e) => warn!(%remote, error = %e, "registering connection failed"),
        }
    }

    fn encode<M: Serialize>(&self, envelope: &Envelope<M>) -> Option<Bytes> {
        frame_message(&self.transform.load(), envelope)
            .inspect_err(|e| warn!(error = %e, "could not encode message"))
            .ok()
    }

    async fn deliver_all(&self, frame: &[u8], connection_ids: &[ConnectionId]) -> usize {
        let mut delivered = 0;
        for &connection_id in connection_ids {
            let Some(connection) = self.registry.get(connection_id) else {
                trace!(%connection_id, "send to unknown connection skipped");
                continue;
            };
            match connection.send_frame(frame).await {
                SendOutcome::Sent => delivered += 1,
                SendOutcome::NothingWritten => {
                    warn!(%connection_id, "send reached no peer, checking heartbeat");
                    self.heartbeat(connection_id, &connection).await;
                },
                SendOutcome::Failed(e) => {
                    warn!(%connection_id, error = %e, "send failed, checking heartbeat");
                    self.heartbeat(connection_id, &connection).await;
                },
            }
        }
        delivered
    }

    async fn disconnect(&self, connection_id: ConnectionId) -> bool {
        let Some(connection) = self.registry.remove(connection_id) else {
            return false;
        };
        connection.close().await;
        info!(%connection_id, remote = %connection.remote_addr(), "client disconnected");
        true
    }

    async fn kick(&self, connection_id: ConnectionId) -> bool {
        let removed = self.disconnect(connection_id).await;
        if removed {
            self.emit(ServerEvent::ConnectionLost { connection_id });
        }
        removed
    }

    async fn heartbeat(&self, connection_id: ConnectionId, connection: &Connection) -> bool {
        let Err(error) = connection.check_alive().await else {
            return true;
        };
        warn!(%connection_id, %error, "dropping off");
        self.kick(connection_id).await;
        false
    }

    async fn heartbeat_connections(&self) -> Vec<ConnectionId> {
        let mut kicked = Vec::new();
        for (connection_id, connection) in self.registry.snapshot() {
            if !self.heartbeat(connection_id, &connection).await {
                kicked.push(connection_id);
            }
        }
        kicked
    }

    fn dispatch(&self, connection_id: ConnectionId, envelope: Envelope<C>) {
        trace!(%connection_id, message = envelope.body.type_name(), request_id = ?envelope.correlation, "received");
        let event = match envelope.correlation {
            Some(request_id) => {
                ServerEvent::RequestReceived { connection_id, request_id, message: envelope.body }
            },
            None => ServerEvent::MessageReceived { connection_id, message: envelope.body },
        };
        self.emit(event);
    }
}

async fn accept_loop<C: ClientMessage>(
    shared: Weak<Shared<C>>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let Some(server) = shared.upgrade() else {
            break;
        };

        match accepted {
            Ok((stream, remote)) => server.register(stream, remote),
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            },
        }
    }
    debug!("accept loop stopped");
}

async fn sweep_loop<C: ClientMessage>(
    shared: Weak<Shared<C>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticks.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticks.tick() => {},
        }
        let Some(server) = shared.upgrade() else {
            break;
        };
        let kicked = server.heartbeat_connections().await;
        if !kicked.is_empty() {
            info!(count = kicked.len(), "heartbeat sweep dropped connections");
        }
    }
    debug!("heartbeat sweep stopped");
}

struct ServerHandler<C> {
    shared: Weak<Shared<C>>,
    connection_id: ConnectionId,
}

impl<C: ClientMessage> FrameHandler for ServerHandler<C> {
    async fn on_frame(&self, frame: Bytes) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let chain = shared.transform.load_full();
        match chain.decode::<Envelope<C>>(frame).await {
            Ok(Some(envelope)) => shared.dispatch(self.connection_id, envelope),
            Ok(None) => {},
            Err(e) => {
                warn!(connection_id = %self.connection_id, error = %e, "dropping undecodable frame");
            },
        }
    }

    fn on_closed(&self, reason: CloseReason) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let connection_id = self.connection_id;
        tokio::spawn(async move {
            info!(%connection_id, ?reason, "client connection ended");
            shared.kick(connection_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use serde::Deserialize;
    use skein_proto::{Codec, FrameReader, framing::encode_frame};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Up(String);
    impl Message for Up {}
    impl ClientMessage for Up {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Down(u32);
    impl Message for Down {}
    impl ServerMessage for Down {}

    fn loopback() -> ServerConfig {
        ServerConfig::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)))
    }

    async fn next(events: &mut Events<ServerEvent<Up>>) -> ServerEvent<Up> {
        tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap()
    }

    async fn join(
        addr: SocketAddr,
        events: &mut Events<ServerEvent<Up>>,
    ) -> (TcpStream, ConnectionId) {
        let stream = TcpStream::connect(addr).await.unwrap();
        match next(events).await {
            ServerEvent::ClientConnected { connection_id, .. } => (stream, connection_id),
            other => panic!("expected ClientConnected, got {other:?}"),
        }
    }

    async fn read_envelope(stream: &mut TcpStream) -> Envelope<Down> {
        let mut frames = FrameReader::with_capacity(256);
        loop {
            if let Some(frame) = frames.next_frame().unwrap() {
                return Codec::Cbor.decode(&frame).unwrap();
            }
            assert!(stream.read_buf(frames.buffer_mut()).await.unwrap() > 0);
        }
    }

    async fn write_envelope(stream: &mut TcpStream, envelope: &Envelope<Up>) {
        let payload = Codec::Cbor.encode(envelope).unwrap();
        stream.write_all(&encode_frame(&payload).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn host_and_close_are_idempotent() {
        let (server, _events) = Server::<Down, Up>::new(loopback());
        let addr = server.host().await.unwrap();
        assert_eq!(server.host().await.unwrap(), addr);
        assert!(server.is_hosting());
        assert_eq!(server.local_addr(), Some(addr));

        server.close().await;
        server.close().await;
        assert!(!server.is_hosting());
        assert_eq!(server.local_addr(), None);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn messages_and_requests_are_tagged_with_their_origin() {
        let (server, mut events) = Server::<Down, Up>::new(loopback());
        let addr = server.host().await.unwrap();
        let (mut stream, id) = join(addr, &mut events).await;

        write_envelope(&mut stream, &Envelope::plain(Up("hello".into()))).await;
        write_envelope(&mut stream, &Envelope::correlated(9, Up("ping".into()))).await;

        assert_eq!(
            next(&mut events).await,
            ServerEvent::MessageReceived { connection_id: id, message: Up("hello".into()) }
        );
        assert_eq!(
            next(&mut events).await,
            ServerEvent::RequestReceived { connection_id: id, request_id: 9, message: Up("ping".into()) }
        );

        assert!(server.answer(id, 9, &Down(1)).await);
        assert_eq!(read_envelope(&mut stream).await, Envelope::correlated(9, Down(1)));
        server.close().await;
    }

    #[tokio::test]
    async fn peer_close_kicks_exactly_once() {
        let (server, mut events) = Server::<Down, Up>::new(loopback());
        let addr = server.host().await.unwrap();
        let (stream, id) = join(addr, &mut events).await;
        drop(stream);

        assert_eq!(next(&mut events).await, ServerEvent::ConnectionLost { connection_id: id });
        assert!(!server.is_registered(id));
        assert!(!server.kick_client(id).await);
        assert!(!server.disconnect_client(id).await);
        server.close().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn operator_disconnect_is_silent() {
        let (server, mut events) = Server::<Down, Up>::new(loopback());
        let addr = server.host().await.unwrap();
        let (mut stream, id) = join(addr, &mut events).await;

        assert!(server.disconnect_client(id).await);
        assert!(!server.disconnect_client(id).await);
        assert_eq!(server.connection_count(), 0);

        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
        server.close().await;
    }

    #[tokio::test]
    async fn sends_to_unknown_ids_are_no_ops() {
        let (server, _events) = Server::<Down, Up>::new(loopback());
        server.host().await.unwrap();
        assert_eq!(server.send_message(&Down(0), &[ConnectionId::from(42)]).await, 0);
        assert!(!server.answer(ConnectionId::from(42), 1, &Down(0)).await);
        server.close().await;
    }

    #[tokio::test]
    async fn multicast_needs_hosting_and_configuration() {
        let (server, _events) = Server::<Down, Up>::new(loopback());
        assert!(matches!(server.send_multicast_message(&Down(0)).await, Err(NetError::NotHosting)));

        server.host().await.unwrap();
        assert!(matches!(
            server.send_multicast_message(&Down(0)).await,
            Err(NetError::MulticastUnavailable)
        ));
        server.close().await;
    }

    #[tokio::test]
    async fn sweep_keeps_live_connections() {
        let (server, mut events) = Server::<Down, Up>::new(loopback());
        let addr = server.host().await.unwrap();
        let (_stream, id) = join(addr, &mut events).await;

        assert!(server.heartbeat_connections().await.is_empty());
        assert_eq!(server.connection_ids(), [id]);
        server.close().await;
    }
}
