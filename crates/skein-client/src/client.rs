//! Outbound client: one connection to one server.
//!
//! # State machine
//!
//! ```text
//!                 connect            socket up, loop running
//! ┌──────────────┐ ─────> ┌────────────┐ ─────────────────> ┌───────────┐
//! │ Disconnected │        │ Connecting │                    │ Connected │
//! └──────────────┘ <───── └────────────┘                    └───────────┘
//!        ↑          failed                                        │
//!        └────────────────────────────────────────────────────────┘
//!           disconnect, peer closed, or dead on liveness probe
//! ```
//!
//! Every established connection gets a new epoch. Loss reports carry the
//! epoch of the loop that produced them, so a late report from an old
//! connection never tears down its replacement.

use std::{
    collections::HashMap,
    marker::PhantomData,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use bytes::Bytes;
use serde::Serialize;
use skein_core::{
    CloseReason, Connection, ConnectionState, Events, FrameHandler, MulticastConfig, NetError,
    Result, SendOutcome, SocketTuning, TransformChain,
    connection::frame_message,
    multicast::{self, multicast_port},
    socket::{connect_tuned, probe_reachable},
};
use skein_proto::{ClientMessage, Envelope, Message, RequestId, Requestable, ServerMessage};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;

/// Notifications from a client's background loops.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent<S> {
    /// A message arrived on the TCP channel that is not an answer to a
    /// waiting request.
    MessageReceived(S),
    /// A datagram from the trusted multicast sender.
    MulticastReceived(S),
    /// The connection ended without a local `disconnect`.
    ConnectionLost,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client for one server connection.
///
/// Sends `C` and receives `S`. Cheap to clone; clones share the connection.
pub struct Client<C, S> {
    shared: Arc<Shared<S>>,
    _outbound: PhantomData<fn(C)>,
}

impl<C, S> Clone for Client<C, S> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared), _outbound: PhantomData }
    }
}

impl<C: ClientMessage, S: ServerMessage> Client<C, S> {
    /// Create a disconnected client and the stream its events arrive on.
    pub fn new(config: ClientConfig) -> (Self, Events<ClientEvent<S>>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            transform: ArcSwap::from_pointee(config.transform.clone()),
            config,
            events,
            lifecycle: tokio::sync::Mutex::new(None),
            active: Mutex::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            epochs: AtomicU64::new(0),
            last_remote: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
        });
        (Self { shared, _outbound: PhantomData }, rx)
    }

    /// Connect to `remote`. A no-op if already connected.
    ///
    /// On failure the client stays `Disconnected`.
    pub async fn connect(&self, remote: SocketAddr) -> Result<()> {
        self.shared.connect(remote).await
    }

    /// Resolve `host` and connect to its first IPv4 address.
    pub async fn connect_host(&self, host: &str, port: u16) -> Result<()> {
        let resolution = || NetError::Resolution { host: host.to_owned() };
        let remote = tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| resolution())?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(resolution)?;
        self.connect(remote).await
    }

    /// Stop the receive loop, wait for it and close the socket. Pending
    /// requests resolve to `None`. A no-op when already disconnected.
    pub async fn disconnect(&self) {
        self.shared.teardown(None).await;
    }

    /// Fire-and-forget send. Returns whether the frame went out.
    ///
    /// Does nothing when not connected. A zero-byte write triggers a
    /// liveness check; a failed write triggers a liveness check with repair.
    pub async fn send_message(&self, message: &C) -> bool {
        self.shared.send(&Envelope::plain(message)).await
    }

    /// Send a request and wait for its correlated answer.
    ///
    /// Returns `None` when not connected, when the connection drops before
    /// the answer arrives, or when the configured request timeout elapses.
    /// Unrelated messages arriving meanwhile go to the event stream.
    pub async fn send_request<R>(&self, request: R) -> Option<S>
    where
        R: Requestable + Into<C>,
    {
        self.shared.active()?;

        let request_id = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(request_id, tx);

        let message: C = request.into();
        if !self.shared.send(&Envelope::correlated(request_id, &message)).await {
            lock(&self.shared.pending).remove(&request_id);
            return None;
        }

        let answer = match self.shared.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.ok().and_then(|answer| answer.ok()),
            None => rx.await.ok(),
        };
        if answer.is_none() {
            lock(&self.shared.pending).remove(&request_id);
            debug!(request_id, "request went unanswered");
        }
        answer
    }

    /// Check whether the transport is still alive.
    ///
    /// A dead connection is torn down and reported as lost. With `repair`,
    /// a reconnect to the same endpoint follows if it passes a reachability
    /// probe.
    pub async fn heartbeat(&self, repair: bool) -> bool {
        self.shared.heartbeat(repair).await
    }

    /// Drop the current connection, if any, and reconnect to the last known
    /// endpoint if it is reachable.
    pub async fn repair(&self) -> bool {
        let Some(remote) = *lock(&self.shared.last_remote) else {
            return false;
        };
        self.shared.teardown(None).await;
        self.shared.repair_to(remote).await
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    /// Whether the state is `Connected`.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether the receive loop of the current connection is running.
    pub fn is_receiving(&self) -> bool {
        self.shared.active().is_some_and(|active| active.connection.is_receiving())
    }

    /// Endpoint of the current connection.
    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.shared.active().map(|active| active.connection.remote_addr())
    }

    /// Replace the transform chain. Takes effect for the next send and the
    /// next received frame.
    pub fn set_transform(&self, chain: TransformChain) {
        self.shared.transform.store(Arc::new(chain));
    }

    /// Active transform chain.
    pub fn transform(&self) -> Arc<TransformChain> {
        self.shared.transform.load_full()
    }
}

#[derive(Debug, Clone)]
struct Active {
    epoch: u64,
    connection: Arc<Connection>,
}

struct Session {
    active: Active,
    multicast: Option<MulticastSession>,
}

struct MulticastSession {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MulticastSession {
    async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "multicast loop ended abnormally");
        }
    }
}

struct Shared<S> {
    config: ClientConfig,
    transform: ArcSwap<TransformChain>,
    events: mpsc::UnboundedSender<ClientEvent<S>>,
    /// Serialises connect and teardown.
    lifecycle: tokio::sync::Mutex<Option<Session>>,
    /// Snapshot of the live connection for the send path.
    active: Mutex<Option<Active>>,
    state: Mutex<ConnectionState>,
    epochs: AtomicU64,
    last_remote: Mutex<Option<SocketAddr>>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<S>>>,
    next_request: AtomicU64,
}

impl<S: ServerMessage> Shared<S> {
    fn active(&self) -> Option<Active> {
        lock(&self.active).clone()
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    async fn connect(self: &Arc<Self>, remote: SocketAddr) -> Result<()> {
        let mut slot = self.lifecycle.lock().await;
        if slot.is_some() {
            debug!(%remote, "already connected");
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        match self.open(remote).await {
            Ok(session) => {
                *lock(&self.active) = Some(session.active.clone());
                *lock(&self.last_remote) = Some(remote);
                info!(%remote, epoch = session.active.epoch, "connected");
                *slot = Some(session);
                self.set_state(ConnectionState::Connected);
                Ok(())
            },
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                warn!(%remote, error = %e, "connect failed");
                Err(e)
            },
        }
    }

    async fn open(self: &Arc<Self>, remote: SocketAddr) -> Result<Session> {
        let tuning = SocketTuning::STANDARD;
        let stream = connect_tuned(remote, self.config.local_port, &tuning).await?;

        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let handler = ClientHandler { shared: Arc::downgrade(self), epoch };
        let connection = Connection::spawn(stream, &tuning, handler)
            .map_err(|e| NetError::socket("configure", e))?;

        let multicast =
            self.config.multicast.as_ref().and_then(|config| self.join_multicast(config, remote));
        Ok(Session { active: Active { epoch, connection }, multicast })
    }

    fn join_multicast(&self, config: &MulticastConfig, remote: SocketAddr) -> Option<MulticastSession> {
        let Some(port) = multicast_port(remote.port()) else {
            warn!(group = %config.group, control_port = remote.port(), "multicast unavailable, continuing without it");
            return None;
        };
        let socket = match multicast::bind_receiver(config, port) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(group = %config.group, port, error = %e, "multicast unavailable, continuing without it");
                return None;
            },
        };

        let (shutdown, signal) = watch::channel(false);
        let events = self.events.clone();
        let task = multicast::spawn_receiver(
            socket,
            self.transform.load().codec(),
            config.expected_sender(),
            signal,
            move |message: S| {
                let _ = events.send(ClientEvent::MulticastReceived(message));
            },
        );
        debug!(group = %config.group, port, "joined multicast group");
        Some(MulticastSession { shutdown, task })
    }

    /// Tear down the current session. With `epoch`, only if the current
    /// session still has that epoch. Returns the endpoint it was connected
    /// to.
    async fn teardown(&self, epoch: Option<u64>) -> Option<SocketAddr> {
        let mut slot = self.lifecycle.lock().await;
        match (slot.as_ref(), epoch) {
            (None, _) => return None,
            (Some(session), Some(epoch)) if session.active.epoch != epoch => {
                debug!(epoch, current = session.active.epoch, "ignoring loss of replaced connection");
                return None;
            },
            _ => {},
        }
        let session = slot.take()?;

        *lock(&self.active) = None;
        self.set_state(ConnectionState::Disconnected);

        if let Some(multicast) = session.multicast {
            multicast.stop().await;
        }
        let connection = session.active.connection;
        connection.close().await;
        lock(&self.pending).clear();

        let remote = connection.remote_addr();
        info!(%remote, "disconnected");
        Some(remote)
    }

    /// Tear down `epoch` and report it lost.
    async fn lose(&self, epoch: u64) -> Option<SocketAddr> {
        let remote = self.teardown(Some(epoch)).await?;
        let _ = self.events.send(ClientEvent::ConnectionLost);
        Some(remote)
    }

    async fn heartbeat(self: &Arc<Self>, repair: bool) -> bool {
        let Some(active) = self.active() else {
            return false;
        };
        let Err(error) = active.connection.check_alive().await else {
            return true;
        };

        warn!(%error, repair, "dropping off");
        let lost = self.lose(active.epoch).await;
        if let (true, Some(remote)) = (repair, lost) {
            self.repair_to(remote).await;
        }
        false
    }

    async fn repair_to(self: &Arc<Self>, remote: SocketAddr) -> bool {
        if !probe_reachable(remote, self.config.repair_probe_timeout).await {
            warn!(%remote, "server unreachable, dropping off");
            return false;
        }

        info!(%remote, "reconnecting");
        if self.connect(remote).await.is_err() {
            return false;
        }
        let Some(active) = self.active() else {
            return false;
        };
        if active.connection.is_alive().await {
            return true;
        }
        self.lose(active.epoch).await;
        false
    }

    async fn on_loss(self: Arc<Self>, epoch: u64, reason: CloseReason) {
        match reason {
            CloseReason::PeerClosed => {
                info!(epoch, "server closed the connection");
                self.lose(epoch).await;
            },
            CloseReason::Broken => {
                if let Some(remote) = self.lose(epoch).await {
                    self.repair_to(remote).await;
                }
            },
        }
    }

    async fn send<M: Serialize>(self: &Arc<Self>, envelope: &Envelope<M>) -> bool {
        let Some(active) = self.active() else {
            debug!("not connected, message discarded");
            return false;
        };

        let frame = match frame_message(&self.transform.load(), envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "could not encode message");
                return false;
            },
        };

        match active.connection.send_frame(&frame).await {
            SendOutcome::Sent => true,
            SendOutcome::NothingWritten => {
                warn!(remote = %active.connection.remote_addr(), "send reached no peer");
                self.heartbeat(false).await;
                false
            },
            SendOutcome::Failed(e) => {
                warn!(remote = %active.connection.remote_addr(), error = %e, "send failed");
                self.heartbeat(true).await;
                false
            },
        }
    }

    fn dispatch(&self, envelope: Envelope<S>) {
        trace!(message = envelope.body.type_name(), request_id = ?envelope.correlation, "received");
        let mut body = envelope.body;
        if let Some(request_id) = envelope.correlation {
            let waiter = lock(&self.pending).remove(&request_id);
            match waiter {
                Some(waiter) => match waiter.send(body) {
                    Ok(()) => return,
                    Err(unclaimed) => body = unclaimed,
                },
                None => debug!(request_id, "answer arrived after its request gave up"),
            }
        }
        let _ = self.events.send(ClientEvent::MessageReceived(body));
    }
}

struct ClientHandler<S> {
    shared: Weak<Shared<S>>,
    epoch: u64,
}

impl<S: ServerMessage> FrameHandler for ClientHandler<S> {
    async fn on_frame(&self, frame: Bytes) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let chain = shared.transform.load_full();
        match chain.decode::<Envelope<S>>(frame).await {
            Ok(Some(envelope)) => shared.dispatch(envelope),
            Ok(None) => {},
            Err(e) => warn!(error = %e, "dropping undecodable frame"),
        }
    }

    fn on_closed(&self, reason: CloseReason) {
        if let Some(shared) = self.shared.upgrade() {
            tokio::spawn(shared.on_loss(self.epoch, reason));
        }
    }
}
