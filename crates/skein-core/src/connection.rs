//! One TCP connection and its dedicated receive loop.
//!
//! A [`Connection`] owns the write half of a tuned stream. The read half
//! lives inside a spawned receive task that reassembles frames and hands
//! them, in wire order, to a [`FrameHandler`]. Client and server differ only
//! in the handler they plug in.
//!
//! # Receive loop
//!
//! ```text
//!            ┌──────────────────────────────────────────┐
//!            │ select(shutdown, timeout(read))           │
//!            └──────────────────────────────────────────┘
//!   shutdown │   timeout │   0 bytes   │  n bytes     │  io error
//!            ↓           ↓             ↓              ↓
//!          exit      continue     PeerClosed    frames → handler
//!                                                    liveness probe:
//!                                                    alive → continue
//!                                                    dead  → Broken
//! ```
//!
//! # Shutdown
//!
//! [`Connection::close`] signals the loop, waits for it to exit and only
//! then shuts the socket down, so the loop never touches a closed
//! transport. When called from inside the loop's own task it skips the wait.
//! Handlers still must not close from [`FrameHandler::on_closed`] directly:
//! they hand the disconnect to another task.

use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use serde::Serialize;
use skein_proto::{FrameReader, framing::encode_frame};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::watch,
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::{
    error::{NetError, Result, is_timeout},
    socket::{SocketTuning, is_connection_valid, recommended_recv_capacity},
    transform::TransformChain,
};

/// Lifecycle of an outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket.
    #[default]
    Disconnected,
    /// Socket being opened.
    Connecting,
    /// Socket open and receive loop running.
    Connected,
}

/// Result of writing one frame.
#[derive(Debug)]
pub enum SendOutcome {
    /// The whole frame was handed to the kernel.
    Sent,
    /// The transport accepted zero bytes.
    NothingWritten,
    /// The write failed or timed out.
    Failed(io::Error),
}

impl SendOutcome {
    /// Whether the frame went out.
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }
}

/// Why a receive loop stopped on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its side (zero-byte read).
    PeerClosed,
    /// The transport failed and the liveness probe found it dead, or the
    /// byte stream became unparseable.
    Broken,
}

/// Receiver of everything a connection's loop produces.
pub trait FrameHandler: Send + Sync + 'static {
    /// A complete frame arrived. Frames are delivered one at a time in wire
    /// order; the next read starts only after this future completes.
    fn on_frame(&self, frame: Bytes) -> impl Future<Output = ()> + Send;

    /// The loop stopped because of the peer or the transport.
    ///
    /// Not called when the loop stops because its connection was closed
    /// locally. Runs on the loop's own task, so it must not wait for that
    /// task to finish.
    fn on_closed(&self, reason: CloseReason);
}

tokio::task_local! {
    static RECEIVE_LOOP: u64;
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// An established, tuned TCP connection.
#[derive(Debug)]
pub struct Connection {
    serial: u64,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    remote: SocketAddr,
    local: SocketAddr,
    send_timeout: Duration,
    terminated: AtomicBool,
    shutdown: watch::Sender<bool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Take ownership of a tuned stream and start its receive loop.
    ///
    /// The receive buffer starts at the socket's reported receive capacity.
    pub fn spawn<H: FrameHandler>(
        stream: TcpStream,
        tuning: &SocketTuning,
        handler: H,
    ) -> io::Result<Arc<Self>> {
        let remote = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let capacity = recommended_recv_capacity(&stream, tuning);
        let (reader, writer) = stream.into_split();
        let (shutdown, signal) = watch::channel(false);
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);

        let connection = Arc::new(Self {
            serial,
            writer: tokio::sync::Mutex::new(writer),
            remote,
            local,
            send_timeout: tuning.send_timeout,
            terminated: AtomicBool::new(false),
            shutdown,
            receiver: Mutex::new(None),
        });

        let receive = ReceiveLoop {
            reader,
            frames: FrameReader::with_capacity(capacity),
            shutdown: signal,
            recv_timeout: tuning.recv_timeout,
            remote,
        };
        let task = tokio::spawn(RECEIVE_LOOP.scope(serial, receive.run(handler)));
        *connection.receiver.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        debug!(%remote, %local, capacity, "connection established");
        Ok(connection)
    }

    /// Remote endpoint.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Local endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Whether [`Connection::terminate`] has been called.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Whether the receive loop is still running.
    pub fn is_receiving(&self) -> bool {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Write one already-framed buffer, bounded by the send timeout.
    pub async fn send_frame(&self, frame: &[u8]) -> SendOutcome {
        if self.is_terminated() {
            return SendOutcome::Failed(io::ErrorKind::NotConnected.into());
        }

        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(self.send_timeout, writer.write_all(frame)).await {
            Ok(Ok(())) => {
                trace!(remote = %self.remote, bytes = frame.len(), "frame sent");
                SendOutcome::Sent
            },
            Ok(Err(e)) if e.kind() == io::ErrorKind::WriteZero => SendOutcome::NothingWritten,
            Ok(Err(e)) => SendOutcome::Failed(e),
            Err(_) => SendOutcome::Failed(io::ErrorKind::TimedOut.into()),
        }
    }

    /// Liveness probe: not terminated, and the transport reports itself
    /// connected and error-free.
    pub async fn is_alive(&self) -> bool {
        self.check_alive().await.is_ok()
    }

    /// Like [`Connection::is_alive`], but a dead peer is reported as
    /// [`NetError::Liveness`].
    pub async fn check_alive(&self) -> Result<()> {
        let alive = !self.is_terminated() && is_connection_valid(self.writer.lock().await.as_ref());
        if alive { Ok(()) } else { Err(NetError::Liveness { remote: self.remote }) }
    }

    /// Mark the connection dead and signal the receive loop to stop.
    ///
    /// Returns `false` if it was already terminated.
    pub fn terminate(&self) -> bool {
        let first = !self.terminated.swap(true, Ordering::AcqRel);
        if first {
            self.shutdown.send_replace(true);
        }
        first
    }

    /// Terminate, wait for the receive loop to exit, then shut the socket
    /// down. Safe to call more than once.
    pub async fn close(&self) {
        self.terminate();

        let task = self.receiver.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            let inside_loop = RECEIVE_LOOP.try_with(|serial| *serial == self.serial).unwrap_or(false);
            if inside_loop {
                debug!(remote = %self.remote, "close requested from receive loop, not joining");
            } else if let Err(e) = task.await {
                warn!(remote = %self.remote, error = %e, "receive loop ended abnormally");
            }
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            trace!(remote = %self.remote, error = %e, "socket shutdown");
        }
    }
}

/// Encode a message through a chain and length-prefix it.
pub fn frame_message<M: Serialize>(
    chain: &TransformChain,
    message: &M,
) -> skein_proto::Result<Bytes> {
    encode_frame(&chain.encode(message)?)
}

struct ReceiveLoop {
    reader: OwnedReadHalf,
    frames: FrameReader,
    shutdown: watch::Receiver<bool>,
    recv_timeout: Duration,
    remote: SocketAddr,
}

impl ReceiveLoop {
    async fn run<H: FrameHandler>(mut self, handler: H) {
        let reason = self.pump(&handler).await;
        debug!(remote = %self.remote, ?reason, "receive loop stopped");
        if let Some(reason) = reason {
            handler.on_closed(reason);
        }
    }

    /// Returns `None` when stopped locally.
    async fn pump<H: FrameHandler>(&mut self, handler: &H) -> Option<CloseReason> {
        loop {
            if *self.shutdown.borrow() {
                return None;
            }

            let read = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return None,
                read = tokio::time::timeout(
                    self.recv_timeout,
                    self.reader.read_buf(self.frames.buffer_mut()),
                ) => read,
            };

            match read {
                Err(_) => continue,
                Ok(Ok(0)) => return Some(CloseReason::PeerClosed),
                Ok(Ok(n)) => trace!(remote = %self.remote, bytes = n, "read"),
                Ok(Err(e)) if is_timeout(&e) => continue,
                Ok(Err(e)) => {
                    if is_connection_valid(self.reader.as_ref()) {
                        warn!(remote = %self.remote, error = %e, "read failed, peer still alive");
                        continue;
                    }
                    warn!(remote = %self.remote, error = %e, "read failed, peer gone");
                    return Some(CloseReason::Broken);
                },
            }

            loop {
                match self.frames.next_frame() {
                    Ok(Some(frame)) => handler.on_frame(frame).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(remote = %self.remote, error = %e, "unrecoverable frame");
                        return Some(CloseReason::Broken);
                    },
                }
                if *self.shutdown.borrow() {
                    return None;
                }
            }
        }
    }
}
