//! The connection lifecycle state machine.
//!
//! A [`Connection`] wraps one transport and drives it through
//! `Idle → Connecting → Open → Closing → Closed`, or `Connecting → Failed` when
//! the attempt does not succeed. The same type serves both sides of a socket:
//! a [`Role::Client`] connection dials out with [`Connection::begin_connect`],
//! a [`Role::Server`] connection completes an inbound upgrade with
//! [`Connection::accept`].
//!
//! Once open, a background listen loop reads frames, reassembles them into
//! [`Message`]s and raises events. Sends are serialized by a per-connection
//! send lock and split into frames of at most
//! [`MESSAGE_CHUNK_SIZE`](crate::config::MESSAGE_CHUNK_SIZE) bytes.
//!
//! # Examples
//!
//! ```no_run
//! use std::time::Duration;
//! use wschannel_core::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let conn = Connection::client("ws://127.0.0.1:8080/chat", ConnectionConfig::default());
//! conn.on_message(|msg| println!("received {} bytes", msg.len()));
//!
//! if conn.connect(Duration::from_secs(5)).await {
//!     conn.send_async("hello").await?;
//!     conn.disconnect_async().await;
//! }
//! # Ok(())
//! # }
//! ```

use crate::closure::{ClosureReason, TransportErrorCode};
use crate::config::{ConnectionConfig, MESSAGE_CHUNK_SIZE};
use crate::error::{ConnectError, Error, Result, TransportResult};
use crate::event::{ConnectionEvent, EventHub, SubscriptionId};
use crate::message::{Message, MessageType};
use crate::transport::{ChannelState, Establish, FrameKind, Transport, websocket};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique identifier for a connection.
pub type ConnectionId = String;

/// Which side of the socket a connection is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Dials out to a server.
    Client,
    /// Accepts an inbound upgrade.
    Server,
}

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, nothing attempted yet.
    Idle,
    /// A connect or accept attempt is running.
    Connecting,
    /// Messages can be exchanged.
    Open,
    /// We sent a close frame and wait for the peer's acknowledgement.
    ClosingLocal,
    /// The peer sent a close frame and we are acknowledging it.
    ClosingRemote,
    /// The session has ended.
    Closed,
    /// The last connect or accept attempt failed.
    Failed,
}

impl ConnectionState {
    /// Returns `true` for [`Closed`](Self::Closed) and [`Failed`](Self::Failed).
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// Returns `true` while a close handshake is in progress.
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            ConnectionState::ClosingLocal | ConnectionState::ClosingRemote
        )
    }

    fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle | Failed, Connecting)
                | (Connecting, Open | Failed)
                | (Open, ClosingLocal | ClosingRemote)
                | (Open | ClosingLocal | ClosingRemote, Closed)
        )
    }
}

/// Metadata about a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Client or server side.
    pub role: Role,
    /// Remote address, when known. Only server connections record one.
    pub peer_addr: Option<SocketAddr>,
    /// Unix timestamp of creation, in seconds.
    pub created_at: u64,
}

struct Inner {
    info: ConnectionInfo,
    config: ConnectionConfig,
    establish: Establish,
    state: watch::Sender<ConnectionState>,
    transport: OnceLock<Arc<dyn Transport>>,
    lifecycle: Arc<tokio::sync::Mutex<()>>,
    send_lock: tokio::sync::Mutex<()>,
    close_sent: AtomicBool,
    disconnected: AtomicBool,
    events: EventHub,
}

/// A WebSocket connection, on either side of the socket.
///
/// `Connection` is a cheap handle: clones share the same underlying state.
/// Most operations require a running Tokio runtime.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// A non-owning handle to a [`Connection`].
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    /// Returns the connection if it is still alive.
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }

    /// Returns `true` if both handles point at the same connection.
    pub fn ptr_eq(&self, other: &WeakConnection) -> bool {
        self.inner.ptr_eq(&other.inner)
    }
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakConnection")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl Connection {
    /// Creates a connection with an arbitrary establish strategy.
    pub fn new(
        id: impl Into<ConnectionId>,
        role: Role,
        establish: Establish,
        config: ConnectionConfig,
    ) -> Self {
        Self::with_peer(id.into(), role, None, establish, config)
    }

    /// Creates a client connection that dials `uri` when connected.
    ///
    /// The id is `client-` followed by a random UUID.
    pub fn client(uri: impl Into<String>, config: ConnectionConfig) -> Self {
        let id = format!("client-{}", Uuid::new_v4().simple());
        Self::with_peer(id, Role::Client, None, websocket::dial(uri), config)
    }

    /// Creates a server connection for an inbound upgrade from `peer_addr`.
    pub fn server(
        id: impl Into<ConnectionId>,
        peer_addr: SocketAddr,
        establish: Establish,
        config: ConnectionConfig,
    ) -> Self {
        Self::with_peer(id.into(), Role::Server, Some(peer_addr), establish, config)
    }

    fn with_peer(
        id: ConnectionId,
        role: Role,
        peer_addr: Option<SocketAddr>,
        establish: Establish,
        config: ConnectionConfig,
    ) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let (state, _) = watch::channel(ConnectionState::Idle);

        Self {
            inner: Arc::new(Inner {
                events: EventHub::new(id.clone(), role == Role::Server),
                info: ConnectionInfo {
                    id,
                    role,
                    peer_addr,
                    created_at,
                },
                config,
                establish,
                state,
                transport: OnceLock::new(),
                lifecycle: Arc::new(tokio::sync::Mutex::new(())),
                send_lock: tokio::sync::Mutex::new(()),
                close_sent: AtomicBool::new(false),
                disconnected: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.inner.info.id
    }

    /// Returns the connection's role.
    pub fn role(&self) -> Role {
        self.inner.info.role
    }

    /// Returns the connection metadata.
    pub fn info(&self) -> &ConnectionInfo {
        &self.inner.info
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Returns `true` while the connection is open and no close has started.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Returns a receiver that observes state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Returns a non-owning handle.
    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Returns `true` if both handles point at the same connection.
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- connect / accept ----

    /// Starts connecting in the background and returns immediately.
    ///
    /// The outcome is reported as a [`ConnectionEvent::Connected`] or
    /// [`ConnectionEvent::ConnectionFailed`] event. The attempt is bounded by
    /// `timeout`. A failed client connection may be connected again.
    ///
    /// # Errors
    ///
    /// - [`ConnectError::AlreadyConnecting`] if an attempt is running
    /// - [`ConnectError::AlreadyConnected`] if the connection is open
    /// - [`ConnectError::InvalidState`] for server connections and connections
    ///   that are closing or closed
    pub fn begin_connect(&self, timeout: Duration) -> std::result::Result<(), ConnectError> {
        self.require_role(Role::Client)?;
        self.start_attempt(timeout).map(|_| ())
    }

    /// Connects and waits for the outcome. Returns `true` if the connection
    /// opened.
    pub async fn connect(&self, timeout: Duration) -> bool {
        if let Err(err) = self.require_role(Role::Client) {
            debug!("Connection {} cannot connect: {}", self.id(), err);
            return false;
        }
        match self.start_attempt(timeout) {
            Ok(attempt) => matches!(attempt.await, Ok(Ok(()))),
            Err(err) => {
                debug!("Connection {} cannot connect: {}", self.id(), err);
                false
            }
        }
    }

    /// Starts completing the inbound upgrade in the background.
    ///
    /// The attempt is bounded by `timeout`. A server connection accepts once;
    /// after a failed attempt further calls fail with
    /// [`ConnectError::InvalidState`].
    pub fn accept(&self, timeout: Duration) -> std::result::Result<(), ConnectError> {
        self.require_role(Role::Server)?;
        self.start_attempt(timeout).map(|_| ())
    }

    /// Completes the inbound upgrade and waits for the outcome.
    pub async fn accept_async(&self, timeout: Duration) -> std::result::Result<(), ConnectError> {
        self.require_role(Role::Server)?;
        let attempt = self.start_attempt(timeout)?;
        attempt.await.unwrap_or(Err(ConnectError::Faulted))
    }

    fn require_role(&self, role: Role) -> std::result::Result<(), ConnectError> {
        if self.role() == role {
            Ok(())
        } else {
            Err(ConnectError::InvalidState)
        }
    }

    fn start_attempt(
        &self,
        timeout: Duration,
    ) -> std::result::Result<JoinHandle<std::result::Result<(), ConnectError>>, ConnectError> {
        // The previous attempt may still hold the lock briefly after opening.
        self.check_can_attempt()?;
        let guard = self
            .inner
            .lifecycle
            .clone()
            .try_lock_owned()
            .map_err(|_| ConnectError::AlreadyConnecting)?;
        self.check_can_attempt()?;

        self.transition(ConnectionState::Connecting);
        debug!("Connection {} connecting", self.id());

        let conn = self.clone();
        Ok(tokio::spawn(async move {
            let outcome = conn.run_attempt(timeout).await;
            drop(guard);
            outcome
        }))
    }

    fn check_can_attempt(&self) -> std::result::Result<(), ConnectError> {
        match self.state() {
            ConnectionState::Idle => Ok(()),
            ConnectionState::Failed if self.role() == Role::Client => Ok(()),
            ConnectionState::Connecting => Err(ConnectError::AlreadyConnecting),
            ConnectionState::Open => Err(ConnectError::AlreadyConnected),
            _ => Err(ConnectError::InvalidState),
        }
    }

    async fn run_attempt(&self, timeout: Duration) -> std::result::Result<(), ConnectError> {
        let establish = (self.inner.establish)();
        let transport = match tokio::time::timeout(timeout, establish).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(err)) => {
                warn!("Connection {} failed to connect: {}", self.id(), err);
                return Err(self.fail(ConnectError::from_transport(err.code)));
            }
            Err(_) => {
                warn!("Connection {} timed out after {:?}", self.id(), timeout);
                return Err(self.fail(ConnectError::Timeout));
            }
        };

        if transport.state() != ChannelState::Open {
            warn!(
                "Connection {} established in unexpected state {:?}",
                self.id(),
                transport.state()
            );
            let _ = transport
                .close(ClosureReason::ProtocolError, "unexpected state")
                .await;
            return Err(self.fail(ConnectError::InvalidState));
        }

        if self.inner.transport.set(transport.clone()).is_err() {
            // Only one attempt ever reaches Open.
            return Err(self.fail(ConnectError::InvalidState));
        }
        self.transition(ConnectionState::Open);
        info!("Connection {} opened", self.id());
        self.inner.events.emit(ConnectionEvent::Connected);

        tokio::spawn(listen(self.clone(), transport));
        Ok(())
    }

    fn fail(&self, err: ConnectError) -> ConnectError {
        self.transition(ConnectionState::Failed);
        self.inner
            .events
            .emit(ConnectionEvent::ConnectionFailed(err));
        err
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let id = &self.inner.info.id;
        self.inner.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                debug!("Connection {} state {:?} -> {:?}", id, *state, next);
                *state = next;
                true
            } else {
                false
            }
        })
    }

    // ---- send ----

    /// Queues a message for sending and returns immediately.
    ///
    /// Failures are logged and handled like any send failure: the connection
    /// is torn down and [`ConnectionEvent::Disconnected`] is raised. Messages
    /// queued this way carry no ordering guarantee relative to each other.
    pub fn send(&self, message: impl Into<Message>) {
        let message = message.into();
        let conn = self.clone();
        tokio::spawn(async move {
            if let Err(err) = conn.send_async(message).await {
                debug!("Connection {} dropped a message: {}", conn.id(), err);
            }
        });
    }

    /// Sends a message and waits until every frame was handed to the
    /// transport.
    ///
    /// Concurrent sends on one connection never interleave their frames.
    ///
    /// # Errors
    ///
    /// Fails with [`ConnectError::InvalidState`] unless the connection is open
    /// and no close has started. Transport failures are returned after the
    /// connection was torn down.
    pub async fn send_async(&self, message: impl Into<Message>) -> Result<()> {
        let message = message.into();
        let transport = self.open_transport()?;
        let kind = match message.msg_type {
            MessageType::Text => FrameKind::Text,
            MessageType::Binary => FrameKind::Binary,
        };

        let result = {
            let _guard = self.inner.send_lock.lock().await;
            if self.inner.close_sent.load(Ordering::Acquire) || !self.is_open() {
                return Err(Error::Connect(ConnectError::InvalidState));
            }
            send_chunked(transport.as_ref(), message.data, kind).await
        };

        if let Err(err) = result {
            warn!("Connection {} send failed: {}", self.id(), err);
            self.emergency_disconnect(&transport, err.code).await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Sends a text message.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send_async(Message::text(text.into())).await
    }

    /// Sends a binary message.
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_async(Message::binary(data)).await
    }

    /// Serializes `value` as JSON and sends it as a text message.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.send_text(json).await
    }

    fn open_transport(&self) -> Result<Arc<dyn Transport>> {
        match self.inner.transport.get() {
            Some(transport)
                if self.is_open() && !self.inner.close_sent.load(Ordering::Acquire) =>
            {
                Ok(transport.clone())
            }
            _ => Err(Error::Connect(ConnectError::InvalidState)),
        }
    }

    // ---- disconnect ----

    /// Starts a graceful close and returns immediately.
    ///
    /// Does nothing unless the connection is open. If the peer does not
    /// acknowledge within the close timeout, the transport is closed hard.
    pub fn disconnect(&self) {
        let conn = self.clone();
        tokio::spawn(async move { conn.disconnect_async().await });
    }

    /// Closes gracefully and waits for the session to end.
    ///
    /// Waits at most the configured close timeout for the peer's
    /// acknowledgement. On expiry the transport is closed hard and
    /// [`ConnectionEvent::Disconnected`] is raised with
    /// [`ClosureReason::EndpointUnavailable`]. Calling this on a connection
    /// that is not open, or a second time, is a no-op.
    pub async fn disconnect_async(&self) {
        let Some(transport) = self.inner.transport.get().cloned() else {
            debug!("Connection {} never opened, nothing to close", self.id());
            return;
        };
        if self.state().is_terminal() {
            return;
        }

        let result = {
            let _guard = self.inner.send_lock.lock().await;
            if self.inner.close_sent.swap(true, Ordering::AcqRel) {
                None
            } else {
                self.transition(ConnectionState::ClosingLocal);
                info!("Connection {} closing", self.id());
                Some(
                    transport
                        .close_output(ClosureReason::NormalClosure, "Closing")
                        .await,
                )
            }
        };
        if let Some(Err(err)) = result {
            warn!("Connection {} failed to send close: {}", self.id(), err);
            self.emergency_disconnect(&transport, err.code).await;
            return;
        }

        let timeout = self.inner.config.close_timeout();
        let mut state = self.inner.state.subscribe();
        let acknowledged = tokio::time::timeout(timeout, state.wait_for(|s| s.is_terminal()))
            .await
            .is_ok();
        if !acknowledged {
            warn!(
                "Connection {} close not acknowledged within {:?}",
                self.id(),
                timeout
            );
            {
                let _guard = self.inner.send_lock.lock().await;
                let _ = transport
                    .close(ClosureReason::EndpointUnavailable, "close timeout")
                    .await;
            }
            self.finish(ClosureReason::EndpointUnavailable);
        }
    }

    /// Tears the connection down after a transport failure.
    async fn emergency_disconnect(&self, transport: &Arc<dyn Transport>, code: TransportErrorCode) {
        let reason = ClosureReason::from_transport(code);
        {
            let _guard = self.inner.send_lock.lock().await;
            self.inner.close_sent.store(true, Ordering::Release);
            if transport.state() == ChannelState::Open {
                let _ = transport
                    .close_output(ClosureReason::InternalServerError, "Internal error")
                    .await;
            }
            let _ = transport.close(reason, "Internal error").await;
        }
        self.finish(reason);
    }

    /// Handles the peer's close frame.
    async fn remote_close(&self, transport: &Arc<dyn Transport>) {
        {
            let _guard = self.inner.send_lock.lock().await;
            if !self.inner.close_sent.swap(true, Ordering::AcqRel) {
                self.transition(ConnectionState::ClosingRemote);
                debug!("Connection {} acknowledging close", self.id());
            }
            if let Err(err) = transport
                .close(ClosureReason::NormalClosure, "Closing")
                .await
            {
                debug!("Connection {} close ack failed: {}", self.id(), err);
            }
        }
        self.finish(ClosureReason::NormalClosure);
    }

    /// Moves to `Closed` and raises `Disconnected`, once.
    fn finish(&self, reason: ClosureReason) {
        self.transition(ConnectionState::Closed);
        if !self.inner.disconnected.swap(true, Ordering::AcqRel) {
            info!("Connection {} closed: {}", self.id(), reason);
            self.inner
                .events
                .emit(ConnectionEvent::Disconnected(reason));
        }
    }

    async fn terminated(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }

    // ---- events ----

    /// Subscribes a callback to every event.
    ///
    /// Callbacks run on the connection's dispatcher task, one event at a time.
    pub fn on_event<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.events.add_callback(Arc::new(callback))
    }

    /// Subscribes to [`ConnectionEvent::Connected`].
    pub fn on_connected<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let ConnectionEvent::Connected = event {
                callback();
            }
        })
    }

    /// Subscribes to [`ConnectionEvent::MessageReceived`].
    pub fn on_message<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let ConnectionEvent::MessageReceived(message) = event {
                callback(message);
            }
        })
    }

    /// Subscribes to [`ConnectionEvent::Disconnected`].
    pub fn on_disconnected<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(ClosureReason) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let ConnectionEvent::Disconnected(reason) = event {
                callback(*reason);
            }
        })
    }

    /// Subscribes to [`ConnectionEvent::ConnectionFailed`].
    pub fn on_connection_failed<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(ConnectError) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let ConnectionEvent::ConnectionFailed(err) = event {
                callback(*err);
            }
        })
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.remove(id)
    }

    /// Returns a channel receiving every later event.
    ///
    /// The channel closes after the terminal event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.inner.events.add_channel()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", self.id())
            .field("role", &self.role())
            .field("state", &self.state())
            .finish()
    }
}

async fn send_chunked(
    transport: &dyn Transport,
    data: Bytes,
    kind: FrameKind,
) -> TransportResult<()> {
    if data.is_empty() {
        return transport.send_frame(data, kind, true).await;
    }

    let len = data.len();
    let mut start = 0;
    while start < len {
        let end = (start + MESSAGE_CHUNK_SIZE).min(len);
        transport
            .send_frame(data.slice(start..end), kind, end == len)
            .await?;
        start = end;
    }
    Ok(())
}

/// Reads frames until the peer closes, the transport fails or the connection
/// ends some other way.
async fn listen(conn: Connection, transport: Arc<dyn Transport>) {
    debug!("Connection {} listening", conn.id());
    let max_size = conn.inner.config.max_message_size;
    let mut buffer = BytesMut::new();
    let mut current: Option<MessageType> = None;

    let terminated = conn.terminated();
    tokio::pin!(terminated);

    loop {
        let frame = tokio::select! {
            biased;
            frame = transport.receive_frame() => frame,
            _ = &mut terminated => break,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Connection {} receive failed: {}", conn.id(), err);
                conn.emergency_disconnect(&transport, err.code).await;
                break;
            }
        };

        let msg_type = match frame.kind {
            FrameKind::Close => {
                debug!("Connection {} received close", conn.id());
                conn.remote_close(&transport).await;
                break;
            }
            FrameKind::Text => MessageType::Text,
            FrameKind::Binary => MessageType::Binary,
        };

        if buffer.len() + frame.payload.len() > max_size {
            warn!(
                "Connection {} message exceeds {} bytes",
                conn.id(),
                max_size
            );
            conn.emergency_disconnect(&transport, TransportErrorCode::MessageTooBig)
                .await;
            break;
        }

        let msg_type = *current.get_or_insert(msg_type);
        buffer.extend_from_slice(&frame.payload);
        if !frame.is_final {
            continue;
        }

        current = None;
        let message = Message::new(buffer.split().freeze(), msg_type);
        if conn.inner.disconnected.load(Ordering::Acquire) {
            debug!("Connection {} dropping message after disconnect", conn.id());
            continue;
        }
        conn.inner
            .events
            .emit(ConnectionEvent::MessageReceived(message));
    }
    debug!("Connection {} listen loop stopped", conn.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::{Frame, MemoryTransport};
    use futures_util::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    const WAIT: Duration = Duration::from_secs(2);

    fn config() -> ConnectionConfig {
        ConnectionConfig::default().with_close_timeout(Duration::from_millis(300))
    }

    /// A client connection whose peer is a raw transport end.
    async fn open_client() -> (Connection, mpsc::UnboundedReceiver<ConnectionEvent>, MemoryTransport) {
        let (local, remote) = MemoryTransport::pair();
        let conn = Connection::new("c1", Role::Client, local.into_establish(), config());
        let mut events = conn.subscribe();
        assert!(conn.connect(WAIT).await);
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
        (conn, events, remote)
    }

    /// A client and a server connection talking to each other.
    async fn open_pair() -> (Connection, Connection) {
        let (a, b) = MemoryTransport::pair();
        let client = Connection::new("client", Role::Client, a.into_establish(), config());
        let server = Connection::server(
            "server",
            "127.0.0.1:9000".parse().unwrap(),
            b.into_establish(),
            config(),
        );
        assert!(client.connect(WAIT).await);
        server.accept_async(WAIT).await.unwrap();
        (client, server)
    }

    fn pending() -> Establish {
        Arc::new(|| futures_util::future::pending::<TransportResult<Arc<dyn Transport>>>().boxed())
    }

    fn refusing() -> Establish {
        Arc::new(|| refuse().boxed())
    }

    async fn refuse() -> TransportResult<Arc<dyn Transport>> {
        Err(TransportError::invalid_state("upgrade consumed"))
    }

    async fn gated(
        slot: Option<(oneshot::Receiver<()>, MemoryTransport)>,
    ) -> TransportResult<Arc<dyn Transport>> {
        let (gate, transport) = slot.ok_or_else(|| TransportError::invalid_state("used"))?;
        let _ = gate.await;
        Ok(Arc::new(transport))
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn drain(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut seen = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            seen.push(event);
        }
        seen
    }

    fn count_disconnects(events: &[ConnectionEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::Disconnected(_)))
            .count()
    }

    #[tokio::test]
    async fn test_connect_and_exchange_messages() {
        let (client, server) = open_pair().await;
        assert!(client.is_open());
        assert!(server.is_open());
        assert_eq!(server.info().peer_addr, Some("127.0.0.1:9000".parse().unwrap()));

        let mut server_events = server.subscribe();
        client.send_async("hello").await.unwrap();
        assert_eq!(
            next_event(&mut server_events).await,
            ConnectionEvent::MessageReceived(Message::text("hello"))
        );
    }

    #[tokio::test]
    async fn test_client_id_prefix() {
        let conn = Connection::client("ws://127.0.0.1:1/", ConnectionConfig::default());
        assert!(conn.id().starts_with("client-"));
        assert_eq!(conn.role(), Role::Client);
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_second_connect_while_connecting_is_rejected() {
        let (release, gate) = oneshot::channel::<()>();
        let (local, _remote) = MemoryTransport::pair();
        let slot = Arc::new(parking_lot::Mutex::new(Some((gate, local))));
        let establish: Establish = Arc::new(move || gated(slot.lock().take()).boxed());

        let conn = Connection::new("c1", Role::Client, establish, config());
        let mut events = conn.subscribe();
        conn.begin_connect(WAIT).unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(conn.begin_connect(WAIT), Err(ConnectError::AlreadyConnecting));

        release.send(()).unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
        assert_eq!(conn.begin_connect(WAIT), Err(ConnectError::AlreadyConnected));
    }

    #[tokio::test]
    async fn test_connect_timeout_fails_without_connected() {
        let conn = Connection::new("c1", Role::Client, pending(), config());
        let mut events = conn.subscribe();

        conn.begin_connect(Duration::from_millis(50)).unwrap();
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::ConnectionFailed(ConnectError::Timeout)
        );
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert!(drain(&mut events).await.is_empty());
    }

    #[tokio::test]
    async fn test_client_may_retry_after_failure() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let (local, _remote) = MemoryTransport::pair();
        let local = Arc::new(parking_lot::Mutex::new(Some(local)));
        let counter = attempts.clone();
        let establish: Establish = Arc::new(move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            let transport = if attempt == 0 { None } else { local.lock().take() };
            async move {
                transport
                    .map(|t| Arc::new(t) as Arc<dyn Transport>)
                    .ok_or_else(|| {
                        TransportError::new(
                            TransportErrorCode::EndpointUnreachable,
                            "refused",
                        )
                    })
            }
            .boxed()
        });

        let conn = Connection::new("c1", Role::Client, establish, config());
        assert!(!conn.connect(WAIT).await);
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert!(conn.connect(WAIT).await);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_server_accepts_once() {
        let (_client, server) = open_pair().await;
        assert_eq!(server.accept(WAIT), Err(ConnectError::AlreadyConnected));

        let failing = Connection::server("s", "127.0.0.1:1".parse().unwrap(), refusing(), config());
        assert_eq!(failing.accept_async(WAIT).await, Err(ConnectError::InvalidState));
        assert_eq!(failing.state(), ConnectionState::Failed);
        assert_eq!(failing.accept_async(WAIT).await, Err(ConnectError::InvalidState));
    }

    #[tokio::test]
    async fn test_role_mismatch_is_invalid_state() {
        let client = Connection::new("c", Role::Client, pending(), config());
        let server = Connection::new("s", Role::Server, pending(), config());
        assert_eq!(client.accept(WAIT), Err(ConnectError::InvalidState));
        assert_eq!(server.begin_connect(WAIT), Err(ConnectError::InvalidState));
        assert!(!server.connect(WAIT).await);
    }

    #[tokio::test]
    async fn test_large_message_is_chunked() {
        let (conn, _events, remote) = open_client().await;
        let payload: Vec<u8> = (0..MESSAGE_CHUNK_SIZE * 7 / 2).map(|i| (i % 251) as u8).collect();
        conn.send_async(payload.clone()).await.unwrap();

        let mut frames = Vec::new();
        loop {
            let frame = remote.receive_frame().await.unwrap();
            let last = frame.is_final;
            frames.push(frame);
            if last {
                break;
            }
        }
        assert_eq!(frames.len(), 4);
        for frame in &frames[..3] {
            assert_eq!(frame.payload.len(), MESSAGE_CHUNK_SIZE);
            assert!(!frame.is_final);
        }
        assert_eq!(frames[3].payload.len(), MESSAGE_CHUNK_SIZE / 2);

        let joined: Vec<u8> = frames.iter().flat_map(|f| f.payload.to_vec()).collect();
        assert_eq!(joined, payload);
    }

    #[tokio::test]
    async fn test_fragments_reassembled_into_one_message() {
        let (_conn, mut events, remote) = open_client().await;
        remote
            .send_frame(Bytes::from_static(b"hel"), FrameKind::Text, false)
            .await
            .unwrap();
        remote
            .send_frame(Bytes::from_static(b"lo"), FrameKind::Text, true)
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::MessageReceived(Message::text("hello"))
        );
    }

    #[tokio::test]
    async fn test_large_message_round_trip() {
        let (client, server) = open_pair().await;
        let mut events = server.subscribe();
        let payload: Vec<u8> = (0..MESSAGE_CHUNK_SIZE * 3 + 17).map(|i| (i % 7) as u8).collect();
        client.send_binary(payload.clone()).await.unwrap();

        match next_event(&mut events).await {
            ConnectionEvent::MessageReceived(message) => {
                assert!(message.is_binary());
                assert_eq!(message.as_bytes(), &payload[..]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_message_is_one_final_frame() {
        let (conn, _events, remote) = open_client().await;
        conn.send_async(Vec::<u8>::new()).await.unwrap();
        let frame = remote.receive_frame().await.unwrap();
        assert_eq!(frame, Frame::data(Bytes::new(), FrameKind::Binary, true));
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let (conn, _events, remote) = open_client().await;
        let size = MESSAGE_CHUNK_SIZE * 2 + 100;

        let mut tasks = Vec::new();
        for i in 0..16u8 {
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move {
                conn.send_async(vec![i; size]).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..16 {
            let mut message = Vec::new();
            loop {
                let frame = remote.receive_frame().await.unwrap();
                message.extend_from_slice(&frame.payload);
                if frame.is_final {
                    break;
                }
            }
            assert_eq!(message.len(), size);
            assert!(message.iter().all(|b| *b == message[0]));
            seen.push(message[0]);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..16u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_disconnect_twice_raises_one_event() {
        let (client, server) = open_pair().await;
        let mut client_events = client.subscribe();
        let mut server_events = server.subscribe();

        client.disconnect();
        client.disconnect();

        assert_eq!(
            next_event(&mut client_events).await,
            ConnectionEvent::Disconnected(ClosureReason::NormalClosure)
        );
        assert_eq!(
            next_event(&mut server_events).await,
            ConnectionEvent::Disconnected(ClosureReason::NormalClosure)
        );
        assert!(drain(&mut client_events).await.is_empty());
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(server.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_disconnect_async_waits_for_ack() {
        let (client, server) = open_pair().await;
        client.disconnect_async().await;
        assert_eq!(client.state(), ConnectionState::Closed);

        server.disconnect_async().await;
        assert_eq!(server.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_remote_close_is_acknowledged() {
        let (conn, mut events, remote) = open_client().await;
        remote
            .close_output(ClosureReason::NormalClosure, "bye")
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Disconnected(ClosureReason::NormalClosure)
        );
        assert!(remote.receive_frame().await.unwrap().is_close());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_timeout_forces_disconnect() {
        let (conn, mut events, _remote) = open_client().await;
        conn.disconnect_async().await;

        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Disconnected(ClosureReason::EndpointUnavailable)
        );
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_severed_transport_disconnects() {
        let (conn, mut events, remote) = open_client().await;
        remote.sever();
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Disconnected(ClosureReason::EndpointUnavailable)
        );
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_send_failure_disconnects_once() {
        let (conn, mut events, remote) = open_client().await;
        drop(remote);

        let _ = conn.send_async("late").await;
        let seen = drain(&mut events).await;
        assert_eq!(count_disconnects(&seen), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_oversized_message_closes_connection() {
        let (local, remote) = MemoryTransport::pair();
        let conn = Connection::new(
            "c1",
            Role::Client,
            local.into_establish(),
            config().with_max_message_size(8),
        );
        let mut events = conn.subscribe();
        assert!(conn.connect(WAIT).await);
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);

        remote
            .send_frame(Bytes::from_static(b"0123456789"), FrameKind::Binary, true)
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Disconnected(ClosureReason::MessageTooBig)
        );
        assert!(remote.receive_frame().await.unwrap().is_close());
    }

    #[tokio::test]
    async fn test_send_rejected_after_close_started() {
        let (conn, _events, _remote) = open_client().await;
        conn.disconnect();
        let mut state = conn.watch_state();
        state.wait_for(|s| s.is_closing() || s.is_terminal()).await.unwrap();

        let err = conn.send_async("too late").await.unwrap_err();
        assert!(matches!(err, Error::Connect(ConnectError::InvalidState)));
    }

    #[tokio::test]
    async fn test_operations_before_connect() {
        let conn = Connection::new("c1", Role::Client, pending(), config());
        let err = conn.send_async("nope").await.unwrap_err();
        assert!(matches!(err, Error::Connect(ConnectError::InvalidState)));

        conn.disconnect_async().await;
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_weak_handle() {
        let conn = Connection::new("c1", Role::Client, pending(), config());
        let weak = conn.downgrade();
        assert!(weak.upgrade().unwrap().ptr_eq(&conn));
        assert!(weak.ptr_eq(&conn.downgrade()));
        drop(conn);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_callback_subscriptions() {
        let (client, server) = open_pair().await;
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        let id = server.on_message(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut events = server.subscribe();

        client.send_async("one").await.unwrap();
        next_event(&mut events).await;
        assert!(server.unsubscribe(id));
        client.send_async("two").await.unwrap();
        next_event(&mut events).await;

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }
}
