//! The transport collaborator.
//!
//! A [`Transport`] is one established, frame-oriented channel. The connection
//! state machine drives it and nothing else touches it: the listen loop is the
//! only caller of [`Transport::receive_frame`], and every outbound call happens
//! under the connection's send lock.
//!
//! Establishing a transport is a separate concern, expressed as an
//! [`Establish`] strategy: a function that dials out (client role) or completes
//! a pending upgrade (server role) and yields the open transport.
//!
//! Two implementations are provided:
//!
//! - [`websocket::WebSocketTransport`] over `tokio-tungstenite`
//! - [`memory::MemoryTransport`], an in-process duplex pair
//!
//! Cancellation follows the usual tokio convention: dropping an operation's
//! future cancels it.

pub mod memory;
pub mod websocket;

use crate::closure::ClosureReason;
use crate::error::TransportResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use std::sync::Arc;

pub use memory::MemoryTransport;
pub use websocket::WebSocketTransport;

/// The state of the channel as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// The opening handshake is still running.
    Connecting,
    /// Data can flow both ways.
    Open,
    /// We sent a close frame and are waiting for the peer's.
    CloseSent,
    /// The peer sent a close frame we have not answered yet.
    CloseReceived,
    /// Both close frames were exchanged.
    Closed,
    /// The channel ended without a close handshake.
    Aborted,
}

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Binary data (or a continuation of a binary message).
    Binary,
    /// Text data (or a continuation of a text message).
    Text,
    /// The peer's close signal.
    Close,
}

/// One unit received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame payload. Empty for close frames.
    pub payload: Bytes,
    /// Whether this frame completes its message.
    pub is_final: bool,
    /// Data or close.
    pub kind: FrameKind,
}

impl Frame {
    /// A data frame.
    pub fn data(payload: impl Into<Bytes>, kind: FrameKind, is_final: bool) -> Self {
        Self {
            payload: payload.into(),
            is_final,
            kind,
        }
    }

    /// A close frame.
    pub fn close() -> Self {
        Self {
            payload: Bytes::new(),
            is_final: true,
            kind: FrameKind::Close,
        }
    }

    /// Returns `true` for close frames.
    pub fn is_close(&self) -> bool {
        self.kind == FrameKind::Close
    }
}

/// An established, bidirectional, frame-oriented channel.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one frame. `kind` is the type of the message the frame belongs to;
    /// the transport decides whether it starts a new message or continues one.
    async fn send_frame(&self, payload: Bytes, kind: FrameKind, is_final: bool)
    -> TransportResult<()>;

    /// Waits for the next frame from the peer.
    async fn receive_frame(&self) -> TransportResult<Frame>;

    /// Sends a close frame without tearing the channel down (half-close).
    async fn close_output(&self, reason: ClosureReason, text: &str) -> TransportResult<()>;

    /// Completes or forces the close of the channel.
    async fn close(&self, reason: ClosureReason, text: &str) -> TransportResult<()>;

    /// The current channel state.
    fn state(&self) -> ChannelState;
}

/// Strategy that produces an open transport, either by dialing out or by
/// completing an inbound upgrade.
pub type Establish =
    Arc<dyn Fn() -> BoxFuture<'static, TransportResult<Arc<dyn Transport>>> + Send + Sync>;
