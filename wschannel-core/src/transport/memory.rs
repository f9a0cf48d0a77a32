//! In-process transport.
//!
//! [`MemoryTransport::pair`] returns two connected ends. Frames are passed
//! through unchanged, including their `is_final` flag, so a message sent in
//! several frames arrives in several frames. This makes the memory transport
//! the reference collaborator for testing the connection state machine.

use super::{ChannelState, Establish, Frame, FrameKind, Transport};
use crate::closure::{ClosureReason, TransportErrorCode};
use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One end of an in-memory duplex channel.
pub struct MemoryTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    state: Mutex<ChannelState>,
}

impl MemoryTransport {
    /// Creates two connected, open ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }

    fn new(outbound: mpsc::UnboundedSender<Frame>, inbound: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self {
            outbound: Mutex::new(Some(outbound)),
            inbound: tokio::sync::Mutex::new(inbound),
            state: Mutex::new(ChannelState::Open),
        }
    }

    /// Wraps this end in a single-use [`Establish`] strategy. Later calls fail
    /// with `InvalidState`, like a consumed upgrade request.
    pub fn into_establish(self) -> Establish {
        let slot = Arc::new(Mutex::new(Some(self)));
        Arc::new(move || {
            let transport = slot.lock().take();
            async move {
                match transport {
                    Some(transport) => Ok(Arc::new(transport) as Arc<dyn Transport>),
                    None => Err(TransportError::invalid_state("transport already handed out")),
                }
            }
            .boxed()
        })
    }

    /// Drops the outbound side without a close frame, as a network failure
    /// would. The peer's next receive fails.
    pub fn sever(&self) {
        self.outbound.lock().take();
        let mut state = self.state.lock();
        if *state != ChannelState::Closed {
            *state = ChannelState::Aborted;
        }
    }

    fn push(&self, frame: Frame) -> TransportResult<()> {
        let outbound = self.outbound.lock();
        let sender = outbound
            .as_ref()
            .ok_or_else(|| TransportError::invalid_state("outbound side is closed"))?;
        sender.send(frame).map_err(|_| {
            TransportError::new(
                TransportErrorCode::ConnectionClosedPrematurely,
                "peer dropped its end",
            )
        })
    }

    fn send_close(&self) -> TransportResult<()> {
        {
            let mut state = self.state.lock();
            *state = match *state {
                ChannelState::Open => ChannelState::CloseSent,
                ChannelState::CloseReceived => ChannelState::Closed,
                other => {
                    return Err(TransportError::invalid_state(format!(
                        "cannot send close in state {:?}",
                        other
                    )));
                }
            };
        }
        self.push(Frame::close())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_frame(
        &self,
        payload: Bytes,
        kind: FrameKind,
        is_final: bool,
    ) -> TransportResult<()> {
        match self.state() {
            ChannelState::Open | ChannelState::CloseReceived => {}
            other => {
                return Err(TransportError::invalid_state(format!(
                    "cannot send data in state {:?}",
                    other
                )));
            }
        }

        let result = self.push(Frame::data(payload, kind, is_final));
        if result.is_err() {
            *self.state.lock() = ChannelState::Aborted;
        }
        result
    }

    async fn receive_frame(&self) -> TransportResult<Frame> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(frame) => {
                if frame.is_close() {
                    let mut state = self.state.lock();
                    *state = match *state {
                        ChannelState::CloseSent => ChannelState::Closed,
                        ChannelState::Open => ChannelState::CloseReceived,
                        other => other,
                    };
                }
                Ok(frame)
            }
            None => {
                let mut state = self.state.lock();
                if *state != ChannelState::Closed {
                    *state = ChannelState::Aborted;
                }
                Err(TransportError::new(
                    TransportErrorCode::ConnectionClosedPrematurely,
                    "peer went away without a close frame",
                ))
            }
        }
    }

    async fn close_output(&self, _reason: ClosureReason, _text: &str) -> TransportResult<()> {
        self.send_close()
    }

    async fn close(&self, _reason: ClosureReason, _text: &str) -> TransportResult<()> {
        let result = match self.state() {
            ChannelState::Open | ChannelState::CloseReceived => self.send_close(),
            _ => Ok(()),
        };
        self.outbound.lock().take();
        let mut state = self.state.lock();
        if *state != ChannelState::Closed {
            *state = ChannelState::Aborted;
        }
        result
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_pass_through_unchanged() {
        let (a, b) = MemoryTransport::pair();
        a.send_frame(Bytes::from_static(b"he"), FrameKind::Text, false)
            .await
            .unwrap();
        a.send_frame(Bytes::from_static(b"llo"), FrameKind::Text, true)
            .await
            .unwrap();

        let first = b.receive_frame().await.unwrap();
        assert_eq!(first, Frame::data(&b"he"[..], FrameKind::Text, false));
        let second = b.receive_frame().await.unwrap();
        assert!(second.is_final);
        assert_eq!(second.payload, Bytes::from_static(b"llo"));
    }

    #[tokio::test]
    async fn test_close_handshake_states() {
        let (a, b) = MemoryTransport::pair();
        a.close_output(ClosureReason::NormalClosure, "bye").await.unwrap();
        assert_eq!(a.state(), ChannelState::CloseSent);

        assert!(b.receive_frame().await.unwrap().is_close());
        assert_eq!(b.state(), ChannelState::CloseReceived);

        b.close(ClosureReason::NormalClosure, "bye").await.unwrap();
        assert_eq!(b.state(), ChannelState::Closed);

        assert!(a.receive_frame().await.unwrap().is_close());
        assert_eq!(a.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let (a, _b) = MemoryTransport::pair();
        a.close_output(ClosureReason::NormalClosure, "").await.unwrap();
        let err = a
            .send_frame(Bytes::new(), FrameKind::Binary, true)
            .await
            .unwrap_err();
        assert_eq!(err.code, TransportErrorCode::InvalidState);
    }

    #[tokio::test]
    async fn test_sever_fails_peer_receive() {
        let (a, b) = MemoryTransport::pair();
        a.sever();
        let err = b.receive_frame().await.unwrap_err();
        assert_eq!(err.code, TransportErrorCode::ConnectionClosedPrematurely);
        assert_eq!(b.state(), ChannelState::Aborted);
    }

    #[tokio::test]
    async fn test_establish_is_single_use() {
        let (a, _b) = MemoryTransport::pair();
        let establish = a.into_establish();
        assert!(establish().await.is_ok());
        let err = establish().await.err().unwrap();
        assert_eq!(err.code, TransportErrorCode::InvalidState);
    }

    #[tokio::test]
    async fn test_send_to_dropped_peer_fails() {
        let (a, b) = MemoryTransport::pair();
        drop(b);
        let err = a
            .send_frame(Bytes::from_static(b"x"), FrameKind::Binary, true)
            .await
            .unwrap_err();
        assert_eq!(err.code, TransportErrorCode::ConnectionClosedPrematurely);
        assert_eq!(a.state(), ChannelState::Aborted);
    }
}
