//! WebSocket transport over `tokio-tungstenite`.
//!
//! The stream is split into a sink and a stream half, each behind its own async
//! mutex, so the listen loop can wait for frames while sends proceed.
//!
//! tungstenite reassembles fragmented inbound messages itself, so every data
//! frame this transport yields is final. Outbound messages are written as raw
//! frames, which keeps the connection's chunking visible on the wire.

use super::{ChannelState, Establish, Frame, FrameKind, Transport};
use crate::closure::{ClosureReason, TransportErrorCode};
use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use tungstenite::Error as WsError;
use tungstenite::Message as WsMessage;
use tungstenite::error::ProtocolError;
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::frame::Frame as WsFrame;
use tungstenite::protocol::frame::coding::{CloseCode, Data as OpData, OpCode};

/// A [`Transport`] backed by a tungstenite WebSocket stream.
pub struct WebSocketTransport<S> {
    sink: tokio::sync::Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    stream: tokio::sync::Mutex<SplitStream<WebSocketStream<S>>>,
    state: Mutex<ChannelState>,
    continuing: AtomicBool,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an established WebSocket stream.
    pub fn new(stream: WebSocketStream<S>) -> Self {
        let (sink, stream) = stream.split();
        Self {
            sink: tokio::sync::Mutex::new(sink),
            stream: tokio::sync::Mutex::new(stream),
            state: Mutex::new(ChannelState::Open),
            continuing: AtomicBool::new(false),
        }
    }

    fn set_state(&self, next: ChannelState) {
        *self.state.lock() = next;
    }

    fn abort(&self) {
        let mut state = self.state.lock();
        if *state != ChannelState::Closed {
            *state = ChannelState::Aborted;
        }
    }

    async fn write_close(&self, reason: ClosureReason, text: &str) -> TransportResult<()> {
        let next = match self.state() {
            ChannelState::Open => ChannelState::CloseSent,
            ChannelState::CloseReceived => ChannelState::Closed,
            other => {
                return Err(TransportError::invalid_state(format!(
                    "cannot send close in state {:?}",
                    other
                )));
            }
        };

        // 1005 is reserved for "no status" and must not go on the wire.
        let frame = match reason {
            ClosureReason::Unknown => None,
            reason => Some(CloseFrame {
                code: CloseCode::from(reason.code()),
                reason: text.to_owned().into(),
            }),
        };

        self.set_state(next);
        let mut sink = self.sink.lock().await;
        match sink.send(WsMessage::Close(frame)).await {
            Ok(()) | Err(WsError::ConnectionClosed) => Ok(()),
            Err(e) => {
                drop(sink);
                self.abort();
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
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

        let opcode = if self.continuing.load(Ordering::Acquire) {
            OpCode::Data(OpData::Continue)
        } else {
            match kind {
                FrameKind::Binary => OpCode::Data(OpData::Binary),
                FrameKind::Text => OpCode::Data(OpData::Text),
                FrameKind::Close => {
                    return Err(TransportError::new(
                        TransportErrorCode::InvalidMessageType,
                        "close is not a data frame",
                    ));
                }
            }
        };

        let frame = WsFrame::message(payload.to_vec(), opcode, is_final);
        let mut sink = self.sink.lock().await;
        match sink.send(WsMessage::Frame(frame)).await {
            Ok(()) => {
                self.continuing.store(!is_final, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                drop(sink);
                self.abort();
                Err(e.into())
            }
        }
    }

    async fn receive_frame(&self) -> TransportResult<Frame> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    return Ok(Frame::data(data, FrameKind::Binary, true));
                }
                Some(Ok(WsMessage::Text(text))) => {
                    return Ok(Frame::data(text.into_bytes(), FrameKind::Text, true));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(?frame, "close frame received");
                    let mut state = self.state.lock();
                    *state = match *state {
                        ChannelState::CloseSent => ChannelState::Closed,
                        _ => ChannelState::CloseReceived,
                    };
                    return Ok(Frame::close());
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {
                    continue;
                }
                Some(Err(e)) => {
                    self.abort();
                    return Err(e.into());
                }
                None => {
                    self.abort();
                    return Err(TransportError::new(
                        TransportErrorCode::ConnectionClosedPrematurely,
                        "stream ended without a close frame",
                    ));
                }
            }
        }
    }

    async fn close_output(&self, reason: ClosureReason, text: &str) -> TransportResult<()> {
        self.write_close(reason, text).await
    }

    async fn close(&self, reason: ClosureReason, text: &str) -> TransportResult<()> {
        let result = match self.state() {
            ChannelState::Open | ChannelState::CloseReceived => self.write_close(reason, text).await,
            _ => Ok(()),
        };

        let mut sink = self.sink.lock().await;
        match sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {}
            Err(e) => debug!("error while closing sink: {}", e),
        }
        drop(sink);

        self.abort();
        result
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }
}

impl From<WsError> for TransportError {
    fn from(err: WsError) -> Self {
        TransportError::new(classify(&err), err)
    }
}

/// Classifies a tungstenite error into a transport error code.
pub fn classify(err: &WsError) -> TransportErrorCode {
    use TransportErrorCode as Code;

    match err {
        WsError::ConnectionClosed => Code::ConnectionClosedPrematurely,
        WsError::AlreadyClosed => Code::InvalidState,
        WsError::Io(e) => classify_io(e),
        WsError::Capacity(_) => Code::MessageTooBig,
        WsError::Utf8 => Code::InvalidPayload,
        WsError::WriteBufferFull(_) => Code::Faulted,
        WsError::AttackAttempt => Code::HeaderError,
        WsError::Url(_) => Code::EndpointUnreachable,
        WsError::Http(_) => Code::NotAWebSocket,
        WsError::HttpFormat(_) => Code::HeaderError,
        WsError::Protocol(protocol) => match protocol {
            ProtocolError::UnknownDataFrameType(_)
            | ProtocolError::UnknownControlFrameType(_)
            | ProtocolError::InvalidOpcode(_) => Code::InvalidMessageType,
            ProtocolError::WrongHttpMethod
            | ProtocolError::MissingUpgradeWebSocketHeader
            | ProtocolError::MissingConnectionUpgradeHeader => Code::NotAWebSocket,
            ProtocolError::MissingSecWebSocketVersionHeader => Code::UnsupportedVersion,
            ProtocolError::ResetWithoutClosingHandshake => Code::ConnectionClosedPrematurely,
            _ => Code::HeaderError,
        },
        #[allow(unreachable_patterns)]
        _ => Code::NativeError,
    }
}

fn classify_io(err: &io::Error) -> TransportErrorCode {
    use io::ErrorKind;

    match err.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable
        | ErrorKind::AddrNotAvailable
        | ErrorKind::NotFound => TransportErrorCode::EndpointUnreachable,
        ErrorKind::TimedOut => TransportErrorCode::Timeout,
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => TransportErrorCode::ConnectionClosedPrematurely,
        _ => TransportErrorCode::NativeError,
    }
}

/// Strategy that dials `uri` and performs the client handshake.
pub fn dial(uri: impl Into<String>) -> Establish {
    let uri = uri.into();
    Arc::new(move || dial_once(uri.clone()).boxed())
}

async fn dial_once(uri: String) -> TransportResult<Arc<dyn Transport>> {
    let (stream, _response) = tokio_tungstenite::connect_async(uri).await?;
    Ok(Arc::new(WebSocketTransport::new(stream)))
}

/// Strategy that completes the server handshake on an already-arrived upgrade
/// request. The stream is consumed by the first call; later calls fail with
/// [`TransportErrorCode::InvalidState`].
pub fn accept<S>(stream: S) -> Establish
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let pending = Arc::new(Mutex::new(Some(stream)));
    Arc::new(move || accept_once(pending.lock().take()).boxed())
}

async fn accept_once<S>(stream: Option<S>) -> TransportResult<Arc<dyn Transport>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let stream =
        stream.ok_or_else(|| TransportError::invalid_state("upgrade request already consumed"))?;
    let stream = tokio_tungstenite::accept_async(stream).await?;
    Ok(Arc::new(WebSocketTransport::new(stream)))
}
