//! Error types and result handling for wschannel.
//!
//! There are three layers of failure in this crate:
//!
//! - [`TransportError`]: what a [`Transport`](crate::transport::Transport)
//!   reports. It carries a [`TransportErrorCode`] plus a human readable message.
//! - [`ConnectError`]: the error taxonomy surfaced by `ConnectionFailed` events
//!   and by rejected lifecycle calls such as a second `begin_connect`.
//! - [`Error`]: the crate-wide error used by fallible public operations, with
//!   `From` conversions for everything below it.
//!
//! In-session failures are never returned as errors; they arrive as a
//! `Disconnected` event carrying a [`ClosureReason`](crate::closure::ClosureReason).
//!
//! # Examples
//!
//! ```
//! use wschannel_core::error::{ConnectError, Error};
//! use wschannel_core::closure::TransportErrorCode;
//!
//! let err = ConnectError::from_transport(TransportErrorCode::ConnectionClosedPrematurely);
//! assert_eq!(err, ConnectError::EndpointUnreachable);
//!
//! let err: Error = ConnectError::AlreadyConnecting.into();
//! assert!(matches!(err, Error::Connect(ConnectError::AlreadyConnecting)));
//! ```

use crate::closure::TransportErrorCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a connect or accept attempt failed, or why it was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
pub enum ConnectError {
    /// The attempt did not finish before its timeout.
    #[error("connect attempt timed out")]
    Timeout,

    /// Another attempt is still in flight on this connection.
    #[error("a connect attempt is already in progress")]
    AlreadyConnecting,

    /// The connection is already open.
    #[error("connection is already open")]
    AlreadyConnected,

    /// The connection's state or role does not allow the operation.
    #[error("operation not valid in the current connection state")]
    InvalidState,

    /// The upgrade was malformed or unexpected.
    #[error("protocol error during the opening handshake")]
    ProtocolError,

    /// The remote endpoint could not be reached.
    #[error("endpoint unreachable")]
    EndpointUnreachable,

    /// Generic transport fault.
    #[error("transport faulted")]
    Faulted,

    /// Unexpected failure from the layer below the transport.
    #[error("native transport error")]
    NativeError,
}

impl ConnectError {
    /// Maps a transport error code onto the connect-time error taxonomy.
    pub fn from_transport(code: TransportErrorCode) -> Self {
        use TransportErrorCode as Code;

        match code {
            Code::Timeout => Self::Timeout,
            Code::NotAWebSocket
            | Code::HeaderError
            | Code::UnsupportedVersion
            | Code::UnsupportedProtocol
            | Code::InvalidMessageType
            | Code::InvalidPayload => Self::ProtocolError,
            Code::ConnectionClosedPrematurely | Code::EndpointUnreachable => {
                Self::EndpointUnreachable
            }
            Code::InvalidState => Self::InvalidState,
            Code::NativeError => Self::NativeError,
            Code::Success | Code::UnknownError | Code::Faulted | Code::MessageTooBig => {
                Self::Faulted
            }
        }
    }
}

/// A failure reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    /// The classified error code.
    pub code: TransportErrorCode,
    /// Detail from the layer that failed.
    pub message: String,
}

impl TransportError {
    /// Creates a transport error with the given code and detail.
    pub fn new<T: fmt::Display>(code: TransportErrorCode, message: T) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }

    /// Shorthand for an error raised because the channel is closed or closing.
    pub fn invalid_state<T: fmt::Display>(message: T) -> Self {
        Self::new(TransportErrorCode::InvalidState, message)
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// The main error type for wschannel.
#[derive(Debug, Error)]
pub enum Error {
    /// Error from the tungstenite WebSocket stack.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// I/O error, typically while binding or accepting.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A lifecycle call was refused or a connect attempt failed.
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    /// The transport failed during an operation.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A connection with this id is already registered.
    #[error("Duplicate connection id: {0}")]
    DuplicateConnection(String),

    /// A service is already mapped to this path.
    #[error("Duplicate route: {0}")]
    DuplicateRoute(String),

    /// The address could not be parsed.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Any other error.
    #[error("Custom error: {0}")]
    Custom(String),
}

/// A specialized `Result` type for wschannel operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a custom error from any displayable message.
    pub fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::Custom(msg.to_string())
    }
}
