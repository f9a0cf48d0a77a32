//! Closure taxonomy: why a connection ended.
//!
//! The transport reports failures as [`TransportErrorCode`] values. Callers never
//! see those codes directly once a session is running; instead every code is
//! mapped through a fixed table onto a [`ClosureReason`], which is what the
//! `Disconnected` event carries.
//!
//! | Transport code | Closure reason |
//! |----------------|----------------|
//! | `Success` | `NormalClosure` |
//! | `Timeout`, `ConnectionClosedPrematurely`, `EndpointUnreachable` | `EndpointUnavailable` |
//! | `NotAWebSocket`, `HeaderError` | `ProtocolError` |
//! | `InvalidMessageType` | `InvalidMessageType` |
//! | `InvalidPayload` | `InvalidPayload` |
//! | `UnsupportedVersion`, `UnsupportedProtocol` | `PolicyViolation` |
//! | `MessageTooBig` | `MessageTooBig` |
//! | `Faulted`, `NativeError` | `InternalServerError` |
//! | `UnknownError`, `InvalidState` | `Unknown` |
//!
//! # Examples
//!
//! ```
//! use wschannel_core::closure::{ClosureReason, TransportErrorCode};
//!
//! let reason = ClosureReason::from_transport(TransportErrorCode::ConnectionClosedPrematurely);
//! assert_eq!(reason, ClosureReason::EndpointUnavailable);
//! assert_eq!(reason.code(), 1001);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes reported by a transport.
///
/// These mirror the failure classes a WebSocket stack can report, plus a few
/// that only exist at this layer (`Success`, `Timeout`, `EndpointUnreachable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportErrorCode {
    /// No error.
    Success,
    /// An operation did not complete in time.
    Timeout,
    /// No further information was available.
    UnknownError,
    /// A frame with an unknown or unexpected opcode arrived.
    InvalidMessageType,
    /// General failure of the channel.
    Faulted,
    /// The layer below raised something unexpected.
    NativeError,
    /// The peer did not speak WebSocket (e.g. refused the upgrade).
    NotAWebSocket,
    /// Unsupported protocol version was requested.
    UnsupportedVersion,
    /// Unsupported subprotocol was requested.
    UnsupportedProtocol,
    /// The opening handshake headers were malformed.
    HeaderError,
    /// The connection dropped without a close handshake.
    ConnectionClosedPrematurely,
    /// The channel is not in a state that permits the operation.
    InvalidState,
    /// Payload data did not match its declared type (e.g. bad UTF-8).
    InvalidPayload,
    /// A message exceeded the configured size limit.
    MessageTooBig,
    /// The remote endpoint could not be reached at all.
    EndpointUnreachable,
}

/// Why a connection ended, as seen by callers.
///
/// Each variant carries its RFC 6455 close code, available through
/// [`ClosureReason::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClosureReason {
    /// (1000) The close handshake completed normally.
    NormalClosure,
    /// (1001) An endpoint went away or could not be reached.
    EndpointUnavailable,
    /// (1002) The peer violated the protocol.
    ProtocolError,
    /// (1003) A message of an unacceptable type arrived.
    InvalidMessageType,
    /// (1005) No specific reason is known.
    Unknown,
    /// (1007) Payload data was inconsistent with its type.
    InvalidPayload,
    /// (1008) A policy (version, subprotocol) was violated.
    PolicyViolation,
    /// (1009) A message was larger than allowed.
    MessageTooBig,
    /// (1011) An unexpected internal failure.
    InternalServerError,
}

impl ClosureReason {
    /// Maps a transport error code onto its closure reason.
    pub fn from_transport(code: TransportErrorCode) -> Self {
        use TransportErrorCode as Code;

        match code {
            Code::Success => Self::NormalClosure,
            Code::Timeout | Code::ConnectionClosedPrematurely | Code::EndpointUnreachable => {
                Self::EndpointUnavailable
            }
            Code::NotAWebSocket | Code::HeaderError => Self::ProtocolError,
            Code::InvalidMessageType => Self::InvalidMessageType,
            Code::InvalidPayload => Self::InvalidPayload,
            Code::UnsupportedVersion | Code::UnsupportedProtocol => Self::PolicyViolation,
            Code::MessageTooBig => Self::MessageTooBig,
            Code::Faulted | Code::NativeError => Self::InternalServerError,
            Code::UnknownError | Code::InvalidState => Self::Unknown,
        }
    }

    /// The RFC 6455 close code for this reason.
    pub fn code(self) -> u16 {
        match self {
            Self::NormalClosure => 1000,
            Self::EndpointUnavailable => 1001,
            Self::ProtocolError => 1002,
            Self::InvalidMessageType => 1003,
            Self::Unknown => 1005,
            Self::InvalidPayload => 1007,
            Self::PolicyViolation => 1008,
            Self::MessageTooBig => 1009,
            Self::InternalServerError => 1011,
        }
    }

    /// Looks up the reason for a close code received from a peer.
    ///
    /// Codes outside the table map to [`ClosureReason::Unknown`].
    pub fn from_code(code: u16) -> Self {
        match code {
            1000 => Self::NormalClosure,
            1001 => Self::EndpointUnavailable,
            1002 => Self::ProtocolError,
            1003 => Self::InvalidMessageType,
            1007 => Self::InvalidPayload,
            1008 => Self::PolicyViolation,
            1009 => Self::MessageTooBig,
            1011 => Self::InternalServerError,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ClosureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
