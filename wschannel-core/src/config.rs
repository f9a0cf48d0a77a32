//! Connection and server configuration.
//!
//! Both structs deserialize with `serde`, so they can be embedded in an
//! application's own configuration file. Every field has a default, and missing
//! fields fall back to it.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use wschannel_core::config::{ConnectionConfig, ServerConfig};
//!
//! let config = ConnectionConfig::default()
//!     .with_close_timeout(Duration::from_secs(2))
//!     .with_max_message_size(1024 * 1024);
//! assert_eq!(config.close_timeout(), Duration::from_secs(2));
//!
//! let server: ServerConfig = serde_json::from_str(r#"{"identity_header":"x-client-id"}"#).unwrap();
//! assert_eq!(server.identity_header, "x-client-id");
//! assert_eq!(server.connection, ConnectionConfig::default());
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Payload size of one outbound frame. Larger messages are split into several
/// frames of at most this many bytes.
pub const MESSAGE_CHUNK_SIZE: usize = 16 * 1024;

const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 << 20;

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bound on reading and completing an inbound upgrade, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// How long `disconnect_async` waits for the peer's close acknowledgement.
    pub close_timeout_ms: u64,
    /// Largest reassembled message accepted from the peer, in bytes.
    pub max_message_size: usize,
}

impl ConnectionConfig {
    /// Sets the handshake timeout used when accepting.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = duration_ms(timeout);
        self
    }

    /// Sets the close-acknowledgement timeout.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = duration_ms(timeout);
        self
    }

    /// Sets the largest accepted inbound message.
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Handshake timeout as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Close timeout as a [`Duration`].
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Request header whose value, together with the peer address, forms the
    /// id of an accepted connection. Matched case-insensitively.
    pub identity_header: String,
    /// Settings applied to every accepted connection.
    pub connection: ConnectionConfig,
}

impl ServerConfig {
    /// Sets the identifying header.
    pub fn with_identity_header(mut self, header: impl Into<String>) -> Self {
        self.identity_header = header.into();
        self
    }

    /// Sets the per-connection settings.
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            identity_header: "sec-websocket-key".to_string(),
            connection: ConnectionConfig::default(),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
