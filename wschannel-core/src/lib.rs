//! # wschannel-core
//!
//! Event-driven WebSocket connections with a strict lifecycle, for both sides
//! of a socket, plus a registry for managing many server-side connections.
//!
//! ## Overview
//!
//! A [`Connection`] moves through `Idle → Connecting → Open → Closing → Closed`
//! (or `Failed` when an attempt does not succeed) and reports everything that
//! happens to it as a [`ConnectionEvent`]:
//!
//! - `Connected` once the transport is open
//! - `MessageReceived` for every complete, reassembled message
//! - `Disconnected` exactly once when the session ends, with a
//!   [`ClosureReason`]
//! - `ConnectionFailed` when a connect or accept attempt fails, with a
//!   [`ConnectError`]
//!
//! Outbound messages are split into frames of at most
//! [`MESSAGE_CHUNK_SIZE`](config::MESSAGE_CHUNK_SIZE) bytes, and concurrent
//! sends on one connection never interleave their frames.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       Application                          │
//! │   ┌──────────────┐   ┌──────────┐   ┌──────────────────┐   │
//! │   │   Handlers   │   │  Server  │   │ ConnectionRegistry│   │
//! │   └──────────────┘   └──────────┘   └──────────────────┘   │
//! └───────────────────────────────────────────────────────────┘
//!                              │
//! ┌───────────────────────────────────────────────────────────┐
//! │  Connection (state machine, send lock, listen loop)        │
//! │  EventHub (queue + dispatcher per connection)              │
//! └───────────────────────────────────────────────────────────┘
//!                              │
//! ┌───────────────────────────────────────────────────────────┐
//! │  Transport: WebSocketTransport (tokio-tungstenite)         │
//! │             MemoryTransport (in-process pair)              │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ### Server
//!
//! ```no_run
//! use wschannel_core::prelude::*;
//!
//! #[derive(Default)]
//! struct Echo;
//!
//! #[async_trait]
//! impl Handler for Echo {
//!     async fn on_message(&self, ctx: &HandlerContext, message: Message) -> Result<()> {
//!         ctx.send(message).await
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     Server::new()
//!         .add_handler::<Echo>("/echo")?
//!         .listen("127.0.0.1:8080")
//!         .await
//! }
//! ```
//!
//! ### Client
//!
//! ```no_run
//! use std::time::Duration;
//! use wschannel_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let conn = Connection::client("ws://127.0.0.1:8080/echo", ConnectionConfig::default());
//!     conn.on_message(|msg| println!("{:?}", msg.as_text()));
//!
//!     if conn.connect(Duration::from_secs(5)).await {
//!         conn.send_async("hello").await?;
//!         conn.disconnect_async().await;
//!     }
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod closure;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod handler;
pub mod message;
pub mod registry;
pub mod server;
pub mod transport;

pub use closure::{ClosureReason, TransportErrorCode};
pub use config::{ConnectionConfig, MESSAGE_CHUNK_SIZE, ServerConfig};
pub use connection::{
    Connection, ConnectionId, ConnectionInfo, ConnectionState, Role, WeakConnection,
};
pub use error::{ConnectError, Error, Result, TransportError};
pub use event::{ConnectionEvent, SubscriptionId};
pub use handler::{Handler, HandlerContext, HandlerFactory, bind};
pub use message::{Message, MessageType};
pub use registry::ConnectionRegistry;
pub use server::Server;
pub use transport::{ChannelState, Establish, Frame, FrameKind, Transport};

/// Commonly used types and traits.
///
/// ```
/// use wschannel_core::prelude::*;
///
/// #[derive(Default)]
/// struct Quiet;
///
/// #[async_trait]
/// impl Handler for Quiet {}
///
/// let server = Server::new().add_handler::<Quiet>("/quiet").unwrap();
/// assert!(server.clients().is_empty());
/// ```
pub mod prelude {
    pub use crate::closure::ClosureReason;
    pub use crate::config::{ConnectionConfig, ServerConfig};
    pub use crate::connection::{Connection, ConnectionId, ConnectionState, Role};
    pub use crate::error::{ConnectError, Error, Result};
    pub use crate::event::ConnectionEvent;
    pub use crate::handler::{Handler, HandlerContext};
    pub use crate::message::{Message, MessageType};
    pub use crate::registry::ConnectionRegistry;
    pub use crate::server::Server;
    pub use async_trait::async_trait;
}
