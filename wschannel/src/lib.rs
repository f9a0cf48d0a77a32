//! # wschannel
//!
//! Event-driven WebSocket connections for clients and servers, with a strict
//! connection lifecycle, ordered event delivery, chunked sends that never
//! interleave, and a registry for broadcasting to many connections.
//!
//! This crate re-exports [`wschannel_core`]. Add it to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! wschannel = "0.1"
//! tokio = { version = "1", features = ["full"] }
//! ```
//!
//! ## Chat server
//!
//! ```no_run
//! use wschannel::prelude::*;
//!
//! #[derive(Default)]
//! struct Chat;
//!
//! #[async_trait]
//! impl Handler for Chat {
//!     async fn on_connected(&self, ctx: &HandlerContext) {
//!         let notice = format!("{} joined", ctx.id());
//!         ctx.clients().broadcast_except(ctx.id(), notice).await;
//!     }
//!
//!     async fn on_message(&self, ctx: &HandlerContext, message: Message) -> Result<()> {
//!         ctx.clients().broadcast_except(ctx.id(), message).await;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     Server::new()
//!         .add_handler::<Chat>("/chat")?
//!         .listen("127.0.0.1:8080")
//!         .await
//! }
//! ```
//!
//! ## Client
//!
//! ```no_run
//! use std::time::Duration;
//! use wschannel::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let conn = Connection::client("ws://127.0.0.1:8080/chat", ConnectionConfig::default());
//!     conn.on_message(|msg| println!("{}", msg.as_text().unwrap_or("<binary>")));
//!     conn.on_disconnected(|reason| println!("closed: {}", reason));
//!
//!     if !conn.connect(Duration::from_secs(5)).await {
//!         return Err(Error::custom("could not connect"));
//!     }
//!     conn.send_async("hello everyone").await?;
//!     conn.disconnect_async().await;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub use wschannel_core::*;

/// Prelude module for convenient imports.
///
/// - **Core**: `Connection`, `ConnectionRegistry`, `Server`, `Message`
/// - **Handlers**: `Handler`, `HandlerContext`, `async_trait`
/// - **Events**: `ConnectionEvent`, `ClosureReason`, `ConnectError`
/// - **Errors**: `Error`, `Result`
pub mod prelude {
    pub use wschannel_core::prelude::*;
}
