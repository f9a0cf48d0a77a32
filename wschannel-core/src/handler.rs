//! Application callbacks for a connection.
//!
//! Implement [`Handler`] to react to the lifecycle of one connection. Every
//! callback has an empty default, so a handler only overrides what it needs.
//! Each callback receives a [`HandlerContext`] with the bound connection and
//! the registry of its peers.
//!
//! [`bind`] attaches a handler to a connection. Callbacks run on a task of
//! their own, one at a time and in event order, so a handler may await
//! freely without delaying the connection's listen loop.
//!
//! # Examples
//!
//! ```
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
//! ```

use crate::closure::ClosureReason;
use crate::connection::{Connection, ConnectionId};
use crate::error::{ConnectError, Result};
use crate::event::ConnectionEvent;
use crate::message::Message;
use crate::registry::ConnectionRegistry;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Reacts to the events of one connection.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// The connection opened.
    async fn on_connected(&self, _ctx: &HandlerContext) {}

    /// The connect or accept attempt failed.
    async fn on_connection_failed(&self, _ctx: &HandlerContext, _error: ConnectError) {}

    /// A complete message arrived. An error is logged and does not close the
    /// connection.
    async fn on_message(&self, _ctx: &HandlerContext, _message: Message) -> Result<()> {
        Ok(())
    }

    /// The session ended.
    async fn on_disconnected(&self, _ctx: &HandlerContext, _reason: ClosureReason) {}
}

/// Creates one handler per accepted connection.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn Handler> + Send + Sync>;

/// What a handler callback can reach.
#[derive(Clone)]
pub struct HandlerContext {
    connection: Connection,
    clients: ConnectionRegistry,
}

impl HandlerContext {
    /// Creates a context for `connection`.
    pub fn new(connection: Connection, clients: ConnectionRegistry) -> Self {
        Self {
            connection,
            clients,
        }
    }

    /// The bound connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Id of the bound connection.
    pub fn id(&self) -> &ConnectionId {
        self.connection.id()
    }

    /// Every connection served alongside this one.
    pub fn clients(&self) -> &ConnectionRegistry {
        &self.clients
    }

    /// Sends a message on the bound connection.
    pub async fn send(&self, message: impl Into<Message>) -> Result<()> {
        self.connection.send_async(message).await
    }
}

/// Subscribes `handler` to the events of `conn`.
///
/// The returned task ends after the connection's terminal event. The task only
/// holds a weak handle to the connection between events.
pub fn bind(
    handler: Arc<dyn Handler>,
    conn: &Connection,
    clients: ConnectionRegistry,
) -> JoinHandle<()> {
    let mut events = conn.subscribe();
    let weak = conn.downgrade();
    let id = conn.id().clone();

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(connection) = weak.upgrade() else {
                break;
            };
            let ctx = HandlerContext::new(connection, clients.clone());
            let call = dispatch(handler.as_ref(), &ctx, event);
            if AssertUnwindSafe(call).catch_unwind().await.is_err() {
                error!("Handler for connection {} panicked", id);
            }
        }
        debug!("Handler for connection {} released", id);
    })
}

async fn dispatch(handler: &dyn Handler, ctx: &HandlerContext, event: ConnectionEvent) {
    match event {
        ConnectionEvent::Connected => handler.on_connected(ctx).await,
        ConnectionEvent::MessageReceived(message) => {
            if let Err(e) = handler.on_message(ctx, message).await {
                warn!("Handler error on connection {}: {}", ctx.id(), e);
            }
        }
        ConnectionEvent::Disconnected(reason) => handler.on_disconnected(ctx, reason).await,
        ConnectionEvent::ConnectionFailed(err) => handler.on_connection_failed(ctx, err).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::Role;
    use crate::error::{Error, TransportResult};
    use crate::transport::{Establish, MemoryTransport, Transport};
    use parking_lot::Mutex;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn on_connected(&self, ctx: &HandlerContext) {
            self.seen.lock().push(format!("connected {}", ctx.id()));
        }

        async fn on_connection_failed(&self, _ctx: &HandlerContext, error: ConnectError) {
            self.seen.lock().push(format!("failed {:?}", error));
        }

        async fn on_message(&self, ctx: &HandlerContext, message: Message) -> Result<()> {
            let text = message.as_text().unwrap_or_default().to_string();
            self.seen.lock().push(format!("message {}", text));
            match text.as_str() {
                "fail" => Err(Error::custom("rejected")),
                "panic" => panic!("handler bug"),
                _ => ctx.send(format!("echo {}", text)).await,
            }
        }

        async fn on_disconnected(&self, _ctx: &HandlerContext, reason: ClosureReason) {
            self.seen.lock().push(format!("disconnected {:?}", reason));
        }
    }

    fn pair() -> (Connection, Connection) {
        let (a, b) = MemoryTransport::pair();
        let config = ConnectionConfig::default().with_close_timeout(Duration::from_millis(300));
        let client = Connection::new("client", Role::Client, a.into_establish(), config.clone());
        let server = Connection::new("server", Role::Server, b.into_establish(), config);
        (client, server)
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_handler_sees_lifecycle_in_order() {
        let (client, server) = pair();
        let recorder = Arc::new(Recorder::default());
        let task = bind(recorder.clone(), &server, ConnectionRegistry::new());

        let mut replies = client.subscribe();
        assert!(client.connect(WAIT).await);
        server.accept_async(WAIT).await.unwrap();

        client.send_async("hi").await.unwrap();
        let reply = tokio::time::timeout(WAIT, replies.recv()).await.unwrap().unwrap();
        assert_eq!(reply, ConnectionEvent::Connected);
        let reply = tokio::time::timeout(WAIT, replies.recv()).await.unwrap().unwrap();
        assert_eq!(reply, ConnectionEvent::MessageReceived(Message::text("echo hi")));

        client.disconnect_async().await;
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(
            recorder.seen(),
            vec![
                "connected server",
                "message hi",
                "disconnected NormalClosure",
            ]
        );
    }

    #[tokio::test]
    async fn test_handler_errors_and_panics_do_not_stop_delivery() {
        let (client, server) = pair();
        let recorder = Arc::new(Recorder::default());
        bind(recorder.clone(), &server, ConnectionRegistry::new());

        assert!(client.connect(WAIT).await);
        server.accept_async(WAIT).await.unwrap();
        client.send_async("fail").await.unwrap();
        client.send_async("panic").await.unwrap();
        client.send_async("after").await.unwrap();

        wait_until(|| recorder.seen().len() == 4).await;
        assert_eq!(recorder.seen()[3], "message after");
        assert!(server.is_open());
    }

    #[tokio::test]
    async fn test_failed_accept_reaches_handler() {
        let establish: Establish = Arc::new(|| {
            futures_util::future::pending::<TransportResult<Arc<dyn Transport>>>().boxed()
        });
        let server = Connection::new("server", Role::Server, establish, ConnectionConfig::default());
        let recorder = Arc::new(Recorder::default());
        let task = bind(recorder.clone(), &server, ConnectionRegistry::new());

        assert_eq!(
            server.accept_async(Duration::from_millis(20)).await,
            Err(ConnectError::Timeout)
        );
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(recorder.seen(), vec!["failed Timeout"]);
    }

    #[tokio::test]
    async fn test_context_exposes_registry() {
        let (_client, server) = pair();
        let registry = ConnectionRegistry::new();
        registry.add(&server).unwrap();

        let ctx = HandlerContext::new(server.clone(), registry);
        assert_eq!(ctx.id(), "server");
        assert!(ctx.clients().get("server").unwrap().ptr_eq(ctx.connection()));
    }
}
