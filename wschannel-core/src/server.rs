//! Accepting WebSocket connections.
//!
//! A [`Server`] maps request paths to handler factories. For each inbound TCP
//! stream it peeks at the HTTP request head without consuming it, checks that
//! the request is a WebSocket upgrade for a known path, and hands the stream
//! to a server-role [`Connection`]. Anything else is answered with
//! `405 Method Not Allowed`.
//!
//! Every accepted connection is added to one shared [`ConnectionRegistry`],
//! reachable through [`Server::clients`] or from handlers via
//! [`HandlerContext::clients`](crate::handler::HandlerContext::clients).
//!
//! # Examples
//!
//! ```no_run
//! use wschannel_core::prelude::*;
//!
//! #[derive(Default)]
//! struct Chat;
//!
//! #[async_trait]
//! impl Handler for Chat {
//!     async fn on_message(&self, ctx: &HandlerContext, message: Message) -> Result<()> {
//!         ctx.clients().broadcast_async(message).await;
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! Server::new()
//!     .add_handler::<Chat>("/chat")?
//!     .listen("127.0.0.1:8080")
//!     .await
//! # }
//! ```

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::{Error, Result};
use crate::handler::{self, Handler, HandlerFactory};
use crate::registry::ConnectionRegistry;
use crate::transport::websocket;
use http::{Method, Request, StatusCode};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Largest request head the server will look at.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Routes WebSocket upgrades to handlers.
pub struct Server {
    services: HashMap<String, HandlerFactory>,
    registry: ConnectionRegistry,
    config: ServerConfig,
}

impl Server {
    /// Creates a server with default settings and no services.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Creates a server with the given settings.
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            services: HashMap::new(),
            registry: ConnectionRegistry::new(),
            config,
        }
    }

    /// Maps `path` to a handler factory. The factory runs once per accepted
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRoute`] if the normalized path is already
    /// mapped.
    pub fn add_service<F, H>(mut self, path: &str, factory: F) -> Result<Self>
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: Handler,
    {
        let path = normalize_path(path);
        if self.services.contains_key(&path) {
            return Err(Error::DuplicateRoute(path));
        }
        info!("Registered service at {}", path);
        let factory: HandlerFactory = Arc::new(move || Arc::new(factory()) as Arc<dyn Handler>);
        self.services.insert(path, factory);
        Ok(self)
    }

    /// Maps `path` to a default-constructed `H` per connection.
    pub fn add_handler<H>(self, path: &str) -> Result<Self>
    where
        H: Handler + Default,
    {
        self.add_service(path, H::default)
    }

    /// The registry of accepted connections.
    pub fn clients(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// The server settings.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds `addr` and serves until an accept error occurs.
    pub async fn listen(self, addr: impl AsRef<str>) -> Result<()> {
        let addr: SocketAddr = addr
            .as_ref()
            .parse()
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", addr.as_ref(), e)))?;

        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending())
            .await
    }

    /// Serves until `signal` completes, then closes every connection.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        info!("WebSocket server listening on {}", listener.local_addr()?);
        let server = Arc::new(self);
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown requested, closing {} connections", server.registry.count());
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    let server = server.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer_addr).await {
                            error!("Connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
            }
        }

        drop(listener);
        server.registry.disconnect_all_async().await;
        info!("WebSocket server stopped");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let timeout = self.config.connection.handshake_timeout();
        let head = tokio::time::timeout(timeout, peek_request_head(&stream))
            .await
            .map_err(|_| Error::custom("Timed out reading request head"))??;

        let Some(request) = parse_request_head(&String::from_utf8_lossy(&head)) else {
            debug!("Malformed request from {}", peer_addr);
            return reject(stream, head.len(), StatusCode::BAD_REQUEST).await;
        };

        let path = normalize_path(request.uri().path());
        let factory = match self.services.get(&path) {
            Some(factory) if is_upgrade_request(&request) => factory,
            _ => {
                debug!(
                    "Rejecting {} {} from {}",
                    request.method(),
                    request.uri(),
                    peer_addr
                );
                return reject(stream, head.len(), StatusCode::METHOD_NOT_ALLOWED).await;
            }
        };

        let identity = request
            .headers()
            .get(self.config.identity_header.to_ascii_lowercase().as_str())
            .and_then(|value| value.to_str().ok());
        let id = connection_id(peer_addr, identity);

        let conn = Connection::server(
            id,
            peer_addr,
            websocket::accept(stream),
            self.config.connection.clone(),
        );
        self.registry.add(&conn)?;
        handler::bind(factory(), &conn, self.registry.clone());

        if let Err(e) = conn.accept_async(timeout).await {
            warn!("Upgrade from {} on {} failed: {}", peer_addr, path, e);
        }
        Ok(())
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<&String> = self.services.keys().collect();
        paths.sort();
        f.debug_struct("Server")
            .field("services", &paths)
            .field("clients", &self.registry.count())
            .field("config", &self.config)
            .finish()
    }
}

/// Normalizes a route: leading `/`, no trailing `/` except for the root.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    format!("/{}", trimmed)
}

/// Id of an accepted connection: `"{ip}:{port}#{identity}"`, or
/// `"{ip}:{port}"` when the client sent no identifying header.
pub fn connection_id(peer_addr: SocketAddr, identity: Option<&str>) -> ConnectionId {
    match identity {
        Some(identity) => format!("{}:{}#{}", peer_addr.ip(), peer_addr.port(), identity),
        None => format!("{}:{}", peer_addr.ip(), peer_addr.port()),
    }
}

/// Peeks until a complete request head is buffered, without consuming it.
async fn peek_request_head(stream: &TcpStream) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; MAX_REQUEST_HEAD];
    loop {
        let n = stream.peek(&mut buffer).await?;
        if n == 0 {
            return Err(Error::custom("Connection closed before request"));
        }
        if let Some(end) = buffer[..n].windows(4).position(|w| w == b"\r\n\r\n") {
            buffer.truncate(end + 4);
            return Ok(buffer);
        }
        if n == buffer.len() {
            return Err(Error::custom("Request head too large"));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn parse_request_head(head: &str) -> Option<Request<()>> {
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?;
    let target = request_line.next()?;
    request_line.next()?;

    let mut builder = Request::builder().method(method).uri(target);
    for line in lines.take_while(|line| !line.is_empty()) {
        let (name, value) = line.split_once(':')?;
        builder = builder.header(name.trim(), value.trim());
    }
    builder.body(()).ok()
}

fn is_upgrade_request(request: &Request<()>) -> bool {
    request.method() == Method::GET
        && request
            .headers()
            .get_all(http::header::UPGRADE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.to_ascii_lowercase().contains("websocket"))
}

async fn reject(mut stream: TcpStream, consumed: usize, status: StatusCode) -> Result<()> {
    // Read the request we only peeked at so closing does not reset the
    // connection before the client sees the response.
    let mut discard = vec![0u8; consumed];
    stream.read_exact(&mut discard).await?;

    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
