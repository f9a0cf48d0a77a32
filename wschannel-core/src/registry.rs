//! Tracking of live connections.
//!
//! A [`ConnectionRegistry`] maps connection ids to weak handles. It never keeps
//! a connection alive: entries remove themselves when their connection
//! disconnects, and handles whose connection was dropped are skipped.
//!
//! Bulk operations (broadcast, disconnect) take a snapshot of the members
//! first and release the map before doing any I/O, so connections may join
//! and leave while a broadcast is running.
//!
//! # Examples
//!
//! ```no_run
//! use wschannel_core::prelude::*;
//!
//! # async fn example(registry: ConnectionRegistry) {
//! let delivered = registry.broadcast_async("server restarting").await;
//! println!("notified {} of {} clients", delivered, registry.count());
//! registry.disconnect_all_async().await;
//! # }
//! ```

use crate::connection::{Connection, ConnectionId, ConnectionState, Role, WeakConnection};
use crate::error::{Error, Result};
use crate::event::ConnectionEvent;
use crate::message::Message;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::join_all;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

type Members = DashMap<ConnectionId, WeakConnection>;

/// A shared, thread-safe set of connections keyed by id.
///
/// Cloning is cheap; clones share the same members.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<Members>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection and returns the new member count.
    ///
    /// The entry removes itself when the connection raises
    /// [`ConnectionEvent::Disconnected`], or `ConnectionFailed` for a server
    /// connection, which cannot retry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateConnection`] if a live connection with the
    /// same id is already registered.
    pub fn add(&self, conn: &Connection) -> Result<usize> {
        let id = conn.id().clone();
        match self.connections.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().upgrade().is_some() {
                    return Err(Error::DuplicateConnection(id));
                }
                entry.insert(conn.downgrade());
            }
            Entry::Vacant(entry) => {
                entry.insert(conn.downgrade());
            }
        }

        let members = Arc::downgrade(&self.connections);
        let handle = conn.downgrade();
        let removes_on_failure = conn.role() == Role::Server;
        let key = id.clone();
        conn.on_event(move |event| {
            let finished = match event {
                ConnectionEvent::Disconnected(_) => true,
                ConnectionEvent::ConnectionFailed(_) => removes_on_failure,
                _ => false,
            };
            if finished {
                remove_member(&members, &key, &handle);
            }
        });

        // The connection may have ended before the subscription existed.
        let ended = match conn.state() {
            ConnectionState::Closed => true,
            ConnectionState::Failed => removes_on_failure,
            _ => false,
        };
        if ended {
            self.remove(conn);
        }

        let count = self.count();
        info!("Connection {} registered ({} total)", id, count);
        Ok(count)
    }

    /// Removes exactly this connection. Returns `false` if it was not a member.
    pub fn remove(&self, conn: &Connection) -> bool {
        let handle = conn.downgrade();
        self.connections
            .remove_if(conn.id(), |_, member| member.ptr_eq(&handle))
            .is_some()
    }

    /// Removes whatever connection is registered under `id`.
    pub fn remove_id(&self, id: &str) -> bool {
        self.connections.remove(id).is_some()
    }

    /// Returns the connection registered under `id`, if it is still alive.
    pub fn get(&self, id: &str) -> Option<Connection> {
        self.connections
            .get(id)
            .and_then(|member| member.value().upgrade())
    }

    /// Returns the ids of all live members.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.snapshot()
            .into_iter()
            .map(|conn| conn.id().clone())
            .collect()
    }

    /// Returns the number of live members.
    pub fn count(&self) -> usize {
        self.connections
            .iter()
            .filter(|member| member.value().upgrade().is_some())
            .count()
    }

    /// Returns `true` if there are no live members.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Sends a message to every member without waiting. Returns the number of
    /// members the message was queued for.
    pub fn broadcast(&self, message: impl Into<Message>) -> usize {
        let message = message.into();
        let members = self.snapshot();
        for conn in &members {
            conn.send(message.clone());
        }
        members.len()
    }

    /// Sends a message to every member concurrently. Returns the number of
    /// successful sends.
    pub async fn broadcast_async(&self, message: impl Into<Message>) -> usize {
        send_all(self.snapshot(), message.into()).await
    }

    /// Sends a message to every member except `except_id`. Returns the number
    /// of successful sends.
    pub async fn broadcast_except(&self, except_id: &str, message: impl Into<Message>) -> usize {
        let members = self
            .snapshot()
            .into_iter()
            .filter(|conn| conn.id() != except_id)
            .collect();
        send_all(members, message.into()).await
    }

    /// Queues a message for one member. Returns `false` if no such member
    /// exists.
    pub fn send_to(&self, id: &str, message: impl Into<Message>) -> bool {
        match self.get(id) {
            Some(conn) => {
                conn.send(message);
                true
            }
            None => {
                debug!("send_to: no connection {}", id);
                false
            }
        }
    }

    /// Sends a message to one member and waits. Returns `true` if it was
    /// sent.
    pub async fn send_to_async(&self, id: &str, message: impl Into<Message>) -> bool {
        match self.get(id) {
            Some(conn) => conn.send_async(message).await.is_ok(),
            None => {
                debug!("send_to: no connection {}", id);
                false
            }
        }
    }

    /// Starts closing every member without waiting.
    pub fn disconnect_all(&self) {
        let registry = self.clone();
        tokio::spawn(async move { registry.disconnect_all_async().await });
    }

    /// Closes every member and waits until each has finished or hit its
    /// close timeout. The closed members are removed afterwards.
    pub async fn disconnect_all_async(&self) {
        let members = self.snapshot();
        if members.is_empty() {
            return;
        }
        info!("Disconnecting {} connections", members.len());

        join_all(members.iter().map(|conn| conn.disconnect_async())).await;
        for conn in &members {
            self.remove(conn);
        }
    }

    fn snapshot(&self) -> Vec<Connection> {
        self.connections
            .iter()
            .filter_map(|member| member.value().upgrade())
            .collect()
    }
}

fn remove_member(members: &Weak<Members>, id: &str, handle: &WeakConnection) {
    if let Some(members) = members.upgrade()
        && members.remove_if(id, |_, member| member.ptr_eq(handle)).is_some()
    {
        debug!("Connection {} unregistered", id);
    }
}

async fn send_all(members: Vec<Connection>, message: Message) -> usize {
    let results = join_all(members.iter().map(|conn| conn.send_async(message.clone()))).await;
    results.into_iter().filter(|result| result.is_ok()).count()
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("count", &self.connections.len())
            .finish()
    }
}
