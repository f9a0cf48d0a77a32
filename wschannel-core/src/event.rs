//! Lifecycle events and their delivery.
//!
//! Every connection owns an [`EventHub`]. Producers (the connect task, the
//! listen loop, the send path) push [`ConnectionEvent`]s into an unbounded
//! queue and continue immediately. A single dispatcher task per connection
//! drains the queue and hands each event to every subscriber, in subscription
//! order. Since there is one queue and one dispatcher, a subscriber observes
//! events in the order they were raised, and a slow subscriber delays only
//! later deliveries, never the listen loop.
//!
//! After a terminal event the subscriber list is cleared. Handlers usually hold
//! a clone of the connection they are bound to; clearing drops those clones and
//! lets a finished connection be freed.

use crate::closure::ClosureReason;
use crate::error::ConnectError;
use crate::message::Message;
use parking_lot::{Mutex, RwLock};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Something that happened to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection is open.
    Connected,
    /// A complete message arrived.
    MessageReceived(Message),
    /// The session ended. Raised exactly once per connection.
    Disconnected(ClosureReason),
    /// A connect or accept attempt failed.
    ConnectionFailed(ConnectError),
}

/// Identifies a subscription so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

#[derive(Clone)]
enum Subscriber {
    Callback(Callback),
    Channel(mpsc::UnboundedSender<ConnectionEvent>),
}

impl Subscriber {
    fn deliver(&self, event: &ConnectionEvent) {
        match self {
            Subscriber::Callback(callback) => {
                if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                    error!(?event, "event subscriber panicked");
                }
            }
            Subscriber::Channel(sender) => {
                // A dropped receiver just stops listening.
                let _ = sender.send(event.clone());
            }
        }
    }
}

type Subscribers = Arc<RwLock<Vec<(SubscriptionId, Subscriber)>>>;

/// Subscription list plus the queue feeding its dispatcher.
pub(crate) struct EventHub {
    label: String,
    subscribers: Subscribers,
    next_id: AtomicU64,
    queue: mpsc::UnboundedSender<ConnectionEvent>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    clear_on_failure: bool,
}

impl EventHub {
    /// Creates a hub. `clear_on_failure` makes `ConnectionFailed` terminal, as
    /// it is for connections that cannot retry.
    pub(crate) fn new(label: impl Into<String>, clear_on_failure: bool) -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        Self {
            label: label.into(),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(0),
            queue,
            pending: Mutex::new(Some(pending)),
            clear_on_failure,
        }
    }

    pub(crate) fn add_callback(&self, callback: Callback) -> SubscriptionId {
        self.add(Subscriber::Callback(callback))
    }

    pub(crate) fn add_channel(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add(Subscriber::Channel(tx));
        rx
    }

    fn add(&self, subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, subscriber));
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Queues an event. Starts the dispatcher on first use, so this must run
    /// inside a Tokio runtime.
    pub(crate) fn emit(&self, event: ConnectionEvent) {
        self.start();
        debug!(connection = %self.label, ?event, "event raised");
        // The dispatcher only stops once the hub itself is gone.
        let _ = self.queue.send(event);
    }

    fn start(&self) {
        let Some(mut queue) = self.pending.lock().take() else {
            return;
        };

        let subscribers = self.subscribers.clone();
        let clear_on_failure = self.clear_on_failure;
        let label = self.label.clone();
        tokio::spawn(async move {
            while let Some(event) = queue.recv().await {
                let terminal = match event {
                    ConnectionEvent::Disconnected(_) => true,
                    ConnectionEvent::ConnectionFailed(_) => clear_on_failure,
                    _ => false,
                };

                let snapshot: Vec<Subscriber> = subscribers
                    .read()
                    .iter()
                    .map(|(_, subscriber)| subscriber.clone())
                    .collect();
                for subscriber in &snapshot {
                    subscriber.deliver(&event);
                }

                if terminal {
                    subscribers.write().clear();
                    debug!(connection = %label, "subscribers released");
                }
            }
            debug!(connection = %label, "event dispatcher stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let hub = EventHub::new("test", false);
        let mut rx = hub.add_channel();

        hub.emit(ConnectionEvent::Connected);
        hub.emit(ConnectionEvent::MessageReceived(Message::text("a")));
        hub.emit(ConnectionEvent::MessageReceived(Message::text("b")));

        assert_eq!(rx.recv().await, Some(ConnectionEvent::Connected));
        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::MessageReceived(Message::text("a")))
        );
        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::MessageReceived(Message::text("b")))
        );
    }

    #[tokio::test]
    async fn test_panicking_subscriber_does_not_stop_delivery() {
        let hub = EventHub::new("test", false);
        hub.add_callback(Arc::new(|_| panic!("subscriber bug")));
        let mut rx = hub.add_channel();

        hub.emit(ConnectionEvent::Connected);
        hub.emit(ConnectionEvent::Disconnected(ClosureReason::NormalClosure));

        assert_eq!(rx.recv().await, Some(ConnectionEvent::Connected));
        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::Disconnected(ClosureReason::NormalClosure))
        );
    }

    #[tokio::test]
    async fn test_terminal_event_clears_subscribers() {
        let hub = EventHub::new("test", true);
        let mut rx = hub.add_channel();

        hub.emit(ConnectionEvent::ConnectionFailed(ConnectError::Timeout));
        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::ConnectionFailed(ConnectError::Timeout))
        );

        // The list was cleared, so our sender is gone and the channel closes.
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(closed.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let hub = EventHub::new("test", false);
        let id = hub.add_callback(Arc::new(|_| {}));
        assert!(hub.remove(id));
        assert!(!hub.remove(id));
    }
}
