//! Transport Events
//!
//! Every connection, client and server publishes what happens to it through
//! an [`EventHub`]. Observers call [`EventHub::subscribe`] and drain the
//! returned [`Subscription`]; dropping the subscription unsubscribes.
//!
//! Each subscriber gets its own unbounded channel, so a slow observer never
//! blocks a read loop. Events reach one subscriber in publish order; there is
//! no ordering guarantee across subscribers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{ConnectionId, TransportError};

/// Data carried by a [`TransportEvent::MessageReceived`]
#[derive(Debug)]
pub enum Payload<M> {
    /// A deserialized framed message
    Message(Arc<M>),
    /// Bytes exactly as read in raw mode
    Raw(Bytes),
}

impl<M> Payload<M> {
    /// Whether the payload came from a raw-mode read
    #[must_use]
    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }

    /// The message, if this is a framed payload
    #[must_use]
    pub fn message(&self) -> Option<&M> {
        match self {
            Self::Message(m) => Some(m.as_ref()),
            Self::Raw(_) => None,
        }
    }

    /// The bytes, if this is a raw payload
    #[must_use]
    pub fn raw(&self) -> Option<&Bytes> {
        match self {
            Self::Raw(b) => Some(b),
            Self::Message(_) => None,
        }
    }
}

impl<M> Clone for Payload<M> {
    fn clone(&self) -> Self {
        match self {
            Self::Message(m) => Self::Message(Arc::clone(m)),
            Self::Raw(b) => Self::Raw(b.clone()),
        }
    }
}

/// Something that happened on a transport
#[derive(Debug)]
pub enum TransportEvent<M> {
    /// A message or raw chunk arrived
    MessageReceived {
        /// Connection that read it
        connection: ConnectionId,
        /// What was read
        payload: Payload<M>,
    },

    /// A read, send, accept or decode failure
    Error {
        /// Connection the failure belongs to (None for listener errors)
        connection: Option<ConnectionId>,
        /// The failure
        error: Arc<TransportError>,
    },

    /// Server accepted a connection
    ClientAdded {
        /// Id assigned to the new connection
        connection: ConnectionId,
        /// Remote address
        peer: SocketAddr,
    },

    /// Server dropped a connection from its registry
    ClientRemoved {
        /// Id of the removed connection
        connection: ConnectionId,
    },

    /// Client connectivity flipped
    ConnectionChanged {
        /// New connectivity
        connected: bool,
    },
}

impl<M> TransportEvent<M> {
    /// Build an error event
    pub(crate) fn error(connection: Option<ConnectionId>, error: TransportError) -> Self {
        Self::Error {
            connection,
            error: Arc::new(error),
        }
    }
}

impl<M> Clone for TransportEvent<M> {
    fn clone(&self) -> Self {
        match self {
            Self::MessageReceived {
                connection,
                payload,
            } => Self::MessageReceived {
                connection: *connection,
                payload: payload.clone(),
            },
            Self::Error { connection, error } => Self::Error {
                connection: *connection,
                error: Arc::clone(error),
            },
            Self::ClientAdded { connection, peer } => Self::ClientAdded {
                connection: *connection,
                peer: *peer,
            },
            Self::ClientRemoved { connection } => Self::ClientRemoved {
                connection: *connection,
            },
            Self::ConnectionChanged { connected } => Self::ConnectionChanged {
                connected: *connected,
            },
        }
    }
}

type Subscribers<E> = Mutex<HashMap<u64, mpsc::UnboundedSender<E>>>;

/// Fan-out of events to any number of subscribers
///
/// Cloning the hub shares the subscriber list.
pub struct EventHub<E> {
    subscribers: Arc<Subscribers<E>>,
    next_id: Arc<AtomicU64>,
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<E> Clone for EventHub<E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<E> std::fmt::Debug for EventHub<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<E: Clone> EventHub<E> {
    /// Create a hub with no subscribers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    #[must_use]
    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, tx);

        Subscription {
            id,
            receiver: rx,
            hub: Arc::downgrade(&self.subscribers),
        }
    }

    /// Deliver an event to every current subscriber
    ///
    /// Subscribers whose receiving side is gone are pruned.
    pub fn publish(&self, event: &E) {
        self.subscribers
            .lock()
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

impl<E> EventHub<E> {
    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Receiving end of an [`EventHub`] subscription
///
/// Unsubscribes when dropped.
pub struct Subscription<E> {
    id: u64,
    receiver: mpsc::UnboundedReceiver<E>,
    hub: Weak<Subscribers<E>>,
}

impl<E> Subscription<E> {
    /// Wait for the next event
    ///
    /// Returns `None` once the hub is gone and every queued event was read.
    pub async fn recv(&mut self) -> Option<E> {
        self.receiver.recv().await
    }

    /// Take the next queued event without waiting
    pub fn try_recv(&mut self) -> Option<E> {
        self.receiver.try_recv().ok()
    }

    /// Stop receiving events
    pub fn unsubscribe(self) {
        drop(self);
    }

    fn detach(&self) {
        if let Some(subscribers) = self.hub.upgrade() {
            subscribers.lock().remove(&self.id);
        }
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.detach();
    }
}

impl<E> std::fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let hub: EventHub<u32> = EventHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.publish(&7);

        assert_eq!(a.try_recv(), Some(7));
        assert_eq!(b.try_recv(), Some(7));
        assert_eq!(a.try_recv(), None);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let hub: EventHub<u32> = EventHub::new();
        let sub = hub.subscribe();
        let _other = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        drop(sub);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn test_explicit_unsubscribe() {
        let hub: EventHub<&'static str> = EventHub::new();
        let sub = hub.subscribe();
        sub.unsubscribe();

        hub.publish(&"nobody listening");
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_cloned_hub_shares_subscribers() {
        let hub: EventHub<u32> = EventHub::new();
        let clone = hub.clone();
        let mut sub = hub.subscribe();

        clone.publish(&1);
        clone.publish(&2);

        assert_eq!(sub.try_recv(), Some(1));
        assert_eq!(sub.try_recv(), Some(2));
    }

    #[tokio::test]
    async fn test_recv_ends_when_hub_dropped() {
        let hub: EventHub<u32> = EventHub::new();
        let mut sub = hub.subscribe();
        hub.publish(&3);
        drop(hub);

        assert_eq!(sub.recv().await, Some(3));
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn test_payload_accessors() {
        let message: Payload<String> = Payload::Message(Arc::new("hi".to_string()));
        assert!(!message.is_raw());
        assert_eq!(message.message().map(String::as_str), Some("hi"));

        let raw: Payload<String> = Payload::Raw(Bytes::from_static(b"\x01\x02"));
        assert!(raw.is_raw());
        assert_eq!(raw.raw().map(|b| b.as_ref()), Some(&b"\x01\x02"[..]));
        assert!(raw.message().is_none());
    }
}
