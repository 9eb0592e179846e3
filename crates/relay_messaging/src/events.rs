//! Subscriber registry shared by a hub and its connections.

use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::connection::{Connection, Role};
use crate::message::InboundMessage;

/// A lifecycle tag published by a connection's state machine (`emit`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub connection_id: Uuid,
    pub role: Role,
    /// `"close"` (inbound) or `"closed"` (outbound).
    pub tag: String,
    /// Identity the peer last announced on this link, if any.
    pub peer_identity: Option<String>,
    pub server_url: Option<String>,
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listeners<T> {
    inner: RwLock<Vec<Listener<T>>>,
}

impl<T> Listeners<T> {
    fn new() -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, listener: Listener<T>) {
        self.inner.write().push(listener);
    }

    fn clear(&self) {
        self.inner.write().clear();
    }

    fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Invoke every listener outside the lock, so listeners may subscribe
    /// or unsubscribe re-entrantly.
    fn publish(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self.inner.read().clone();
        for listener in snapshot {
            listener(value);
        }
    }
}

/// Message, connection and lifecycle subscribers.
pub(crate) struct EventBus {
    messages: Listeners<InboundMessage>,
    connections: Listeners<Connection>,
    lifecycle: Listeners<LifecycleEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            messages: Listeners::new(),
            connections: Listeners::new(),
            lifecycle: Listeners::new(),
        }
    }

    pub fn on_message(&self, listener: Listener<InboundMessage>) {
        self.messages.add(listener);
    }

    pub fn on_connection(&self, listener: Listener<Connection>) {
        self.connections.add(listener);
    }

    pub fn on_lifecycle(&self, listener: Listener<LifecycleEvent>) {
        self.lifecycle.add(listener);
    }

    pub fn remove_all_message_listeners(&self) {
        self.messages.clear();
    }

    pub fn message_listener_count(&self) -> usize {
        self.messages.len()
    }

    pub fn publish_message(&self, message: &InboundMessage) {
        self.messages.publish(message);
    }

    pub fn publish_connection(&self, connection: &Connection) {
        self.connections.publish(connection);
    }

    pub fn publish_lifecycle(&self, event: &LifecycleEvent) {
        self.lifecycle.publish(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
