//! Typed publish/subscribe registry between the transport and its consumers.
//!
//! Every trigger posts one task per subscriber onto the tokio scheduler, so
//! a panicking or slow subscriber never delays the others or the caller.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, error};
use serde::Serialize;

use crate::messages::{
    AllMessagesReadPayload, BookingExpiredPayload, BookingExpiringPayload, MessageReadPayload,
    NewMessagePayload, SeatsUpdatedPayload, ServerEvent, TypingPayload,
};

/// Everything that can be published. Serializes as `{type, ...data}`,
/// which is the shape wildcard subscribers forward to their own sinks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Connected,
    Disconnected { reason: String },
    Error { message: String },
    NewMessage(NewMessagePayload),
    MessageRead(MessageReadPayload),
    AllMessagesRead(AllMessagesReadPayload),
    Typing(TypingPayload),
    SeatsUpdated(SeatsUpdatedPayload),
    BookingExpiring(BookingExpiringPayload),
    BookingExpired(BookingExpiredPayload),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connected => EventKind::Connected,
            Event::Disconnected { .. } => EventKind::Disconnected,
            Event::Error { .. } => EventKind::Error,
            Event::NewMessage(_) => EventKind::NewMessage,
            Event::MessageRead(_) => EventKind::MessageRead,
            Event::AllMessagesRead(_) => EventKind::AllMessagesRead,
            Event::Typing(_) => EventKind::Typing,
            Event::SeatsUpdated(_) => EventKind::SeatsUpdated,
            Event::BookingExpiring(_) => EventKind::BookingExpiring,
            Event::BookingExpired(_) => EventKind::BookingExpired,
        }
    }
}

impl From<ServerEvent> for Event {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::NewMessage(payload) => Event::NewMessage(payload),
            ServerEvent::MessageRead(payload) => Event::MessageRead(payload),
            ServerEvent::AllMessagesRead(payload) => Event::AllMessagesRead(payload),
            ServerEvent::Typing(payload) => Event::Typing(payload),
            ServerEvent::SeatsUpdated(payload) => Event::SeatsUpdated(payload),
            ServerEvent::BookingExpiring(payload) => Event::BookingExpiring(payload),
            ServerEvent::BookingExpired(payload) => Event::BookingExpired(payload),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Connected,
    Disconnected,
    Error,
    NewMessage,
    MessageRead,
    AllMessagesRead,
    Typing,
    SeatsUpdated,
    BookingExpiring,
    BookingExpired,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Error => "error",
            EventKind::NewMessage => "new_message",
            EventKind::MessageRead => "message_read",
            EventKind::AllMessagesRead => "all_messages_read",
            EventKind::Typing => "typing",
            EventKind::SeatsUpdated => "seats_updated",
            EventKind::BookingExpiring => "booking_expiring",
            EventKind::BookingExpired => "booking_expired",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a listener is registered under: one event kind, or every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Kind(EventKind),
    All,
}

impl From<EventKind> for Topic {
    fn from(kind: EventKind) -> Self {
        Topic::Kind(kind)
    }
}

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<Topic, Vec<(u64, Listener)>>,
}

impl Registry {
    fn remove_id(&mut self, topic: Topic, id: u64) {
        if let Some(listeners) = self.topics.get_mut(&topic) {
            listeners.retain(|(listener_id, _)| *listener_id != id);
            if listeners.is_empty() {
                self.topics.remove(&topic);
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<Mutex<Registry>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener`. Registering the same `Arc` twice on one topic
    /// keeps a single entry. Dropping the returned [`Subscription`]
    /// removes exactly this listener.
    pub fn add_event_listener(&self, topic: impl Into<Topic>, listener: Listener) -> Subscription {
        let topic = topic.into();
        let mut registry = self.lock();
        let existing = registry.topics.get(&topic).and_then(|listeners| {
            listeners
                .iter()
                .find(|(_, registered)| Arc::ptr_eq(registered, &listener))
                .map(|(id, _)| *id)
        });
        let id = match existing {
            Some(id) => id,
            None => {
                registry.next_id += 1;
                let id = registry.next_id;
                registry.topics.entry(topic).or_default().push((id, listener));
                id
            }
        };

        Subscription {
            topic,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Convenience over [`add_event_listener`](Self::add_event_listener) for closures.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add_event_listener(topic, Arc::new(listener))
    }

    pub fn remove_event_listener(&self, topic: impl Into<Topic>, listener: &Listener) {
        let topic = topic.into();
        let mut registry = self.lock();
        let found = registry.topics.get(&topic).and_then(|listeners| {
            listeners
                .iter()
                .find(|(_, registered)| Arc::ptr_eq(registered, listener))
                .map(|(id, _)| *id)
        });
        if let Some(id) = found {
            registry.remove_id(topic, id);
        }
    }

    /// Schedules every listener of `event.kind()` and every wildcard
    /// listener as its own task. Returns the number of tasks posted.
    pub fn trigger_event(&self, event: Event) -> usize {
        let kind = event.kind();
        let listeners: Vec<Listener> = {
            let registry = self.lock();
            [Topic::Kind(kind), Topic::All]
                .iter()
                .filter_map(|topic| registry.topics.get(topic))
                .flat_map(|listeners| listeners.iter().map(|(_, listener)| listener.clone()))
                .collect()
        };

        if listeners.is_empty() {
            return 0;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("No tokio runtime available, dropping {kind} event");
            return 0;
        };

        debug!("Dispatching {kind} to {} listener(s)", listeners.len());
        let event = Arc::new(event);
        for listener in &listeners {
            let listener = Arc::clone(listener);
            let event = Arc::clone(&event);
            runtime.spawn(async move {
                listener(&event);
            });
        }
        listeners.len()
    }

    /// Topics that currently have at least one listener.
    pub fn registered_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.lock().topics.keys().copied().collect();
        topics.sort();
        topics
    }

    pub fn listener_count(&self, topic: impl Into<Topic>) -> usize {
        self.lock()
            .topics
            .get(&topic.into())
            .map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Handle for one registered listener. Unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    topic: Topic,
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            registry.remove_id(self.topic, self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::RawMessage;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn new_message(id: &str) -> Event {
        Event::NewMessage(NewMessagePayload {
            message: RawMessage {
                id: Some(id.to_string()),
                ..RawMessage::default()
            },
        })
    }

    #[tokio::test]
    async fn panicking_listener_does_not_block_the_next() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _first = dispatcher.subscribe(EventKind::NewMessage, |_| panic!("listener failure"));
        let _second = dispatcher.subscribe(EventKind::NewMessage, move |event| {
            let _ = tx.send(event.clone());
        });

        assert_eq!(dispatcher.trigger_event(new_message("m1")), 2);
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, new_message("m1"));
    }

    #[tokio::test]
    async fn delivery_is_deferred() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = dispatcher.subscribe(EventKind::Connected, move |_| {
            let _ = tx.send(());
        });

        dispatcher.trigger_event(Event::Connected);
        assert!(rx.try_recv().is_err());
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn wildcard_receives_typed_events() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _all = dispatcher.subscribe(Topic::All, move |event| {
            let _ = tx.send(serde_json::to_value(event).unwrap());
        });

        dispatcher.trigger_event(Event::Disconnected {
            reason: "transport close".into(),
        });
        let value = rx.recv().await.unwrap();
        assert_eq!(value, json!({ "type": "disconnected", "reason": "transport close" }));
    }

    #[test]
    fn dropping_subscription_removes_only_that_listener() {
        let dispatcher = EventDispatcher::new();
        let first = dispatcher.subscribe(EventKind::Typing, |_| {});
        let _second = dispatcher.subscribe(EventKind::Typing, |_| {});
        assert_eq!(dispatcher.listener_count(EventKind::Typing), 2);

        first.unsubscribe();
        assert_eq!(dispatcher.listener_count(EventKind::Typing), 1);
    }

    #[test]
    fn remove_event_listener_matches_by_identity() {
        let dispatcher = EventDispatcher::new();
        let listener: Listener = Arc::new(|_| {});
        let other: Listener = Arc::new(|_| {});
        let subscription = dispatcher.add_event_listener(EventKind::MessageRead, listener.clone());

        dispatcher.remove_event_listener(EventKind::MessageRead, &other);
        assert_eq!(dispatcher.listener_count(EventKind::MessageRead), 1);

        dispatcher.remove_event_listener(EventKind::MessageRead, &listener);
        assert_eq!(dispatcher.listener_count(EventKind::MessageRead), 0);
        assert!(dispatcher.registered_topics().is_empty());

        // Already gone; dropping must be a no-op.
        drop(subscription);
    }

    #[test]
    fn same_listener_registers_once() {
        let dispatcher = EventDispatcher::new();
        let listener: Listener = Arc::new(|_| {});
        let _a = dispatcher.add_event_listener(EventKind::Connected, listener.clone());
        let _b = dispatcher.add_event_listener(EventKind::Connected, listener);
        assert_eq!(dispatcher.listener_count(EventKind::Connected), 1);
    }

    #[test]
    fn trigger_without_listeners_posts_nothing() {
        let dispatcher = EventDispatcher::new();
        assert_eq!(dispatcher.trigger_event(Event::Connected), 0);
    }
}
