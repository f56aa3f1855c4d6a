//! Binds a [`RealtimeSession`] to authentication state and keeps the
//! message log, unread counters and notifications consumers render from.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dispatcher::{Event, EventKind, Listener, Subscription, Topic};
use crate::history::{Insert, MessageLog};
use crate::messages::{AckCallback, NewMessagePayload};
use crate::models::{AuthState, Message, Notification, NotificationKind, Party};
use crate::session::RealtimeSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
}

/// The event kinds the provider subscribes to while connected.
pub const PROVIDER_EVENTS: [EventKind; 6] = [
    EventKind::Connected,
    EventKind::SeatsUpdated,
    EventKind::BookingExpiring,
    EventKind::BookingExpired,
    EventKind::NewMessage,
    EventKind::MessageRead,
];

#[derive(Default)]
struct ProviderState {
    log: MessageLog,
    unread: HashMap<String, u32>,
    notifications: Vec<Notification>,
    last_notification_id: i64,
    seats: HashMap<String, Value>,
}

struct Lifecycle {
    auth: AuthState,
    subscriptions: Vec<Subscription>,
}

struct Inner {
    session: Arc<RealtimeSession>,
    state: Mutex<ProviderState>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    phase: watch::Sender<Phase>,
    revision: watch::Sender<u64>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.session.disconnect();
    }
}

#[derive(Clone)]
pub struct SessionProvider {
    inner: Arc<Inner>,
}

impl SessionProvider {
    pub fn new(session: Arc<RealtimeSession>) -> Self {
        let (phase, _) = watch::channel(Phase::Disconnected);
        let (revision, _) = watch::channel(0);
        SessionProvider {
            inner: Arc::new(Inner {
                session,
                state: Mutex::new(ProviderState::default()),
                lifecycle: tokio::sync::Mutex::new(Lifecycle {
                    auth: AuthState::signed_out(),
                    subscriptions: Vec::new(),
                }),
                phase,
                revision,
            }),
        }
    }

    /// Reacts to one authentication snapshot. A change of either field
    /// tears the old session down before a new one is attempted; an
    /// unchanged snapshot does nothing.
    pub async fn apply_auth(&self, auth: AuthState) -> Phase {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.auth == auth {
            return self.phase();
        }

        self.teardown(&mut lifecycle);
        lifecycle.auth = auth.clone();
        if !auth.is_authenticated {
            return Phase::Disconnected;
        }

        info!(
            "Connecting realtime session for {}",
            auth.id.as_deref().unwrap_or("anonymous")
        );
        self.inner.phase.send_replace(Phase::Connecting);

        if self.inner.session.connect().await {
            lifecycle.subscriptions = register_handlers(&self.inner);
            self.inner.phase.send_replace(Phase::Connected);
            self.inner.bump();
            Phase::Connected
        } else {
            error!("Realtime connection failed; staying disconnected");
            self.inner.phase.send_replace(Phase::Disconnected);
            Phase::Disconnected
        }
    }

    /// Applies every change published on `auth` until its sender goes away,
    /// then shuts the session down.
    pub fn bind(&self, mut auth: watch::Receiver<AuthState>) -> JoinHandle<()> {
        let provider = self.clone();
        tokio::spawn(async move {
            loop {
                let snapshot = auth.borrow_and_update().clone();
                provider.apply_auth(snapshot).await;
                if auth.changed().await.is_err() {
                    break;
                }
            }
            provider.shutdown().await;
        })
    }

    /// Unmount path: disconnect and drop every subscription.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.teardown(&mut lifecycle);
        lifecycle.auth = AuthState::signed_out();
    }

    fn teardown(&self, lifecycle: &mut Lifecycle) {
        if !lifecycle.subscriptions.is_empty() {
            debug!("Dropping {} provider subscriptions", lifecycle.subscriptions.len());
        }
        lifecycle.subscriptions.clear();
        self.inner.session.disconnect();
        self.inner.phase.send_replace(Phase::Disconnected);
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.is_connected()
    }

    pub fn connection_status(&self) -> watch::Receiver<bool> {
        self.inner.session.connection_status()
    }

    /// Revision counter bumped after every state change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    pub fn session(&self) -> &Arc<RealtimeSession> {
        &self.inner.session
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.lock().log.entries().to_vec()
    }

    /// Inserts unless a message with the same id is already logged.
    pub fn add_message(&self, message: Message) -> bool {
        let outcome = self.inner.lock().log.insert(message);
        if outcome == Insert::Duplicate {
            return false;
        }
        self.inner.bump();
        true
    }

    pub fn get_conversation_messages(&self, user_id: &str, admin_id: &str) -> Vec<Message> {
        self.inner.lock().log.conversation(user_id, admin_id)
    }

    /// Marks what the other party sent as read, from `role`'s point of
    /// view, and zeroes the counter of that counterpart.
    pub fn mark_conversation_as_read(&self, user_id: &str, admin_id: &str, role: Party) {
        let counterpart = match role {
            Party::Admin => user_id,
            Party::User => admin_id,
        };
        {
            let mut state = self.inner.lock();
            state.log.mark_conversation_read(user_id, admin_id, role.other());
            state.unread.insert(counterpart.to_string(), 0);
        }
        self.inner.bump();
    }

    pub fn unread_count(&self, counterpart_id: &str) -> u32 {
        self.inner
            .lock()
            .unread
            .get(counterpart_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn unread_counts(&self) -> HashMap<String, u32> {
        self.inner.lock().unread.clone()
    }

    /// Publishes `message` as though the server had sent it.
    pub fn notify_new_message(&self, message: Message) {
        self.inner
            .session
            .dispatcher()
            .trigger_event(Event::NewMessage(NewMessagePayload {
                message: message.into(),
            }));
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.inner.lock().notifications.clone()
    }

    pub fn clear_notification(&self, notification_id: i64) -> bool {
        let removed = {
            let mut state = self.inner.lock();
            let before = state.notifications.len();
            state.notifications.retain(|n| n.id != notification_id);
            state.notifications.len() != before
        };
        if removed {
            self.inner.bump();
        }
        removed
    }

    /// Latest `seats_updated` payload for a showtime.
    pub fn seat_snapshot(&self, showtime_id: &str) -> Option<Value> {
        self.inner.lock().seats.get(showtime_id).cloned()
    }

    pub fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        callback: Option<AckCallback>,
    ) -> bool {
        self.inner
            .session
            .send_message(conversation_id, content, callback)
    }

    pub fn add_event_listener(&self, topic: impl Into<Topic>, listener: Listener) -> Subscription {
        self.inner.session.add_event_listener(topic, listener)
    }

    pub fn remove_event_listener(&self, topic: impl Into<Topic>, listener: &Listener) {
        self.inner.session.remove_event_listener(topic, listener);
    }

    pub fn subscribe<F>(&self, topic: impl Into<Topic>, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.session.subscribe(topic, listener)
    }
}

type Handler = fn(&Inner, &Event);

fn register_handlers(inner: &Arc<Inner>) -> Vec<Subscription> {
    let handlers: [Handler; 6] = [
        on_connected,
        on_seats_updated,
        on_booking_expiring,
        on_booking_expired,
        on_new_message,
        on_message_read,
    ];

    PROVIDER_EVENTS
        .into_iter()
        .zip(handlers)
        .map(|(kind, handler)| {
            let weak: Weak<Inner> = Arc::downgrade(inner);
            inner.session.subscribe(kind, move |event| {
                if let Some(inner) = weak.upgrade() {
                    handler(&inner, event);
                }
            })
        })
        .collect()
}

fn on_connected(inner: &Inner, _event: &Event) {
    info!("Realtime session is live");
    inner.bump();
}

fn on_seats_updated(inner: &Inner, event: &Event) {
    let Event::SeatsUpdated(update) = event else {
        return;
    };
    debug!("Seats updated for showtime {}", update.showtime_id);
    inner
        .lock()
        .seats
        .insert(update.showtime_id.clone(), update.seats.clone());
    inner.bump();
}

fn on_booking_expiring(inner: &Inner, event: &Event) {
    let Event::BookingExpiring(expiring) = event else {
        return;
    };
    push_notification(
        inner,
        NotificationKind::Warning,
        format!(
            "Your booking will expire in {} minutes",
            expiring.minutes_left
        ),
        &expiring.booking_id,
    );
}

fn on_booking_expired(inner: &Inner, event: &Event) {
    let Event::BookingExpired(expired) = event else {
        return;
    };
    push_notification(
        inner,
        NotificationKind::Error,
        "Your booking has expired".to_string(),
        &expired.booking_id,
    );
}

fn push_notification(inner: &Inner, kind: NotificationKind, message: String, booking_id: &str) {
    {
        let mut state = inner.lock();
        let id = Utc::now()
            .timestamp_millis()
            .max(state.last_notification_id + 1);
        state.last_notification_id = id;
        state.notifications.push(Notification {
            id,
            kind,
            message,
            booking_id: Some(booking_id.to_string()),
        });
    }
    inner.bump();
}

fn on_new_message(inner: &Inner, event: &Event) {
    let Event::NewMessage(payload) = event else {
        return;
    };
    let message = match payload.message.clone().normalize() {
        Ok(message) => message,
        Err(e) => {
            warn!("Dropping new_message: {}", e);
            return;
        }
    };

    {
        let mut state = inner.lock();
        let counterpart = message.counterpart_id().to_string();
        match state.log.insert(message) {
            Insert::Added => *state.unread.entry(counterpart).or_insert(0) += 1,
            Insert::Confirmed => {}
            Insert::Duplicate => return,
        }
    }
    inner.bump();
}

fn on_message_read(inner: &Inner, event: &Event) {
    let Event::MessageRead(read) = event else {
        return;
    };
    let found = inner.lock().log.mark_read(&read.message_id);
    if found {
        inner.bump();
    } else {
        debug!("message_read for unknown message {}", read.message_id);
    }
}
