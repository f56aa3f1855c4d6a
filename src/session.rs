use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::RealtimeConfig;
use crate::dispatcher::{Event, EventDispatcher, Listener, Subscription, Topic};
use crate::error::{RealtimeError, Result};
use crate::messages::{Ack, AckCallback, ClientEvent, ServerEvent};
use crate::transport::{Connector, Handshake, LinkEvent, Outbound, TokenProvider};

struct ActiveLink {
    generation: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct LinkState {
    link: Option<ActiveLink>,
    generation: u64,
    next_ack_id: u64,
    pending_acks: HashMap<u64, AckCallback>,
}

struct Shared {
    dispatcher: EventDispatcher,
    connected: watch::Sender<bool>,
    reconnect_attempts: AtomicU32,
    state: Mutex<LinkState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The state lock, but only while `generation` still owns the link.
    fn lock_current(&self, generation: u64) -> Option<MutexGuard<'_, LinkState>> {
        let state = self.lock();
        state
            .link
            .as_ref()
            .is_some_and(|link| link.generation == generation)
            .then_some(state)
    }

    /// Returns whether the flag changed.
    fn set_connected(&self, connected: bool) -> bool {
        self.connected.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        })
    }
}

/// One authenticated realtime connection and the operations on it.
pub struct RealtimeSession {
    config: RealtimeConfig,
    tokens: Arc<dyn TokenProvider>,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
}

impl RealtimeSession {
    pub fn new(
        config: RealtimeConfig,
        tokens: Arc<dyn TokenProvider>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (connected, _) = watch::channel(false);
        RealtimeSession {
            config,
            tokens,
            connector,
            shared: Arc::new(Shared {
                dispatcher: EventDispatcher::new(),
                connected,
                reconnect_attempts: AtomicU32::new(0),
                state: Mutex::new(LinkState::default()),
            }),
        }
    }

    /// Fetches a token, opens a link and waits for the server to accept
    /// it. `false` when the token is unusable or no connect arrives within
    /// the connect timeout. Any previous link is closed first.
    pub async fn connect(&self) -> bool {
        self.disconnect();
        match self.establish().await {
            Ok(()) => {
                info!("Realtime session connected");
                true
            }
            Err(e) => {
                error!("Realtime connect failed: {}", e);
                false
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        let token = self.fetch_token().await?;
        let link = self.connector.open(Handshake { token }).await?;

        let (first_connect, connected) = oneshot::channel();
        let generation = {
            let mut state = self.shared.lock();
            state.generation += 1;
            let generation = state.generation;
            let task = tokio::spawn(pump(
                Arc::clone(&self.shared),
                generation,
                link.inbound,
                first_connect,
            ));
            // A concurrent connect may have raced us here; keep only ours.
            if let Some(previous) = state.link.replace(ActiveLink {
                generation,
                outbound: link.outbound,
                pump: task,
            }) {
                close_link(previous);
            }
            generation
        };

        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, connected).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.close_generation(generation);
                Err(RealtimeError::Protocol(
                    "link ended before connecting".into(),
                ))
            }
            Err(_) => {
                self.close_generation(generation);
                Err(RealtimeError::Timeout(
                    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                ))
            }
        }
    }

    /// Closes the current link if there is one. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let (link, pending) = {
            let mut state = self.shared.lock();
            (state.link.take(), std::mem::take(&mut state.pending_acks))
        };

        if let Some(link) = link {
            close_link(link);
            info!("Realtime session disconnected");
            self.shared.dispatcher.trigger_event(Event::Disconnected {
                reason: "io client disconnect".into(),
            });
        }
        self.shared.set_connected(false);
        self.shared.reconnect_attempts.store(0, Ordering::Relaxed);

        for (_, callback) in pending {
            callback(Ack::failure("Connection closed"));
        }
    }

    pub fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        callback: Option<AckCallback>,
    ) -> bool {
        self.emit(
            ClientEvent::SendMessage {
                conversation_id: conversation_id.to_string(),
                content: content.to_string(),
            },
            callback,
        )
    }

    pub fn mark_message_as_read(&self, message_id: &str, callback: Option<AckCallback>) -> bool {
        self.emit(
            ClientEvent::MarkRead {
                message_id: message_id.to_string(),
            },
            callback,
        )
    }

    pub fn mark_all_as_read(&self, conversation_id: &str, callback: Option<AckCallback>) -> bool {
        self.emit(
            ClientEvent::MarkAllRead {
                conversation_id: conversation_id.to_string(),
            },
            callback,
        )
    }

    pub fn send_typing_status(&self, conversation_id: &str, is_typing: bool) -> bool {
        self.emit(
            ClientEvent::Typing {
                conversation_id: conversation_id.to_string(),
                is_typing,
            },
            None,
        )
    }

    pub fn add_event_listener(&self, topic: impl Into<Topic>, listener: Listener) -> Subscription {
        self.shared.dispatcher.add_event_listener(topic, listener)
    }

    pub fn remove_event_listener(&self, topic: impl Into<Topic>, listener: &Listener) {
        self.shared.dispatcher.remove_event_listener(topic, listener);
    }

    pub fn subscribe<F>(&self, topic: impl Into<Topic>, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.dispatcher.subscribe(topic, listener)
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.shared.dispatcher
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    pub fn connection_status(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    /// Drops and failed dials seen since the link last connected.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn max_reconnect_attempts(&self) -> u32 {
        self.config.reconnection_attempts
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    async fn fetch_token(&self) -> Result<String> {
        self.tokens.fetch_token().await?.into_token()
    }

    fn emit(&self, event: ClientEvent, callback: Option<AckCallback>) -> bool {
        let name = event.name();
        if !self.is_connected() {
            warn!("Cannot emit {}: not connected", name);
            if let Some(callback) = callback {
                callback(Ack::failure("Not connected"));
            }
            return false;
        }

        let data = match event.payload() {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode {}: {}", name, e);
                if let Some(callback) = callback {
                    callback(Ack::failure(e.to_string()));
                }
                return false;
            }
        };

        let rejected = {
            let mut state = self.shared.lock();
            let outbound = state.link.as_ref().map(|link| link.outbound.clone());
            match outbound {
                None => callback,
                Some(outbound) => {
                    let ack_id = callback.map(|callback| {
                        state.next_ack_id += 1;
                        let id = state.next_ack_id;
                        state.pending_acks.insert(id, callback);
                        id
                    });
                    let frame = Outbound::Emit {
                        name: name.to_string(),
                        data,
                        ack_id,
                    };
                    if outbound.send(frame).is_ok() {
                        debug!("Emitted {}", name);
                        return true;
                    }
                    ack_id.and_then(|id| state.pending_acks.remove(&id))
                }
            }
        };

        warn!("Cannot emit {}: link is gone", name);
        if let Some(callback) = rejected {
            callback(Ack::failure("Not connected"));
        }
        false
    }

    fn close_generation(&self, generation: u64) {
        let current = {
            let state = self.shared.lock();
            state.link.as_ref().map(|link| link.generation)
        };
        if current == Some(generation) {
            self.disconnect();
        }
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        let link = self.shared.lock().link.take();
        if let Some(link) = link {
            close_link(link);
        }
    }
}

fn close_link(link: ActiveLink) {
    let _ = link.outbound.send(Outbound::Close);
    link.pump.abort();
}

/// Turns link events into dispatcher events for one connection. Events
/// from a link that has since been replaced or closed are discarded.
async fn pump(
    shared: Arc<Shared>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
    first_connect: oneshot::Sender<()>,
) {
    let mut first_connect = Some(first_connect);

    while let Some(event) = inbound.recv().await {
        let Some(mut state) = shared.lock_current(generation) else {
            debug!("Link {} superseded, dropping its events", generation);
            return;
        };

        match event {
            LinkEvent::Connected => {
                shared.set_connected(true);
                drop(state);
                shared.reconnect_attempts.store(0, Ordering::Relaxed);
                if let Some(first) = first_connect.take() {
                    let _ = first.send(());
                } else {
                    info!("Realtime session reconnected");
                }
                shared.dispatcher.trigger_event(Event::Connected);
            }
            LinkEvent::Disconnected(reason) => {
                shared.set_connected(false);
                drop(state);
                shared.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
                warn!("Realtime session disconnected: {}", reason);
                shared
                    .dispatcher
                    .trigger_event(Event::Disconnected { reason });
            }
            LinkEvent::ConnectError(message) => {
                let was_connected = shared.set_connected(false);
                drop(state);
                shared.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
                error!("Realtime connection error: {}", message);
                if was_connected {
                    shared.dispatcher.trigger_event(Event::Disconnected {
                        reason: message.clone(),
                    });
                }
                shared.dispatcher.trigger_event(Event::Error { message });
            }
            LinkEvent::Event { name, data } => {
                drop(state);
                match ServerEvent::parse(&name, data) {
                    Ok(event) => {
                        shared.dispatcher.trigger_event(event.into());
                    }
                    Err(e) => warn!("Dropping {} event: {}", name, e),
                }
            }
            LinkEvent::Ack { id, data } => {
                let callback = state.pending_acks.remove(&id);
                drop(state);
                match callback {
                    Some(callback) => {
                        tokio::spawn(async move { callback(Ack::from_payload(data)) });
                    }
                    None => debug!("Ack {} has no waiting callback", id),
                }
            }
        }
    }

    debug!("Realtime link {} finished", generation);
    if let Some(_state) = shared.lock_current(generation) {
        shared.set_connected(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Link, TokenResponse};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct FixedToken(Option<TokenResponse>);

    #[async_trait]
    impl TokenProvider for FixedToken {
        async fn fetch_token(&self) -> Result<TokenResponse> {
            self.0
                .clone()
                .ok_or_else(|| RealtimeError::Token("unreachable".into()))
        }
    }

    struct NeverOpens(AtomicBool);

    #[async_trait]
    impl Connector for NeverOpens {
        async fn open(&self, _handshake: Handshake) -> Result<Link> {
            self.0.store(true, Ordering::SeqCst);
            Err(RealtimeError::Protocol("should not be dialed".into()))
        }
    }

    fn session(token: Option<TokenResponse>) -> (RealtimeSession, Arc<NeverOpens>) {
        let connector = Arc::new(NeverOpens(AtomicBool::new(false)));
        let session = RealtimeSession::new(
            RealtimeConfig::default(),
            Arc::new(FixedToken(token)),
            connector.clone(),
        );
        (session, connector)
    }

    #[tokio::test]
    async fn connect_fails_fast_on_bad_token() {
        let (session, connector) = session(Some(TokenResponse {
            status_code: 403,
            content: None,
        }));
        assert!(!session.connect().await);
        assert!(!connector.0.load(Ordering::SeqCst));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn connect_fails_when_token_fetch_errors() {
        let (session, _) = session(None);
        assert!(!session.connect().await);
    }

    #[test]
    fn emit_while_disconnected_fails_synchronously() {
        let (session, _) = session(None);
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();

        let sent = session.send_message(
            "U1",
            "hello",
            Some(Box::new(move |ack| {
                *sink.lock().unwrap() = Some(ack);
            })),
        );

        assert!(!sent);
        let ack = seen.lock().unwrap().take().unwrap();
        assert!(!ack.success);
        assert_eq!(ack.error.as_deref(), Some("Not connected"));
        assert!(!session.send_typing_status("U1", true));
        assert!(!session.mark_message_as_read("m1", None));
        assert!(!session.mark_all_as_read("U1", None));
    }

    #[tokio::test]
    async fn superseded_link_cannot_mark_session_connected() {
        let (session, _) = session(None);
        let (first_connect, connected) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump(Arc::clone(&session.shared), 7, rx, first_connect));

        tx.send(LinkEvent::Connected).unwrap();
        task.await.unwrap();

        assert!(connected.await.is_err());
        assert!(!session.is_connected());
    }

    #[test]
    fn disconnect_without_link_is_a_no_op() {
        let (session, _) = session(None);
        session.disconnect();
        session.disconnect();
        assert!(!session.is_connected());
        assert_eq!(session.reconnect_attempts(), 0);
        assert_eq!(session.max_reconnect_attempts(), 5);
    }
}
