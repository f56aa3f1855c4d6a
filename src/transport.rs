use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use url::Url;

use crate::config::RealtimeConfig;
use crate::error::{RealtimeError, Result};
use crate::packet::Packet;

/// Body of the socket-token endpoint: `{statusCode, content: {token}}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub status_code: u16,
    #[serde(default)]
    pub content: Option<TokenContent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenContent {
    #[serde(default)]
    pub token: Option<String>,
}

impl TokenResponse {
    pub fn ok(token: impl Into<String>) -> Self {
        TokenResponse {
            status_code: 200,
            content: Some(TokenContent {
                token: Some(token.into()),
            }),
        }
    }

    pub fn into_token(self) -> Result<String> {
        if self.status_code != 200 {
            return Err(RealtimeError::Token(format!(
                "token endpoint answered {}",
                self.status_code
            )));
        }
        self.content
            .and_then(|content| content.token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| RealtimeError::Token("response carried no token".into()))
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<TokenResponse>;
}

/// Fetches the socket token from the REST API.
pub struct HttpTokenProvider {
    client: reqwest::Client,
    url: Url,
    bearer: Option<String>,
}

impl HttpTokenProvider {
    pub fn new(url: Url) -> Self {
        HttpTokenProvider {
            client: reqwest::Client::new(),
            url,
            bearer: None,
        }
    }

    /// Sends `Authorization: Bearer <token>` with every request.
    #[must_use]
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn fetch_token(&self) -> Result<TokenResponse> {
        let mut request = self.client.get(self.url.clone());
        if let Some(bearer) = &self.bearer {
            request = request.bearer_auth(bearer);
        }

        let response = request.send().await?;
        let http_status = response.status().as_u16();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        match serde_json::from_value::<TokenResponse>(body) {
            Ok(parsed) => Ok(parsed),
            Err(e) => {
                debug!("Token endpoint body was not a token response: {}", e);
                Ok(TokenResponse {
                    status_code: http_status,
                    content: None,
                })
            }
        }
    }
}

/// Authentication payload of the namespace connect packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Handshake {
    pub token: String,
}

/// What a live link reports to its session.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Disconnected(String),
    ConnectError(String),
    Event { name: String, data: Value },
    Ack { id: u64, data: Value },
}

/// What a session asks its link to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Emit {
        name: String,
        data: Value,
        ack_id: Option<u64>,
    },
    Close,
}

/// Channel pair owned by one session for the lifetime of one connection.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Link {
    /// Both ends: the `Link` for the session, and the link-side halves
    /// for whoever drives the connection.
    pub fn pair() -> (
        Link,
        mpsc::UnboundedReceiver<Outbound>,
        mpsc::UnboundedSender<LinkEvent>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Link {
                outbound: out_tx,
                inbound: in_rx,
            },
            out_rx,
            in_tx,
        )
    }
}

/// Opens realtime links. `open` returns as soon as the link exists; the
/// `Connected` event arrives on the link once the server accepts it.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, handshake: Handshake) -> Result<Link>;
}

/// Socket.IO over websocket, reconnecting a bounded number of times.
#[derive(Debug, Clone)]
pub struct SocketIoConnector {
    url: Url,
    reconnection_attempts: u32,
    reconnection_delay: Duration,
}

impl SocketIoConnector {
    pub fn new(config: &RealtimeConfig) -> Result<Self> {
        Ok(SocketIoConnector {
            url: config.socket_url()?,
            reconnection_attempts: config.reconnection_attempts,
            reconnection_delay: config.reconnection_delay,
        })
    }
}

#[async_trait]
impl Connector for SocketIoConnector {
    async fn open(&self, handshake: Handshake) -> Result<Link> {
        let auth = serde_json::to_value(&handshake)?;
        let (link, outbound, inbound) = Link::pair();
        tokio::spawn(run_link(self.clone(), auth, outbound, inbound));
        Ok(link)
    }
}

enum Ended {
    /// The session closed the link.
    Closed,
    /// Transport lost; eligible for reconnection.
    Dropped { reason: String, was_connected: bool },
    /// Server refused or ended the session; no reconnection.
    Refused(String),
    ServerDisconnect,
}

type Pending = VecDeque<Outbound>;

async fn run_link(
    connector: SocketIoConnector,
    auth: Value,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut pending = Pending::new();
    let mut attempts = 0u32;

    loop {
        match drive_connection(&connector.url, &auth, &mut outbound, &inbound, &mut pending).await {
            Ok(Ended::Closed) => {
                debug!("Link to {} closed by client", connector.url);
                return;
            }
            Ok(Ended::Refused(message)) => {
                error!("Server refused realtime connection: {}", message);
                let _ = inbound.send(LinkEvent::ConnectError(message));
                return;
            }
            Ok(Ended::ServerDisconnect) => {
                warn!("Server ended the realtime session");
                let _ = inbound.send(LinkEvent::Disconnected("io server disconnect".into()));
                return;
            }
            Ok(Ended::Dropped {
                reason,
                was_connected,
            }) => {
                warn!("Realtime link dropped: {}", reason);
                if was_connected {
                    attempts = 0;
                }
                let _ = inbound.send(LinkEvent::Disconnected(reason));
            }
            Err(e) => {
                error!("Realtime connection attempt failed: {}", e);
                let _ = inbound.send(LinkEvent::ConnectError(e.to_string()));
            }
        }

        if inbound.is_closed() {
            return;
        }

        attempts += 1;
        if attempts > connector.reconnection_attempts {
            warn!(
                "Giving up on {} after {} reconnection attempts",
                connector.url, connector.reconnection_attempts
            );
            return;
        }

        info!(
            "Reconnecting in {:?} (attempt {}/{})",
            connector.reconnection_delay, attempts, connector.reconnection_attempts
        );
        let sleep = tokio::time::sleep(connector.reconnection_delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => break,
                frame = outbound.recv() => match frame {
                    None | Some(Outbound::Close) => return,
                    Some(emit) => pending.push_back(emit),
                },
            }
        }
    }
}

async fn drive_connection(
    url: &Url,
    auth: &Value,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    inbound: &mpsc::UnboundedSender<LinkEvent>,
    pending: &mut Pending,
) -> Result<Ended> {
    debug!("Dialing {}", url);
    let (ws, _) = connect_async(url.as_str()).await?;
    let (mut sink, mut stream) = ws.split();

    let open = loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => match Packet::decode(text.as_str())? {
                Packet::Open(open) => break open,
                other => debug!("Ignoring {:?} before open", other),
            },
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(RealtimeError::Protocol("closed before open".into()))
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    };
    debug!("Engine session {} opened", open.sid);

    send_packet(&mut sink, &Packet::Connect(Some(auth.clone()))).await?;

    let liveness = if open.ping_interval == 0 {
        Duration::from_secs(45)
    } else {
        Duration::from_millis(open.ping_interval + open.ping_timeout)
    };
    let mut connected = false;

    loop {
        tokio::select! {
            incoming = tokio::time::timeout(liveness, stream.next()) => {
                let frame = match incoming {
                    Err(_) => return Ok(dropped("ping timeout", connected)),
                    Ok(None) | Ok(Some(Ok(WsMessage::Close(_)))) => {
                        return Ok(dropped("transport close", connected))
                    }
                    Ok(Some(Err(e))) => {
                        return Ok(dropped(&format!("transport error: {e}"), connected))
                    }
                    Ok(Some(Ok(WsMessage::Text(text)))) => text,
                    Ok(Some(Ok(_))) => continue,
                };

                let packet = match Packet::decode(frame.as_str()) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("Dropping malformed frame: {}", e);
                        continue;
                    }
                };

                match packet {
                    Packet::Ping => {
                        if let Err(e) = send_packet(&mut sink, &Packet::Pong).await {
                            return Ok(write_failed(&e, connected));
                        }
                    }
                    Packet::Connect(_) => {
                        connected = true;
                        while let Some(frame) = pending.pop_front() {
                            if let Err(e) = send_outbound(&mut sink, frame).await {
                                return Ok(write_failed(&e, connected));
                            }
                        }
                        if inbound.send(LinkEvent::Connected).is_err() {
                            return Ok(Ended::Closed);
                        }
                    }
                    Packet::ConnectError(data) => {
                        let message = data
                            .get("message")
                            .and_then(Value::as_str)
                            .map_or_else(|| data.to_string(), str::to_string);
                        return Ok(Ended::Refused(message));
                    }
                    Packet::Disconnect => return Ok(Ended::ServerDisconnect),
                    Packet::Close => return Ok(dropped("transport close", connected)),
                    Packet::Event { name, mut args, .. } => {
                        let data = if args.is_empty() { Value::Null } else { args.swap_remove(0) };
                        if inbound.send(LinkEvent::Event { name, data }).is_err() {
                            return Ok(Ended::Closed);
                        }
                    }
                    Packet::Ack { id, mut args } => {
                        let data = if args.is_empty() { Value::Null } else { args.swap_remove(0) };
                        if inbound.send(LinkEvent::Ack { id, data }).is_err() {
                            return Ok(Ended::Closed);
                        }
                    }
                    Packet::Open(_) | Packet::Pong | Packet::Noop => {}
                }
            }
            frame = outbound.recv() => match frame {
                None | Some(Outbound::Close) => {
                    let _ = send_packet(&mut sink, &Packet::Disconnect).await;
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(Ended::Closed);
                }
                Some(frame) if connected => {
                    if let Err(e) = send_outbound(&mut sink, frame).await {
                        return Ok(write_failed(&e, connected));
                    }
                }
                Some(frame) => pending.push_back(frame),
            },
        }
    }
}

fn dropped(reason: &str, was_connected: bool) -> Ended {
    Ended::Dropped {
        reason: reason.to_string(),
        was_connected,
    }
}

fn write_failed(error: &RealtimeError, was_connected: bool) -> Ended {
    dropped(&format!("transport error: {error}"), was_connected)
}

async fn send_outbound<S>(sink: &mut S, frame: Outbound) -> Result<()>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    match frame {
        Outbound::Emit { name, data, ack_id } => {
            send_packet(sink, &Packet::event(name, data, ack_id)).await
        }
        Outbound::Close => Ok(()),
    }
}

async fn send_packet<S>(sink: &mut S, packet: &Packet) -> Result<()>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    sink.send(WsMessage::text(packet.encode()?)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn token_response_requires_200() {
        let response: TokenResponse =
            serde_json::from_value(json!({ "statusCode": 401, "content": { "token": "abc" } }))
                .unwrap();
        assert!(matches!(response.into_token(), Err(RealtimeError::Token(_))));
    }

    #[test]
    fn token_response_requires_token() {
        let response: TokenResponse =
            serde_json::from_value(json!({ "statusCode": 200, "content": {} })).unwrap();
        assert!(response.into_token().is_err());

        let response: TokenResponse =
            serde_json::from_value(json!({ "statusCode": 200 })).unwrap();
        assert!(response.into_token().is_err());
    }

    #[test]
    fn token_response_yields_token() {
        assert_eq!(TokenResponse::ok("abc").into_token().unwrap(), "abc");
    }

    #[test]
    fn handshake_serializes_as_auth_payload() {
        let auth = serde_json::to_value(Handshake {
            token: "abc".into(),
        })
        .unwrap();
        assert_eq!(auth, json!({ "token": "abc" }));
    }

    #[tokio::test]
    async fn link_pair_connects_both_halves() {
        let (mut link, mut outbound, inbound) = Link::pair();
        link.outbound.send(Outbound::Close).unwrap();
        inbound.send(LinkEvent::Connected).unwrap();
        assert_eq!(outbound.recv().await, Some(Outbound::Close));
        assert_eq!(link.inbound.recv().await, Some(LinkEvent::Connected));
    }
}
