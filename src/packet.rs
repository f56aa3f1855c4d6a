//! Text frames of Engine.IO v4 carrying Socket.IO v5 packets.
//!
//! Only the default namespace and text payloads are spoken. Binary
//! attachments are rejected as protocol errors.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{RealtimeError, Result};

/// Body of the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(OpenInfo),
    Close,
    Ping,
    Pong,
    Noop,
    Connect(Option<Value>),
    Disconnect,
    Event {
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        id: u64,
        args: Vec<Value>,
    },
    ConnectError(Value),
}

impl Packet {
    pub fn event(name: impl Into<String>, data: Value, id: Option<u64>) -> Packet {
        Packet::Event {
            id,
            name: name.into(),
            args: vec![data],
        }
    }

    pub fn decode(frame: &str) -> Result<Packet> {
        let mut chars = frame.chars();
        let engine_type = chars
            .next()
            .ok_or_else(|| RealtimeError::Protocol("empty frame".into()))?;
        let rest = chars.as_str();

        match engine_type {
            '0' => Ok(Packet::Open(serde_json::from_str(rest)?)),
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '6' => Ok(Packet::Noop),
            '4' => decode_socket_packet(rest),
            other => Err(RealtimeError::Protocol(format!(
                "unsupported engine packet type {other:?}"
            ))),
        }
    }

    pub fn encode(&self) -> Result<String> {
        let frame = match self {
            Packet::Open(_) => {
                return Err(RealtimeError::Protocol("clients never send open".into()))
            }
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::Noop => "6".to_string(),
            Packet::Connect(None) => "40".to_string(),
            Packet::Connect(Some(auth)) => format!("40{}", serde_json::to_string(auth)?),
            Packet::Disconnect => "41".to_string(),
            Packet::Event { id, name, args } => {
                let mut array = Vec::with_capacity(args.len() + 1);
                array.push(Value::String(name.clone()));
                array.extend(args.iter().cloned());
                let body = serde_json::to_string(&array)?;
                match id {
                    Some(id) => format!("42{id}{body}"),
                    None => format!("42{body}"),
                }
            }
            Packet::Ack { id, args } => format!("43{id}{}", serde_json::to_string(args)?),
            Packet::ConnectError(data) => format!("44{}", serde_json::to_string(data)?),
        };
        Ok(frame)
    }
}

fn decode_socket_packet(body: &str) -> Result<Packet> {
    let mut chars = body.chars();
    let socket_type = chars
        .next()
        .ok_or_else(|| RealtimeError::Protocol("message frame without socket packet".into()))?;
    let rest = skip_namespace(chars.as_str());

    match socket_type {
        '0' => {
            if rest.is_empty() {
                Ok(Packet::Connect(None))
            } else {
                Ok(Packet::Connect(Some(serde_json::from_str(rest)?)))
            }
        }
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let (id, payload) = split_ack_id(rest)?;
            let mut args = parse_args(payload)?;
            if args.is_empty() {
                return Err(RealtimeError::Protocol("event without name".into()));
            }
            let name = match args.remove(0) {
                Value::String(name) => name,
                other => {
                    return Err(RealtimeError::Protocol(format!(
                        "event name must be a string, got {other}"
                    )))
                }
            };
            Ok(Packet::Event { id, name, args })
        }
        '3' => {
            let (id, payload) = split_ack_id(rest)?;
            let id = id.ok_or_else(|| RealtimeError::Protocol("ack without id".into()))?;
            Ok(Packet::Ack {
                id,
                args: parse_args(payload)?,
            })
        }
        '4' => {
            let data = if rest.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(rest)?
            };
            Ok(Packet::ConnectError(data))
        }
        '5' | '6' => Err(RealtimeError::Protocol(
            "binary packets are not supported".into(),
        )),
        other => Err(RealtimeError::Protocol(format!(
            "unsupported socket packet type {other:?}"
        ))),
    }
}

/// Drops a `/nsp,` prefix. Only the default namespace is used, so the
/// name itself is not kept.
fn skip_namespace(rest: &str) -> &str {
    if rest.starts_with('/') {
        match rest.find(',') {
            Some(comma) => &rest[comma + 1..],
            None => "",
        }
    } else {
        rest
    }
}

fn split_ack_id(rest: &str) -> Result<(Option<u64>, &str)> {
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return Ok((None, rest));
    }
    let id = rest[..digits]
        .parse()
        .map_err(|_| RealtimeError::Protocol(format!("bad ack id {:?}", &rest[..digits])))?;
    Ok((Some(id), &rest[digits..]))
}

fn parse_args(payload: &str) -> Result<Vec<Value>> {
    match serde_json::from_str(payload)? {
        Value::Array(args) => Ok(args),
        other => Err(RealtimeError::Protocol(format!(
            "expected a json array, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_engine_open() {
        let packet = Packet::decode(
            r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
        )
        .unwrap();
        assert_eq!(
            packet,
            Packet::Open(OpenInfo {
                sid: "abc".into(),
                ping_interval: 25000,
                ping_timeout: 20000,
            })
        );
    }

    #[test]
    fn encodes_connect_with_token() {
        let frame = Packet::Connect(Some(json!({ "token": "abc" })))
            .encode()
            .unwrap();
        assert_eq!(frame, r#"40{"token":"abc"}"#);
    }

    #[test]
    fn encodes_event_with_ack_id() {
        let frame = Packet::event("mark_read", json!({ "messageId": "m1" }), Some(7))
            .encode()
            .unwrap();
        assert_eq!(frame, r#"427["mark_read",{"messageId":"m1"}]"#);
    }

    #[test]
    fn decodes_event_without_ack() {
        let packet = Packet::decode(r#"42["typing",{"conversationId":"c1","isTyping":true}]"#).unwrap();
        assert_eq!(
            packet,
            Packet::Event {
                id: None,
                name: "typing".into(),
                args: vec![json!({ "conversationId": "c1", "isTyping": true })],
            }
        );
    }

    #[test]
    fn decodes_ack_with_multi_digit_id() {
        let packet = Packet::decode(r#"4312[{"success":true}]"#).unwrap();
        assert_eq!(
            packet,
            Packet::Ack {
                id: 12,
                args: vec![json!({ "success": true })],
            }
        );
    }

    #[test]
    fn decodes_connect_ack_and_error() {
        assert_eq!(
            Packet::decode(r#"40{"sid":"x"}"#).unwrap(),
            Packet::Connect(Some(json!({ "sid": "x" })))
        );
        assert_eq!(
            Packet::decode(r#"44{"message":"invalid token"}"#).unwrap(),
            Packet::ConnectError(json!({ "message": "invalid token" }))
        );
    }

    #[test]
    fn skips_namespace_prefix() {
        let packet = Packet::decode(r#"42/chat,["new_message",{}]"#).unwrap();
        assert!(matches!(packet, Packet::Event { ref name, .. } if name == "new_message"));
    }

    #[test]
    fn rejects_binary_and_garbage() {
        assert!(Packet::decode("451-[\"upload\"]").is_err());
        assert!(Packet::decode("").is_err());
        assert!(Packet::decode("9").is_err());
        assert!(Packet::decode("42{\"not\":\"array\"}").is_err());
    }
}
