use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{RealtimeError, Result};
use crate::models::{Message, Party};

/// Emissions this client sends to the server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    #[serde(rename = "send_message")]
    SendMessage {
        conversation_id: String,
        content: String,
    },
    #[serde(rename = "mark_read")]
    MarkRead { message_id: String },
    #[serde(rename = "mark_all_read")]
    MarkAllRead { conversation_id: String },
    #[serde(rename = "typing")]
    Typing {
        conversation_id: String,
        is_typing: bool,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SendMessage { .. } => "send_message",
            ClientEvent::MarkRead { .. } => "mark_read",
            ClientEvent::MarkAllRead { .. } => "mark_all_read",
            ClientEvent::Typing { .. } => "typing",
        }
    }

    /// The `data` half of the `[name, data]` Socket.IO event.
    pub fn payload(&self) -> Result<Value> {
        let mut envelope = serde_json::to_value(self)?;
        Ok(envelope
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }
}

/// Domain events the server pushes. Connection lifecycle packets are
/// handled by the transport and never parsed here.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "new_message")]
    NewMessage(NewMessagePayload),
    #[serde(rename = "message_read")]
    MessageRead(MessageReadPayload),
    #[serde(rename = "all_messages_read")]
    AllMessagesRead(AllMessagesReadPayload),
    #[serde(rename = "typing")]
    Typing(TypingPayload),
    #[serde(rename = "seats_updated")]
    SeatsUpdated(SeatsUpdatedPayload),
    #[serde(rename = "booking_expiring")]
    BookingExpiring(BookingExpiringPayload),
    #[serde(rename = "booking_expired")]
    BookingExpired(BookingExpiredPayload),
}

impl ServerEvent {
    pub fn parse(name: &str, data: Value) -> Result<ServerEvent> {
        Ok(serde_json::from_value(json!({ "event": name, "data": data }))?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessagePayload {
    pub message: RawMessage,
}

/// A chat message as the server sends it. Every field is optional so a
/// partial payload still reaches normalization instead of failing here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawMessage {
    #[serde(rename = "_id", alias = "id")]
    pub id: Option<String>,
    pub sender: Option<Party>,
    pub content: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub user_id: Option<IdRef>,
    pub admin_id: Option<IdRef>,
    pub is_read: Option<bool>,
    pub is_temporary: Option<bool>,
}

impl RawMessage {
    /// Project onto the canonical [`Message`] shape.
    pub fn normalize(self) -> Result<Message> {
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RealtimeError::Protocol("message without _id".into()))?;
        let sender = self
            .sender
            .ok_or_else(|| RealtimeError::Protocol(format!("message {id} without sender")))?;
        let user_id = self
            .user_id
            .map(IdRef::into_id)
            .ok_or_else(|| RealtimeError::Protocol(format!("message {id} without userId")))?;
        let admin_id = self
            .admin_id
            .map(IdRef::into_id)
            .ok_or_else(|| RealtimeError::Protocol(format!("message {id} without adminId")))?;

        Ok(Message {
            id,
            sender,
            content: self.content.unwrap_or_default(),
            created_at: self.created_at.unwrap_or_else(Utc::now),
            user_id,
            admin_id,
            is_read: self.is_read.unwrap_or(false),
            is_temporary: self.is_temporary.unwrap_or(false),
        })
    }
}

impl From<Message> for RawMessage {
    fn from(message: Message) -> Self {
        RawMessage {
            id: Some(message.id),
            sender: Some(message.sender),
            content: Some(message.content),
            created_at: Some(message.created_at),
            user_id: Some(IdRef::Plain(message.user_id)),
            admin_id: Some(IdRef::Plain(message.admin_id)),
            is_read: Some(message.is_read),
            is_temporary: Some(message.is_temporary).filter(|temporary| *temporary),
        }
    }
}

/// Either a bare id or a populated document carrying `_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdRef {
    Plain(String),
    Populated {
        #[serde(rename = "_id")]
        id: String,
    },
}

impl IdRef {
    pub fn into_id(self) -> String {
        match self {
            IdRef::Plain(id) | IdRef::Populated { id } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReadPayload {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllMessagesReadPayload {
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatsUpdatedPayload {
    pub showtime_id: String,
    #[serde(default)]
    pub seats: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingExpiringPayload {
    pub booking_id: String,
    pub minutes_left: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingExpiredPayload {
    pub booking_id: String,
}

/// Server acknowledgement handed to an emit callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub success: bool,
    pub error: Option<String>,
    pub data: Value,
}

impl Ack {
    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Ack {
            success: false,
            data: json!({ "success": false, "error": error }),
            error: Some(error),
        }
    }

    /// Interpret the first ack argument. Servers that omit `success`
    /// are treated as having succeeded.
    pub fn from_payload(data: Value) -> Self {
        let success = data
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let error = data
            .get("error")
            .or_else(|| data.get("message").filter(|_| !success))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ack {
            success,
            error,
            data,
        }
    }
}

pub type AckCallback = Box<dyn FnOnce(Ack) + Send + 'static>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_message_payload_uses_camel_case() {
        let event = ClientEvent::SendMessage {
            conversation_id: "U1".into(),
            content: "hi".into(),
        };
        assert_eq!(event.name(), "send_message");
        assert_eq!(
            event.payload().unwrap(),
            json!({ "conversationId": "U1", "content": "hi" })
        );
    }

    #[test]
    fn typing_payload_carries_flag() {
        let event = ClientEvent::Typing {
            conversation_id: "c1".into(),
            is_typing: true,
        };
        assert_eq!(
            event.payload().unwrap(),
            json!({ "conversationId": "c1", "isTyping": true })
        );
    }

    #[test]
    fn parses_new_message_and_ignores_extra_fields() {
        let event = ServerEvent::parse(
            "new_message",
            json!({
                "message": {
                    "_id": "m1",
                    "sender": "user",
                    "content": "hi",
                    "createdAt": "2024-01-01T00:00:00Z",
                    "userId": "U1",
                    "adminId": { "_id": "A1", "name": "Box office" },
                    "__v": 0
                }
            }),
        )
        .unwrap();

        let ServerEvent::NewMessage(payload) = event else {
            panic!("expected new_message");
        };
        let message = payload.message.normalize().unwrap();
        assert_eq!(message.id, "m1");
        assert_eq!(message.admin_id, "A1");
        assert!(!message.is_read);
        assert!(!message.is_temporary);
    }

    #[test]
    fn normalize_rejects_missing_id() {
        let raw = RawMessage {
            sender: Some(Party::User),
            content: Some("hi".into()),
            ..RawMessage::default()
        };
        assert!(matches!(raw.normalize(), Err(RealtimeError::Protocol(_))));
    }

    #[test]
    fn unknown_event_name_fails_to_parse() {
        assert!(ServerEvent::parse("showtime_deleted", json!({})).is_err());
    }

    #[test]
    fn ack_reads_failure_shape() {
        let ack = Ack::from_payload(json!({ "success": false, "error": "Conversation not found" }));
        assert!(!ack.success);
        assert_eq!(ack.error.as_deref(), Some("Conversation not found"));

        let ack = Ack::from_payload(json!({ "message": { "_id": "m1" } }));
        assert!(ack.success);
        assert_eq!(ack.error, None);
    }
}
