use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TEMP_ID_PREFIX: &str = "temp-";

/// One end of a user/admin conversation. Doubles as the viewer role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Party {
    User,
    Admin,
}

impl Party {
    pub fn other(self) -> Party {
        match self {
            Party::User => Party::Admin,
            Party::Admin => Party::User,
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::User => f.write_str("user"),
            Party::Admin => f.write_str("admin"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender: Party,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub user_id: String,
    pub admin_id: String,
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_temporary: bool,
}

impl Message {
    /// Local echo shown before the server confirms the send.
    pub fn optimistic(
        sender: Party,
        user_id: impl Into<String>,
        admin_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Message {
            id: format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()),
            sender,
            content: content.into(),
            created_at: Utc::now(),
            user_id: user_id.into(),
            admin_id: admin_id.into(),
            is_read: false,
            is_temporary: true,
        }
    }

    pub fn has_temporary_id(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }

    pub fn conversation(&self) -> ConversationKey {
        ConversationKey::new(&self.user_id, &self.admin_id)
    }

    /// Id of the party that did not send this message.
    pub fn counterpart_id(&self) -> &str {
        match self.sender {
            Party::Admin => &self.user_id,
            Party::User => &self.admin_id,
        }
    }
}

/// Unordered `{userId, adminId}` pair. Stored sorted so both argument
/// orders hash to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey(String, String);

impl ConversationKey {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            ConversationKey(a.to_string(), b.to_string())
        } else {
            ConversationKey(b.to_string(), a.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub message: String,
    pub booking_id: Option<String>,
}

/// Snapshot of the external authentication store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub is_authenticated: bool,
    pub id: Option<String>,
}

impl AuthState {
    pub fn signed_in(id: impl Into<String>) -> Self {
        AuthState {
            is_authenticated: true,
            id: Some(id.into()),
        }
    }

    pub fn signed_out() -> Self {
        AuthState::default()
    }
}
