//! The canonical message log and its per-conversation index.

use std::collections::HashMap;

use crate::models::{ConversationKey, Message, Party};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Added,
    /// A temporary entry was overwritten by its confirmed copy.
    Confirmed,
    Duplicate,
}

/// Messages in arrival order, unique by id. Each conversation keeps a list
/// of positions ordered by `created_at`, ties broken by arrival.
#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    entries: Vec<Message>,
    by_id: HashMap<String, usize>,
    by_conversation: HashMap<ConversationKey, Vec<usize>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, message: Message) -> Insert {
        if let Some(&position) = self.by_id.get(&message.id) {
            if self.entries[position].is_temporary && !message.is_temporary {
                self.unindex(position);
                self.entries[position] = message;
                self.index(position);
                return Insert::Confirmed;
            }
            return Insert::Duplicate;
        }

        let position = self.entries.len();
        self.by_id.insert(message.id.clone(), position);
        self.entries.push(message);
        self.index(position);
        Insert::Added
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.by_id.get(id).map(|&position| &self.entries[position])
    }

    pub fn conversation(&self, user_id: &str, admin_id: &str) -> Vec<Message> {
        self.by_conversation
            .get(&ConversationKey::new(user_id, admin_id))
            .map(|positions| {
                positions
                    .iter()
                    .map(|&position| self.entries[position].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns whether the message exists.
    pub fn mark_read(&mut self, id: &str) -> bool {
        match self.by_id.get(id) {
            Some(&position) => {
                self.entries[position].is_read = true;
                true
            }
            None => false,
        }
    }

    /// Flags every unread message `sender` sent in the conversation.
    /// Returns how many changed.
    pub fn mark_conversation_read(&mut self, user_id: &str, admin_id: &str, sender: Party) -> usize {
        let Some(positions) = self
            .by_conversation
            .get(&ConversationKey::new(user_id, admin_id))
        else {
            return 0;
        };

        let mut changed = 0;
        for &position in positions {
            let entry = &mut self.entries[position];
            if entry.sender == sender && !entry.is_read {
                entry.is_read = true;
                changed += 1;
            }
        }
        changed
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn index(&mut self, position: usize) {
        let entries = &self.entries;
        let created_at = entries[position].created_at;
        let positions = self
            .by_conversation
            .entry(entries[position].conversation())
            .or_default();
        let at = positions.partition_point(|&other| {
            let other_at = entries[other].created_at;
            other_at < created_at || (other_at == created_at && other < position)
        });
        positions.insert(at, position);
    }

    fn unindex(&mut self, position: usize) {
        let key = self.entries[position].conversation();
        if let Some(positions) = self.by_conversation.get_mut(&key) {
            positions.retain(|&other| other != position);
            if positions.is_empty() {
                self.by_conversation.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(id: &str, sender: Party, user: &str, admin: &str, minute: u32) -> Message {
        Message {
            id: id.to_string(),
            sender,
            content: format!("body of {id}"),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 10, minute, 0).unwrap(),
            user_id: user.to_string(),
            admin_id: admin.to_string(),
            is_read: false,
            is_temporary: false,
        }
    }

    #[test]
    fn insert_is_idempotent_on_id() {
        let mut log = MessageLog::new();
        let m = message("m1", Party::User, "U1", "A1", 0);
        assert_eq!(log.insert(m.clone()), Insert::Added);
        assert_eq!(log.insert(m), Insert::Duplicate);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn conversation_is_filtered_and_sorted() {
        let mut log = MessageLog::new();
        log.insert(message("late", Party::Admin, "U1", "A1", 30));
        log.insert(message("other-admin", Party::User, "U1", "A2", 5));
        log.insert(message("early", Party::User, "U1", "A1", 1));
        log.insert(message("other-user", Party::User, "U2", "A1", 2));
        log.insert(message("middle", Party::User, "U1", "A1", 10));

        let ids: Vec<String> = log
            .conversation("U1", "A1")
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, ["early", "middle", "late"]);
        assert_eq!(log.conversation("A1", "U1").len(), 3);
        assert!(log.conversation("U3", "A1").is_empty());
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let mut log = MessageLog::new();
        log.insert(message("first", Party::User, "U1", "A1", 0));
        log.insert(message("second", Party::Admin, "U1", "A1", 0));
        let ids: Vec<String> = log.conversation("U1", "A1").into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["first", "second"]);
    }

    #[test]
    fn confirmed_copy_replaces_temporary_in_place() {
        let mut log = MessageLog::new();
        let mut temp = message("temp-1", Party::User, "U1", "A1", 20);
        temp.is_temporary = true;
        log.insert(message("before", Party::Admin, "U1", "A1", 5));
        log.insert(temp);

        let mut confirmed = message("temp-1", Party::User, "U1", "A1", 1);
        confirmed.content = "confirmed".into();
        assert_eq!(log.insert(confirmed), Insert::Confirmed);
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[1].content, "confirmed");

        let ids: Vec<String> = log.conversation("U1", "A1").into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["temp-1", "before"]);
    }

    #[test]
    fn different_ids_are_not_collapsed() {
        let mut log = MessageLog::new();
        let mut temp = message("temp-abc", Party::User, "U1", "A1", 0);
        temp.is_temporary = true;
        log.insert(temp);
        log.insert(message("server-1", Party::User, "U1", "A1", 0));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn marks_only_one_senders_messages() {
        let mut log = MessageLog::new();
        log.insert(message("u", Party::User, "U1", "A1", 0));
        log.insert(message("a", Party::Admin, "U1", "A1", 1));
        log.insert(message("elsewhere", Party::User, "U1", "A2", 2));

        assert_eq!(log.mark_conversation_read("U1", "A1", Party::User), 1);
        assert!(log.get("u").unwrap().is_read);
        assert!(!log.get("a").unwrap().is_read);
        assert!(!log.get("elsewhere").unwrap().is_read);
        assert_eq!(log.mark_conversation_read("U1", "A1", Party::User), 0);
    }

    #[test]
    fn mark_read_reports_unknown_ids() {
        let mut log = MessageLog::new();
        log.insert(message("m1", Party::User, "U1", "A1", 0));
        assert!(log.mark_read("m1"));
        assert!(!log.mark_read("missing"));
    }
}
