use crate::entity::{RoomId, UserId};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

pub type MessageId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub sender_name: String,
    #[serde(default)]
    pub sender_image: Option<String>,
    #[serde(alias = "content")]
    pub text: String,
    pub sent_at_time: NaiveDateTime,
}

/// Outbound chat payload published to the room destination.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage<'a> {
    pub room_id: RoomId,
    pub content: &'a str,
}

/// Messages of one room, unique by id.
///
/// Kept ordered by `(sent_at_time, id)` no matter which path delivered them,
/// so a cached tail, a fresh history page and live pushes can arrive in any
/// order. Ids already present are skipped.
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: BTreeMap<(NaiveDateTime, MessageId), ChatMessage>,
    seen: HashSet<MessageId>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, message: ChatMessage) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        self.messages.insert((message.sent_at_time, message.id), message);
        true
    }

    /// Adds a message received over the socket. Returns false for duplicates.
    pub fn push_live(&mut self, message: ChatMessage) -> bool {
        self.insert(message)
    }

    /// Merges a history page (any order). Returns how many messages were new.
    pub fn merge_history(&mut self, page: Vec<ChatMessage>) -> usize {
        let mut added = 0;
        for message in page {
            if self.insert(message) {
                added += 1;
            }
        }
        added
    }

    /// Rendering order.
    pub fn newest_first(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.values().rev()
    }

    pub fn latest(&self) -> Option<&ChatMessage> {
        self.messages.values().next_back()
    }

    pub fn oldest(&self) -> Option<&ChatMessage> {
        self.messages.values().next()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.seen.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn sample_message(id: MessageId, minute: u32) -> ChatMessage {
    use chrono::NaiveDate;

    ChatMessage {
        id,
        sender_id: 1,
        sender_name: "mina".to_string(),
        sender_image: None,
        text: format!("message {id}"),
        sent_at_time: NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(12, minute, 0))
            .unwrap(),
    }
}
