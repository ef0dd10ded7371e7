//! In-memory chat history
//!
//! Conversations live only as long as the client. They can be backfilled
//! from the message API when the server has storage.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use callrelay_core::UserId;
use callrelay_signal::StoredMessage;

/// One chat line
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    /// Local sequence number, unique within a [`ChatHistory`]
    pub id: u64,
    pub from: UserId,
    pub to: UserId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Sent by the local participant
    pub outgoing: bool,
    pub read: bool,
}

/// Conversations of the local participant, keyed by contact
#[derive(Debug)]
pub struct ChatHistory {
    local: UserId,
    conversations: HashMap<UserId, Vec<ChatMessage>>,
    next_id: u64,
}

impl ChatHistory {
    pub fn new(local: UserId) -> Self {
        Self {
            local,
            conversations: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn local(&self) -> &UserId {
        &self.local
    }

    /// Record a message we sent
    pub fn record_outgoing(&mut self, to: &UserId, text: &str) -> &ChatMessage {
        let msg = ChatMessage {
            id: self.allocate_id(),
            from: self.local.clone(),
            to: to.clone(),
            text: text.to_string(),
            timestamp: Utc::now(),
            outgoing: true,
            read: true,
        };
        self.push(to.clone(), msg)
    }

    /// Record a message relayed to us
    pub fn record_incoming(&mut self, from: &UserId, text: &str) -> &ChatMessage {
        let msg = ChatMessage {
            id: self.allocate_id(),
            from: from.clone(),
            to: self.local.clone(),
            text: text.to_string(),
            timestamp: Utc::now(),
            outgoing: false,
            read: false,
        };
        self.push(from.clone(), msg)
    }

    /// Merge stored history into the conversation with `contact`.
    ///
    /// Messages already present (same sender, text and millisecond) are
    /// skipped. Returns how many were added.
    pub fn backfill(&mut self, contact: &UserId, stored: &[StoredMessage]) -> usize {
        let mut added = 0;
        for record in stored {
            let Some(msg) = self.convert_stored(contact, record) else {
                continue;
            };
            let conversation = self.conversations.entry(contact.clone()).or_default();
            let duplicate = conversation.iter().any(|m| {
                m.from == msg.from
                    && m.text == msg.text
                    && m.timestamp.timestamp_millis() == msg.timestamp.timestamp_millis()
            });
            if !duplicate {
                conversation.push(msg);
                added += 1;
            }
        }

        if let Some(conversation) = self.conversations.get_mut(contact) {
            conversation.sort_by_key(|m| (m.timestamp, m.id));
        }
        debug!("Backfilled {} message(s) with {}", added, contact);
        added
    }

    /// Messages exchanged with `contact`, oldest first
    pub fn conversation(&self, contact: &UserId) -> &[ChatMessage] {
        self.conversations
            .get(contact)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Contacts ordered by most recent activity
    pub fn contacts(&self) -> Vec<&UserId> {
        let mut contacts: Vec<(&UserId, Option<DateTime<Utc>>)> = self
            .conversations
            .iter()
            .map(|(contact, msgs)| (contact, msgs.last().map(|m| m.timestamp)))
            .collect();
        contacts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        contacts.into_iter().map(|(contact, _)| contact).collect()
    }

    pub fn unread(&self, contact: &UserId) -> usize {
        self.conversation(contact).iter().filter(|m| !m.read).count()
    }

    /// Contacts with unread messages and how many, most recent first
    pub fn unread_by_contact(&self) -> Vec<(&UserId, usize)> {
        self.contacts()
            .into_iter()
            .map(|contact| (contact, self.unread(contact)))
            .filter(|(_, unread)| *unread > 0)
            .collect()
    }

    /// Mark everything from `contact` as read
    pub fn mark_read(&mut self, contact: &UserId) {
        if let Some(conversation) = self.conversations.get_mut(contact) {
            for msg in conversation.iter_mut() {
                msg.read = true;
            }
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn push(&mut self, contact: UserId, msg: ChatMessage) -> &ChatMessage {
        let conversation = self.conversations.entry(contact).or_default();
        conversation.push(msg);
        &conversation[conversation.len() - 1]
    }

    fn convert_stored(&mut self, contact: &UserId, record: &StoredMessage) -> Option<ChatMessage> {
        let from = UserId::new(&record.from).ok()?;
        let to = UserId::new(&record.to).ok()?;
        let outgoing = from == self.local && &to == contact;
        if !outgoing && !(&from == contact && to == self.local) {
            return None;
        }

        Some(ChatMessage {
            id: self.allocate_id(),
            from,
            to,
            text: record.message.clone(),
            timestamp: DateTime::from_timestamp_millis(record.timestamp)?,
            outgoing,
            read: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    fn stored(id: i64, from: &str, to: &str, message: &str, timestamp: i64) -> StoredMessage {
        StoredMessage {
            id,
            from: from.into(),
            to: to.into(),
            message: message.into(),
            timestamp,
        }
    }

    #[test]
    fn test_record_and_read() {
        let mut history = ChatHistory::new(id("a@example.com"));
        let bob = id("b@example.com");

        assert!(history.record_outgoing(&bob, "hi").outgoing);
        let incoming = history.record_incoming(&bob, "hello");
        assert_eq!(incoming.from, bob);
        assert!(!incoming.read);

        let texts: Vec<&str> = history.conversation(&bob).iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["hi", "hello"]);
        assert_eq!(history.unread(&bob), 1);

        history.mark_read(&bob);
        assert_eq!(history.unread(&bob), 0);
        assert!(history.conversation(&id("c@example.com")).is_empty());
    }

    #[test]
    fn test_unread_by_contact() {
        let mut history = ChatHistory::new(id("a@example.com"));
        let bob = id("b@example.com");
        let carol = id("c@example.com");

        history.record_incoming(&bob, "one");
        history.record_incoming(&carol, "two");
        history.record_incoming(&carol, "three");
        history.record_outgoing(&id("d@example.com"), "sent");
        history.mark_read(&bob);

        assert_eq!(history.unread_by_contact(), vec![(&carol, 2)]);
    }

    #[test]
    fn test_ids_are_unique_across_conversations() {
        let mut history = ChatHistory::new(id("a@example.com"));
        let first = history.record_outgoing(&id("b@example.com"), "x").id;
        let second = history.record_outgoing(&id("c@example.com"), "y").id;
        assert_ne!(first, second);
    }

    #[test]
    fn test_contacts_by_recent_activity() {
        let mut history = ChatHistory::new(id("a@example.com"));
        history.backfill(
            &id("b@example.com"),
            &[stored(1, "b@example.com", "a@example.com", "old", 1_000)],
        );
        history.record_incoming(&id("c@example.com"), "new");

        assert_eq!(
            history.contacts(),
            vec![&id("c@example.com"), &id("b@example.com")]
        );
    }

    #[test]
    fn test_backfill_merges_in_order_and_skips_duplicates() {
        let mut history = ChatHistory::new(id("a@example.com"));
        let bob = id("b@example.com");
        history.record_outgoing(&bob, "live");

        let records = vec![
            stored(2, "b@example.com", "a@example.com", "second", 2_000),
            stored(1, "a@example.com", "b@example.com", "first", 1_000),
            stored(3, "a@example.com", "c@example.com", "not ours", 1_500),
        ];
        assert_eq!(history.backfill(&bob, &records), 2);
        assert_eq!(history.backfill(&bob, &records), 0);

        let conversation = history.conversation(&bob);
        let texts: Vec<&str> = conversation.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "live"]);
        assert!(conversation[0].outgoing);
        assert!(!conversation[1].outgoing);
    }
}
