use serde::{Deserialize, Serialize};

use crate::time::create_timestamp;

/// A single exchanged text. Immutable once created except for the `read`
/// flag, which the recipient-side mark-read operation flips false -> true.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    pub text: String,
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub read: bool,
}

impl Message {
    pub fn new(from: &str, to: &str, text: &str, timestamp: u64) -> Message {
        Message {
            id: generate_message_id(timestamp),
            from: from.to_string(),
            to: to.to_string(),
            text: text.to_string(),
            timestamp,
            read: false,
        }
    }
}

/// The persisted conversation between an unordered pair of participant
/// identities. A self-dialog carries the same identity twice. Participants
/// are stored lexicographically sorted so the pair is a stable record key.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Dialog {
    pub participants: [String; 2],
    pub messages: Vec<Message>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Dialog {
    /// An empty dialog for the sorted pair of `a` and `b`.
    pub fn new(a: &str, b: &str) -> Dialog {
        let (lo, hi) = sort_pair(a, b);
        let now = create_timestamp();
        Dialog {
            participants: [lo.to_string(), hi.to_string()],
            messages: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn involves(&self, address: &str) -> bool {
        self.participants.iter().any(|p| p == address)
    }

    /// The other side of the conversation from `address`'s point of view.
    /// For a self-dialog this is `address` itself.
    pub fn other_participant(&self, address: &str) -> &str {
        if self.participants[0] == address {
            &self.participants[1]
        } else {
            &self.participants[0]
        }
    }

    /// Most recent message by timestamp. Append order is not authoritative
    /// since frames can arrive out of order.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.iter().max_by_key(|m| m.timestamp)
    }

    pub fn unread_count(&self, address: &str) -> usize {
        self.messages
            .iter()
            .filter(|m| m.to == address && !m.read)
            .count()
    }

    /// Timestamp the dialog sorts by in a recency-ordered listing.
    pub fn last_activity(&self) -> u64 {
        self.last_message()
            .map(|m| m.timestamp)
            .unwrap_or(self.updated_at)
    }
}

/// A directory entry created the first time an address appears in any sent
/// or received message. Never removed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub address: String,
    pub added_at: u64,
    pub last_message_at: u64,
}

/// Identity comparison is exact, so plain lexicographic order is enough to
/// make the pair key deterministic.
pub fn sort_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Best-effort unique id: timestamp plus a random suffix. Ids are only ever
/// used inside a single append-only dialog log, never as a distributed
/// uniqueness guarantee.
pub fn generate_message_id(timestamp: u64) -> String {
    format!("{}-{}", timestamp, hex::encode(rand::random::<u32>().to_be_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_pair_is_symmetric() {
        assert_eq!(sort_pair("B", "A"), ("A", "B"));
        assert_eq!(sort_pair("A", "B"), ("A", "B"));
        assert_eq!(sort_pair("A", "A"), ("A", "A"));
    }

    #[test]
    fn self_dialog_keeps_both_participants() {
        let dialog = Dialog::new("A", "A");
        assert_eq!(dialog.participants, ["A".to_string(), "A".to_string()]);
        assert_eq!(dialog.other_participant("A"), "A");
    }

    #[test]
    fn last_message_ignores_append_order() {
        let mut dialog = Dialog::new("A", "B");
        dialog.messages.push(Message::new("A", "B", "late", 2000));
        dialog.messages.push(Message::new("A", "B", "early", 1000));
        assert_eq!(dialog.last_message().unwrap().text, "late");
    }

    #[test]
    fn unread_counts_only_the_recipient_side() {
        let mut dialog = Dialog::new("A", "B");
        dialog.messages.push(Message::new("A", "B", "hi", 1000));
        assert_eq!(dialog.unread_count("B"), 1);
        assert_eq!(dialog.unread_count("A"), 0);
    }
}
