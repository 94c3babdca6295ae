use parking_lot::RwLock;

use crate::protocol::ChatMessage;

/// Ordered, append-only log of chat messages for one booking session.
///
/// Insertion order is arrival order. The relay delivers at-least-once and
/// unordered across participants; no deduplication or reordering happens
/// here, and the relay's replay of persisted history on connect is appended
/// like any other arrival.
pub struct ChatSession {
    log: RwLock<Vec<ChatMessage>>,
}

impl ChatSession {
    pub fn new() -> Self {
        Self {
            log: RwLock::new(Vec::new()),
        }
    }

    pub fn append(&self, message: ChatMessage) {
        tracing::debug!(
            target: "session",
            sender = %message.sender_id,
            "chat message appended"
        );
        self.log.write().push(message);
    }

    /// Current ordered sequence, for display. Read-only.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.log.read().clone()
    }

    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.read().is_empty()
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn message(text: &str) -> ChatMessage {
        ChatMessage {
            text: text.into(),
            sender_id: "a".into(),
            sender_name: "A".into(),
            timestamp: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn append_preserves_arrival_order() {
        let chat = ChatSession::new();
        chat.append(message("one"));
        chat.append(message("two"));
        chat.append(message("one"));

        let log = chat.snapshot();
        let texts: Vec<_> = log.iter().map(|m| m.text.as_str()).collect();
        // Duplicates are kept: delivery is at-least-once.
        assert_eq!(texts, ["one", "two", "one"]);
    }

    #[test]
    fn snapshot_does_not_expose_mutation() {
        let chat = ChatSession::new();
        chat.append(message("only"));
        let mut snap = chat.snapshot();
        snap.clear();
        assert_eq!(chat.len(), 1);
    }
}
