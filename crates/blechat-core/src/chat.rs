//! Append-only chat history

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    FromLocal,
    FromPeer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub text: String,
    pub direction: Direction,
    pub timestamp: Timestamp,
}

impl ChatMessage {
    pub fn new(text: impl Into<String>, direction: Direction) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            direction,
            timestamp: Timestamp::now(),
        }
    }
}

/// Messages in the order they were sent or received
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: impl Into<String>, direction: Direction) -> &ChatMessage {
        let index = self.messages.len();
        self.messages.push(ChatMessage::new(text, direction));
        &self.messages[index]
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_preserves_order() {
        let mut log = ChatLog::new();
        log.push("hi", Direction::FromLocal);
        log.push("hello", Direction::FromPeer);

        let texts: Vec<_> = log.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["hi", "hello"]);
        assert_eq!(log.messages()[1].direction, Direction::FromPeer);
        assert_ne!(log.messages()[0].id, log.messages()[1].id);
    }
}
