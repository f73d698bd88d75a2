// Conversation history for multi-turn interactions

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Bounded history: oldest messages go first when either limit is exceeded
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    messages: Vec<Message>,
    max_messages: usize,
    max_chars: usize,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::with_limits(20, 32_000)
    }

    pub fn with_limits(max_messages: usize, max_chars: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_messages,
            max_chars,
        }
    }

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
        self.trim_if_needed();
    }

    pub fn add_assistant_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
        self.trim_if_needed();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Rough estimate: 1 token ≈ 4 characters
    pub fn estimated_tokens(&self) -> usize {
        self.total_chars() / 4
    }

    fn total_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }

    fn trim_if_needed(&mut self) {
        if self.messages.len() > self.max_messages {
            let remove_count = self.messages.len() - self.max_messages;
            self.messages.drain(0..remove_count);
        }

        let mut total = self.total_chars();
        let mut remove_count = 0;
        while total > self.max_chars && remove_count < self.messages.len() {
            total -= self.messages[remove_count].content.len();
            remove_count += 1;
        }
        self.messages.drain(0..remove_count);
    }
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new()
    }
}
