pub mod manager;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use manager::{ConversationDefaults, ConversationManager, DraftReply, ResponseMode};
pub use store::ConversationStore;

/// External chat identity. One conversation per chat.
pub type ConversationId = i64;

/// Transport-assigned message id, increasing within a chat.
pub type MessageId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Persisted state of one conversation.
///
/// `turns` is the full on-disk sequence, system turn first. Loaded records may
/// come from older writers, so `model` and `system_prompt` are optional and
/// the leading system turn is not guaranteed until a manager normalizes it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub conversation_id: ConversationId,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub turns: Vec<Turn>,
    pub saved_at: DateTime<Utc>,
}

/// High-water mark of transcript messages already folded into the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCursor {
    pub conversation_id: ConversationId,
    pub last_synced_message_id: MessageId,
}

impl SyncCursor {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            last_synced_message_id: 0,
        }
    }

    /// Moves the cursor forward. Never moves it back; returns whether it moved.
    pub fn advance(&mut self, message_id: MessageId) -> bool {
        if message_id > self.last_synced_message_id {
            self.last_synced_message_id = message_id;
            true
        } else {
            false
        }
    }

    pub fn covers(&self, message_id: MessageId) -> bool {
        message_id <= self.last_synced_message_id
    }
}
