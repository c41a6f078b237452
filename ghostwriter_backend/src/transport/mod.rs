//! Messaging transport seam.
//!
//! The engine only needs four capabilities from a messaging service: a live
//! stream of new messages, newest-first history reads, the dialog list, and
//! sending text. `telegram` provides the Bot API implementation.

pub mod telegram;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::conversation::{ConversationId, MessageId};
use crate::error::TransportError;

pub use telegram::TelegramTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
    /// A chat type this client does not know. Never answered.
    Other,
}

impl ChatKind {
    pub fn from_api(raw: &str) -> Self {
        match raw {
            "private" => ChatKind::Private,
            "group" => ChatKind::Group,
            "supergroup" => ChatKind::Supergroup,
            "channel" => ChatKind::Channel,
            _ => ChatKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSummary {
    pub id: ConversationId,
    pub title: String,
    pub kind: ChatKind,
}

/// One message of the external transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptMessage {
    pub id: MessageId,
    pub chat_id: ConversationId,
    /// Sent from the attached account rather than received by it.
    pub outgoing: bool,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub date: DateTime<Utc>,
}

impl TranscriptMessage {
    /// Text body, falling back to a media caption. Empty strings count as absent.
    pub fn body(&self) -> Option<&str> {
        self.text
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| self.caption.as_deref().filter(|c| !c.is_empty()))
    }
}

/// A message delivered by the live stream, with the chat it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub chat: ChatSummary,
    pub message: TranscriptMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub id: MessageId,
    pub chat_id: ConversationId,
    pub date: DateTime<Utc>,
    /// What the chat actually shows, which can be shorter than what was asked for.
    pub text: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolves once messages that arrived while offline are visible through
    /// `history` and `dialogs`.
    async fn ready(&self) {}

    /// Starts (or joins) the live message stream.
    async fn listen(&self) -> Result<flume::Receiver<IncomingMessage>, TransportError>;

    /// Newest-first history of a chat, stopping at `since_id` (exclusive) when given.
    async fn history(
        &self,
        chat_id: ConversationId,
        limit: usize,
        since_id: Option<MessageId>,
    ) -> Result<Vec<TranscriptMessage>, TransportError>;

    async fn dialogs(&self) -> Result<Vec<ChatSummary>, TransportError>;

    async fn send(&self, chat_id: ConversationId, text: &str) -> Result<SentMessage, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: Option<&str>, caption: Option<&str>) -> TranscriptMessage {
        TranscriptMessage {
            id: 1,
            chat_id: 1,
            outgoing: false,
            text: text.map(str::to_string),
            caption: caption.map(str::to_string),
            date: Utc::now(),
        }
    }

    #[test]
    fn body_prefers_text_then_caption() {
        assert_eq!(message(Some("hi"), Some("cap")).body(), Some("hi"));
        assert_eq!(message(None, Some("cap")).body(), Some("cap"));
        assert_eq!(message(Some(""), Some("cap")).body(), Some("cap"));
        assert_eq!(message(None, None).body(), None);
    }

    #[test]
    fn chat_kind_parses_api_names() {
        assert_eq!(ChatKind::from_api("private"), ChatKind::Private);
        assert_eq!(ChatKind::from_api("supergroup"), ChatKind::Supergroup);
        assert_eq!(ChatKind::from_api("channel"), ChatKind::Channel);
        assert_eq!(ChatKind::from_api("sender"), ChatKind::Other);
        assert_eq!(ChatKind::from_api(""), ChatKind::Other);
    }
}
