//! In-memory provider and transport used by the unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::conversation::{ConversationId, MessageId, Turn};
use crate::error::{ProviderError, TransportError};
use crate::llm_client::CompletionProvider;
use crate::transport::{ChatKind, ChatSummary, IncomingMessage, SentMessage, TranscriptMessage, Transport};

pub(crate) struct StubProvider {
    reply: Option<String>,
    fail_when_contains: Option<String>,
    calls: Mutex<Vec<Vec<Turn>>>,
}

impl StubProvider {
    pub(crate) fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
            fail_when_contains: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            fail_when_contains: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Fails whenever any turn contains `needle`, replies with `reply` otherwise.
    pub(crate) fn failing_for(needle: &str, reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
            fail_when_contains: Some(needle.to_string()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> Vec<Vec<Turn>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for StubProvider {
    async fn complete(&self, _model: &str, messages: &[Turn]) -> Result<String, ProviderError> {
        self.calls.lock().unwrap().push(messages.to_vec());

        let poisoned = self
            .fail_when_contains
            .as_deref()
            .is_some_and(|needle| messages.iter().any(|t| t.content.contains(needle)));
        match (&self.reply, poisoned) {
            (Some(reply), false) => Ok(reply.clone()),
            _ => Err(ProviderError::Status {
                status: 500,
                body: "stub failure".to_string(),
            }),
        }
    }
}

#[derive(Default)]
struct StubState {
    chats: Vec<ChatSummary>,
    transcripts: HashMap<ConversationId, Vec<TranscriptMessage>>,
    sent: Vec<(ConversationId, String)>,
    next_id: MessageId,
    fail_sends: bool,
    max_send_chars: Option<usize>,
    subscriber: Option<flume::Sender<IncomingMessage>>,
}

/// Transport over in-memory transcripts. Sent messages are appended to the
/// transcript as outgoing, the way a real service would show them.
#[derive(Clone, Default)]
pub(crate) struct StubTransport {
    state: Arc<Mutex<StubState>>,
}

impl StubTransport {
    pub(crate) fn new() -> Self {
        let transport = Self::default();
        transport.state.lock().unwrap().next_id = 1000;
        transport
    }

    pub(crate) fn add_chat(&self, id: ConversationId, kind: ChatKind) {
        let mut state = self.state.lock().unwrap();
        state.chats.push(ChatSummary {
            id,
            title: format!("chat {}", id),
            kind,
        });
        state.transcripts.entry(id).or_default();
    }

    /// Adds a message to the transcript without delivering it live.
    pub(crate) fn seed(&self, chat_id: ConversationId, id: MessageId, outgoing: bool, text: &str) -> TranscriptMessage {
        self.seed_at(chat_id, id, outgoing, text, Utc::now())
    }

    pub(crate) fn seed_at(
        &self,
        chat_id: ConversationId,
        id: MessageId,
        outgoing: bool,
        text: &str,
        date: DateTime<Utc>,
    ) -> TranscriptMessage {
        let message = TranscriptMessage {
            id,
            chat_id,
            outgoing,
            text: Some(text.to_string()),
            caption: None,
            date,
        };
        let mut state = self.state.lock().unwrap();
        state.next_id = state.next_id.max(id + 1);
        state
            .transcripts
            .entry(chat_id)
            .or_default()
            .push(message.clone());
        message
    }

    /// Adds a message to the transcript and delivers it to the live stream.
    pub(crate) fn push_incoming(&self, chat_id: ConversationId, id: MessageId, outgoing: bool, text: &str) {
        let message = self.seed(chat_id, id, outgoing, text);
        let state = self.state.lock().unwrap();
        let chat = state
            .chats
            .iter()
            .find(|c| c.id == chat_id)
            .cloned()
            .unwrap_or(ChatSummary {
                id: chat_id,
                title: format!("chat {}", chat_id),
                kind: ChatKind::Private,
            });
        if let Some(tx) = &state.subscriber {
            let _ = tx.send(IncomingMessage { chat, message });
        }
    }

    pub(crate) fn fail_sends(&self, fail: bool) {
        self.state.lock().unwrap().fail_sends = fail;
    }

    /// Cuts sent text at `max_chars`, like a service with a message size limit.
    pub(crate) fn limit_sends(&self, max_chars: usize) {
        self.state.lock().unwrap().max_send_chars = Some(max_chars);
    }

    pub(crate) fn sent(&self) -> Vec<(ConversationId, String)> {
        self.state.lock().unwrap().sent.clone()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn listen(&self) -> Result<flume::Receiver<IncomingMessage>, TransportError> {
        let (tx, rx) = flume::unbounded();
        self.state.lock().unwrap().subscriber = Some(tx);
        Ok(rx)
    }

    async fn history(
        &self,
        chat_id: ConversationId,
        limit: usize,
        since_id: Option<MessageId>,
    ) -> Result<Vec<TranscriptMessage>, TransportError> {
        let state = self.state.lock().unwrap();
        let mut messages = state.transcripts.get(&chat_id).cloned().unwrap_or_default();
        messages.sort_by_key(|m| std::cmp::Reverse(m.id));
        Ok(messages
            .into_iter()
            .take_while(|m| since_id.map_or(true, |since| m.id > since))
            .take(limit)
            .collect())
    }

    async fn dialogs(&self) -> Result<Vec<ChatSummary>, TransportError> {
        Ok(self.state.lock().unwrap().chats.clone())
    }

    async fn send(&self, chat_id: ConversationId, text: &str) -> Result<SentMessage, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sends {
            return Err(TransportError::Network("stub send failure".to_string()));
        }
        let text: String = match state.max_send_chars {
            Some(max) => text.chars().take(max).collect(),
            None => text.to_string(),
        };
        let id = state.next_id;
        state.next_id += 1;
        let date = Utc::now();
        state.sent.push((chat_id, text.clone()));
        state.transcripts.entry(chat_id).or_default().push(TranscriptMessage {
            id,
            chat_id,
            outgoing: true,
            text: Some(text.clone()),
            caption: None,
            date,
        });
        Ok(SentMessage {
            id,
            chat_id,
            date,
            text,
        })
    }
}
