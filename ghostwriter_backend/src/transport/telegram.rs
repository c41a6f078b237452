//! Telegram Bot API transport.
//!
//! `connect` spawns a long-polling tokio task that:
//! - Receives private messages via `getUpdates` and records them in a bounded
//!   per-chat transcript.
//! - Forwards each message to the current `listen()` subscriber, if any.
//!
//! The Bot API has no history endpoint, so `history` and `dialogs` are served
//! from the transcript this task (and `send`) accumulates.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{ChatKind, ChatSummary, IncomingMessage, SentMessage, TranscriptMessage, Transport};
use crate::conversation::{ConversationId, MessageId};
use crate::error::TransportError;

// Telegram enforces a 4096-character limit per message.
const MAX_MESSAGE_CHARS: usize = 4096;
const LONG_POLL_TIMEOUT_SECS: u64 = 30;
const BACKLOG_WAIT: Duration = Duration::from_secs(LONG_POLL_TIMEOUT_SECS + 15);

// ─── Telegram API types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Deserialize)]
struct TelegramMessage {
    message_id: i64,
    chat: TelegramChat,
    date: i64,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl TelegramChat {
    fn summary(&self) -> ChatSummary {
        let title = self
            .title
            .clone()
            .or_else(|| self.first_name.clone())
            .or_else(|| self.username.clone())
            .unwrap_or_else(|| self.id.to_string());
        ChatSummary {
            id: self.id,
            title,
            kind: ChatKind::from_api(&self.kind),
        }
    }
}

impl TelegramMessage {
    fn into_transcript(self, outgoing: bool) -> (ChatSummary, TranscriptMessage) {
        let summary = self.chat.summary();
        let date = unix_to_utc(self.date);
        let message = TranscriptMessage {
            id: self.message_id,
            chat_id: self.chat.id,
            outgoing,
            text: self.text,
            caption: self.caption,
            date,
        };
        (summary, message)
    }
}

// ─── Transcript ──────────────────────────────────────────────────────────────

struct ChatTranscript {
    summary: ChatSummary,
    messages: VecDeque<TranscriptMessage>,
}

/// Bounded, per-chat record of every message seen in either direction.
struct TranscriptLog {
    chats: HashMap<ConversationId, ChatTranscript>,
    capacity: usize,
}

impl TranscriptLog {
    fn new(capacity: usize) -> Self {
        Self {
            chats: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn record(&mut self, summary: ChatSummary, message: TranscriptMessage) {
        let capacity = self.capacity;
        let chat = self
            .chats
            .entry(summary.id)
            .or_insert_with(|| ChatTranscript {
                summary: summary.clone(),
                messages: VecDeque::new(),
            });
        chat.summary = summary;

        if chat.messages.iter().any(|m| m.id == message.id) {
            return;
        }
        // Keep ascending id order even if updates arrive out of order.
        let pos = chat
            .messages
            .iter()
            .rposition(|m| m.id < message.id)
            .map(|p| p + 1)
            .unwrap_or(0);
        chat.messages.insert(pos, message);
        while chat.messages.len() > capacity {
            chat.messages.pop_front();
        }
    }

    fn history(
        &self,
        chat_id: ConversationId,
        limit: usize,
        since_id: Option<MessageId>,
    ) -> Vec<TranscriptMessage> {
        let Some(chat) = self.chats.get(&chat_id) else {
            return Vec::new();
        };
        chat.messages
            .iter()
            .rev()
            .take_while(|m| since_id.map_or(true, |since| m.id > since))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Most recently active first.
    fn dialogs(&self) -> Vec<ChatSummary> {
        let mut chats: Vec<&ChatTranscript> = self.chats.values().collect();
        chats.sort_by_key(|c| std::cmp::Reverse(c.messages.back().map(|m| m.date)));
        chats.into_iter().map(|c| c.summary.clone()).collect()
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

struct Inner {
    api_base: String,
    client: reqwest::Client,
    transcript: Mutex<TranscriptLog>,
    subscriber: Mutex<Option<flume::Sender<IncomingMessage>>>,
    /// Flipped after the first successful `getUpdates`, i.e. once the offline backlog is in.
    backlog_ready: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct TelegramTransport {
    inner: Arc<Inner>,
}

impl TelegramTransport {
    /// Builds the transport without starting the update pump.
    pub fn new(
        api_url: &str,
        token: &str,
        client: reqwest::Client,
        transcript_capacity: usize,
    ) -> Self {
        let api_base = format!("{}/bot{}", api_url.trim_end_matches('/'), token);
        Self {
            inner: Arc::new(Inner {
                api_base,
                client,
                transcript: Mutex::new(TranscriptLog::new(transcript_capacity)),
                subscriber: Mutex::new(None),
                backlog_ready: watch::channel(false).0,
            }),
        }
    }

    /// Builds the transport and spawns the long-polling task.
    pub fn connect(
        api_url: &str,
        token: &str,
        client: reqwest::Client,
        transcript_capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let transport = Self::new(api_url, token, client, transcript_capacity);
        let pump = transport.clone();
        let handle = tokio::spawn(async move {
            tracing::info!("Telegram update pump active");
            pump.run_updates().await;
        });
        (transport, handle)
    }

    fn record(&self, summary: ChatSummary, message: TranscriptMessage) {
        if let Ok(mut log) = self.inner.transcript.lock() {
            log.record(summary, message);
        }
    }

    fn forward(&self, incoming: IncomingMessage) {
        let Ok(mut subscriber) = self.inner.subscriber.lock() else {
            return;
        };
        if let Some(tx) = subscriber.as_ref() {
            if tx.send(incoming).is_err() {
                tracing::debug!("Telegram: listener dropped, no longer forwarding updates");
                *subscriber = None;
            }
        }
    }

    async fn run_updates(&self) {
        let mut offset: i64 = 0;
        loop {
            let updates = match self.poll_updates(offset).await {
                Some(u) => u,
                None => continue,
            };
            let first_round = !*self.inner.backlog_ready.borrow();

            for update in updates {
                offset = update.update_id + 1;

                let Some(msg) = update.message else {
                    continue;
                };
                let (chat, message) = msg.into_transcript(false);
                tracing::debug!(
                    "Telegram [chat {}]: message {} received",
                    chat.id,
                    message.id
                );
                self.record(chat.clone(), message.clone());
                self.forward(IncomingMessage { chat, message });
            }

            if first_round {
                self.inner.backlog_ready.send_replace(true);
            }
        }
    }

    async fn poll_updates(&self, offset: i64) -> Option<Vec<Update>> {
        let url = format!("{}/getUpdates", self.inner.api_base);
        let params = serde_json::json!({
            "offset": offset,
            "timeout": LONG_POLL_TIMEOUT_SECS,
            "allowed_updates": ["message"]
        });

        let resp = match self.inner.client.post(&url).json(&params).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Telegram getUpdates error: {}", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
                return None;
            }
        };

        let body: TelegramResponse<Vec<Update>> = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("Telegram getUpdates parse error: {}", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
                return None;
            }
        };

        if !body.ok {
            tracing::warn!(
                "Telegram API returned ok=false: {}",
                body.description.unwrap_or_default()
            );
            tokio::time::sleep(Duration::from_secs(10)).await;
            return None;
        }

        Some(body.result.unwrap_or_default())
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn ready(&self) {
        let mut rx = self.inner.backlog_ready.subscribe();
        let wait = tokio::time::timeout(BACKLOG_WAIT, rx.wait_for(|ready| *ready));
        if wait.await.is_err() {
            tracing::warn!(
                "Telegram: no getUpdates round completed within {}s, continuing without backlog",
                BACKLOG_WAIT.as_secs()
            );
        }
    }

    async fn listen(&self) -> Result<flume::Receiver<IncomingMessage>, TransportError> {
        let (tx, rx) = flume::unbounded();
        let mut subscriber = self
            .inner
            .subscriber
            .lock()
            .map_err(|_| TransportError::Api("subscriber lock poisoned".to_string()))?;
        *subscriber = Some(tx);
        Ok(rx)
    }

    async fn history(
        &self,
        chat_id: ConversationId,
        limit: usize,
        since_id: Option<MessageId>,
    ) -> Result<Vec<TranscriptMessage>, TransportError> {
        let log = self
            .inner
            .transcript
            .lock()
            .map_err(|_| TransportError::Api("transcript lock poisoned".to_string()))?;
        Ok(log.history(chat_id, limit, since_id))
    }

    async fn dialogs(&self) -> Result<Vec<ChatSummary>, TransportError> {
        let log = self
            .inner
            .transcript
            .lock()
            .map_err(|_| TransportError::Api("transcript lock poisoned".to_string()))?;
        Ok(log.dialogs())
    }

    async fn send(&self, chat_id: ConversationId, text: &str) -> Result<SentMessage, TransportError> {
        let text = truncate_chars(text, MAX_MESSAGE_CHARS);

        let url = format!("{}/sendMessage", self.inner.api_base);
        let payload = serde_json::json!({ "chat_id": chat_id, "text": text });

        let resp = self
            .inner
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = resp.status();
        let body: TelegramResponse<TelegramMessage> = resp
            .json()
            .await
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;

        if !status.is_success() || !body.ok {
            return Err(TransportError::Api(format!(
                "sendMessage failed: HTTP {} {}",
                status,
                body.description.unwrap_or_default()
            )));
        }

        let sent = body.result.ok_or_else(|| {
            TransportError::MalformedResponse("sendMessage returned no message".to_string())
        })?;
        let (chat, message) = sent.into_transcript(true);
        let receipt = SentMessage {
            id: message.id,
            chat_id: message.chat_id,
            date: message.date,
            text: message.text.clone().unwrap_or_else(|| text.to_string()),
        };
        self.record(chat, message);

        tracing::debug!("Telegram: sent message {} to chat {}", receipt.id, chat_id);
        Ok(receipt)
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

fn unix_to_utc(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).single().unwrap_or_else(Utc::now)
}
