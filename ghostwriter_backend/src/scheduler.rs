//! Decides when a conversation gets answered.
//!
//! Per conversation the scheduler is `Idle`, `Pending` (a timer is running and
//! inbound messages accumulate in a batch) or `Responding` (the batch has been
//! handed to the responder). The first message of a burst anchors the timer;
//! later messages only join the batch. Messages that arrive while a reply is
//! being produced are held and start a fresh cycle once it finishes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::conversation::{ConversationId, MessageId};
use crate::error::{preview, BackendResult};

/// Clamped Gaussian reply latency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReplyDelay {
    #[serde(default = "default_mean_secs")]
    pub mean_secs: f64,
    #[serde(default = "default_stddev_secs")]
    pub stddev_secs: f64,
    #[serde(default = "default_min_secs")]
    pub min_secs: f64,
    #[serde(default = "default_max_secs")]
    pub max_secs: f64,
}

fn default_mean_secs() -> f64 {
    300.0
}

fn default_stddev_secs() -> f64 {
    180.0
}

fn default_min_secs() -> f64 {
    30.0
}

fn default_max_secs() -> f64 {
    900.0
}

impl Default for ReplyDelay {
    fn default() -> Self {
        Self {
            mean_secs: default_mean_secs(),
            stddev_secs: default_stddev_secs(),
            min_secs: default_min_secs(),
            max_secs: default_max_secs(),
        }
    }
}

impl ReplyDelay {
    /// Always waits exactly `secs`.
    pub fn fixed(secs: f64) -> Self {
        Self {
            mean_secs: secs,
            stddev_secs: 0.0,
            min_secs: secs,
            max_secs: secs,
        }
    }

    pub fn sample(&self) -> Duration {
        self.sample_with(&mut rand::thread_rng())
    }

    pub fn sample_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let draw = match Normal::new(self.mean_secs, self.stddev_secs.abs()) {
            Ok(normal) => normal.sample(rng),
            Err(_) => self.mean_secs,
        };
        let secs = draw.max(self.min_secs).min(self.max_secs).max(0.0);
        Duration::from_secs_f64(secs)
    }
}

/// One inbound message waiting for a batched reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub content: String,
    pub received_at: DateTime<Utc>,
    pub source_message_id: MessageId,
}

/// Builds the single user turn a batch is answered with.
pub fn compose_batch(entries: &[PendingEntry]) -> Option<String> {
    match entries {
        [] => None,
        [single] => Some(single.content.clone()),
        many => Some(
            many.iter()
                .enumerate()
                .map(|(idx, entry)| format!("[Message {}]: {}", idx + 1, entry.content))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTrigger {
    /// A debounced batch of inbound messages.
    Batch,
    /// Answer the history as it stands, without extra user content.
    Immediate,
    /// Like `Immediate`, but typed at catch-up pace.
    CatchUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRequest {
    pub conversation_id: ConversationId,
    pub trigger: ReplyTrigger,
    pub composite: Option<String>,
    pub batch: Vec<PendingEntry>,
}

impl ReplyRequest {
    pub fn highest_source_id(&self) -> Option<MessageId> {
        self.batch.iter().map(|e| e.source_message_id).max()
    }
}

/// Produces and delivers the reply for a request.
#[async_trait]
pub trait BatchResponder: Send + Sync {
    async fn respond(&self, request: ReplyRequest) -> BackendResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Pending { queued: usize, fires_at: Instant },
    Responding { queued: usize },
}

enum Slot {
    Pending {
        batch: Vec<PendingEntry>,
        fires_at: Instant,
        timer: JoinHandle<()>,
    },
    Responding {
        queued: Vec<PendingEntry>,
    },
}

struct SchedulerInner {
    delay: ReplyDelay,
    responder: Arc<dyn BatchResponder>,
    slots: Mutex<HashMap<ConversationId, Slot>>,
}

#[derive(Clone)]
pub struct ResponseScheduler {
    inner: Arc<SchedulerInner>,
}

impl ResponseScheduler {
    pub fn new(delay: ReplyDelay, responder: Arc<dyn BatchResponder>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                delay,
                responder,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Queues an inbound message, starting the timer if the conversation is idle.
    pub fn submit(&self, conversation_id: ConversationId, entry: PendingEntry) -> SchedulerState {
        let mut slots = lock_slots(&self.inner.slots);
        match slots.get_mut(&conversation_id) {
            Some(Slot::Pending {
                batch, fires_at, ..
            }) => {
                batch.push(entry);
                SchedulerState::Pending {
                    queued: batch.len(),
                    fires_at: *fires_at,
                }
            }
            Some(Slot::Responding { queued }) => {
                queued.push(entry);
                SchedulerState::Responding {
                    queued: queued.len(),
                }
            }
            None => {
                let slot = start_pending(&self.inner, conversation_id, vec![entry]);
                let state = slot_state(&slot);
                slots.insert(conversation_id, slot);
                if let SchedulerState::Pending { fires_at, .. } = state {
                    tracing::info!(
                        "Conversation {}: reply scheduled in {:.0}s",
                        conversation_id,
                        fires_at.saturating_duration_since(Instant::now()).as_secs_f64()
                    );
                }
                state
            }
        }
    }

    /// Answers right away if nothing is in flight. Returns whether a reply was started.
    pub fn trigger_now(&self, conversation_id: ConversationId) -> bool {
        self.start_immediate(conversation_id, ReplyTrigger::Immediate)
    }

    /// `trigger_now` for replies owed from before startup.
    pub fn trigger_catch_up(&self, conversation_id: ConversationId) -> bool {
        self.start_immediate(conversation_id, ReplyTrigger::CatchUp)
    }

    fn start_immediate(&self, conversation_id: ConversationId, trigger: ReplyTrigger) -> bool {
        let mut slots = lock_slots(&self.inner.slots);
        if slots.contains_key(&conversation_id) {
            tracing::debug!(
                "Conversation {}: reply already in flight, immediate trigger skipped",
                conversation_id
            );
            return false;
        }
        slots.insert(conversation_id, Slot::Responding { queued: Vec::new() });
        drop(slots);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let request = ReplyRequest {
                conversation_id,
                trigger,
                composite: None,
                batch: Vec::new(),
            };
            run_responder(inner, request).await;
        });
        true
    }

    pub fn state(&self, conversation_id: ConversationId) -> SchedulerState {
        let slots = lock_slots(&self.inner.slots);
        slots
            .get(&conversation_id)
            .map(slot_state)
            .unwrap_or(SchedulerState::Idle)
    }

    pub fn is_busy(&self, conversation_id: ConversationId) -> bool {
        self.state(conversation_id) != SchedulerState::Idle
    }

    /// Conversations with a timer running or a reply in flight.
    pub fn active_conversations(&self) -> Vec<ConversationId> {
        let slots = lock_slots(&self.inner.slots);
        let mut ids: Vec<ConversationId> = slots.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Cancels the timer and hands back the messages it would have answered.
    /// Returns `None` while a reply is in flight, since its batch is no longer ours.
    pub fn try_take_pending(&self, conversation_id: ConversationId) -> Option<Vec<PendingEntry>> {
        let mut slots = lock_slots(&self.inner.slots);
        match slots.remove(&conversation_id) {
            None => Some(Vec::new()),
            Some(Slot::Pending { batch, timer, .. }) => {
                timer.abort();
                Some(batch)
            }
            Some(responding) => {
                slots.insert(conversation_id, responding);
                None
            }
        }
    }

    /// Waits out any reply in flight, then takes whatever is still unanswered.
    /// Afterwards the conversation is idle.
    pub async fn take_unanswered(&self, conversation_id: ConversationId) -> Vec<PendingEntry> {
        loop {
            if let Some(batch) = self.try_take_pending(conversation_id) {
                return batch;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Resolves once no conversation has a timer running or a reply in flight.
    pub async fn wait_idle(&self) {
        while !self.active_conversations().is_empty() {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

fn lock_slots(
    slots: &Mutex<HashMap<ConversationId, Slot>>,
) -> std::sync::MutexGuard<'_, HashMap<ConversationId, Slot>> {
    // Slot bookkeeping stays consistent even if a holder panicked.
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn slot_state(slot: &Slot) -> SchedulerState {
    match slot {
        Slot::Pending {
            batch, fires_at, ..
        } => SchedulerState::Pending {
            queued: batch.len(),
            fires_at: *fires_at,
        },
        Slot::Responding { queued } => SchedulerState::Responding {
            queued: queued.len(),
        },
    }
}

fn start_pending(
    inner: &Arc<SchedulerInner>,
    conversation_id: ConversationId,
    batch: Vec<PendingEntry>,
) -> Slot {
    let fires_at = Instant::now() + inner.delay.sample();
    let timer_inner = inner.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep_until(fires_at).await;
        fire(timer_inner, conversation_id).await;
    });
    Slot::Pending {
        batch,
        fires_at,
        timer,
    }
}

async fn fire(inner: Arc<SchedulerInner>, conversation_id: ConversationId) {
    let batch = {
        let mut slots = lock_slots(&inner.slots);
        match slots.remove(&conversation_id) {
            Some(Slot::Pending { batch, .. }) if batch.is_empty() => return,
            Some(Slot::Pending { batch, .. }) => {
                slots.insert(conversation_id, Slot::Responding { queued: Vec::new() });
                batch
            }
            Some(other) => {
                slots.insert(conversation_id, other);
                return;
            }
            None => return,
        }
    };

    let request = ReplyRequest {
        conversation_id,
        trigger: ReplyTrigger::Batch,
        composite: compose_batch(&batch),
        batch,
    };
    run_responder(inner, request).await;
}

async fn run_responder(inner: Arc<SchedulerInner>, request: ReplyRequest) {
    let _guard = CompletionGuard {
        inner: inner.clone(),
        conversation_id: request.conversation_id,
    };

    let conversation_id = request.conversation_id;
    let batch_len = request.batch.len();
    let prompt_preview = request
        .composite
        .as_deref()
        .map(|c| preview(c, 80))
        .unwrap_or_default();

    if let Err(e) = inner.responder.respond(request).await {
        tracing::error!(
            "Conversation {}: reply failed ({} message(s), prompt {:?}): {}",
            conversation_id,
            batch_len,
            prompt_preview,
            e
        );
    }
}

/// Leaves `Responding` when dropped, whether the responder returned, failed or panicked.
struct CompletionGuard {
    inner: Arc<SchedulerInner>,
    conversation_id: ConversationId,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let mut slots = lock_slots(&self.inner.slots);
        let queued = match slots.remove(&self.conversation_id) {
            Some(Slot::Responding { queued }) => queued,
            Some(other) => {
                slots.insert(self.conversation_id, other);
                return;
            }
            None => return,
        };

        if queued.is_empty() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!(
                "Conversation {}: runtime gone, dropping {} queued message(s)",
                self.conversation_id,
                queued.len()
            );
            return;
        }
        tracing::debug!(
            "Conversation {}: {} message(s) arrived mid-reply, starting a new cycle",
            self.conversation_id,
            queued.len()
        );
        let slot = start_pending(&self.inner, self.conversation_id, queued);
        slots.insert(self.conversation_id, slot);
    }
}
