//! Wires transport, reconciler, scheduler and conversations together.
//!
//! Two drivers share the same pieces:
//! - listen: each live message is attributed; user content is batched by the
//!   scheduler, the owner's own messages and resets settle any unanswered
//!   batch and are then applied directly.
//! - poll: every interval each eligible dialog is reconciled from history and
//!   answered right away when its newest turn is from the user.
//!
//! Both start with an optional catch-up pass over recent history.

pub mod pipeline;
pub mod registry;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;

use crate::config::{AgentConfig, CatchUpConfig, Driver};
use crate::conversation::{ConversationId, Role};
use crate::error::{preview, BackendResult, TransportError};
use crate::reconcile::{
    Attribution, HistoryReconciler, ReconcileOptions, ReconcileOutcome, SyncMode,
};
use crate::scheduler::{compose_batch, PendingEntry, ReplyDelay, ResponseScheduler};
use crate::transport::{ChatKind, ChatSummary, IncomingMessage, Transport};
use crate::typing::TypingProfile;

pub use pipeline::ReplyPipeline;
pub use registry::{Conversation, ConversationRegistry};

const WORKER_IDLE: Duration = Duration::from_secs(600);

type WorkerMap = HashMap<ConversationId, flume::Sender<IncomingMessage>>;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub driver: Driver,
    pub ignored_chats: HashSet<ConversationId>,
    pub poll_interval: Duration,
    pub dialogs_limit: usize,
    pub history_fetch_limit: usize,
    pub reply_delay: ReplyDelay,
    pub typing: TypingProfile,
    pub catch_up: CatchUpConfig,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            driver: config.driver,
            ignored_chats: config.ignored_chat_ids(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            dialogs_limit: config.dialogs_limit,
            history_fetch_limit: config.history_fetch_limit,
            reply_delay: config.reply_delay,
            typing: config.typing,
            catch_up: config.catch_up.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    pub conversations: usize,
    pub turns_imported: usize,
    pub replies_started: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub checked: usize,
    pub skipped_busy: usize,
    pub replies_started: usize,
    pub failures: usize,
}

pub struct Orchestrator {
    registry: Arc<ConversationRegistry>,
    transport: Arc<dyn Transport>,
    reconciler: HistoryReconciler,
    scheduler: ResponseScheduler,
    settings: OrchestratorSettings,
    workers: Mutex<WorkerMap>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ConversationRegistry>,
        transport: Arc<dyn Transport>,
        reconciler: HistoryReconciler,
        settings: OrchestratorSettings,
    ) -> Arc<Self> {
        let pipeline = ReplyPipeline::new(registry.clone(), transport.clone(), settings.typing);
        let scheduler = ResponseScheduler::new(settings.reply_delay, Arc::new(pipeline));
        Arc::new(Self {
            registry,
            transport,
            reconciler,
            scheduler,
            settings,
            workers: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<ConversationRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &ResponseScheduler {
        &self.scheduler
    }

    /// Private chats that are not on the ignore list.
    pub fn is_eligible(&self, chat: &ChatSummary) -> bool {
        chat.kind == ChatKind::Private && !self.settings.ignored_chats.contains(&chat.id)
    }

    /// Runs the configured driver until `shutdown` resolves.
    pub async fn run_until<F>(self: &Arc<Self>, shutdown: F) -> BackendResult<()>
    where
        F: Future<Output = ()>,
    {
        let driver = async {
            match self.settings.driver {
                Driver::Listen => self.run_listener().await,
                Driver::Poll => self.run_poll_loop().await,
            }
        };

        tokio::select! {
            result = driver => result,
            _ = shutdown => {
                let active = self.scheduler.active_conversations();
                if !active.is_empty() {
                    tracing::warn!(
                        "Shutting down with replies pending for {:?}; they will be recovered from history",
                        active
                    );
                }
                Ok(())
            }
        }
    }

    /// Push driver. Subscribes first so nothing that arrives during catch-up is lost.
    pub async fn run_listener(self: &Arc<Self>) -> BackendResult<()> {
        let rx = self.transport.listen().await?;
        tracing::info!("Listening for new messages");

        if self.settings.catch_up.enabled {
            self.catch_up().await;
        }

        while let Ok(incoming) = rx.recv_async().await {
            self.dispatch(incoming);
        }

        tracing::warn!("Message stream ended");
        Err(TransportError::Closed.into())
    }

    /// Hands a live message to its conversation's worker, keeping per-chat order.
    fn dispatch(self: &Arc<Self>, incoming: IncomingMessage) {
        if !self.is_eligible(&incoming.chat) {
            tracing::debug!(
                "Ignoring message {} from chat {} ({:?})",
                incoming.message.id,
                incoming.chat.id,
                incoming.chat.kind
            );
            return;
        }

        let chat_id = incoming.chat.id;
        let mut workers = lock_workers(&self.workers);
        let incoming = match workers.get(&chat_id) {
            Some(tx) => match tx.send(incoming) {
                Ok(()) => return,
                Err(flume::SendError(incoming)) => incoming,
            },
            None => incoming,
        };

        let (tx, rx) = flume::unbounded::<IncomingMessage>();
        let _ = tx.send(incoming);
        workers.insert(chat_id, tx.clone());
        drop(workers);

        let this = self.clone();
        tokio::spawn(async move {
            this.run_worker(chat_id, tx, rx).await;
        });
    }

    /// Drains one chat's messages in order. Leaves after `WORKER_IDLE` without
    /// traffic; the next message for the chat starts a new worker.
    async fn run_worker(
        &self,
        chat_id: ConversationId,
        tx: flume::Sender<IncomingMessage>,
        rx: flume::Receiver<IncomingMessage>,
    ) {
        loop {
            let incoming = match tokio::time::timeout(WORKER_IDLE, rx.recv_async()).await {
                Ok(Ok(incoming)) => incoming,
                Ok(Err(_)) => break,
                Err(_) => {
                    // dispatch sends under this lock, so nothing slips in after the check
                    let mut workers = lock_workers(&self.workers);
                    if !rx.is_empty() {
                        continue;
                    }
                    if workers.get(&chat_id).is_some_and(|t| t.same_channel(&tx)) {
                        workers.remove(&chat_id);
                    }
                    tracing::debug!("Conversation {}: worker idle, stopping", chat_id);
                    break;
                }
            };

            let message_id = incoming.message.id;
            if let Err(e) = self.handle_incoming(incoming).await {
                tracing::error!(
                    "Conversation {}: failed to handle message {}: {}",
                    chat_id,
                    message_id,
                    e
                );
            }
        }
    }

    /// Chats that currently have a live worker.
    pub fn active_workers(&self) -> usize {
        lock_workers(&self.workers).len()
    }

    /// Applies one live message to its conversation.
    ///
    /// The owner's own messages and resets settle the conversation first: a
    /// reply in flight is allowed to finish, and a batch still waiting for its
    /// timer is taken over, so turns keep arrival order.
    pub async fn handle_incoming(&self, incoming: IncomingMessage) -> BackendResult<()> {
        let IncomingMessage { chat, message } = incoming;
        let attribution = self.reconciler.attribute(&message);
        if attribution == Attribution::Skip {
            return Ok(());
        }

        let conversation = self.registry.get_or_open(chat.id).await?;
        if !conversation.lock().await.claim(message.id) {
            tracing::debug!(
                "Conversation {}: message {} already handled",
                chat.id,
                message.id
            );
            return Ok(());
        }

        if let Attribution::Turn(turn) = &attribution {
            if turn.role == Role::User {
                tracing::info!(
                    "Conversation {}: received {:?}",
                    chat.id,
                    preview(&turn.content, 60)
                );
                self.scheduler.submit(
                    chat.id,
                    PendingEntry {
                        content: turn.content.clone(),
                        received_at: message.date,
                        source_message_id: message.id,
                    },
                );
                return Ok(());
            }
        }

        let unanswered = self.scheduler.take_unanswered(chat.id).await;
        let mut conv = conversation.lock().await;
        match attribution {
            Attribution::Turn(turn) => {
                if let Some(batch) = compose_batch(&unanswered) {
                    tracing::info!(
                        "Conversation {}: answered {} pending message(s) by hand",
                        chat.id,
                        unanswered.len()
                    );
                    conv.manager.append_user(batch);
                }
                conv.manager.append(turn.role, turn.content);
            }
            Attribution::Reset => {
                if !unanswered.is_empty() {
                    tracing::info!(
                        "Conversation {}: reset drops {} unanswered message(s)",
                        chat.id,
                        unanswered.len()
                    );
                }
                conv.manager.reset_to_system_prompt();
                tracing::info!("Conversation {}: history reset", chat.id);
            }
            Attribution::Skip => return Ok(()),
        }
        conv.cursor.advance(message.id);
        conv.persist()?;
        Ok(())
    }

    /// Reconciles one conversation from transport history and persists the result.
    pub async fn sync_conversation(
        &self,
        conversation_id: ConversationId,
        mode: SyncMode,
        limit: usize,
        not_before: Option<DateTime<Utc>>,
    ) -> BackendResult<ReconcileOutcome> {
        let conversation = self.registry.get_or_open(conversation_id).await?;
        let mut guard = conversation.lock().await;
        let conv: &mut Conversation = &mut guard;

        let since = match mode {
            SyncMode::Incremental => Some(conv.cursor.last_synced_message_id).filter(|id| *id > 0),
            SyncMode::Full => None,
        };
        let mut messages = self.transport.history(conversation_id, limit, since).await?;
        messages.reverse();

        if mode == SyncMode::Full && messages.is_empty() {
            tracing::warn!(
                "Conversation {}: transport returned no history, keeping stored turns",
                conversation_id
            );
            let cursor = conv.cursor.last_synced_message_id;
            return Ok(ReconcileOutcome {
                previous_cursor: cursor,
                cursor,
                turns_added: 0,
                reset: false,
                needs_reply: false,
                newest_at: None,
            });
        }

        let outcome = conv.reconcile(
            &self.reconciler,
            &messages,
            ReconcileOptions {
                mode,
                not_before,
                ..Default::default()
            },
        );

        if outcome.changed() || mode == SyncMode::Full {
            conv.persist()?;
            tracing::debug!(
                "Conversation {}: synced {} turn(s), cursor {} -> {}",
                conversation_id,
                outcome.turns_added,
                outcome.previous_cursor,
                outcome.cursor
            );
        }
        Ok(outcome)
    }

    /// Replaces a conversation's history with the transport's current window.
    pub async fn resync(&self, conversation_id: ConversationId) -> BackendResult<ReconcileOutcome> {
        self.transport.ready().await;
        let outcome = self
            .sync_conversation(
                conversation_id,
                SyncMode::Full,
                self.settings.history_fetch_limit,
                None,
            )
            .await?;
        tracing::info!(
            "Conversation {}: full resync rebuilt {} turn(s)",
            conversation_id,
            outcome.turns_added
        );
        Ok(outcome)
    }

    async fn eligible_dialogs(&self) -> Result<Vec<ChatSummary>, TransportError> {
        let dialogs = self.transport.dialogs().await?;
        Ok(dialogs
            .into_iter()
            .filter(|chat| self.is_eligible(chat))
            .take(self.settings.dialogs_limit)
            .collect())
    }

    /// Imports what happened while we were away and answers recent unanswered chats.
    pub async fn catch_up(&self) -> CatchUpReport {
        self.transport.ready().await;
        let dialogs = match self.eligible_dialogs().await {
            Ok(dialogs) => dialogs,
            Err(e) => {
                tracing::error!("Catch-up: failed to list dialogs: {}", e);
                return CatchUpReport {
                    failures: 1,
                    ..Default::default()
                };
            }
        };

        let cutoff =
            Utc::now() - chrono::Duration::hours(self.settings.catch_up.max_age_hours as i64);
        let max_messages = self.settings.catch_up.max_messages;

        let results = join_all(dialogs.iter().map(|chat| async move {
            let outcome = self
                .sync_conversation(chat.id, SyncMode::Incremental, max_messages, Some(cutoff))
                .await;
            (chat.id, outcome)
        }))
        .await;

        let mut report = CatchUpReport::default();
        for (conversation_id, outcome) in results {
            report.conversations += 1;
            match outcome {
                Ok(outcome) => {
                    report.turns_imported += outcome.turns_added;
                    let recent = outcome.newest_at.is_some_and(|at| at >= cutoff);
                    if outcome.needs_reply
                        && recent
                        && self.scheduler.trigger_catch_up(conversation_id)
                    {
                        report.replies_started += 1;
                    }
                }
                Err(e) => {
                    report.failures += 1;
                    tracing::error!("Catch-up: conversation {} failed: {}", conversation_id, e);
                }
            }
        }

        tracing::info!(
            "Catch-up done: {} conversation(s), {} turn(s) imported, {} repl(ies) started",
            report.conversations,
            report.turns_imported,
            report.replies_started
        );
        report
    }

    /// Catch-up followed by waiting for the replies it started.
    pub async fn catch_up_and_drain(&self) -> CatchUpReport {
        let report = self.catch_up().await;
        self.scheduler.wait_idle().await;
        report
    }

    /// One poll cycle over every eligible dialog.
    pub async fn poll_once(&self) -> PollReport {
        let dialogs = match self.eligible_dialogs().await {
            Ok(dialogs) => dialogs,
            Err(e) => {
                tracing::warn!("Poll: failed to list dialogs: {}", e);
                return PollReport {
                    failures: 1,
                    ..Default::default()
                };
            }
        };

        let mut report = PollReport::default();
        let mut due = Vec::new();
        for chat in &dialogs {
            if self.scheduler.is_busy(chat.id) {
                report.skipped_busy += 1;
            } else {
                due.push(chat.id);
            }
        }

        let limit = self.settings.history_fetch_limit;
        let results = join_all(due.iter().map(|&conversation_id| async move {
            let outcome = self
                .sync_conversation(conversation_id, SyncMode::Incremental, limit, None)
                .await;
            (conversation_id, outcome)
        }))
        .await;

        for (conversation_id, outcome) in results {
            report.checked += 1;
            match outcome {
                Ok(outcome) if outcome.needs_reply => {
                    if self.scheduler.trigger_now(conversation_id) {
                        report.replies_started += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    report.failures += 1;
                    tracing::error!("Poll: conversation {} failed: {}", conversation_id, e);
                }
            }
        }
        report
    }

    /// Poll driver.
    pub async fn run_poll_loop(&self) -> BackendResult<()> {
        if self.settings.catch_up.enabled {
            self.catch_up().await;
        }

        tracing::info!(
            "Polling dialogs every {}s",
            self.settings.poll_interval.as_secs()
        );
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let report = self.poll_once().await;
            if report.replies_started > 0 || report.failures > 0 {
                tracing::debug!("Poll cycle: {:?}", report);
            }
        }
    }

    /// Answers `text` against the stored conversation without changing it.
    pub async fn preview(&self, conversation_id: ConversationId, text: &str) -> BackendResult<String> {
        let conversation = self.registry.get_or_open(conversation_id).await?;
        let conv = conversation.lock().await;
        Ok(conv.manager.preview(Some(text)).await?)
    }
}

fn lock_workers(workers: &Mutex<WorkerMap>) -> std::sync::MutexGuard<'_, WorkerMap> {
    workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
