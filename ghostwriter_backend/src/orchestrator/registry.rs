//! Lazily opened conversations, one async mutex each.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::conversation::{
    ConversationDefaults, ConversationId, ConversationManager, ConversationStore, MessageId,
    SyncCursor,
};
use crate::error::PersistenceError;
use crate::llm_client::CompletionProvider;
use crate::reconcile::{HistoryReconciler, ReconcileOptions, ReconcileOutcome};
use crate::transport::TranscriptMessage;

/// A conversation's history together with its sync cursor.
pub struct Conversation {
    pub manager: ConversationManager,
    pub cursor: SyncCursor,
    store: ConversationStore,
    /// Highest transcript id already imported or dispatched live. Not persisted.
    handled_through: MessageId,
    /// Replies we sent and recorded that the cursor has not passed yet. They
    /// are skipped on import and on the live stream.
    own_sent: BTreeSet<MessageId>,
    own_sent_dirty: bool,
}

impl Conversation {
    pub fn conversation_id(&self) -> ConversationId {
        self.manager.conversation_id()
    }

    /// Writes record and cursor.
    pub fn persist(&mut self) -> Result<(), PersistenceError> {
        self.manager.save()?;
        self.persist_cursor()
    }

    /// Writes the cursor and the sent ids it has not passed yet.
    pub fn persist_cursor(&mut self) -> Result<(), PersistenceError> {
        let synced = self.cursor.last_synced_message_id;
        let before = self.own_sent.len();
        self.own_sent.retain(|id| *id > synced);
        if self.own_sent.len() != before {
            self.own_sent_dirty = true;
        }

        self.store.save_cursor(&self.cursor)?;
        if self.own_sent_dirty {
            self.store
                .save_sent_ids(self.conversation_id(), &self.own_sent)?;
            self.own_sent_dirty = false;
        }
        Ok(())
    }

    /// Claims a live message. Returns false for duplicates and echoes of our own sends.
    pub fn claim(&mut self, message_id: MessageId) -> bool {
        if self.own_sent.contains(&message_id) || message_id <= self.handled_through {
            return false;
        }
        self.handled_through = message_id;
        true
    }

    pub fn mark_handled_through(&mut self, message_id: MessageId) {
        self.handled_through = self.handled_through.max(message_id);
    }

    /// Remembers a delivered reply until the cursor passes it. Written out by
    /// the next [`persist_cursor`](Self::persist_cursor).
    pub fn record_sent(&mut self, message_id: MessageId) {
        if self.own_sent.insert(message_id) {
            self.own_sent_dirty = true;
        }
    }

    pub fn is_own_sent(&self, message_id: MessageId) -> bool {
        self.own_sent.contains(&message_id)
    }

    /// Folds `messages` into the history, skipping replies already recorded.
    pub fn reconcile(
        &mut self,
        reconciler: &HistoryReconciler,
        messages: &[TranscriptMessage],
        options: ReconcileOptions<'_>,
    ) -> ReconcileOutcome {
        let options = ReconcileOptions {
            already_recorded: Some(&self.own_sent),
            ..options
        };
        let outcome =
            reconciler.reconcile(&mut self.manager, &mut self.cursor, messages, options);
        self.mark_handled_through(outcome.cursor);
        outcome
    }
}

pub struct ConversationRegistry {
    store: ConversationStore,
    provider: Arc<dyn CompletionProvider>,
    defaults: ConversationDefaults,
    entries: Mutex<HashMap<ConversationId, Arc<Mutex<Conversation>>>>,
}

impl ConversationRegistry {
    pub fn new(
        store: ConversationStore,
        provider: Arc<dyn CompletionProvider>,
        defaults: ConversationDefaults,
    ) -> Self {
        Self {
            store,
            provider,
            defaults,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Returns the live conversation, loading it from disk on first use.
    pub async fn get_or_open(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Arc<Mutex<Conversation>>, PersistenceError> {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(&conversation_id) {
            return Ok(existing.clone());
        }

        let manager = ConversationManager::open(
            conversation_id,
            self.store.clone(),
            self.provider.clone(),
            &self.defaults,
        )?;
        let cursor = self.store.load_cursor(conversation_id)?;
        let mut own_sent = self.store.load_sent_ids(conversation_id)?;
        own_sent.retain(|id| !cursor.covers(*id));
        let conversation = Arc::new(Mutex::new(Conversation {
            manager,
            cursor,
            store: self.store.clone(),
            handled_through: cursor.last_synced_message_id,
            own_sent,
            own_sent_dirty: false,
        }));
        entries.insert(conversation_id, conversation.clone());
        Ok(conversation)
    }

    pub async fn open_conversations(&self) -> Vec<ConversationId> {
        let entries = self.entries.lock().await;
        let mut ids: Vec<ConversationId> = entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubProvider;

    fn registry(dir: &tempfile::TempDir) -> ConversationRegistry {
        ConversationRegistry::new(
            ConversationStore::new(dir.path()),
            StubProvider::replying("ok"),
            ConversationDefaults {
                model: "m".to_string(),
                system_prompt: None,
            },
        )
    }

    #[tokio::test]
    async fn same_conversation_is_shared() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);

        let a = registry.get_or_open(5).await.unwrap();
        let b = registry.get_or_open(5).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.open_conversations().await, vec![5]);
    }

    #[tokio::test]
    async fn cursor_is_loaded_and_persisted_with_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        store.ensure_dir().unwrap();
        std::fs::write(store.cursor_path(9), "41").unwrap();

        let registry = registry(&dir);
        let conversation = registry.get_or_open(9).await.unwrap();
        let mut conv = conversation.lock().await;
        assert_eq!(conv.cursor.last_synced_message_id, 41);
        assert!(!conv.claim(40));
        assert!(conv.claim(42));

        conv.manager.append_user("hello");
        conv.cursor.advance(42);
        conv.persist().unwrap();

        assert_eq!(store.load_cursor(9).unwrap().last_synced_message_id, 42);
        assert_eq!(store.load_record(9).unwrap().unwrap().turns.len(), 2);
    }

    #[tokio::test]
    async fn own_sends_are_not_claimed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let conversation = registry.get_or_open(1).await.unwrap();
        let mut conv = conversation.lock().await;

        conv.record_sent(100);
        assert!(!conv.claim(100));
        assert!(conv.claim(101));
    }

    #[tokio::test]
    async fn sent_ids_survive_reopen_until_the_cursor_passes_them() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = registry(&dir);
            let conversation = registry.get_or_open(2).await.unwrap();
            let mut conv = conversation.lock().await;
            conv.cursor.advance(10);
            conv.record_sent(11);
            conv.record_sent(20);
            conv.persist_cursor().unwrap();
        }

        let registry = registry(&dir);
        let conversation = registry.get_or_open(2).await.unwrap();
        let mut conv = conversation.lock().await;
        assert!(conv.is_own_sent(11));
        assert!(conv.is_own_sent(20));

        conv.cursor.advance(15);
        conv.persist_cursor().unwrap();
        assert!(!conv.is_own_sent(11));
        assert_eq!(
            registry.store().load_sent_ids(2).unwrap().into_iter().collect::<Vec<_>>(),
            vec![20]
        );
    }
}
