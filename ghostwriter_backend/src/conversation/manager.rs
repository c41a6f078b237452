use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{ConversationId, ConversationRecord, ConversationStore, Role, Turn};
use crate::error::{BackendResult, PersistenceError, ProviderError};
use crate::llm_client::CompletionProvider;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

/// Values used when a conversation has no stored record (or the record lacks them).
#[derive(Debug, Clone)]
pub struct ConversationDefaults {
    pub model: String,
    pub system_prompt: Option<String>,
}

/// What happens to an appended user turn when the provider call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    /// The user turn stays in the history so a later call can answer it.
    #[default]
    Persistent,
    /// The history is rolled back to how it was before the call.
    Transient,
}

/// A provider reply that has not been recorded yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftReply {
    pub text: String,
    appended_user: bool,
}

/// Owns the AI-facing history of one conversation.
///
/// The system prompt lives in its own field and `turns` never starts with it;
/// the combined sequence is only built for the provider and for the file, so
/// the leading system turn always matches the current prompt.
pub struct ConversationManager {
    conversation_id: ConversationId,
    model: String,
    system_prompt: String,
    turns: Vec<Turn>,
    saved_at: Option<DateTime<Utc>>,
    store: ConversationStore,
    provider: Arc<dyn CompletionProvider>,
}

impl ConversationManager {
    /// Loads the stored record if there is one, otherwise starts empty.
    pub fn open(
        conversation_id: ConversationId,
        store: ConversationStore,
        provider: Arc<dyn CompletionProvider>,
        defaults: &ConversationDefaults,
    ) -> Result<Self, PersistenceError> {
        let record = store.load_record(conversation_id)?;

        let explicit_prompt = defaults
            .system_prompt
            .clone()
            .filter(|p| !p.trim().is_empty());

        let (model, system_prompt, turns, saved_at) = match record {
            Some(record) => {
                let system_prompt = record
                    .system_prompt
                    .or(explicit_prompt)
                    .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
                let model = record.model.unwrap_or_else(|| defaults.model.clone());
                (model, system_prompt, record.turns, Some(record.saved_at))
            }
            None => (
                defaults.model.clone(),
                explicit_prompt.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
                Vec::new(),
                None,
            ),
        };

        let mut manager = Self {
            conversation_id,
            model,
            system_prompt,
            turns: Vec::new(),
            saved_at,
            store,
            provider,
        };
        manager.replace_turns(turns);

        tracing::debug!(
            "Opened conversation {} ({} turns, model {})",
            conversation_id,
            manager.turns.len(),
            manager.model
        );
        Ok(manager)
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        self.saved_at
    }

    /// Turns after the system turn.
    pub fn history(&self) -> &[Turn] {
        &self.turns
    }

    /// The full sequence as the provider sees it, system turn first.
    pub fn turns(&self) -> Vec<Turn> {
        let mut all = Vec::with_capacity(self.turns.len() + 1);
        all.push(Turn::system(self.system_prompt.clone()));
        all.extend(self.turns.iter().cloned());
        all
    }

    pub fn append(&mut self, role: Role, content: impl Into<String>) {
        self.turns.push(Turn::new(role, content));
    }

    pub fn append_user(&mut self, content: impl Into<String>) {
        self.append(Role::User, content);
    }

    pub fn append_assistant(&mut self, content: impl Into<String>) {
        self.append(Role::Assistant, content);
    }

    pub fn reset_to_system_prompt(&mut self) {
        self.turns.clear();
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn set_system_prompt_from_file(&mut self, path: &Path) -> Result<(), PersistenceError> {
        let prompt = std::fs::read_to_string(path).map_err(|source| PersistenceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.set_system_prompt(prompt.trim());
        Ok(())
    }

    /// Replaces the history. A leading system turn is treated as the slot
    /// reserved for the current prompt and dropped.
    pub fn replace_turns(&mut self, mut turns: Vec<Turn>) {
        if turns.first().map(|t| t.role) == Some(Role::System) {
            turns.remove(0);
        }
        self.turns = turns;
    }

    pub fn to_record(&self) -> ConversationRecord {
        ConversationRecord {
            conversation_id: self.conversation_id,
            model: Some(self.model.clone()),
            system_prompt: Some(self.system_prompt.clone()),
            turns: self.turns(),
            saved_at: self.saved_at.unwrap_or_else(Utc::now),
        }
    }

    pub fn save(&mut self) -> Result<(), PersistenceError> {
        let mut record = self.to_record();
        record.saved_at = Utc::now();
        self.store.save_record(&record)?;
        self.saved_at = Some(record.saved_at);
        Ok(())
    }

    /// Appends `extra` (if any) and asks the provider, without recording the
    /// answer. Follow up with [`commit_reply`](Self::commit_reply) or
    /// [`discard_reply`](Self::discard_reply).
    pub async fn draft_reply(
        &mut self,
        extra: Option<&str>,
        mode: ResponseMode,
    ) -> Result<DraftReply, ProviderError> {
        let appended_user = match extra {
            Some(content) if !content.is_empty() => {
                self.append_user(content);
                true
            }
            _ => false,
        };

        let messages = self.turns();
        match self.provider.complete(&self.model, &messages).await {
            Ok(text) => Ok(DraftReply {
                text,
                appended_user,
            }),
            Err(e) => {
                if appended_user && mode == ResponseMode::Transient {
                    self.turns.pop();
                }
                Err(e)
            }
        }
    }

    /// Records the reply as an assistant turn and persists the conversation.
    /// If the write fails the assistant turn is taken back out.
    pub fn commit_reply(&mut self, draft: DraftReply) -> Result<String, PersistenceError> {
        self.append_assistant(draft.text.clone());
        if let Err(e) = self.save() {
            self.turns.pop();
            return Err(e);
        }
        Ok(draft.text)
    }

    /// Drops the reply and the user turn the draft appended.
    pub fn discard_reply(&mut self, draft: DraftReply) {
        if draft.appended_user && self.turns.last().map(|t| t.role) == Some(Role::User) {
            self.turns.pop();
        }
    }

    pub async fn respond(&mut self, extra: Option<&str>) -> BackendResult<String> {
        self.respond_with_mode(extra, ResponseMode::Persistent).await
    }

    pub async fn respond_with_mode(
        &mut self,
        extra: Option<&str>,
        mode: ResponseMode,
    ) -> BackendResult<String> {
        let draft = self.draft_reply(extra, mode).await?;
        Ok(self.commit_reply(draft)?)
    }

    /// Asks the provider as if `extra` had been sent, leaving the history untouched.
    pub async fn preview(&self, extra: Option<&str>) -> Result<String, ProviderError> {
        let mut messages = self.turns();
        if let Some(content) = extra.filter(|c| !c.is_empty()) {
            messages.push(Turn::user(content));
        }
        self.provider.complete(&self.model, &messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::testing::StubProvider;
    use tempfile::TempDir;

    fn defaults(prompt: Option<&str>) -> ConversationDefaults {
        ConversationDefaults {
            model: "test-model".to_string(),
            system_prompt: prompt.map(str::to_string),
        }
    }

    fn open(
        dir: &TempDir,
        provider: Arc<StubProvider>,
        prompt: Option<&str>,
    ) -> ConversationManager {
        let store = ConversationStore::new(dir.path());
        ConversationManager::open(1, store, provider, &defaults(prompt)).expect("open")
    }

    fn assert_system_first(manager: &ConversationManager) {
        let turns = manager.turns();
        assert_eq!(turns[0].role, Role::System);
        assert_eq!(turns[0].content, manager.system_prompt());
    }

    #[test]
    fn system_turn_invariant_holds_after_every_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = open(&dir, StubProvider::replying("ok"), Some("first"));
        assert_system_first(&manager);

        manager.append_user("hello");
        assert_system_first(&manager);

        manager.append(Role::System, "mid-stream note");
        assert_system_first(&manager);

        manager.set_system_prompt("second");
        assert_system_first(&manager);
        assert_eq!(manager.turns()[0].content, "second");

        manager.replace_turns(vec![Turn::system("stale"), Turn::user("a")]);
        assert_system_first(&manager);
        assert_eq!(manager.turns().len(), 2);

        manager.reset_to_system_prompt();
        assert_system_first(&manager);
        assert_eq!(manager.turns(), vec![Turn::system("second")]);
    }

    #[test]
    fn stored_prompt_wins_over_explicit_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        store
            .save_record(&ConversationRecord {
                conversation_id: 1,
                model: Some("stored-model".to_string()),
                system_prompt: Some("stored prompt".to_string()),
                turns: vec![Turn::system("outdated copy"), Turn::user("hi")],
                saved_at: Utc::now(),
            })
            .unwrap();

        let manager = open(&dir, StubProvider::replying("ok"), Some("explicit"));
        assert_eq!(manager.system_prompt(), "stored prompt");
        assert_eq!(manager.model(), "stored-model");
        assert_eq!(
            manager.turns(),
            vec![Turn::system("stored prompt"), Turn::user("hi")]
        );
    }

    #[test]
    fn explicit_prompt_fills_in_when_stored_one_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        store.ensure_dir().unwrap();
        std::fs::write(
            store.record_path(1),
            r#"{"messages": [{"role": "user", "content": "hi"}]}"#,
        )
        .unwrap();

        let manager = open(&dir, StubProvider::replying("ok"), Some("explicit"));
        assert_eq!(manager.system_prompt(), "explicit");
        assert_eq!(manager.model(), "test-model");
        assert_eq!(
            manager.turns(),
            vec![Turn::system("explicit"), Turn::user("hi")]
        );
    }

    #[test]
    fn fresh_conversation_uses_default_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open(&dir, StubProvider::replying("ok"), None);
        assert_eq!(manager.system_prompt(), DEFAULT_SYSTEM_PROMPT);
        assert!(manager.history().is_empty());
    }

    #[tokio::test]
    async fn respond_appends_reply_and_persists_matching_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        store
            .save_record(&ConversationRecord {
                conversation_id: 1,
                model: Some("test-model".to_string()),
                system_prompt: Some("assistant".to_string()),
                turns: vec![Turn::system("assistant"), Turn::user("hi")],
                saved_at: Utc::now(),
            })
            .unwrap();

        let provider = StubProvider::replying("hello");
        let mut manager = open(&dir, provider.clone(), Some("assistant"));

        let reply = manager.respond(None).await.expect("respond");
        assert_eq!(reply, "hello");

        let expected = vec![
            Turn::system("assistant"),
            Turn::user("hi"),
            Turn::assistant("hello"),
        ];
        assert_eq!(manager.turns(), expected);
        assert_eq!(provider.calls()[0], expected[..2].to_vec());

        let raw = std::fs::read_to_string(store.record_path(1)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let persisted: Vec<Turn> = serde_json::from_value(value["messages"].clone()).unwrap();
        assert_eq!(persisted, expected);
    }

    #[tokio::test]
    async fn provider_failure_keeps_user_turn_in_persistent_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = open(&dir, StubProvider::failing(), Some("p"));

        let err = manager.respond(Some("are you there?")).await.unwrap_err();
        assert!(matches!(err, BackendError::Provider(_)));
        assert_eq!(manager.history(), &[Turn::user("are you there?")]);
        // Nothing was written because the call never completed.
        assert!(!ConversationStore::new(dir.path()).record_path(1).exists());
    }

    #[tokio::test]
    async fn provider_failure_rolls_back_in_transient_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = open(&dir, StubProvider::failing(), Some("p"));
        manager.append_user("earlier");

        let result = manager
            .respond_with_mode(Some("are you there?"), ResponseMode::Transient)
            .await;
        assert!(result.is_err());
        assert_eq!(manager.history(), &[Turn::user("earlier")]);
    }

    #[tokio::test]
    async fn discarded_draft_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = open(&dir, StubProvider::replying("draft"), Some("p"));

        let draft = manager
            .draft_reply(Some("question"), ResponseMode::Transient)
            .await
            .unwrap();
        assert_eq!(draft.text, "draft");
        assert_eq!(manager.history().len(), 1);

        manager.discard_reply(draft);
        assert!(manager.history().is_empty());
    }

    #[tokio::test]
    async fn preview_does_not_touch_history() {
        let dir = tempfile::tempdir().unwrap();
        let provider = StubProvider::replying("maybe");
        let mut manager = open(&dir, provider.clone(), Some("p"));
        manager.append_user("one");

        let reply = manager.preview(Some("two")).await.unwrap();
        assert_eq!(reply, "maybe");
        assert_eq!(manager.history(), &[Turn::user("one")]);
        assert_eq!(provider.calls()[0].last(), Some(&Turn::user("two")));
    }

    #[test]
    fn system_prompt_can_be_loaded_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let prompt_path = dir.path().join("prompt.txt");
        std::fs::write(&prompt_path, "  be terse\n").unwrap();

        let mut manager = open(&dir, StubProvider::replying("ok"), None);
        manager.set_system_prompt_from_file(&prompt_path).unwrap();
        assert_eq!(manager.system_prompt(), "be terse");

        let missing = manager.set_system_prompt_from_file(&dir.path().join("nope.txt"));
        assert!(matches!(missing, Err(PersistenceError::Read { .. })));
        assert_eq!(manager.system_prompt(), "be terse");
    }
}
