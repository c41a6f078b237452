use std::sync::Arc;

use async_trait::async_trait;

use super::registry::ConversationRegistry;
use crate::conversation::ResponseMode;
use crate::error::{preview, BackendResult};
use crate::scheduler::{BatchResponder, ReplyRequest, ReplyTrigger};
use crate::transport::Transport;
use crate::typing::TypingProfile;

/// Draft, type, send, then record. A reply that never reaches the chat leaves
/// no trace in the history and does not move the cursor.
pub struct ReplyPipeline {
    registry: Arc<ConversationRegistry>,
    transport: Arc<dyn Transport>,
    typing: TypingProfile,
    catch_up_typing: TypingProfile,
}

impl ReplyPipeline {
    pub fn new(
        registry: Arc<ConversationRegistry>,
        transport: Arc<dyn Transport>,
        typing: TypingProfile,
    ) -> Self {
        Self {
            registry,
            transport,
            typing,
            catch_up_typing: TypingProfile::instant(),
        }
    }

    fn profile_for(&self, trigger: ReplyTrigger) -> &TypingProfile {
        match trigger {
            ReplyTrigger::CatchUp => &self.catch_up_typing,
            ReplyTrigger::Batch | ReplyTrigger::Immediate => &self.typing,
        }
    }
}

#[async_trait]
impl BatchResponder for ReplyPipeline {
    async fn respond(&self, request: ReplyRequest) -> BackendResult<()> {
        let conversation_id = request.conversation_id;
        let conversation = self.registry.get_or_open(conversation_id).await?;
        let mut conv = conversation.lock().await;

        // Transient: a failed batch is dropped, not replayed.
        let mut draft = conv
            .manager
            .draft_reply(request.composite.as_deref(), ResponseMode::Transient)
            .await?;

        let typing = self.profile_for(request.trigger).delay_for(&draft.text);
        tracing::debug!(
            "Conversation {}: typing {} chars for {:.1}s",
            conversation_id,
            draft.text.chars().count(),
            typing.as_secs_f64()
        );
        tokio::time::sleep(typing).await;

        let sent = match self.transport.send(conversation_id, &draft.text).await {
            Ok(sent) => sent,
            Err(e) => {
                conv.manager.discard_reply(draft);
                return Err(e.into());
            }
        };
        if sent.text != draft.text {
            tracing::warn!(
                "Conversation {}: transport delivered {} of {} chars",
                conversation_id,
                sent.text.chars().count(),
                draft.text.chars().count()
            );
        }

        draft.text = sent.text;
        // An uncommitted reply is left for the next pass to import.
        let text = conv.manager.commit_reply(draft)?;
        conv.record_sent(sent.id);

        // Only the batch is consumed. Whatever else arrived before our reply
        // stays above the cursor for the next pass.
        if let Some(source) = request.highest_source_id() {
            conv.cursor.advance(source);
            conv.mark_handled_through(source);
        }
        conv.persist_cursor()?;

        tracing::info!(
            "Conversation {}: replied to {} message(s): {:?}",
            conversation_id,
            request.batch.len().max(1),
            preview(&text, 60)
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ConversationDefaults, ConversationStore, Turn};
    use crate::scheduler::{compose_batch, PendingEntry};
    use crate::testing::{StubProvider, StubTransport};
    use crate::transport::ChatKind;
    use chrono::Utc;

    fn pipeline(
        dir: &tempfile::TempDir,
        provider: Arc<StubProvider>,
        transport: &StubTransport,
    ) -> (ReplyPipeline, Arc<ConversationRegistry>) {
        let registry = Arc::new(ConversationRegistry::new(
            ConversationStore::new(dir.path()),
            provider,
            ConversationDefaults {
                model: "m".to_string(),
                system_prompt: Some("sys".to_string()),
            },
        ));
        let pipeline = ReplyPipeline::new(
            registry.clone(),
            Arc::new(transport.clone()),
            TypingProfile::instant(),
        );
        (pipeline, registry)
    }

    fn batch_request(entries: Vec<PendingEntry>) -> ReplyRequest {
        ReplyRequest {
            conversation_id: 1,
            trigger: ReplyTrigger::Batch,
            composite: compose_batch(&entries),
            batch: entries,
        }
    }

    fn entry(id: i64, content: &str) -> PendingEntry {
        PendingEntry {
            content: content.to_string(),
            received_at: Utc::now(),
            source_message_id: id,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reply_is_sent_recorded_and_synced() {
        let dir = tempfile::tempdir().unwrap();
        let transport = StubTransport::new();
        transport.add_chat(1, ChatKind::Private);
        let (pipeline, registry) = pipeline(&dir, StubProvider::replying("sure"), &transport);

        pipeline
            .respond(batch_request(vec![entry(5, "a"), entry(6, "b")]))
            .await
            .unwrap();

        assert_eq!(transport.sent(), vec![(1, "sure".to_string())]);
        let conversation = registry.get_or_open(1).await.unwrap();
        let conv = conversation.lock().await;
        assert_eq!(
            conv.manager.history(),
            &[
                Turn::user("[Message 1]: a\n[Message 2]: b"),
                Turn::assistant("sure"),
            ]
        );
        assert_eq!(conv.cursor.last_synced_message_id, 6);
        assert_eq!(registry.store().load_cursor(1).unwrap().last_synced_message_id, 6);
        assert!(conv.is_own_sent(1000));
        assert!(registry.store().load_sent_ids(1).unwrap().contains(&1000));
    }

    #[tokio::test(start_paused = true)]
    async fn reply_cut_by_the_transport_is_recorded_as_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let transport = StubTransport::new();
        transport.limit_sends(4096);
        let long_reply = "word ".repeat(1000);
        let (pipeline, registry) = pipeline(&dir, StubProvider::replying(&long_reply), &transport);

        pipeline
            .respond(batch_request(vec![entry(5, "tell me everything")]))
            .await
            .unwrap();

        let delivered: String = long_reply.chars().take(4096).collect();
        assert_eq!(transport.sent(), vec![(1, delivered.clone())]);
        let record = registry.store().load_record(1).unwrap().unwrap();
        assert_eq!(record.turns.last(), Some(&Turn::assistant(delivered)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_discards_the_draft() {
        let dir = tempfile::tempdir().unwrap();
        let transport = StubTransport::new();
        transport.fail_sends(true);
        let (pipeline, registry) = pipeline(&dir, StubProvider::replying("sure"), &transport);

        let err = pipeline
            .respond(batch_request(vec![entry(5, "hello?")]))
            .await;
        assert!(err.is_err());

        let conversation = registry.get_or_open(1).await.unwrap();
        let conv = conversation.lock().await;
        assert!(conv.manager.history().is_empty());
        assert_eq!(conv.cursor.last_synced_message_id, 0);
        assert!(!registry.store().record_path(1).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn provider_failure_rolls_back_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let transport = StubTransport::new();
        let (pipeline, registry) = pipeline(&dir, StubProvider::failing(), &transport);

        assert!(pipeline
            .respond(batch_request(vec![entry(5, "hello?")]))
            .await
            .is_err());
        assert!(transport.sent().is_empty());

        let conversation = registry.get_or_open(1).await.unwrap();
        assert!(conversation.lock().await.manager.history().is_empty());
    }
}
