use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::config::AgentConfig;
use crate::conversation::{ConversationDefaults, ConversationStore};
use crate::http_client::build_http_client_with_timeout;
use crate::llm_client::{CompletionProvider, LlmClient};
use crate::orchestrator::{ConversationRegistry, Orchestrator, OrchestratorSettings};
use crate::reconcile::HistoryReconciler;
use crate::transport::{TelegramTransport, Transport};

// Must outlive the Telegram long-poll timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(90);

pub struct GhostwriterRuntime {
    pub config: AgentConfig,
    pub orchestrator: Arc<Orchestrator>,
    update_pump: Option<JoinHandle<()>>,
}

pub struct GhostwriterRuntimeBuilder {
    config: AgentConfig,
    provider: Option<Arc<dyn CompletionProvider>>,
    transport: Option<Arc<dyn Transport>>,
    start_update_pump: bool,
}

impl GhostwriterRuntimeBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            provider: None,
            transport: None,
            start_update_pump: true,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the Telegram transport without consuming updates. For commands
    /// that only touch stored conversations.
    pub fn offline(mut self) -> Self {
        self.start_update_pump = false;
        self
    }

    /// Must be called from within a tokio runtime: the update pump is spawned here.
    pub fn build(self) -> Result<GhostwriterRuntime> {
        let config = self.config;
        let system_prompt = config
            .resolve_system_prompt()
            .context("failed to resolve system prompt")?;

        let store = ConversationStore::new(&config.history_dir);
        store
            .ensure_dir()
            .with_context(|| format!("history directory {:?} is not usable", config.history_dir))?;
        match store.known_conversations() {
            Ok(ids) => tracing::info!("{} stored conversation(s) in {:?}", ids.len(), store.root()),
            Err(e) => tracing::warn!("Could not list stored conversations: {}", e),
        }

        let http_client = build_http_client_with_timeout(Some(HTTP_TIMEOUT))?;

        let provider: Arc<dyn CompletionProvider> = match self.provider {
            Some(provider) => provider,
            None => {
                let mut client = LlmClient::new(
                    config.llm_api_url.clone(),
                    config.llm_api_key.clone().unwrap_or_default(),
                    http_client.clone(),
                );
                if let Some(temperature) = config.llm_temperature {
                    client = client.with_temperature(temperature);
                }
                if let Some(max_tokens) = config.llm_max_tokens {
                    client = client.with_max_tokens(max_tokens);
                }
                Arc::new(client)
            }
        };

        let mut update_pump = None;
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => {
                let token = config.telegram_bot_token.as_deref().unwrap_or_default();
                if self.start_update_pump {
                    let (transport, handle) = TelegramTransport::connect(
                        &config.telegram_api_url,
                        token,
                        http_client,
                        config.transcript_capacity,
                    );
                    update_pump = Some(handle);
                    Arc::new(transport)
                } else {
                    Arc::new(TelegramTransport::new(
                        &config.telegram_api_url,
                        token,
                        http_client,
                        config.transcript_capacity,
                    ))
                }
            }
        };

        let registry = Arc::new(ConversationRegistry::new(
            store,
            provider,
            ConversationDefaults {
                model: config.llm_model.clone(),
                system_prompt,
            },
        ));
        let reconciler = HistoryReconciler::new(&config.user_marker, &config.reset_command);
        let orchestrator = Orchestrator::new(
            registry,
            transport,
            reconciler,
            OrchestratorSettings::from_config(&config),
        );

        tracing::info!(
            "Runtime ready: driver {:?}, model {}",
            config.driver,
            config.llm_model
        );

        Ok(GhostwriterRuntime {
            config,
            orchestrator,
            update_pump,
        })
    }
}

impl GhostwriterRuntime {
    pub fn bootstrap(config: AgentConfig) -> Result<Self> {
        GhostwriterRuntimeBuilder::new(config).build()
    }
}

impl Drop for GhostwriterRuntime {
    fn drop(&mut self) {
        if let Some(pump) = self.update_pump.take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubProvider, StubTransport};
    use crate::transport::ChatKind;

    fn config(dir: &tempfile::TempDir) -> AgentConfig {
        AgentConfig {
            telegram_bot_token: Some("1:test".to_string()),
            llm_api_key: Some("k".to_string()),
            history_dir: dir.path().join("history"),
            system_prompt: Some("be brief".to_string()),
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn builder_wires_injected_provider_and_transport() {
        let dir = tempfile::tempdir().unwrap();
        let transport = StubTransport::new();
        transport.add_chat(1, ChatKind::Private);

        let runtime = GhostwriterRuntimeBuilder::new(config(&dir))
            .with_provider(StubProvider::replying("hi"))
            .with_transport(Arc::new(transport))
            .build()
            .unwrap();

        assert!(dir.path().join("history").is_dir());
        let reply = runtime.orchestrator.preview(1, "hello").await.unwrap();
        assert_eq!(reply, "hi");

        let conversation = runtime.orchestrator.registry().get_or_open(1).await.unwrap();
        assert_eq!(conversation.lock().await.manager.system_prompt(), "be brief");
    }

    #[tokio::test]
    async fn offline_build_does_not_start_update_pump() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = GhostwriterRuntimeBuilder::new(config(&dir))
            .with_provider(StubProvider::replying("hi"))
            .offline()
            .build()
            .unwrap();
        assert!(runtime.update_pump.is_none());
    }
}
