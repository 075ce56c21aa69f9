//! Control surface for a UI shell or the CLI.
//!
//! [`Control`] wires the configured Khoj client, state store, conversation
//! manager and translator together and exposes the small set of actions a
//! tray menu or command line needs.

use crate::config::ProxyConfig;
use crate::context::CallContext;
use crate::conversation::ConversationManager;
use crate::error::{ConversationError, TranslateError};
use crate::server::{self, AppState, ServerHandle, ServerSettings};
use crate::state::JsonFileStateStore;
use crate::translation::{Translator, TranslatorOptions};
use crate::upstream::{KhojApi, KhojClient};
use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Deadline for one-shot [`Control::ask`] calls.
pub const DEFAULT_ASK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiKeyStatus {
    pub present: bool,
}

impl ApiKeyStatus {
    pub fn label(&self) -> &'static str {
        if self.present {
            "API Key: Set"
        } else {
            "API Key: Not Set"
        }
    }
}

impl fmt::Display for ApiKeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub struct Control {
    conversations: Arc<ConversationManager>,
    translator: Arc<Translator>,
    settings: ServerSettings,
}

impl Control {
    /// Build against the real Khoj HTTP API.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let client = KhojClient::new(config.api_base.clone(), config.api_key.clone(), config.timeout)
            .context("failed to build khoj client")?;
        info!(api_base = %client.api_base(), timeout = ?config.timeout, "khoj client ready");
        Ok(Self::with_api(Arc::new(client), config))
    }

    pub fn with_api(api: Arc<dyn KhojApi>, config: &ProxyConfig) -> Self {
        let store = Arc::new(JsonFileStateStore::new(config.state_file.clone()));
        let conversations = Arc::new(ConversationManager::new(
            api.clone(),
            store,
            config.agent_slug.clone(),
            config.api_key_present(),
        ));
        let translator = Arc::new(Translator::new(
            api,
            conversations.clone(),
            TranslatorOptions {
                client_id: config.client_id.clone(),
                attachments: config.attachments.clone(),
            },
        ));

        Self {
            conversations,
            translator,
            settings: config.server.clone(),
        }
    }

    pub fn conversations(&self) -> &Arc<ConversationManager> {
        &self.conversations
    }

    pub async fn initialize(
        &self,
        override_handle: Option<&str>,
        force_new: bool,
    ) -> Result<(), ConversationError> {
        self.conversations.initialize(override_handle, force_new).await
    }

    /// Short form of the active handle for menu titles.
    pub async fn display_handle(&self) -> String {
        self.conversations.display_handle().await
    }

    pub async fn create_new_conversation(&self) -> Result<String, ConversationError> {
        self.conversations.create_new_conversation().await
    }

    pub async fn set_conversation_handle(&self, handle: &str) -> Result<(), ConversationError> {
        self.conversations.set_active_conversation(handle).await
    }

    pub async fn set_agent_slug(&self, slug: &str) -> Result<(), ConversationError> {
        self.conversations.set_active_agent(slug).await
    }

    pub fn api_key_status(&self) -> ApiKeyStatus {
        ApiKeyStatus {
            present: self.conversations.api_key_present(),
        }
    }

    /// Send `prompt` as-is in the active conversation, giving up after
    /// `timeout`.
    pub async fn ask(&self, prompt: &str, timeout: Duration) -> Result<String, TranslateError> {
        let ctx = CallContext::with_timeout(timeout);
        let result = self.translator.ask(&ctx, prompt).await;
        if let Err(e) = &result {
            if e.is_timeout() {
                warn!(timeout_secs = timeout.as_secs(), "AI request timed out");
            }
        }
        result
    }

    /// Make sure a conversation exists, then bind and start the HTTP server.
    ///
    /// Failing to create the conversation is fatal: no server is started.
    pub async fn start_server(&self) -> Result<ServerHandle> {
        let handle = self
            .conversations
            .ensure_active()
            .await
            .context("failed to create new conversation")?;
        info!(conversation_id = %handle, "using conversation");

        server::start(
            AppState::new(self.translator.clone(), &self.settings),
            &self.settings,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::testing::MockKhoj;
    use crate::error::UpstreamError;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(dir: &TempDir, api_key: Option<&str>) -> ProxyConfig {
        ProxyConfig {
            api_key: api_key.map(str::to_string),
            state_file: dir.path().join("state.json"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn hooks_drive_the_conversation_manager() {
        let dir = TempDir::new().unwrap();
        let api = Arc::new(MockKhoj::answering(""));
        let control = Control::with_api(api.clone(), &config(&dir, Some("key")));

        control.initialize(None, false).await.unwrap();
        assert_eq!(control.display_handle().await, "None");

        control.set_conversation_handle("conversation-9876").await.unwrap();
        assert_eq!(control.display_handle().await, "...9876");

        assert!(matches!(
            control.set_conversation_handle("").await,
            Err(ConversationError::EmptyHandle)
        ));

        control.set_agent_slug("gpt-4o-mini").await.unwrap();
        let handle = control.create_new_conversation().await.unwrap();
        assert_eq!(handle, "conv-gpt-4o-mini-1");
        assert_eq!(api.session_calls(), 1);
    }

    #[test]
    fn api_key_status_labels() {
        let dir = TempDir::new().unwrap();
        let api = Arc::new(MockKhoj::answering(""));

        let with_key = Control::with_api(api.clone(), &config(&dir, Some("key")));
        assert_eq!(with_key.api_key_status().to_string(), "API Key: Set");

        let without = Control::with_api(api, &config(&dir, None));
        assert!(!without.api_key_status().present);
        assert_eq!(without.api_key_status().label(), "API Key: Not Set");
    }

    #[tokio::test]
    async fn ask_sends_prompt_verbatim() {
        let dir = TempDir::new().unwrap();
        let api = Arc::new(MockKhoj::answering("sure"));
        let control = Control::with_api(api.clone(), &config(&dir, Some("key")));
        control.set_conversation_handle("abc").await.unwrap();

        let answer = control.ask("rewrite this", DEFAULT_ASK_TIMEOUT).await.unwrap();

        assert_eq!(answer, "sure");
        let sent = api.last_request().unwrap();
        assert_eq!(sent.q, "rewrite this");
        assert_eq!(sent.conversation_id, "abc");
    }

    #[tokio::test]
    async fn ask_reports_timeout_distinctly() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"response": "late"}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let config = ProxyConfig {
            api_base: server.uri(),
            ..config(&dir, Some("key"))
        };
        let control = Control::from_config(&config).unwrap();
        control.set_conversation_handle("abc").await.unwrap();

        let err = control
            .ask("hello", Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(err.to_string().contains("timed out after 1s"));
        assert!(matches!(
            err,
            TranslateError::Upstream(UpstreamError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn start_server_fails_without_conversation() {
        let dir = TempDir::new().unwrap();
        let api = Arc::new(MockKhoj::answering("").with_session_error(|| {
            UpstreamError::SessionCreation {
                status: Some(401),
                body: "unauthorized".to_string(),
            }
        }));
        let control = Control::with_api(api.clone(), &config(&dir, Some("key")));
        control.initialize(None, false).await.unwrap();

        let err = control.start_server().await.err().unwrap();
        assert!(err.to_string().contains("failed to create new conversation"));
        assert_eq!(api.session_calls(), 1);
    }
}
