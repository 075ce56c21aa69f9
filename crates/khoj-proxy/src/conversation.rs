//! Conversation lifecycle.
//!
//! The proxy talks to exactly one remote conversation at a time. This module
//! owns that `(conversation handle, agent slug)` pair, decides when a new
//! remote conversation must be created, and keeps the persisted
//! [`ConversationState`] in step with it.
//!
//! Resolution order at startup ([`ConversationManager::initialize`]):
//! 1. `--conversation-id` override, used verbatim.
//! 2. `-n`, which defers creation to [`ConversationManager::ensure_active`].
//! 3. The persisted state file; an empty handle also defers creation.
//!
//! Concurrent requests share the pair. Edits take a short write lock, so a
//! request sees either the old or the new handle, never a torn one. Neither
//! remote session creation nor the state-file write happens under that lock.

use crate::error::ConversationError;
use crate::state::{ConversationState, StateStore};
use crate::upstream::KhojApi;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

pub const DEFAULT_AGENT_SLUG: &str = "sonnet-short-025716";

#[derive(Debug, Clone, Default)]
struct ActiveConversation {
    handle: String,
    agent: String,
    needs_new: bool,
    /// Bumped on every edit so an older snapshot never overwrites a newer one.
    generation: u64,
}

impl ActiveConversation {
    fn is_ready(&self) -> bool {
        !self.needs_new && !self.handle.is_empty()
    }

    fn bump(&mut self) -> (u64, ConversationState) {
        self.generation += 1;
        (
            self.generation,
            ConversationState::new(self.handle.clone(), self.agent.clone()),
        )
    }
}

/// Owner of the process-wide active conversation.
pub struct ConversationManager {
    api: Arc<dyn KhojApi>,
    store: Arc<dyn StateStore>,
    default_agent: String,
    api_key_present: bool,
    active: RwLock<ActiveConversation>,
    /// Serializes remote session creation.
    creating: Mutex<()>,
    /// Generation of the last snapshot written to the store.
    persisted: Mutex<u64>,
}

impl ConversationManager {
    pub fn new(
        api: Arc<dyn KhojApi>,
        store: Arc<dyn StateStore>,
        default_agent: impl Into<String>,
        api_key_present: bool,
    ) -> Self {
        let default_agent = default_agent.into();
        Self {
            api,
            store,
            active: RwLock::new(ActiveConversation {
                agent: default_agent.clone(),
                ..Default::default()
            }),
            creating: Mutex::new(()),
            persisted: Mutex::new(0),
            default_agent,
            api_key_present,
        }
    }

    /// Resolve the starting conversation from CLI overrides or persisted state.
    pub async fn initialize(
        &self,
        override_handle: Option<&str>,
        force_new: bool,
    ) -> Result<(), ConversationError> {
        if let Some(handle) = override_handle.filter(|h| !h.is_empty()) {
            let mut active = self.active.write().await;
            active.handle = handle.to_string();
            active.needs_new = false;
            info!(conversation_id = %active.handle, "using conversation ID from command line");
            return Ok(());
        }

        if force_new {
            self.active.write().await.needs_new = true;
            info!("will create new conversation when server starts");
            return Ok(());
        }

        let state = self.load_state().await?;
        let mut active = self.active.write().await;
        if state.last_conversation_id.is_empty() {
            active.needs_new = true;
            active.agent = self.default_agent.clone();
            info!("no saved conversation found, will create new conversation when server starts");
            return Ok(());
        }

        active.handle = state.last_conversation_id;
        active.agent = if state.agent_slug.is_empty() {
            self.default_agent.clone()
        } else {
            state.agent_slug
        };
        active.needs_new = false;
        info!(
            conversation_id = %active.handle,
            agent_slug = %active.agent,
            created_at = %state.created_at.to_rfc3339(),
            "using saved conversation"
        );
        Ok(())
    }

    /// Make sure a usable handle exists, creating a remote conversation when
    /// startup flagged one as needed or no handle is set.
    ///
    /// Session-creation failure is returned as-is; the caller treats it as
    /// fatal to server startup.
    pub async fn ensure_active(&self) -> Result<String, ConversationError> {
        {
            let active = self.active.read().await;
            if active.is_ready() {
                return Ok(active.handle.clone());
            }
        }

        let _creating = self.creating.lock().await;
        {
            // Another caller may have finished creating while we queued.
            let active = self.active.read().await;
            if active.is_ready() {
                return Ok(active.handle.clone());
            }
        }

        info!("creating new conversation");
        self.start_new().await
    }

    /// Unconditionally start a fresh remote conversation (the "new
    /// conversation" menu action). Failure leaves the current handle intact.
    pub async fn create_new_conversation(&self) -> Result<String, ConversationError> {
        if !self.api_key_present {
            return Err(ConversationError::MissingApiKey);
        }
        let _creating = self.creating.lock().await;
        self.start_new().await
    }

    /// Caller holds `creating`. Requests keep using the old handle until the
    /// new one is swapped in.
    async fn start_new(&self) -> Result<String, ConversationError> {
        let agent = {
            let active = self.active.read().await;
            if active.agent.is_empty() {
                self.default_agent.clone()
            } else {
                active.agent.clone()
            }
        };

        let handle = self
            .api
            .create_session(&agent)
            .await
            .map_err(ConversationError::Session)?;

        let (generation, snapshot) = {
            let mut active = self.active.write().await;
            active.handle = handle.clone();
            if active.agent.is_empty() {
                active.agent = agent.clone();
            }
            active.needs_new = false;
            active.bump()
        };

        if let Err(e) = self.persist(generation, snapshot).await {
            warn!(error = %e, "failed to save conversation state");
        }

        info!(conversation_id = %handle, agent_slug = %agent, "new conversation created");
        Ok(handle)
    }

    /// Replace the active handle. Empty input is rejected without mutation.
    pub async fn set_active_conversation(&self, handle: &str) -> Result<(), ConversationError> {
        if handle.is_empty() {
            return Err(ConversationError::EmptyHandle);
        }

        let (generation, snapshot) = {
            let mut active = self.active.write().await;
            active.handle = handle.to_string();
            active.needs_new = false;
            active.bump()
        };
        self.persist(generation, snapshot).await?;

        info!(conversation_id = %handle, "conversation ID updated");
        Ok(())
    }

    /// Replace the active agent; empty input means the default agent.
    pub async fn set_active_agent(&self, slug: &str) -> Result<(), ConversationError> {
        let slug = if slug.is_empty() {
            self.default_agent.as_str()
        } else {
            slug
        };

        let (generation, snapshot) = {
            let mut active = self.active.write().await;
            active.agent = slug.to_string();
            active.bump()
        };
        self.persist(generation, snapshot).await?;

        info!(agent_slug = %slug, "agent slug updated");
        Ok(())
    }

    pub async fn active_handle(&self) -> String {
        self.active.read().await.handle.clone()
    }

    pub async fn active_agent(&self) -> String {
        self.active.read().await.agent.clone()
    }

    pub async fn needs_new_conversation(&self) -> bool {
        !self.active.read().await.is_ready()
    }

    pub async fn display_handle(&self) -> String {
        display_handle(&self.active.read().await.handle)
    }

    pub fn api_key_present(&self) -> bool {
        self.api_key_present
    }

    async fn load_state(&self) -> Result<ConversationState, ConversationError> {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || store.load()).await??)
    }

    /// Write `snapshot` on the blocking pool unless a newer one already landed.
    async fn persist(
        &self,
        generation: u64,
        snapshot: ConversationState,
    ) -> Result<(), ConversationError> {
        let mut persisted = self.persisted.lock().await;
        if generation <= *persisted {
            return Ok(());
        }

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save(&snapshot)).await??;
        *persisted = generation;
        Ok(())
    }
}

/// `"None"` for an empty handle, the handle itself up to 4 characters, else
/// `"..."` plus the last 4 characters.
pub fn display_handle(handle: &str) -> String {
    if handle.is_empty() {
        return "None".to_string();
    }
    let count = handle.chars().count();
    if count <= 4 {
        return handle.to_string();
    }
    let tail: String = handle.chars().skip(count - 4).collect();
    format!("...{}", tail)
}
