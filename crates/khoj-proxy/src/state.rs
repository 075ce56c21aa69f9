//! Persisted conversation state.
//!
//! A tiny JSON document remembering which remote conversation (and agent) the
//! proxy last used, so a restart resumes the same Khoj conversation:
//!
//! ```json
//! {
//!   "last_conversation_id": "a1b2c3d4",
//!   "agent_slug": "sonnet-short-025716",
//!   "created_at": "2025-01-01T12:00:00Z"
//! }
//! ```
//!
//! The store is pure data access. Validation and the decision of *when* to
//! write belong to [`crate::conversation::ConversationManager`].

use crate::error::StateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const DEFAULT_STATE_FILE: &str = "conversation_state.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    #[serde(default)]
    pub last_conversation_id: String,
    #[serde(default)]
    pub agent_slug: String,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(conversation_id: impl Into<String>, agent_slug: impl Into<String>) -> Self {
        Self {
            last_conversation_id: conversation_id.into(),
            agent_slug: agent_slug.into(),
            created_at: Utc::now(),
        }
    }
}

/// Load/save access to the persisted [`ConversationState`].
pub trait StateStore: Send + Sync {
    /// Returns an empty state when nothing has been persisted yet.
    fn load(&self) -> Result<ConversationState, StateError>;

    fn save(&self, state: &ConversationState) -> Result<(), StateError>;
}

/// [`StateStore`] backed by a pretty-printed JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    path: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn display_path(&self) -> String {
        self.path.display().to_string()
    }
}

impl Default for JsonFileStateStore {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_FILE)
    }
}

impl StateStore for JsonFileStateStore {
    fn load(&self) -> Result<ConversationState, StateError> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ConversationState::default()),
            Err(source) => {
                return Err(StateError::Read {
                    path: self.display_path(),
                    source,
                })
            }
        };

        serde_json::from_str(&data).map_err(StateError::Parse)
    }

    fn save(&self, state: &ConversationState) -> Result<(), StateError> {
        let data = serde_json::to_string_pretty(state).map_err(StateError::Serialize)?;
        fs::write(&self.path, data).map_err(|source| StateError::Write {
            path: self.display_path(),
            source,
        })
    }
}
