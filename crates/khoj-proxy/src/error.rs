//! Error types

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("session creation failed{}: {}", status_suffix(.status), .body)]
    SessionCreation { status: Option<u16>, body: String },

    #[error("khoj API error {status}: {body}")]
    ClientStatus { status: u16, body: String },

    #[error("khoj API error {status}: {body}")]
    ServerStatus { status: u16, body: String },

    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },

    #[error("request cancelled")]
    Cancelled,

    #[error("khoj API call failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<UpstreamError>,
    },
}

impl UpstreamError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServerStatus { .. } | Self::Transport(_) | Self::Decode(_)
        )
    }

    /// True when the caller's deadline expired, including after retries.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Exhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|s| format!(" with status {}", s))
        .unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read conversation state file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to write conversation state file {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse conversation state: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("failed to serialize conversation state: {0}")]
    Serialize(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("conversation ID cannot be empty")]
    EmptyHandle,

    #[error("KHOJ_API_KEY not set")]
    MissingApiKey,

    #[error("failed to create new conversation: {0}")]
    Session(#[source] UpstreamError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("conversation state task failed: {0}")]
    StoreTask(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("khoj API call failed: {0}")]
    Upstream(#[from] UpstreamError),
}

impl TranslateError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Upstream(e) => e.is_timeout(),
        }
    }
}
