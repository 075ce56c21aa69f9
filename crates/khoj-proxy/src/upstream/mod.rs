//! Khoj backend client.
//!
//! Two endpoints are used:
//! - `POST {api_base}/api/chat/sessions` creates a conversation for an agent.
//! - `POST {api_base}/api/chat` sends a query within a conversation.
//!
//! Both are authenticated with `Authorization: Bearer <key>` when a key is
//! configured. The [`KhojApi`] trait is the seam the translator and the
//! conversation manager depend on.

mod client;
pub mod retry;
pub mod types;

pub use client::KhojClient;
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
pub use types::{UpstreamChatRequest, UpstreamChatResponse, UpstreamFile};

use crate::context::CallContext;
use crate::error::UpstreamError;
use async_trait::async_trait;

#[async_trait]
pub trait KhojApi: Send + Sync {
    /// Create a new remote conversation for `agent_slug`. Single attempt.
    async fn create_session(&self, agent_slug: &str) -> Result<String, UpstreamError>;

    /// Send a chat query, retrying transient failures.
    async fn chat(
        &self,
        ctx: &CallContext,
        request: &UpstreamChatRequest,
    ) -> Result<UpstreamChatResponse, UpstreamError>;
}
