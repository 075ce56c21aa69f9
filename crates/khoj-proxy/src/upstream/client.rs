use super::retry::RetryPolicy;
use super::types::{SessionRequest, SessionResponse, UpstreamChatRequest, UpstreamChatResponse};
use super::KhojApi;
use crate::context::CallContext;
use crate::error::UpstreamError;
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use std::time::Duration;
use tracing::{debug, info};

const USER_AGENT: &str = "KhojProvider/1.0";
const SESSION_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// HTTP client for the Khoj REST API.
#[derive(Debug, Clone)]
pub struct KhojClient {
    api_base: String,
    api_key: Option<String>,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl KhojClient {
    /// Build a client with a pooled connection set and a per-request timeout
    /// for chat calls. A zero `timeout` leaves chat attempts unbounded.
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .user_agent(USER_AGENT);
        if !timeout.is_zero() {
            builder = builder.timeout(timeout);
        }
        let http = builder.build()?;

        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            http,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn attempt_chat(
        &self,
        request: &UpstreamChatRequest,
        attempt: u32,
    ) -> Result<UpstreamChatResponse, UpstreamError> {
        let url = format!("{}/api/chat", self.api_base);
        debug!(url = %url, attempt = attempt + 1, "making khoj API call");

        let response = self
            .authorized(self.http.post(&url))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        debug!(status = status.as_u16(), body_len = body.len(), "khoj API response");

        if status != StatusCode::OK {
            let status_code = status.as_u16();
            return Err(if status.is_server_error() {
                UpstreamError::ServerStatus {
                    status: status_code,
                    body,
                }
            } else {
                UpstreamError::ClientStatus {
                    status: status_code,
                    body,
                }
            });
        }

        serde_json::from_str(&body).map_err(|e| {
            debug!(body = %body, "undecodable khoj response body");
            UpstreamError::Decode(e.to_string())
        })
    }
}

#[async_trait]
impl KhojApi for KhojClient {
    async fn create_session(&self, agent_slug: &str) -> Result<String, UpstreamError> {
        let url = format!("{}/api/chat/sessions", self.api_base);
        let body = SessionRequest {
            agent_slug: agent_slug.to_string(),
        };

        let response = self
            .authorized(self.http.post(&url))
            .timeout(SESSION_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamError::SessionCreation {
                status: None,
                body: e.to_string(),
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| UpstreamError::SessionCreation {
                status: Some(status.as_u16()),
                body: e.to_string(),
            })?;

        if status != StatusCode::OK {
            return Err(UpstreamError::SessionCreation {
                status: Some(status.as_u16()),
                body: text,
            });
        }

        let session: SessionResponse =
            serde_json::from_str(&text).map_err(|e| UpstreamError::SessionCreation {
                status: Some(status.as_u16()),
                body: format!("failed to decode session response: {}", e),
            })?;

        info!(agent_slug, conversation_id = %session.conversation_id, "created khoj conversation");
        Ok(session.conversation_id)
    }

    async fn chat(
        &self,
        ctx: &CallContext,
        request: &UpstreamChatRequest,
    ) -> Result<UpstreamChatResponse, UpstreamError> {
        ctx.check()?;
        ctx.run(
            self.retry
                .run(|attempt| self.attempt_chat(request, attempt)),
        )
        .await
    }
}
