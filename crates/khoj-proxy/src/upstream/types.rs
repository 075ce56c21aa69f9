//! Khoj REST API wire types.

use serde::{Deserialize, Serialize};

/// Body for `POST {api_base}/api/chat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamChatRequest {
    pub q: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub conversation_id: String,
    /// Always `false`; streaming to the caller is emulated locally.
    pub stream: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<UpstreamFile>,
}

/// A file attachment carried next to the query instead of inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamFile {
    pub name: String,
    pub content: String,
    pub file_type: String,
    pub size: usize,
}

/// Response of `POST {api_base}/api/chat`.
///
/// Only `response` and `conversation_id` are used; the rest is kept so debug
/// logging can show what the backend sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamChatResponse {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub response: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_context: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_khoj: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Body for `POST {api_base}/api/chat/sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub agent_slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub conversation_id: String,
}

/// `null` decodes to the empty string, matching a missing field.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
