//! OpenAI <-> Khoj translation.
//!
//! This module implements the core format conversions:
//! - OpenAI `chat/completions` request -> Khoj `/api/chat` query (a flattened
//!   `"<role>: <content>"` transcript plus extracted file attachments)
//! - Khoj `/api/chat` response -> OpenAI `chat.completion`
//!
//! The remote conversation keeps its own turn history, keyed by the active
//! conversation handle; nothing here stores turns.

use crate::context::CallContext;
use crate::conversation::ConversationManager;
use crate::error::TranslateError;
use crate::types::{
    AssistantMessage, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, Role,
    Usage,
};
use crate::upstream::{KhojApi, UpstreamChatRequest, UpstreamFile};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_CLIENT_ID: &str = "khoj-provider-continue";

/// Decides which messages are shipped as file attachments instead of prompt
/// text.
///
/// Defaults match what editor integrations paste: a whole HTML document of
/// more than 10 000 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AttachmentRule {
    /// Content must be strictly longer than this many bytes.
    pub min_len: usize,
    /// Content must contain at least one of these markers.
    pub markers: Vec<String>,
    pub file_type: String,
}

impl Default for AttachmentRule {
    fn default() -> Self {
        Self {
            min_len: 10_000,
            markers: vec!["<!DOCTYPE html>".to_string(), "<html".to_string()],
            file_type: "html".to_string(),
        }
    }
}

impl AttachmentRule {
    pub fn matches(&self, content: &str) -> bool {
        content.len() > self.min_len && self.markers.iter().any(|m| content.contains(m.as_str()))
    }

    fn file_name(content: &str) -> &'static str {
        if content.contains("index.html") {
            "index.html"
        } else {
            "main.html"
        }
    }

    /// Turn `content` into an attachment plus the prompt placeholder that
    /// replaces it.
    pub fn extract(&self, content: String) -> (UpstreamFile, String) {
        let name = Self::file_name(&content);
        let size = content.len();
        let placeholder = format!("[File: {} ({} bytes) - sent in files array]", name, size);
        let file = UpstreamFile {
            name: name.to_string(),
            content,
            file_type: self.file_type.clone(),
            size,
        };
        (file, placeholder)
    }
}

/// The Khoj query built from an OpenAI message list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuiltPrompt {
    pub prompt: String,
    pub files: Vec<UpstreamFile>,
}

/// Flatten messages into one `"<role>: <content>\n"` line each, in order.
/// Messages matching `rule` are moved to the files list.
pub fn build_prompt(messages: &[ChatMessage], rule: &AttachmentRule) -> BuiltPrompt {
    let mut out = BuiltPrompt::default();

    for (i, msg) in messages.iter().enumerate() {
        let content = msg.text();
        let line = if rule.matches(&content) {
            let (file, placeholder) = rule.extract(content);
            debug!(
                message = i + 1,
                name = %file.name,
                size = file.size,
                "moving message content into files array"
            );
            out.files.push(file);
            placeholder
        } else {
            content
        };

        out.prompt.push_str(msg.role.as_str());
        out.prompt.push_str(": ");
        out.prompt.push_str(&line);
        out.prompt.push('\n');
    }

    out
}

/// `len / 4` estimate; total uses the combined length, not the sum of the
/// rounded parts.
pub fn estimate_usage(prompt: &str, completion: &str) -> Usage {
    Usage {
        prompt_tokens: (prompt.len() / 4) as u32,
        completion_tokens: (completion.len() / 4) as u32,
        total_tokens: ((prompt.len() + completion.len()) / 4) as u32,
    }
}

/// Translator settings.
#[derive(Debug, Clone)]
pub struct TranslatorOptions {
    pub client_id: String,
    pub attachments: AttachmentRule,
}

impl Default for TranslatorOptions {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            attachments: AttachmentRule::default(),
        }
    }
}

/// Maps OpenAI requests onto the active Khoj conversation.
pub struct Translator {
    api: Arc<dyn KhojApi>,
    conversations: Arc<ConversationManager>,
    options: TranslatorOptions,
}

impl Translator {
    pub fn new(
        api: Arc<dyn KhojApi>,
        conversations: Arc<ConversationManager>,
        options: TranslatorOptions,
    ) -> Self {
        Self {
            api,
            conversations,
            options,
        }
    }

    /// Build the upstream request for `messages` against the active
    /// conversation.
    pub async fn upstream_request(&self, messages: &[ChatMessage]) -> UpstreamChatRequest {
        let built = build_prompt(messages, &self.options.attachments);
        UpstreamChatRequest {
            q: built.prompt,
            conversation_id: self.conversations.active_handle().await,
            stream: false,
            client_id: self.options.client_id.clone(),
            files: built.files,
        }
    }

    /// Translate, call the backend, and map the answer back.
    pub async fn complete(
        &self,
        ctx: &CallContext,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, TranslateError> {
        info!(model = %request.model, messages = request.messages.len(), "processing chat completion");

        let upstream = self.upstream_request(&request.messages).await;
        debug!(
            prompt_len = upstream.q.len(),
            files = upstream.files.len(),
            conversation_id = %upstream.conversation_id,
            "khoj API request"
        );

        let answer = self.api.chat(ctx, &upstream).await?;
        debug!(response_len = answer.response.len(), "khoj API response");

        let created = Utc::now().timestamp();
        Ok(ChatCompletionResponse {
            id: format!("chatcmpl-{}", created),
            object: "chat.completion".to_string(),
            created,
            model: request.model.clone(),
            usage: estimate_usage(&upstream.q, &answer.response),
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: Role::Assistant,
                    content: answer.response,
                },
                finish_reason: "stop".to_string(),
            }],
        })
    }

    /// Send `text` verbatim as the query in the active conversation and
    /// return the answer.
    pub async fn ask(&self, ctx: &CallContext, text: &str) -> Result<String, TranslateError> {
        let request = UpstreamChatRequest {
            q: text.to_string(),
            conversation_id: self.conversations.active_handle().await,
            stream: false,
            client_id: self.options.client_id.clone(),
            files: vec![],
        };
        let answer = self.api.chat(ctx, &request).await?;
        Ok(answer.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::testing::{memory_manager, MockKhoj};
    use crate::error::UpstreamError;

    fn html_doc(extra: &str) -> String {
        let mut doc = format!("<!DOCTYPE html><html><head><title>{}</title></head><body>", extra);
        while doc.len() <= 10_000 {
            doc.push_str("<p>lorem ipsum dolor sit amet</p>");
        }
        doc.push_str("</body></html>");
        doc
    }

    #[test]
    fn prompt_is_role_prefixed_lines_in_order() {
        let messages = vec![
            ChatMessage::new(Role::System, "be terse"),
            ChatMessage::new(Role::User, "hi"),
            ChatMessage::new(Role::Assistant, "hello"),
            ChatMessage::new(Role::User, "bye"),
        ];

        let built = build_prompt(&messages, &AttachmentRule::default());
        assert_eq!(
            built.prompt,
            "system: be terse\nuser: hi\nassistant: hello\nuser: bye\n"
        );
        assert!(built.files.is_empty());
    }

    #[test]
    fn empty_messages_give_empty_prompt() {
        let built = build_prompt(&[], &AttachmentRule::default());
        assert_eq!(built, BuiltPrompt::default());
    }

    #[test]
    fn large_html_moves_to_files() {
        let page = html_doc("index.html");
        let messages = vec![
            ChatMessage::new(Role::User, page.clone()),
            ChatMessage::new(Role::User, "fix the header"),
        ];

        let built = build_prompt(&messages, &AttachmentRule::default());
        assert!(!built.prompt.contains(&page));
        assert_eq!(built.files.len(), 1);
        assert_eq!(built.files[0].name, "index.html");
        assert_eq!(built.files[0].file_type, "html");
        assert_eq!(built.files[0].size, page.len());
        assert_eq!(
            built.prompt,
            format!(
                "user: [File: index.html ({} bytes) - sent in files array]\nuser: fix the header\n",
                page.len()
            )
        );
    }

    #[test]
    fn each_qualifying_message_is_attached() {
        let messages = vec![
            ChatMessage::new(Role::User, html_doc("a")),
            ChatMessage::new(Role::Assistant, html_doc("b")),
        ];

        let built = build_prompt(&messages, &AttachmentRule::default());
        assert_eq!(built.files.len(), 2);
        assert!(built.files.iter().all(|f| f.name == "main.html"));
    }

    #[test]
    fn either_condition_alone_does_not_attach() {
        let rule = AttachmentRule::default();
        let small_html = "<html><body>tiny</body></html>";
        let large_text = "x".repeat(20_000);

        assert!(!rule.matches(small_html));
        assert!(!rule.matches(&large_text));

        let exactly_threshold = {
            let mut s = "<html>".to_string();
            s.push_str(&"y".repeat(10_000 - s.len()));
            s
        };
        assert_eq!(exactly_threshold.len(), 10_000);
        assert!(!rule.matches(&exactly_threshold));

        let built = build_prompt(
            &[
                ChatMessage::new(Role::User, small_html),
                ChatMessage::new(Role::User, large_text.clone()),
            ],
            &rule,
        );
        assert!(built.files.is_empty());
        assert!(built.prompt.contains(&large_text));
    }

    #[test]
    fn usage_uses_combined_length_for_total() {
        let usage = estimate_usage("abc", "defgh");
        assert_eq!(usage.prompt_tokens, 0);
        assert_eq!(usage.completion_tokens, 1);
        assert_eq!(usage.total_tokens, 2);

        let usage = estimate_usage("user: hi\n", "hello");
        assert_eq!(usage.prompt_tokens, 9 / 4);
        assert_eq!(usage.completion_tokens, 5 / 4);
        assert_eq!(usage.total_tokens, (9 + 5) / 4);
    }

    #[tokio::test]
    async fn complete_maps_backend_answer() {
        let api = Arc::new(MockKhoj::answering("hello"));
        let (manager, _dir) = memory_manager(api.clone(), Some("abc"));
        let translator = Translator::new(api.clone(), manager, TranslatorOptions::default());

        let request = ChatCompletionRequest {
            model: "khoj-chat".to_string(),
            messages: vec![ChatMessage::new(Role::User, "hi")],
            temperature: None,
            max_tokens: None,
            stream: true,
            tools: None,
        };
        let resp = translator
            .complete(&CallContext::new(), &request)
            .await
            .unwrap();

        assert_eq!(resp.object, "chat.completion");
        assert!(resp.id.starts_with("chatcmpl-"));
        assert_eq!(resp.model, "khoj-chat");
        assert_eq!(resp.choices.len(), 1);
        assert_eq!(resp.choices[0].message.role, Role::Assistant);
        assert_eq!(resp.content(), "hello");
        assert_eq!(resp.choices[0].finish_reason, "stop");
        assert_eq!(resp.usage, estimate_usage("user: hi\n", "hello"));

        let sent = api.last_request().unwrap();
        assert_eq!(sent.q, "user: hi\n");
        assert_eq!(sent.conversation_id, "abc");
        assert!(!sent.stream);
        assert_eq!(sent.client_id, DEFAULT_CLIENT_ID);
    }

    #[tokio::test]
    async fn complete_propagates_upstream_failure() {
        let api = Arc::new(MockKhoj::failing(|| UpstreamError::ClientStatus {
            status: 404,
            body: "no such conversation".to_string(),
        }));
        let (manager, _dir) = memory_manager(api.clone(), Some("abc"));
        let translator = Translator::new(api.clone(), manager, TranslatorOptions::default());

        let request = ChatCompletionRequest {
            model: "m".to_string(),
            messages: vec![],
            temperature: None,
            max_tokens: None,
            stream: false,
            tools: None,
        };
        let err = translator
            .complete(&CallContext::new(), &request)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TranslateError::Upstream(UpstreamError::ClientStatus { status: 404, .. })
        ));
        assert_eq!(api.chat_calls(), 1);
    }
}
