//! Streaming emulation (SSE).
//!
//! Khoj answers synchronously, but editor clients usually ask for
//! `stream: true`. The complete answer is fetched first, then sliced into
//! fixed-size pieces and sent as OpenAI-style `data: {json}` frames with a
//! small pacing delay, followed by a terminal `finish_reason: "stop"` frame
//! and the literal `data: [DONE]` marker.
//!
//! If the fetch fails, a single `{"error": {...}}` frame is sent instead and
//! the stream ends without `[DONE]`.

use crate::context::CallContext;
use crate::translation::Translator;
use crate::types::{ChatCompletionRequest, ChatCompletionResponse};
use async_stream::stream;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Chunking and pacing for emulated streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Characters per content frame.
    pub chunk_size: usize,
    #[serde(with = "millis", rename = "frame_delay_ms")]
    pub frame_delay: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            frame_delay: Duration::from_millis(5),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Which OpenAI chunk shape to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `chat.completion.chunk` with `choices[0].delta.content`.
    Chat,
    /// Legacy `text_completion` with `choices[0].text`.
    Text,
}

/// Split `content` into pieces of at most `size` characters, never inside a
/// UTF-8 sequence. Only the last piece may be shorter.
pub fn chunk_text(content: &str, size: usize) -> Vec<&str> {
    let size = size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut count = 0;

    for (idx, _) in content.char_indices() {
        if count == size {
            chunks.push(&content[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < content.len() {
        chunks.push(&content[start..]);
    }
    chunks
}

fn sse_data(data: &Value) -> String {
    format!("data: {}\n\n", data)
}

fn chunk_frame(resp: &ChatCompletionResponse, kind: FrameKind, piece: Option<&str>) -> Value {
    let finish_reason = if piece.is_some() { Value::Null } else { json!("stop") };
    match kind {
        FrameKind::Chat => {
            let delta = match piece {
                Some(text) => json!({"content": text}),
                None => json!({}),
            };
            json!({
                "id": resp.id,
                "object": "chat.completion.chunk",
                "created": resp.created,
                "model": resp.model,
                "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
            })
        }
        FrameKind::Text => json!({
            "id": resp.id.replacen("chatcmpl-", "cmpl-", 1),
            "object": "text_completion",
            "created": resp.created,
            "model": resp.model,
            "choices": [{
                "text": piece.unwrap_or(""),
                "index": 0,
                "logprobs": null,
                "finish_reason": finish_reason
            }]
        }),
    }
}

/// SSE error frame sent when the upstream fetch fails.
pub fn error_frame(message: &str) -> String {
    sse_data(&json!({"error": {"message": message, "type": "api_error"}}))
}

/// Replay an already-complete response as a paced SSE frame sequence.
///
/// `ctx` is checked before every frame; once cancelled, nothing more is sent
/// (no terminal frame, no `[DONE]`).
pub fn emulate_stream(
    response: ChatCompletionResponse,
    kind: FrameKind,
    options: StreamOptions,
    ctx: CallContext,
) -> impl Stream<Item = String> + Send {
    stream! {
        let content = response.content().to_string();

        for piece in chunk_text(&content, options.chunk_size) {
            if ctx.is_cancelled() {
                debug!("client disconnected during streaming");
                return;
            }
            yield sse_data(&chunk_frame(&response, kind, Some(piece)));
            if !options.frame_delay.is_zero() {
                tokio::time::sleep(options.frame_delay).await;
            }
        }

        if ctx.is_cancelled() {
            debug!("client disconnected during streaming");
            return;
        }
        yield sse_data(&chunk_frame(&response, kind, None));
        yield DONE_FRAME.to_string();
    }
}

/// Fetch the whole answer through `translator`, then emulate a stream of it.
///
/// The returned stream owns a drop guard on `ctx`: dropping the stream (e.g.
/// on client disconnect) cancels the in-flight upstream call.
pub fn stream_completion(
    translator: Arc<Translator>,
    request: ChatCompletionRequest,
    kind: FrameKind,
    options: StreamOptions,
    ctx: CallContext,
) -> impl Stream<Item = String> + Send {
    let guard = ctx.drop_guard();

    stream! {
        let _guard = guard;

        match translator.complete(&ctx, &request).await {
            Ok(response) => {
                let mut frames = pin!(emulate_stream(response, kind, options, ctx.clone()));
                while let Some(frame) = frames.next().await {
                    yield frame;
                }
            }
            Err(e) => {
                error!(error = %e, "error in chat completion");
                yield error_frame(&e.to_string());
            }
        }
    }
}
