//! Khoj Proxy - OpenAI-compatible HTTP adapter for the Khoj chat API.
//!
//! Editor integrations speak OpenAI's `/v1/chat/completions`. This crate
//! exposes that surface and forwards every request into one long-lived Khoj
//! conversation:
//! - Flatten the OpenAI message list into a Khoj query, moving large HTML
//!   documents into the `files` array.
//! - Call Khoj with retry and linear backoff.
//! - Map the answer back to `chat.completion`, or replay it as SSE chunks
//!   when the client asked for a stream.
//! - Keep the active conversation handle and agent in a small JSON state file.

pub mod cli;
pub mod config;
pub mod context;
pub mod control;
pub mod conversation;
pub mod error;
pub mod server;
pub mod state;
pub mod streaming;
pub mod translation;
pub mod types;
pub mod upstream;

pub use config::ProxyConfig;
pub use context::CallContext;
pub use control::Control;
pub use conversation::ConversationManager;
pub use server::{ServerHandle, ServerSettings};
pub use translation::Translator;
