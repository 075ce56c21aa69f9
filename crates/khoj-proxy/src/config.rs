//! Configuration from defaults, an optional YAML file, environment variables
//! and CLI flags, applied in that order.
//!
//! ```yaml
//! api_base: "https://app.khoj.dev"
//! port: 3002
//! timeout: "2m"
//! max_body_bytes: 33554432
//! stream:
//!   chunk_size: 50
//!   frame_delay_ms: 5
//! attachments:
//!   min_len: 10000
//!   markers: ["<!DOCTYPE html>", "<html"]
//! ```
//!
//! **Environment variables:**
//! - `KHOJ_API_BASE`: backend base URL (default: https://app.khoj.dev)
//! - `KHOJ_API_KEY`: bearer token; empty or `dummy` means no key
//! - `PORT`: listen port (default: 3002)
//! - `KHOJ_TIMEOUT`: per-attempt chat timeout, e.g. `90`, `90s`, `2m`; `0` disables it (default: 120s)
//! - `KHOJ_STATE_FILE`: conversation state path (default: conversation_state.json)
//! - `KHOJ_AGENT_SLUG`: default agent for new conversations
//! - `KHOJ_REQUIRE_API_KEY`: refuse to start without an API key

use crate::conversation::DEFAULT_AGENT_SLUG;
use crate::server::ServerSettings;
use crate::state::DEFAULT_STATE_FILE;
use crate::streaming::StreamOptions;
use crate::translation::{AttachmentRule, DEFAULT_CLIENT_ID};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_API_BASE: &str = "https://app.khoj.dev";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Placeholder key some launchers export; treated as no key.
const PLACEHOLDER_API_KEY: &str = "dummy";

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub require_api_key: bool,
    pub timeout: Duration,
    pub state_file: PathBuf,
    pub agent_slug: String,
    pub client_id: String,
    pub attachments: AttachmentRule,
    pub server: ServerSettings,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            require_api_key: false,
            timeout: DEFAULT_TIMEOUT,
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            agent_slug: DEFAULT_AGENT_SLUG.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            attachments: AttachmentRule::default(),
            server: ServerSettings::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    api_base: Option<String>,
    api_key: Option<String>,
    port: Option<u16>,
    timeout: Option<String>,
    state_file: Option<PathBuf>,
    agent_slug: Option<String>,
    require_api_key: Option<bool>,
    max_body_bytes: Option<usize>,
    client_id: Option<String>,
    model_id: Option<String>,
    stream: Option<StreamOptions>,
    attachments: Option<AttachmentRule>,
}

/// Values given on the command line; they win over everything else.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub api_base: Option<String>,
    pub port: Option<u16>,
    pub state_file: Option<PathBuf>,
    pub require_api_key: bool,
}

impl ProxyConfig {
    /// Resolve against the process environment.
    pub fn load(config_file: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        Self::resolve(config_file, |key| env::var(key).ok(), overrides)
    }

    /// Resolve with an explicit environment lookup.
    pub fn resolve(
        config_file: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
        overrides: &Overrides,
    ) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {:?}", path))?;
            config.apply_yaml(&content)?;
        }
        config.apply_env(|key| env(key).filter(|v| !v.is_empty()))?;
        config.apply_overrides(overrides);

        config.api_key = config
            .api_key
            .filter(|k| !k.is_empty() && k != PLACEHOLDER_API_KEY);
        if config.api_key.is_none() {
            if config.require_api_key {
                bail!("KHOJ_API_KEY not set");
            }
            warn!("KHOJ_API_KEY not set, requests will be sent without authorization");
        }

        Ok(config)
    }

    fn apply_yaml(&mut self, content: &str) -> Result<()> {
        let file: FileConfig =
            serde_yaml_ng::from_str(content).context("Failed to parse config YAML")?;

        if let Some(v) = file.api_base {
            self.api_base = v;
        }
        if let Some(v) = file.api_key {
            self.api_key = Some(v);
        }
        if let Some(v) = file.port {
            self.server.port = v;
        }
        if let Some(v) = file.timeout {
            self.timeout =
                parse_duration(&v).with_context(|| format!("Invalid timeout {:?}", v))?;
        }
        if let Some(v) = file.state_file {
            self.state_file = v;
        }
        if let Some(v) = file.agent_slug {
            self.agent_slug = v;
        }
        if let Some(v) = file.require_api_key {
            self.require_api_key = v;
        }
        if let Some(v) = file.max_body_bytes {
            self.server.max_body_bytes = v;
        }
        if let Some(v) = file.client_id {
            self.client_id = v;
        }
        if let Some(v) = file.model_id {
            self.server.model_id = v;
        }
        if let Some(v) = file.stream {
            self.server.stream = v;
        }
        if let Some(v) = file.attachments {
            self.attachments = v;
        }
        Ok(())
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = env("KHOJ_API_BASE") {
            self.api_base = v;
        }
        if let Some(v) = env("KHOJ_API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = env("PORT") {
            self.server.port = v
                .parse()
                .with_context(|| format!("Invalid PORT {:?}", v))?;
        }
        if let Some(v) = env("KHOJ_TIMEOUT") {
            match parse_duration(&v) {
                Some(timeout) => self.timeout = timeout,
                None => warn!(value = %v, "ignoring invalid KHOJ_TIMEOUT"),
            }
        }
        if let Some(v) = env("KHOJ_STATE_FILE") {
            self.state_file = PathBuf::from(v);
        }
        if let Some(v) = env("KHOJ_AGENT_SLUG") {
            self.agent_slug = v;
        }
        if let Some(v) = env("KHOJ_REQUIRE_API_KEY") {
            self.require_api_key = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(v) = &overrides.api_base {
            self.api_base = v.clone();
        }
        if let Some(v) = overrides.port {
            self.server.port = v;
        }
        if let Some(v) = &overrides.state_file {
            self.state_file = v.clone();
        }
        if overrides.require_api_key {
            self.require_api_key = true;
        }
    }

    pub fn api_key_present(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Parse `"90"` (seconds), `"90s"`, `"2m"`, `"500ms"`, `"1h"` or compounds
/// such as `"1m30s"`. Out-of-range values are rejected like malformed ones.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
        rest = &rest[unit_len..];
    }
    Some(total)
}
