//! Chat capability consumed by the cognition loop
//!
//! Model routing, retries, backoff and admission control belong to the
//! implementor of [`ChatModel`]; the agent treats every error it returns as
//! final for the current call.

use crate::error::{AgentError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Which model tier a call should be routed to
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelSize {
    /// Fast model for the foreground loop
    #[default]
    Small,
    /// Slower, stronger model (planning, reflection, wondering)
    Large,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// One chat completion request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub mode: ModelSize,
    /// When set, the response text must be a JSON document
    pub json_mode: bool,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub const DEFAULT_MAX_TOKENS: u32 = 64_000;

    /// System prompt followed by a single user turn
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            mode: ModelSize::Small,
            json_mode: false,
            max_tokens: Self::DEFAULT_MAX_TOKENS,
        }
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    pub fn with_mode(mut self, mode: ModelSize) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<String>;
}

/// Decode a JSON-mode response into the shape a phase expects.
///
/// Accepts a bare document or one embedded in surrounding prose.
pub fn parse_json<T: DeserializeOwned>(phase: &'static str, text: &str) -> Result<T> {
    match serde_json::from_str(text) {
        Ok(value) => Ok(value),
        Err(first) => {
            let embedded = match (text.find('{'), text.rfind('}')) {
                (Some(start), Some(end)) if start < end => &text[start..=end],
                _ => return Err(AgentError::malformed(phase, first.to_string())),
            };
            serde_json::from_str(embedded).map_err(|e| AgentError::malformed(phase, e.to_string()))
        }
    }
}
