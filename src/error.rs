//! Error types for the shopper agent

use thiserror::Error;

/// Main error type for the cognition loop and memory store
#[derive(Error, Debug)]
pub enum AgentError {
    /// Chat capability failed
    #[error("Chat call failed: {0}")]
    Chat(String),

    /// Embedding capability failed
    #[error("Embedding failed: {0}")]
    Embedding(String),

    /// The model answered, but not in the shape the phase needs
    #[error("Malformed {phase} response: {detail}")]
    MalformedResponse { phase: &'static str, detail: String },

    /// A phase was called without the state it depends on
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// Environment collaborator failed
    #[error("Environment error: {0}")]
    Environment(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    pub fn malformed(phase: &'static str, detail: impl Into<String>) -> Self {
        AgentError::MalformedResponse {
            phase,
            detail: detail.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AgentError>;
