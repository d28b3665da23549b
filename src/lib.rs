//! # Shopper Mind - cognition loop and associative memory for synthetic web shoppers
//!
//! An [`Agent`] holds a persona, a shopping intent and a [`MemoryStore`]. The
//! [`CognitivePolicy`] drives it one page at a time (perceive, feedback, plan,
//! act) while a background loop reflects, wonders and scores memories. The
//! [`SessionOrchestrator`] runs many such shoppers concurrently.

pub mod agent;
pub mod config;
pub mod embedding;
pub mod environment;
pub mod error;
pub mod llm;
pub mod policy;
pub mod prompts;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod trace;
pub mod types;

#[cfg(test)]
mod testing;

pub use agent::Agent;
pub use config::{
    AgentConfig, AgentConfigBuilder, OrchestratorConfig, RecentWindows, SlowLoopConfig,
};
pub use embedding::{dot, EmbeddingProvider, HashEmbeddingProvider};
pub use environment::{Environment, EnvironmentFactory, PageObservation};
pub use error::{AgentError, Result};
pub use llm::{parse_json, ChatMessage, ChatModel, ChatRequest, ModelSize, Role};
pub use policy::{CognitivePolicy, SlowLoop, SlowLoopStats};
pub use session::{SessionOrchestrator, SessionOutcome, SessionSpec};
pub use store::{
    KindWeights, MemoryStore, RecentFlags, RetrieveOptions, ScoringProfile, UpdateReport,
};
pub use telemetry::{ApiTracer, CallScope};
pub use trace::{latest_run, read_memory_trace, KindSummary, RunDirectory, TraceSummary};
pub use types::{format_memories, MemoryKind, MemoryPiece, PiecePayload, Timestamp, TracedPiece};
