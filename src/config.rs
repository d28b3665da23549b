//! Agent, background-loop and orchestrator configuration

use crate::error::{AgentError, Result};
use crate::store::KindWeights;
use crate::types::MemoryKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How far back (in steps) each kind counts as "recent" during retrieval
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecentWindows {
    pub observation: u64,
    pub action: u64,
    pub plan: u64,
    pub thought: u64,
}

impl Default for RecentWindows {
    fn default() -> Self {
        Self {
            observation: 3,
            action: 5,
            plan: 5,
            thought: 5,
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Ranked pieces returned by each retrieval (on top of the recent set)
    pub retrieve_limit: usize,
    pub recent_windows: RecentWindows,
    /// How many trailing pieces `wonder` looks at
    pub wonder_window: usize,
    /// Terms masked out of the page before perception
    pub deny_list: Vec<String>,
    pub perceive_max_tokens: u32,
    pub default_max_tokens: u32,
    /// `None` re-prompts until the planner answers well-formed
    pub max_plan_attempts: Option<u32>,
    pub plan_kind_weights: KindWeights,
    pub act_kind_weights: KindWeights,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            retrieve_limit: 20,
            recent_windows: RecentWindows::default(),
            wonder_window: 50,
            deny_list: ["Crime", "crime", "Security", "security"]
                .into_iter()
                .map(String::from)
                .collect(),
            perceive_max_tokens: 64_000,
            default_max_tokens: 64_000,
            max_plan_attempts: Some(10),
            plan_kind_weights: KindWeights::new()
                .with(MemoryKind::Action, 10.0)
                .with(MemoryKind::Plan, 10.0)
                .with(MemoryKind::Thought, 10.0)
                .with(MemoryKind::Reflection, 10.0),
            act_kind_weights: KindWeights::new()
                .with(MemoryKind::Observation, 0.0)
                .with(MemoryKind::Action, 10.0)
                .with(MemoryKind::Thought, 10.0),
        }
    }
}

impl AgentConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            AgentError::Configuration(format!("{}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retrieve_limit == 0 {
            return Err(AgentError::Configuration(
                "retrieve_limit must be positive".into(),
            ));
        }
        if self.max_plan_attempts == Some(0) {
            return Err(AgentError::Configuration(
                "max_plan_attempts must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for agent config
pub struct AgentConfigBuilder {
    config: AgentConfig,
}

impl AgentConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AgentConfig::default(),
        }
    }

    pub fn retrieve_limit(mut self, limit: usize) -> Self {
        self.config.retrieve_limit = limit;
        self
    }

    pub fn recent_windows(mut self, windows: RecentWindows) -> Self {
        self.config.recent_windows = windows;
        self
    }

    pub fn wonder_window(mut self, window: usize) -> Self {
        self.config.wonder_window = window;
        self
    }

    pub fn deny_list(mut self, terms: Vec<String>) -> Self {
        self.config.deny_list = terms;
        self
    }

    pub fn max_plan_attempts(mut self, attempts: Option<u32>) -> Self {
        self.config.max_plan_attempts = attempts;
        self
    }

    pub fn build(self) -> AgentConfig {
        self.config
    }
}

impl Default for AgentConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Background reflect/wonder/update loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlowLoopConfig {
    pub enabled: bool,
    /// Pause after a failed iteration only; successful iterations run back to back
    pub failure_backoff_ms: u64,
}

impl Default for SlowLoopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_backoff_ms: 1_000,
        }
    }
}

impl SlowLoopConfig {
    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }
}

/// Session orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Sessions allowed to run at once
    pub concurrency: usize,
    pub max_steps: usize,
    pub close_timeout_ms: u64,
    /// Where per-session run directories go; `None` keeps everything in memory
    pub runs_dir: Option<PathBuf>,
    pub agent: AgentConfig,
    pub slow_loop: SlowLoopConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_steps: 50,
            close_timeout_ms: 10_000,
            runs_dir: None,
            agent: AgentConfig::default(),
            slow_loop: SlowLoopConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            AgentError::Configuration(format!("{}: {e}", path.display()))
        })?;
        if config.concurrency == 0 {
            return Err(AgentError::Configuration(
                "concurrency must be positive".into(),
            ));
        }
        config.agent.validate()?;
        Ok(config)
    }
}
