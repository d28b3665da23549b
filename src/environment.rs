//! Browser environment seam
//!
//! The agent never drives a browser itself. Sessions are handed an
//! [`Environment`] by an [`EnvironmentFactory`]; the policy reads pages from it
//! and sends back serialized actions.

use crate::error::Result;
use crate::session::SessionSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One page as the environment reports it
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PageObservation {
    /// Simplified page markup
    pub html: String,
    /// Interactable elements; entries may be null
    #[serde(default)]
    pub clickable_elements: Vec<Option<serde_json::Value>>,
    #[serde(default)]
    pub tabs: Vec<serde_json::Value>,
    #[serde(default)]
    pub model_answer: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub terminated: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Anything else the environment sends along
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PageObservation {
    /// Non-null interactable elements, in page order
    pub fn valid_targets(&self) -> Vec<serde_json::Value> {
        self.clickable_elements.iter().flatten().cloned().collect()
    }
}

/// A live browsing session
#[async_trait]
pub trait Environment: Send {
    /// Current page, without acting
    async fn observation(&mut self) -> Result<PageObservation>;

    /// Apply one serialized action and return the resulting page
    async fn step(&mut self, action: &str) -> Result<PageObservation>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Creates one environment per session
#[async_trait]
pub trait EnvironmentFactory: Send + Sync {
    async fn create(&self, spec: &SessionSpec) -> Result<Box<dyn Environment>>;
}
