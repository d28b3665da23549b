//! Memory piece types

use serde::{Deserialize, Serialize};

/// Logical step index, advanced once per environment step
pub type Timestamp = u64;

/// Importance value of a piece that has not been scored yet
pub const UNSCORED: f32 = -1.0;

/// Kinds of memory pieces
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// What the agent perceived on the page
    Observation,
    /// Higher-level insight distilled from other pieces
    Reflection,
    /// A plan with a concrete next step
    Plan,
    /// A UI action the agent decided to take
    Action,
    /// Free-form thought (feedback, rationale, wondering)
    Thought,
}

impl MemoryKind {
    /// All memory kinds
    pub const ALL: &[MemoryKind] = &[
        MemoryKind::Observation,
        MemoryKind::Reflection,
        MemoryKind::Plan,
        MemoryKind::Action,
        MemoryKind::Thought,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Observation => "observation",
            MemoryKind::Reflection => "reflection",
            MemoryKind::Plan => "plan",
            MemoryKind::Action => "action",
            MemoryKind::Thought => "thought",
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        MemoryKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown memory kind: {s}"))
    }
}

/// Kind-specific payload carried next to the shared fields
#[derive(Debug, Clone, PartialEq)]
pub enum PiecePayload {
    /// Raw environment payload the observation was condensed from
    Observation { original: serde_json::Value },
    Reflection,
    Plan { next_step: String },
    /// Structured action descriptor as returned by the model
    Action { raw_action: serde_json::Value },
    Thought,
}

/// One atomic recorded event or thought in an agent's memory
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryPiece {
    /// Text payload (what gets embedded and scored)
    pub content: String,
    pub payload: PiecePayload,
    /// Assigned by the store on append
    pub timestamp: Timestamp,
    /// Empty until the store's update pass processes the piece
    pub embedding: Vec<f32>,
    /// Normalized salience in [0, 1], `UNSCORED` until processed
    pub importance: f32,
}

impl MemoryPiece {
    fn with_payload(content: impl Into<String>, payload: PiecePayload) -> Self {
        Self {
            content: content.into(),
            payload,
            timestamp: 0,
            embedding: Vec::new(),
            importance: UNSCORED,
        }
    }

    pub fn observation(content: impl Into<String>, original: serde_json::Value) -> Self {
        Self::with_payload(content, PiecePayload::Observation { original })
    }

    pub fn reflection(content: impl Into<String>) -> Self {
        Self::with_payload(content, PiecePayload::Reflection)
    }

    pub fn plan(content: impl Into<String>, next_step: impl Into<String>) -> Self {
        Self::with_payload(
            content,
            PiecePayload::Plan {
                next_step: next_step.into(),
            },
        )
    }

    pub fn action(content: impl Into<String>, raw_action: serde_json::Value) -> Self {
        Self::with_payload(content, PiecePayload::Action { raw_action })
    }

    pub fn thought(content: impl Into<String>) -> Self {
        Self::with_payload(content, PiecePayload::Thought)
    }

    pub fn kind(&self) -> MemoryKind {
        match self.payload {
            PiecePayload::Observation { .. } => MemoryKind::Observation,
            PiecePayload::Reflection => MemoryKind::Reflection,
            PiecePayload::Plan { .. } => MemoryKind::Plan,
            PiecePayload::Action { .. } => MemoryKind::Action,
            PiecePayload::Thought => MemoryKind::Thought,
        }
    }

    /// Next step text, for plans
    pub fn next_step(&self) -> Option<&str> {
        match &self.payload {
            PiecePayload::Plan { next_step } => Some(next_step),
            _ => None,
        }
    }

    /// Structured action, for actions
    pub fn raw_action(&self) -> Option<&serde_json::Value> {
        match &self.payload {
            PiecePayload::Action { raw_action } => Some(raw_action),
            _ => None,
        }
    }

    pub fn is_scored(&self) -> bool {
        self.importance >= 0.0
    }

    /// Render as one line of model input
    pub fn render(&self) -> String {
        let importance = if self.is_scored() {
            format!("{:.2}", self.importance)
        } else {
            "N/A".to_string()
        };
        format!(
            "timestamp: {}; kind: {}; importance: {}, content: {}",
            self.timestamp,
            self.kind(),
            importance,
            self.content
        )
    }

    pub fn to_traced(&self) -> TracedPiece {
        TracedPiece {
            kind: self.kind(),
            content: self.content.clone(),
            timestamp: self.timestamp,
            importance: self.importance,
        }
    }
}

/// Serialized form of a piece in a persisted memory trace (no embeddings)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TracedPiece {
    pub kind: MemoryKind,
    pub content: String,
    pub timestamp: Timestamp,
    pub importance: f32,
}

impl TracedPiece {
    /// Same grouping `format_memories` uses when sorting
    pub fn sort_by_kind(pieces: &mut [TracedPiece]) {
        pieces.sort_by(|a, b| kind_then_time((a.kind, a.timestamp), (b.kind, b.timestamp)));
    }

    pub fn render(&self) -> String {
        let importance = if self.importance >= 0.0 {
            format!("{:.2}", self.importance)
        } else {
            "N/A".to_string()
        };
        format!(
            "timestamp: {}; kind: {}; importance: {}, content: {}",
            self.timestamp, self.kind, importance, self.content
        )
    }
}

/// Display grouping: kind name alphabetically, then timestamp
pub fn kind_then_time(a: (MemoryKind, Timestamp), b: (MemoryKind, Timestamp)) -> std::cmp::Ordering {
    a.0.as_str().cmp(b.0.as_str()).then(a.1.cmp(&b.1))
}

/// Render pieces as model input lines, optionally grouped by kind then time
pub fn format_memories(pieces: &[MemoryPiece], sort_by_kind: bool) -> Vec<String> {
    let mut refs: Vec<&MemoryPiece> = pieces.iter().collect();
    if sort_by_kind {
        refs.sort_by(|a, b| kind_then_time((a.kind(), a.timestamp), (b.kind(), b.timestamp)));
    }
    refs.into_iter().map(MemoryPiece::render).collect()
}
