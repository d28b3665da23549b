//! Persisted session traces
//!
//! Layout of one run directory:
//!
//! ```text
//! runs/2026-01-31_14-02-11_3fa9/
//!     basic_info.json          session spec
//!     action_trace.json        serialized actions, in order
//!     memory_trace.json        every memory piece (no embeddings)
//!     observation_trace/       perceived description per step
//!     api_trace/               one file per traced model call
//!     <run name>.txt           final memory dump
//!     error.txt                only when the session failed
//! ```

use crate::error::{AgentError, Result};
use crate::types::{MemoryKind, Timestamp, TracedPiece};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const MEMORY_TRACE: &str = "memory_trace.json";
pub const ACTION_TRACE: &str = "action_trace.json";
pub const BASIC_INFO: &str = "basic_info.json";

/// One session's output directory
#[derive(Debug, Clone)]
pub struct RunDirectory {
    path: PathBuf,
    name: String,
}

impl RunDirectory {
    /// Create a fresh, uniquely named run directory under `root`
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}_{}", Utc::now().format("%Y-%m-%d_%H-%M-%S"), &suffix[..4]);
        let path = root.as_ref().join(&name);
        std::fs::create_dir_all(path.join("observation_trace"))?;
        tracing::info!(run_dir = %path.display(), "run directory created");
        Ok(Self { path, name })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn write_json<T: Serialize + ?Sized>(&self, file: &str, value: &T) -> Result<()> {
        let out = std::fs::File::create(self.path.join(file))?;
        serde_json::to_writer_pretty(out, value)?;
        Ok(())
    }

    pub fn write_basic_info<T: Serialize>(&self, info: &T) -> Result<()> {
        self.write_json(BASIC_INFO, info)
    }

    pub fn write_actions(&self, actions: &[String]) -> Result<()> {
        self.write_json(ACTION_TRACE, actions)
    }

    pub fn write_memory(&self, pieces: &[TracedPiece]) -> Result<()> {
        self.write_json(MEMORY_TRACE, pieces)
    }

    pub fn write_observation(&self, step: usize, observation: &str) -> Result<()> {
        let file = self
            .path
            .join("observation_trace")
            .join(format!("observation_{step}.txt"));
        std::fs::write(file, observation)?;
        Ok(())
    }

    /// Final memory dump, named after the run
    pub fn write_summary(&self, formatted_memories: &str) -> Result<()> {
        std::fs::write(self.path.join(format!("{}.txt", self.name)), formatted_memories)?;
        Ok(())
    }

    pub fn write_error(&self, error: &str) -> Result<()> {
        std::fs::write(self.path.join("error.txt"), error)?;
        Ok(())
    }
}

/// Load a memory trace from a file or from a run directory containing one
pub fn read_memory_trace(path: impl AsRef<Path>) -> Result<Vec<TracedPiece>> {
    let path = path.as_ref();
    let file = if path.is_dir() {
        path.join(MEMORY_TRACE)
    } else {
        path.to_path_buf()
    };
    let raw = std::fs::read_to_string(&file)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Most recently modified run directory under `root`
pub fn latest_run(root: impl AsRef<Path>) -> Result<PathBuf> {
    let root = root.as_ref();
    let mut latest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if latest.as_ref().map_or(true, |(best, _)| modified > *best) {
            latest = Some((modified, entry.path()));
        }
    }
    latest
        .map(|(_, path)| path)
        .ok_or_else(|| AgentError::Configuration(format!("no runs under {}", root.display())))
}

/// Per-kind counts and mean importance of a trace
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KindSummary {
    pub count: usize,
    pub scored: usize,
    /// Over scored pieces only
    pub mean_importance: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TraceSummary {
    pub total: usize,
    pub unscored: usize,
    pub last_timestamp: Option<Timestamp>,
    pub by_kind: BTreeMap<MemoryKind, KindSummary>,
}

impl TraceSummary {
    pub fn from_pieces(pieces: &[TracedPiece]) -> Self {
        let mut summary = TraceSummary {
            total: pieces.len(),
            ..Default::default()
        };
        let mut sums: BTreeMap<MemoryKind, f32> = BTreeMap::new();

        for piece in pieces {
            let entry = summary.by_kind.entry(piece.kind).or_default();
            entry.count += 1;
            if piece.importance >= 0.0 {
                entry.scored += 1;
                *sums.entry(piece.kind).or_default() += piece.importance;
            } else {
                summary.unscored += 1;
            }
            summary.last_timestamp = summary.last_timestamp.max(Some(piece.timestamp));
        }

        for (kind, entry) in summary.by_kind.iter_mut() {
            if entry.scored > 0 {
                entry.mean_importance = sums.get(kind).map(|sum| sum / entry.scored as f32);
            }
        }
        summary
    }
}
