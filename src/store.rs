//! Associative memory store
//!
//! Pieces are appended without exclusion. Embeddings and importance scores are
//! attached later, in batches, by [`MemoryStore::update`], and kept as one
//! sequence of records aligned with the piece prefix they cover. Retrieval
//! ranks that prefix by similarity, recency and importance.
//!
//! Locking:
//! - `update` is exclusive with itself (`update_lock`).
//! - `retrieve` holds a shared guard on the scored records; `update` only takes
//!   the exclusive guard for its merge, so reads overlap the network calls.
//! - `add` never waits on either; a piece added while a retrieval is ranking is
//!   simply not scored by that retrieval.

use crate::config::RecentWindows;
use crate::embedding::{dot, EmbeddingProvider};
use crate::error::{AgentError, Result};
use crate::llm::{parse_json, ChatModel, ChatRequest};
use crate::prompts;
use crate::telemetry::CallScope;
use crate::types::{MemoryKind, MemoryPiece, Timestamp, TracedPiece};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock as SyncRwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{Mutex as AsyncMutex, RwLock};

// ─── Retrieval options ────────────────────────────────────────────────────────

/// Per-kind multiplier applied to retrieval scores; unlisted kinds weigh 1
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct KindWeights(HashMap<MemoryKind, f32>);

impl KindWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: MemoryKind, weight: f32) -> Self {
        self.0.insert(kind, weight);
        self
    }

    pub fn get(&self, kind: MemoryKind) -> f32 {
        self.0.get(&kind).copied().unwrap_or(1.0)
    }
}

/// Which kinds must always be returned when recent enough
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecentFlags {
    pub observation: bool,
    pub action: bool,
    pub plan: bool,
    pub thought: bool,
}

impl RecentFlags {
    pub fn all() -> Self {
        Self {
            observation: true,
            action: true,
            plan: true,
            thought: true,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    /// Ranked pieces to return after the recent set
    pub n: usize,
    pub recent: RecentFlags,
    pub kind_weight: KindWeights,
    /// Run `update` before reading
    pub trigger_update: bool,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            n: 20,
            recent: RecentFlags::none(),
            kind_weight: KindWeights::new(),
            trigger_update: true,
        }
    }
}

// ─── Scoring ──────────────────────────────────────────────────────────────────

/// Who the importance rubric is scoring for
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ScoringProfile {
    pub persona: String,
    pub intent: String,
    pub plan: Option<String>,
}

#[derive(Serialize)]
struct ImportanceInput<'a> {
    persona: &'a str,
    intent: &'a str,
    memory: &'a str,
    plan: Option<&'a str>,
}

#[derive(Deserialize)]
struct ImportanceResponse {
    score: f32,
}

#[derive(Debug, Clone)]
struct ScoredRecord {
    embedding: Vec<f32>,
    importance: f32,
}

/// Outcome of one update pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Pieces embedded and scored by this pass
    pub processed: usize,
    /// Pieces covered by scored records after the pass
    pub scored: usize,
    /// Pieces in the store when the pass finished
    pub total: usize,
}

/// Composite retrieval score of one piece
fn composite_score(
    similarity: f32,
    piece_time: Timestamp,
    now: Timestamp,
    importance: f32,
    kind_weight: f32,
) -> f32 {
    let recency = (piece_time as f64 - now as f64).exp() as f32;
    (similarity + recency + importance) * kind_weight
}

// ─── Memory Store ─────────────────────────────────────────────────────────────

pub struct MemoryStore {
    pieces: SyncRwLock<Vec<MemoryPiece>>,
    scored: RwLock<Vec<ScoredRecord>>,
    update_lock: AsyncMutex<()>,
    clock: AtomicU64,
    profile: SyncRwLock<ScoringProfile>,
    windows: RecentWindows,
    update_history: Mutex<Vec<usize>>,
    chat: Arc<dyn ChatModel>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("pieces", &self.len())
            .field("timestamp", &self.timestamp())
            .field("embedder", &self.embedder.name())
            .finish()
    }
}

impl MemoryStore {
    pub fn new(
        chat: Arc<dyn ChatModel>,
        embedder: Arc<dyn EmbeddingProvider>,
        profile: ScoringProfile,
        windows: RecentWindows,
    ) -> Self {
        Self {
            pieces: SyncRwLock::new(Vec::new()),
            scored: RwLock::new(Vec::new()),
            update_lock: AsyncMutex::new(()),
            clock: AtomicU64::new(0),
            profile: SyncRwLock::new(profile),
            windows,
            update_history: Mutex::new(Vec::new()),
            chat,
            embedder,
        }
    }

    fn read_pieces(&self) -> RwLockReadGuard<'_, Vec<MemoryPiece>> {
        self.pieces.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_pieces(&self) -> RwLockWriteGuard<'_, Vec<MemoryPiece>> {
        self.pieces.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ─── Clock ────────────────────────────────────────────────────────────

    /// Current logical step
    pub fn timestamp(&self) -> Timestamp {
        self.clock.load(Ordering::SeqCst)
    }

    /// Move to the next step; returns the new timestamp
    pub fn advance(&self) -> Timestamp {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Replace the plan the importance rubric scores against
    pub fn set_plan(&self, plan: Option<String>) {
        self.profile
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .plan = plan;
    }

    fn profile(&self) -> ScoringProfile {
        self.profile
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    // ─── Append & inspect ─────────────────────────────────────────────────

    /// Stamp the piece with the current step and append it; returns its index.
    ///
    /// The clock is read under the write guard so insertion order never runs
    /// ahead of timestamp order.
    pub fn add(&self, mut piece: MemoryPiece) -> usize {
        let mut pieces = self.write_pieces();
        piece.timestamp = self.timestamp();
        pieces.push(piece);
        let index = pieces.len() - 1;
        tracing::debug!(
            index,
            kind = %pieces[index].kind(),
            timestamp = pieces[index].timestamp,
            "memory added"
        );
        index
    }

    pub fn len(&self) -> usize {
        self.read_pieces().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_pieces().is_empty()
    }

    /// Pieces covered by scored records
    pub async fn scored_len(&self) -> usize {
        self.scored.read().await.len()
    }

    /// Pieces still waiting for an update pass
    pub async fn pending(&self) -> usize {
        let scored = self.scored.read().await.len();
        self.len().saturating_sub(scored)
    }

    /// Processed-piece counts of past update passes, oldest first
    pub fn update_history(&self) -> Vec<usize> {
        self.update_history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn snapshot(&self) -> Vec<MemoryPiece> {
        self.read_pieces().clone()
    }

    /// Pieces from `start` to the end, plus the new end index
    pub fn since(&self, start: usize) -> (Vec<MemoryPiece>, usize) {
        let pieces = self.read_pieces();
        let start = start.min(pieces.len());
        (pieces[start..].to_vec(), pieces.len())
    }

    /// The last `n` pieces
    pub fn tail(&self, n: usize) -> Vec<MemoryPiece> {
        let pieces = self.read_pieces();
        pieces[pieces.len().saturating_sub(n)..].to_vec()
    }

    /// Most recently added piece of a kind
    pub fn last_of_kind(&self, kind: MemoryKind) -> Option<MemoryPiece> {
        self.read_pieces()
            .iter()
            .rev()
            .find(|p| p.kind() == kind)
            .cloned()
    }

    /// Serializable trace of every piece, in insertion order
    pub fn traced(&self) -> Vec<TracedPiece> {
        self.read_pieces().iter().map(MemoryPiece::to_traced).collect()
    }

    // ─── Update ───────────────────────────────────────────────────────────

    /// Embed and score every piece appended since the last pass.
    ///
    /// The batch is merged all at once; if any embedding or scoring call fails
    /// nothing is merged and the error is returned.
    pub async fn update(&self) -> Result<UpdateReport> {
        let _exclusive = self.update_lock.lock().await;

        let start = self.scored.read().await.len();
        let batch: Vec<String> = {
            let pieces = self.read_pieces();
            pieces[start.min(pieces.len())..]
                .iter()
                .map(|p| p.content.clone())
                .collect()
        };

        if batch.is_empty() {
            return Ok(UpdateReport {
                processed: 0,
                scored: start,
                total: self.len(),
            });
        }

        tracing::info!(
            pending = batch.len(),
            "updating memory: computing embeddings & importance"
        );

        let profile = self.profile();
        let (embeddings, importance) =
            futures::try_join!(self.embed_batch(&batch), self.score_batch(&batch, &profile))?;

        let processed = batch.len();
        let scored_total = {
            let mut scored = self.scored.write().await;
            let mut pieces = self.write_pieces();
            for (offset, (embedding, importance)) in
                embeddings.into_iter().zip(importance).enumerate()
            {
                let piece = &mut pieces[start + offset];
                piece.embedding = embedding.clone();
                piece.importance = importance;
                scored.push(ScoredRecord {
                    embedding,
                    importance,
                });
            }
            scored.len()
        };

        self.update_history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(processed);

        let report = UpdateReport {
            processed,
            scored: scored_total,
            total: self.len(),
        };
        tracing::info!(
            processed = report.processed,
            scored = report.scored,
            total = report.total,
            "memory updated"
        );
        Ok(report)
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let embeddings = self.embedder.embed(batch).await?;
        if embeddings.len() != batch.len() {
            return Err(AgentError::Embedding(format!(
                "{} returned {} vectors for {} texts",
                self.embedder.name(),
                embeddings.len(),
                batch.len()
            )));
        }
        Ok(embeddings)
    }

    async fn score_batch(&self, batch: &[String], profile: &ScoringProfile) -> Result<Vec<f32>> {
        try_join_all(batch.iter().map(|content| self.score_one(content, profile))).await
    }

    async fn score_one(&self, content: &str, profile: &ScoringProfile) -> Result<f32> {
        let input = serde_json::to_string(&ImportanceInput {
            persona: &profile.persona,
            intent: &profile.intent,
            memory: content,
            plan: profile.plan.as_deref(),
        })?;
        let request = ChatRequest::new(prompts::MEMORY_IMPORTANCE, input).json();
        let response = self.chat.chat(&request).await?;
        let parsed: ImportanceResponse = parse_json("importance", &response)?;
        Ok((parsed.score / 10.0).clamp(0.0, 1.0))
    }

    // ─── Retrieve ─────────────────────────────────────────────────────────

    /// Recent pieces for every enabled flag, followed by the top `n` scored
    /// pieces for `query`. The two parts are not deduplicated.
    pub async fn retrieve(
        &self,
        query: &str,
        options: &RetrieveOptions,
        trace: Option<&CallScope>,
    ) -> Result<Vec<MemoryPiece>> {
        if options.trigger_update {
            self.update().await?;
        }

        let scored = self.scored.read().await;
        let now = self.timestamp();
        let mut results = self.recent(&options.recent, now);

        if !scored.is_empty() {
            let query_embedding = self
                .embedder
                .embed(&[query.to_string()])
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| AgentError::Embedding("no vector for query".into()))?;
            results.extend(self.rank(&scored, &query_embedding, now, &options.kind_weight, options.n));
        }
        drop(scored);

        tracing::debug!(query, returned = results.len(), "memories retrieved");
        if let Some(scope) = trace {
            scope.record_retrieval(&results);
        }
        Ok(results)
    }

    /// Rank scored pieces against an already embedded query
    pub async fn rank_by_embedding(
        &self,
        query_embedding: &[f32],
        n: usize,
        kind_weight: &KindWeights,
    ) -> Vec<MemoryPiece> {
        let scored = self.scored.read().await;
        self.rank(&scored, query_embedding, self.timestamp(), kind_weight, n)
    }

    fn recent(&self, flags: &RecentFlags, now: Timestamp) -> Vec<MemoryPiece> {
        let windows = [
            (flags.observation, MemoryKind::Observation, self.windows.observation),
            (flags.action, MemoryKind::Action, self.windows.action),
            (flags.plan, MemoryKind::Plan, self.windows.plan),
            (flags.thought, MemoryKind::Thought, self.windows.thought),
        ];

        let pieces = self.read_pieces();
        let mut out = Vec::new();
        for (enabled, kind, window) in windows {
            if !enabled {
                continue;
            }
            out.extend(
                pieces
                    .iter()
                    .filter(|p| p.kind() == kind && p.timestamp + window >= now)
                    .cloned(),
            );
        }
        out
    }

    fn rank(
        &self,
        scored: &[ScoredRecord],
        query_embedding: &[f32],
        now: Timestamp,
        kind_weight: &KindWeights,
        n: usize,
    ) -> Vec<MemoryPiece> {
        let pieces = self.read_pieces();
        // Records never outrun pieces, but a piece may have been added since.
        let len = scored.len().min(pieces.len());

        let scores: Vec<f32> = (0..len)
            .map(|i| {
                let piece = &pieces[i];
                composite_score(
                    dot(&scored[i].embedding, query_embedding),
                    piece.timestamp,
                    now,
                    scored[i].importance,
                    kind_weight.get(piece.kind()),
                )
            })
            .collect();

        let mut order: Vec<usize> = (0..len).collect();
        // Stable: equal scores keep insertion order.
        order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(CmpOrdering::Equal));

        order
            .into_iter()
            .take(n)
            .map(|i| pieces[i].clone())
            .collect()
    }
}
