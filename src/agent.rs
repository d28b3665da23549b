//! # Shopper Agent
//!
//! One synthetic shopper: a persona, a shopping intent, an associative memory
//! and the cognitive phases that read from and write to it.
//!
//! - Fast phases (`perceive`, `feedback`, `plan`, `act`) run once per step
//!   and are traced as API calls.
//! - Slow phases (`reflect`, `wonder`) run in the background loop owned by the
//!   policy and use the large model.

use crate::config::AgentConfig;
use crate::embedding::EmbeddingProvider;
use crate::environment::PageObservation;
use crate::error::{AgentError, Result};
use crate::llm::{parse_json, ChatModel, ChatRequest, ModelSize};
use crate::prompts;
use crate::store::{MemoryStore, RecentFlags, RetrieveOptions, ScoringProfile};
use crate::telemetry::{ApiTracer, CallScope};
use crate::types::{format_memories, MemoryKind, MemoryPiece, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

// ─── Model inputs & outputs ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct PerceiveResponse {
    observations: Vec<String>,
}

#[derive(Deserialize)]
struct ThoughtsResponse {
    thoughts: Vec<String>,
}

#[derive(Deserialize)]
struct InsightsResponse {
    insights: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
struct PlanResponse {
    plan: String,
    rationale: String,
    next_step: String,
}

#[derive(Deserialize)]
struct ActResponse {
    actions: Vec<serde_json::Value>,
}

#[derive(Serialize)]
struct FeedbackInput<'a> {
    persona: &'a str,
    last_action: &'a serde_json::Value,
    last_plan: &'a str,
    observation: &'a str,
}

#[derive(Serialize)]
struct ReflectInput<'a> {
    current_timestamp: Timestamp,
    memories: Vec<String>,
    persona: &'a str,
}

#[derive(Serialize)]
struct WonderInput<'a> {
    persona: &'a str,
    memories: Vec<String>,
    intent: &'a str,
}

#[derive(Serialize)]
struct PlanningInput<'a> {
    persona: &'a str,
    intent: &'a str,
    memories: Vec<String>,
    current_timestamp: Timestamp,
    old_plan: &'a str,
}

#[derive(Serialize)]
struct ValidTargets {
    inputs: Vec<serde_json::Value>,
    clickable: Vec<serde_json::Value>,
    selects: Vec<serde_json::Value>,
}

#[derive(Serialize)]
struct ActInput<'a> {
    valid_targets: ValidTargets,
    persona: &'a str,
    intent: &'a str,
    plan: &'a str,
    next_step: &'a str,
    environment: &'a str,
    recent_memories: Vec<String>,
}

/// Close a traced call, surfacing the phase error before any trace-write error
fn finish_scope<T>(scope: CallScope, outcome: Result<T>) -> Result<T> {
    let written = scope.finish();
    let value = outcome?;
    written?;
    Ok(value)
}

// ─── Agent ────────────────────────────────────────────────────────────────────

pub struct Agent {
    persona: String,
    intent: String,
    config: AgentConfig,
    memory: Arc<MemoryStore>,
    chat: Arc<dyn ChatModel>,
    tracer: ApiTracer,
    current_plan: RwLock<Option<MemoryPiece>>,
    observation: RwLock<Option<String>>,
    /// Index of the first piece the next `reflect` will look at
    reflect_cursor: Mutex<usize>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("intent", &self.intent)
            .field("memory", &self.memory)
            .finish()
    }
}

impl Agent {
    pub fn new(
        persona: impl Into<String>,
        intent: impl Into<String>,
        chat: Arc<dyn ChatModel>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: AgentConfig,
    ) -> Self {
        let persona = persona.into();
        let intent = intent.into();
        let memory = MemoryStore::new(
            Arc::clone(&chat),
            embedder,
            ScoringProfile {
                persona: persona.clone(),
                intent: intent.clone(),
                plan: None,
            },
            config.recent_windows,
        );
        Self {
            persona,
            intent,
            config,
            memory: Arc::new(memory),
            chat,
            tracer: ApiTracer::new(),
            current_plan: RwLock::new(None),
            observation: RwLock::new(None),
            reflect_cursor: Mutex::new(0),
        }
    }

    /// Write traces of this agent's calls through `tracer`
    pub fn with_tracer(mut self, tracer: ApiTracer) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    pub fn intent(&self) -> &str {
        &self.intent
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn tracer(&self) -> &ApiTracer {
        &self.tracer
    }

    pub async fn current_plan(&self) -> Option<MemoryPiece> {
        self.current_plan.read().await.clone()
    }

    /// Latest perceived description of the page
    pub async fn observation(&self) -> Option<String> {
        self.observation.read().await.clone()
    }

    /// Record a thought coming from outside the cognitive phases
    pub fn add_thought(&self, text: impl Into<String>) -> usize {
        self.memory.add(MemoryPiece::thought(text))
    }

    /// Every memory as model-input lines, grouped by kind
    pub fn formatted_memories(&self) -> String {
        format_memories(&self.memory.snapshot(), true).join("\n")
    }

    async fn ask(&self, request: ChatRequest, scope: Option<&CallScope>) -> Result<String> {
        if let Some(scope) = scope {
            scope.record_request(&request.messages);
        }
        let response = self.chat.chat(&request).await?;
        if let Some(scope) = scope {
            scope.record_response(&response);
        }
        Ok(response)
    }

    // ─── Perceive ─────────────────────────────────────────────────────────

    /// Describe the page the way a human would notice it and remember that.
    ///
    /// Deny-listed terms are masked before the page reaches the model.
    pub async fn perceive(&self, environment: &serde_json::Value) -> Result<String> {
        tracing::info!("agent perceiving environment");
        let scope = self.tracer.begin("perceive");
        let outcome = self.perceive_traced(environment, &scope).await;
        let observation = finish_scope(scope, outcome)?;

        *self.observation.write().await = Some(observation.clone());
        self.memory
            .add(MemoryPiece::observation(observation.clone(), environment.clone()));
        tracing::info!(%observation, "perceived");
        Ok(observation)
    }

    async fn perceive_traced(
        &self,
        environment: &serde_json::Value,
        scope: &CallScope,
    ) -> Result<String> {
        let mut page = serde_json::to_string(environment)?;
        for term in &self.config.deny_list {
            page = page.replace(term.as_str(), "***");
        }

        let request = ChatRequest::new(prompts::PERCEIVE, page)
            .json()
            .with_max_tokens(self.config.perceive_max_tokens);
        let response = self.ask(request, Some(scope)).await?;
        let parsed: PerceiveResponse = parse_json("perceive", &response)?;
        parsed
            .observations
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::malformed("perceive", "no observations"))
    }

    // ─── Feedback ─────────────────────────────────────────────────────────

    /// Judge the outcome of the last action against the current plan
    pub async fn feedback(&self, observation: &str) -> Result<Vec<String>> {
        let last_action = self
            .memory
            .last_of_kind(MemoryKind::Action)
            .ok_or_else(|| AgentError::InvariantViolation("feedback needs a previous action".into()))?;
        let last_plan = self
            .current_plan()
            .await
            .ok_or_else(|| AgentError::InvariantViolation("feedback needs a current plan".into()))?;
        let raw_action = last_action
            .raw_action()
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        tracing::info!("agent reflecting on last action");
        let scope = self.tracer.begin("feedback");
        let input = FeedbackInput {
            persona: &self.persona,
            last_action: &raw_action,
            last_plan: &last_plan.content,
            observation,
        };
        let outcome = self.feedback_traced(&input, &scope).await;
        let thoughts = finish_scope(scope, outcome)?;

        for thought in &thoughts {
            self.memory.add(MemoryPiece::thought(thought.clone()));
        }
        tracing::info!(?thoughts, "feedback");
        Ok(thoughts)
    }

    async fn feedback_traced(
        &self,
        input: &FeedbackInput<'_>,
        scope: &CallScope,
    ) -> Result<Vec<String>> {
        let request = ChatRequest::new(prompts::FEEDBACK, serde_json::to_string(input)?)
            .json()
            .with_max_tokens(self.config.default_max_tokens);
        let response = self.ask(request, Some(scope)).await?;
        let parsed: ThoughtsResponse = parse_json("feedback", &response)?;
        Ok(parsed.thoughts)
    }

    // ─── Slow phases ──────────────────────────────────────────────────────

    /// Turn everything added since the previous reflection into insights.
    ///
    /// Returns how many insights were recorded; an empty range skips the call.
    pub async fn reflect(&self) -> Result<usize> {
        let batch = {
            let mut cursor = self.reflect_cursor.lock().await;
            let (batch, end) = self.memory.since(*cursor);
            *cursor = end;
            batch
        };
        if batch.is_empty() {
            tracing::debug!("nothing new to reflect on");
            return Ok(0);
        }

        tracing::info!(memories = batch.len(), "agent reflecting on recent memories");
        let input = serde_json::to_string(&ReflectInput {
            current_timestamp: self.memory.timestamp(),
            memories: format_memories(&batch, true),
            persona: &self.persona,
        })?;
        let request = ChatRequest::new(prompts::REFLECT, input)
            .json()
            .with_mode(ModelSize::Large)
            .with_max_tokens(self.config.default_max_tokens);
        let response = self.ask(request, None).await?;
        let parsed: InsightsResponse = parse_json("reflect", &response)?;

        for insight in &parsed.insights {
            self.memory.add(MemoryPiece::reflection(insight.clone()));
        }
        tracing::info!(insights = ?parsed.insights, "reflection");
        Ok(parsed.insights.len())
    }

    /// Free-form thoughts over the most recent memories
    pub async fn wonder(&self) -> Result<usize> {
        let recent = self.memory.tail(self.config.wonder_window);
        tracing::info!(memories = recent.len(), "agent wondering");

        let input = serde_json::to_string(&WonderInput {
            persona: &self.persona,
            memories: format_memories(&recent, true),
            intent: &self.intent,
        })?;
        let request = ChatRequest::new(prompts::WONDER, input)
            .json()
            .with_mode(ModelSize::Large)
            .with_max_tokens(self.config.default_max_tokens);
        let response = self.ask(request, None).await?;
        let parsed: ThoughtsResponse = parse_json("wonder", &response)?;

        for thought in &parsed.thoughts {
            self.memory.add(MemoryPiece::thought(thought.clone()));
        }
        tracing::info!(thoughts = ?parsed.thoughts, "wonder");
        Ok(parsed.thoughts.len())
    }

    // ─── Plan ─────────────────────────────────────────────────────────────

    /// Revise the plan toward the intent.
    ///
    /// Re-prompts while the planner answers with the wrong shape. When
    /// `max_plan_attempts` runs out the previous plan is kept (or a
    /// re-examine-the-page plan adopted if there is none).
    pub async fn plan(&self) -> Result<MemoryPiece> {
        tracing::info!("agent planning");
        let scope = self.tracer.begin("plan");
        let outcome = self.plan_traced(&scope).await;
        let decided = finish_scope(scope, outcome)?;

        tracing::info!(
            plan = %decided.plan,
            rationale = %decided.rationale,
            next_step = %decided.next_step,
            "plan"
        );

        let mut plan = MemoryPiece::plan(decided.plan, decided.next_step);
        plan.timestamp = self.memory.timestamp();
        *self.current_plan.write().await = Some(plan.clone());
        self.memory.set_plan(Some(plan.content.clone()));
        self.memory.add(MemoryPiece::thought(decided.rationale));
        self.memory.add(plan.clone());
        Ok(plan)
    }

    async fn plan_traced(&self, scope: &CallScope) -> Result<PlanResponse> {
        let options = RetrieveOptions {
            n: self.config.retrieve_limit,
            recent: RecentFlags::all(),
            kind_weight: self.config.plan_kind_weights.clone(),
            trigger_update: false,
        };
        let memories = self.memory.retrieve(&self.intent, &options, Some(scope)).await?;
        let previous = self.current_plan().await;

        let input = serde_json::to_string(&PlanningInput {
            persona: &self.persona,
            intent: &self.intent,
            memories: format_memories(&memories, true),
            current_timestamp: self.memory.timestamp(),
            old_plan: previous.as_ref().map_or("N/A", |p| p.content.as_str()),
        })?;
        let request = ChatRequest::new(prompts::PLANNING, input)
            .json()
            .with_mode(ModelSize::Large)
            .with_max_tokens(self.config.default_max_tokens);

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let response = self.ask(request.clone(), Some(scope)).await?;
            match parse_json::<PlanResponse>("plan", &response) {
                Ok(plan) => return Ok(plan),
                Err(err) => {
                    tracing::warn!(attempt = attempts, error = %err, "unusable plan, rethinking");
                    if self.config.max_plan_attempts.is_some_and(|max| attempts >= max) {
                        return Ok(fallback_plan(previous.as_ref(), attempts));
                    }
                }
            }
        }
    }

    // ─── Act ──────────────────────────────────────────────────────────────

    /// Choose UI actions for the current plan's next step.
    ///
    /// Every returned action is recorded; the first one is returned for the
    /// environment.
    pub async fn act(&self, environment: &PageObservation) -> Result<serde_json::Value> {
        let plan = self
            .current_plan()
            .await
            .ok_or_else(|| AgentError::InvariantViolation("act needs a current plan".into()))?;

        tracing::info!("agent acting");
        let scope = self.tracer.begin("act");
        let outcome = self.act_traced(&plan, environment, &scope).await;
        let actions = finish_scope(scope, outcome)?;

        let mut descriptions = Vec::with_capacity(actions.len());
        for action in &actions {
            let description = action
                .get("description")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| AgentError::malformed("act", "action without a description"))?;
            descriptions.push(description.to_string());
        }
        for (description, action) in descriptions.into_iter().zip(&actions) {
            self.memory.add(MemoryPiece::action(description, action.clone()));
        }

        let first = actions
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::malformed("act", "no actions"))?;
        tracing::info!(action = %first, "act");
        Ok(first)
    }

    async fn act_traced(
        &self,
        plan: &MemoryPiece,
        environment: &PageObservation,
        scope: &CallScope,
    ) -> Result<Vec<serde_json::Value>> {
        let next_step = plan.next_step().unwrap_or_default();
        let options = RetrieveOptions {
            n: self.config.retrieve_limit,
            recent: RecentFlags::none(),
            kind_weight: self.config.act_kind_weights.clone(),
            trigger_update: false,
        };
        let memories = self.memory.retrieve(next_step, &options, Some(scope)).await?;

        let targets = environment.valid_targets();
        let input = serde_json::to_string(&ActInput {
            valid_targets: ValidTargets {
                inputs: targets.clone(),
                clickable: targets.clone(),
                selects: targets,
            },
            persona: &self.persona,
            intent: &self.intent,
            plan: &plan.content,
            next_step,
            environment: &environment.html,
            recent_memories: format_memories(&memories, true),
        })?;
        let request = ChatRequest::new(prompts::ACTION, input)
            .json()
            .with_max_tokens(self.config.default_max_tokens);
        let response = self.ask(request, Some(scope)).await?;
        let parsed: ActResponse = parse_json("act", &response)?;
        if parsed.actions.is_empty() {
            return Err(AgentError::malformed("act", "no actions"));
        }
        Ok(parsed.actions)
    }
}

fn fallback_plan(previous: Option<&MemoryPiece>, attempts: u32) -> PlanResponse {
    let rationale = format!("planner gave no usable answer after {attempts} attempts");
    match previous {
        Some(plan) => PlanResponse {
            plan: plan.content.clone(),
            rationale,
            next_step: plan.next_step().unwrap_or_default().to_string(),
        },
        None => PlanResponse {
            plan: "Re-examine the current page before deciding what to do".into(),
            rationale,
            next_step: "Look over the current page again".into(),
        },
    }
}
