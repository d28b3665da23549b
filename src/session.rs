//! Concurrent shopping sessions
//!
//! The orchestrator runs many independent agents against environments built by
//! an [`EnvironmentFactory`], at most `concurrency` at a time. Each session is
//! isolated: a failing session is reported in its outcome and never stops the
//! others.

use crate::agent::Agent;
use crate::config::OrchestratorConfig;
use crate::embedding::EmbeddingProvider;
use crate::environment::{Environment, EnvironmentFactory};
use crate::error::Result;
use crate::llm::ChatModel;
use crate::policy::CognitivePolicy;
use crate::telemetry::ApiTracer;
use crate::trace::RunDirectory;
use crate::types::TracedPiece;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Who shops, and for what
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSpec {
    pub persona: String,
    pub intent: String,
    /// Extra fields handed to the environment factory untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SessionSpec {
    pub fn new(persona: impl Into<String>, intent: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            intent: intent.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// What one session produced
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    /// Position of the spec in the submitted batch
    pub index: usize,
    pub spec: SessionSpec,
    pub steps: usize,
    pub terminated: bool,
    pub actions: Vec<String>,
    pub memory: Vec<TracedPiece>,
    pub score: Option<f64>,
    pub run_dir: Option<std::path::PathBuf>,
    pub error: Option<String>,
}

impl SessionOutcome {
    fn failed(index: usize, spec: SessionSpec, error: String) -> Self {
        Self {
            index,
            spec,
            steps: 0,
            terminated: false,
            actions: Vec::new(),
            memory: Vec::new(),
            score: None,
            run_dir: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Default)]
struct Progress {
    steps: usize,
    terminated: bool,
    score: Option<f64>,
    actions: Vec<String>,
}

/// Runs batches of sessions with bounded concurrency
#[derive(Clone)]
pub struct SessionOrchestrator {
    config: OrchestratorConfig,
    chat: Arc<dyn ChatModel>,
    embedder: Arc<dyn EmbeddingProvider>,
    tracer: ApiTracer,
}

impl SessionOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        chat: Arc<dyn ChatModel>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            config,
            chat,
            embedder,
            tracer: ApiTracer::new(),
        }
    }

    /// Traced calls across every session of this orchestrator
    pub fn call_count(&self) -> u64 {
        self.tracer.call_count()
    }

    /// Run every spec to completion; outcomes come back in submission order.
    ///
    /// `on_progress(done, total)` is called after each session finishes. A
    /// panicking callback is logged and otherwise ignored; a panicking session
    /// becomes a failed outcome.
    pub async fn run<F>(
        &self,
        specs: Vec<SessionSpec>,
        factory: Arc<dyn EnvironmentFactory>,
        on_progress: F,
    ) -> Vec<SessionOutcome>
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        let total = specs.len();
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let done = Arc::new(AtomicUsize::new(0));
        let on_progress = Arc::new(on_progress);
        let mut tasks = JoinSet::new();

        tracing::info!(sessions = total, concurrency = self.config.concurrency, "starting sessions");

        for (index, spec) in specs.into_iter().enumerate() {
            let orchestrator = self.clone();
            let permits = Arc::clone(&permits);
            let factory = Arc::clone(&factory);
            let done = Arc::clone(&done);
            let on_progress = Arc::clone(&on_progress);

            tasks.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => {
                        let session = orchestrator.run_session(index, spec.clone(), factory.as_ref());
                        match AssertUnwindSafe(session).catch_unwind().await {
                            Ok(outcome) => outcome,
                            Err(panic) => {
                                let reason = panic_message(panic.as_ref());
                                tracing::error!(session = index, reason, "session panicked");
                                SessionOutcome::failed(index, spec, format!("session panicked: {reason}"))
                            }
                        }
                    }
                    Err(e) => SessionOutcome::failed(index, spec, e.to_string()),
                };
                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                let report = std::panic::catch_unwind(AssertUnwindSafe(|| on_progress(finished, total)));
                if report.is_err() {
                    tracing::warn!(session = index, "progress callback panicked");
                }
                outcome
            });
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!(error = %e, "session task aborted"),
            }
        }
        outcomes.sort_by_key(|o| o.index);

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        tracing::info!(sessions = total, failed, "all sessions finished");
        outcomes
    }

    /// Run one session, never failing: errors land in the outcome
    pub async fn run_session(
        &self,
        index: usize,
        spec: SessionSpec,
        factory: &dyn EnvironmentFactory,
    ) -> SessionOutcome {
        tracing::info!(session = index, intent = %spec.intent, "session starting");

        let run_dir = match &self.config.runs_dir {
            Some(root) => match RunDirectory::create(root) {
                Ok(dir) => Some(dir),
                Err(e) => return SessionOutcome::failed(index, spec, e.to_string()),
            },
            None => None,
        };
        let tracer = match &run_dir {
            Some(dir) => match self.tracer.for_run(dir.path()) {
                Ok(tracer) => tracer,
                Err(e) => return SessionOutcome::failed(index, spec, e.to_string()),
            },
            None => self.tracer.clone(),
        };

        let mut env = match factory.create(&spec).await {
            Ok(env) => env,
            Err(e) => {
                tracing::error!(session = index, error = %e, "environment could not be created");
                if let Some(dir) = &run_dir {
                    record_error(dir, index, &e.to_string());
                }
                let mut outcome = SessionOutcome::failed(index, spec, e.to_string());
                outcome.run_dir = run_dir.map(|d| d.path().to_path_buf());
                return outcome;
            }
        };

        let agent = Agent::new(
            spec.persona.clone(),
            spec.intent.clone(),
            Arc::clone(&self.chat),
            Arc::clone(&self.embedder),
            self.config.agent.clone(),
        )
        .with_tracer(tracer);
        let mut policy = CognitivePolicy::new(agent, self.config.slow_loop.clone());

        let mut progress = Progress::default();
        let result = self
            .drive(&spec, &mut policy, env.as_mut(), run_dir.as_ref(), &mut progress)
            .await;

        policy.close().await;
        match tokio::time::timeout(self.config.close_timeout(), env.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(session = index, error = %e, "environment close failed"),
            Err(_) => tracing::warn!(session = index, "environment close timed out"),
        }

        let memory = policy.agent().memory().traced();
        let error = result.err().map(|e| e.to_string());
        if let Some(dir) = &run_dir {
            if let Some(error) = &error {
                record_error(dir, index, error);
            }
            if let Err(e) = dir.write_summary(&policy.formatted_memories()) {
                tracing::warn!(session = index, error = %e, "could not write memory summary");
            }
        }

        match &error {
            Some(e) => tracing::error!(session = index, steps = progress.steps, error = %e, "session failed"),
            None => tracing::info!(session = index, steps = progress.steps, "session finished"),
        }

        SessionOutcome {
            index,
            spec,
            steps: progress.steps,
            terminated: progress.terminated,
            actions: progress.actions,
            memory,
            score: progress.score,
            run_dir: run_dir.map(|d| d.path().to_path_buf()),
            error,
        }
    }

    async fn drive(
        &self,
        spec: &SessionSpec,
        policy: &mut CognitivePolicy,
        env: &mut dyn Environment,
        run_dir: Option<&RunDirectory>,
        progress: &mut Progress,
    ) -> Result<()> {
        if let Some(dir) = run_dir {
            dir.write_basic_info(spec)?;
        }

        while progress.steps < self.config.max_steps {
            let action = policy.forward(env).await?;
            progress.actions.push(action.clone());

            if let Some(dir) = run_dir {
                dir.write_actions(&progress.actions)?;
                if let Some(observation) = policy.agent().observation().await {
                    dir.write_observation(progress.steps, &observation)?;
                }
                dir.write_memory(&policy.agent().memory().traced())?;
            }

            tracing::info!(step = progress.steps + 1, max_steps = self.config.max_steps, %action, "taking action");
            let page = env.step(&action).await?;
            progress.steps += 1;
            progress.score = page.score.or(progress.score);

            if page.terminated {
                progress.terminated = true;
                tracing::info!(steps = progress.steps, "environment terminated");
                break;
            }
        }
        Ok(())
    }
}

/// Write `error.txt`; a failed write is logged, the session outcome already carries the error
fn record_error(dir: &RunDirectory, index: usize, error: &str) -> bool {
    match dir.write_error(error) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(session = index, error = %e, "could not write error file");
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlowLoopConfig;
    use crate::prompts;
    use crate::testing::{KeywordEmbedder, ScriptedChat, ScriptedFactory};
    use std::sync::Mutex;

    fn chat() -> Arc<ScriptedChat> {
        Arc::new(
            ScriptedChat::new()
                .respond(prompts::PERCEIVE, vec![r#"{"observations": ["a product page"]}"#])
                .respond(prompts::FEEDBACK, vec![r#"{"thoughts": ["ok"]}"#])
                .respond(
                    prompts::PLANNING,
                    vec![r#"{"plan": "buy it", "rationale": "fits", "next_step": "click buy"}"#],
                )
                .respond(
                    prompts::ACTION,
                    vec![r#"{"actions": [{"type": "click", "target": "add_to_cart", "description": "buy"}]}"#],
                )
                .respond(prompts::MEMORY_IMPORTANCE, vec![r#"{"score": 3}"#]),
        )
    }

    fn orchestrator(config: OrchestratorConfig) -> SessionOrchestrator {
        SessionOrchestrator::new(config, chat(), Arc::new(KeywordEmbedder::new(2)))
    }

    fn config(runs_dir: Option<std::path::PathBuf>) -> OrchestratorConfig {
        OrchestratorConfig {
            concurrency: 2,
            max_steps: 5,
            runs_dir,
            slow_loop: SlowLoopConfig {
                enabled: false,
                ..SlowLoopConfig::default()
            },
            ..OrchestratorConfig::default()
        }
    }

    fn factory(pages: Vec<&'static str>) -> (Arc<ScriptedFactory>, Arc<AtomicUsize>) {
        let closed = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(ScriptedFactory {
            pages,
            closed: Arc::clone(&closed),
        });
        (factory, closed)
    }

    #[tokio::test]
    async fn failing_session_does_not_stop_others() {
        let orchestrator = orchestrator(config(None));
        let (factory, closed) = factory(vec!["<p>item</p>", "<p>cart</p>", "<p>paid</p>"]);
        let specs = vec![
            SessionSpec::new("student", "buy socks"),
            SessionSpec::new("chef", "broken checkout"),
            SessionSpec::new("nurse", "buy shoes"),
        ];

        let outcomes = orchestrator.run(specs, factory, |_, _| {}).await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].spec.persona, "student");
        assert!(outcomes[0].is_success());
        assert!(outcomes[0].terminated);
        assert_eq!(outcomes[0].steps, 2);
        assert!(!outcomes[1].is_success());
        assert!(outcomes[2].is_success());
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sessions_stop_at_max_steps() {
        let orchestrator = orchestrator(OrchestratorConfig {
            max_steps: 2,
            ..config(None)
        });
        let (factory, _) = factory(vec!["<p>a</p>", "<p>b</p>", "<p>c</p>", "<p>d</p>"]);

        let outcomes = orchestrator
            .run(vec![SessionSpec::new("student", "browse")], factory, |_, _| {})
            .await;

        assert_eq!(outcomes[0].steps, 2);
        assert!(!outcomes[0].terminated);
        assert_eq!(outcomes[0].actions.len(), 2);
    }

    #[tokio::test]
    async fn progress_reported_and_panics_contained() {
        let orchestrator = orchestrator(config(None));
        let (factory, _) = factory(vec!["<p>item</p>"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);

        let outcomes = orchestrator
            .run(
                vec![SessionSpec::new("a", "x"), SessionSpec::new("b", "y")],
                factory,
                move |done, total| {
                    recorded.lock().unwrap().push((done, total));
                    if done == 1 {
                        panic!("progress bar broke");
                    }
                },
            )
            .await;

        assert!(outcomes.iter().all(SessionOutcome::is_success));
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![(1, 2), (2, 2)]);
    }

    #[tokio::test]
    async fn panicking_sessions_become_failed_outcomes() {
        let orchestrator = orchestrator(config(None));
        let (factory, _) = factory(vec!["<p>item</p>", "<p>cart</p>"]);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);

        let outcomes = orchestrator
            .run(
                vec![
                    SessionSpec::new("pilot", "crash the renderer"),
                    SessionSpec::new("baker", "crash it again"),
                    SessionSpec::new("nurse", "buy shoes"),
                ],
                factory,
                move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        for outcome in &outcomes[..2] {
            let error = outcome.error.as_deref().unwrap();
            assert!(error.contains("renderer crashed"), "{error}");
        }
        assert_eq!(outcomes[1].spec.persona, "baker");
        assert!(outcomes[2].is_success());
    }

    #[tokio::test]
    async fn failed_environment_writes_error_file() {
        let root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(config(Some(root.path().to_path_buf())));
        let (factory, _) = factory(vec!["<p>item</p>"]);

        let outcomes = orchestrator
            .run(vec![SessionSpec::new("chef", "broken checkout")], factory, |_, _| {})
            .await;

        let run_dir = outcomes[0].run_dir.clone().unwrap();
        let written = std::fs::read_to_string(run_dir.join("error.txt")).unwrap();
        assert!(written.contains("browser failed to launch"));
    }

    #[test]
    fn unwritable_error_file_is_reported_not_raised() {
        let root = tempfile::tempdir().unwrap();
        let dir = RunDirectory::create(root.path()).unwrap();
        assert!(record_error(&dir, 0, "first"));

        std::fs::remove_dir_all(dir.path()).unwrap();
        assert!(!record_error(&dir, 0, "second"));
    }

    #[tokio::test]
    async fn run_directory_holds_session_traces() {
        let root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(config(Some(root.path().to_path_buf())));
        let (factory, _) = factory(vec!["<p>item</p>", "<p>cart</p>"]);

        let outcomes = orchestrator
            .run(vec![SessionSpec::new("student", "buy socks")], factory, |_, _| {})
            .await;

        let run_dir = outcomes[0].run_dir.clone().unwrap();
        assert!(run_dir.join("basic_info.json").exists());
        assert!(run_dir.join("observation_trace/observation_0.txt").exists());
        assert!(run_dir.join("api_trace").is_dir());
        let trace = crate::trace::read_memory_trace(&run_dir).unwrap();
        assert_eq!(trace.len(), outcomes[0].memory.len());
        assert!(orchestrator.call_count() >= 3);
    }
}
