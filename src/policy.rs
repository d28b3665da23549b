//! Cognitive policy: the per-step loop plus the background slow loop
//!
//! Each `forward` call perceives the page (and, after the first step, judges
//! the previous action concurrently), plans, acts and advances the clock. The
//! first call also starts a supervised background task that keeps reflecting,
//! wondering and updating memory until the policy is closed or dropped.

use crate::agent::Agent;
use crate::config::SlowLoopConfig;
use crate::environment::{Environment, PageObservation};
use crate::error::{AgentError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

// ─── Slow loop ────────────────────────────────────────────────────────────────

/// Counters kept by the background loop
#[derive(Debug, Default)]
pub struct SlowLoopStats {
    iterations: AtomicU64,
    failures: AtomicU64,
}

impl SlowLoopStats {
    /// Reflect/wonder/update rounds run, failed steps included
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    /// Individual steps that failed
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Handle to the background reflect/wonder/update task
pub struct SlowLoop {
    handle: JoinHandle<()>,
    stats: Arc<SlowLoopStats>,
}

impl SlowLoop {
    pub fn spawn(agent: Arc<Agent>, config: SlowLoopConfig) -> Self {
        let stats = Arc::new(SlowLoopStats::default());
        let handle = tokio::spawn(run_slow_loop(agent, config, Arc::clone(&stats)));
        tracing::info!("slow loop started");
        Self { handle, stats }
    }

    pub fn stats(&self) -> Arc<SlowLoopStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    fn abort(&self) {
        self.handle.abort();
    }

    /// Cancel the task and wait until it is gone
    pub async fn shutdown(self) {
        self.handle.abort();
        match self.handle.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                tracing::debug!("slow loop cancelled");
            }
            Err(e) => {
                tracing::error!(error = %e, "slow loop panicked");
            }
        }
        tracing::info!(
            iterations = self.stats.iterations(),
            failures = self.stats.failures(),
            "slow loop stopped"
        );
    }
}

async fn run_slow_loop(agent: Arc<Agent>, config: SlowLoopConfig, stats: Arc<SlowLoopStats>) {
    loop {
        let failed = slow_iteration(&agent, &stats).await;
        stats.iterations.fetch_add(1, Ordering::Relaxed);
        if failed > 0 {
            tokio::time::sleep(config.failure_backoff()).await;
        }
        tokio::task::yield_now().await;
    }
}

/// One reflect/wonder/update round; each step runs whatever the others did.
/// Returns the number of steps that failed.
async fn slow_iteration(agent: &Agent, stats: &SlowLoopStats) -> u64 {
    let mut failed = 0;
    if let Err(e) = agent.reflect().await {
        step_failed(stats, "reflect", &e);
        failed += 1;
    }
    if let Err(e) = agent.wonder().await {
        step_failed(stats, "wonder", &e);
        failed += 1;
    }
    match agent.memory().update().await {
        Ok(report) => {
            tracing::debug!(processed = report.processed, "slow loop update done");
        }
        Err(e) => {
            step_failed(stats, "update", &e);
            failed += 1;
        }
    }
    failed
}

fn step_failed(stats: &SlowLoopStats, step: &'static str, error: &AgentError) {
    stats.failures.fetch_add(1, Ordering::Relaxed);
    tracing::warn!(step, error = %error, "slow loop step failed");
}

// ─── Policy ───────────────────────────────────────────────────────────────────

pub struct CognitivePolicy {
    agent: Arc<Agent>,
    slow_loop_config: SlowLoopConfig,
    slow_loop: Option<SlowLoop>,
}

impl CognitivePolicy {
    pub fn new(agent: Agent, slow_loop_config: SlowLoopConfig) -> Self {
        Self {
            agent: Arc::new(agent),
            slow_loop_config,
            slow_loop: None,
        }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn slow_loop_stats(&self) -> Option<Arc<SlowLoopStats>> {
        self.slow_loop.as_ref().map(SlowLoop::stats)
    }

    /// Read the current page from `env` and decide the next action
    pub async fn forward(&mut self, env: &mut dyn Environment) -> Result<String> {
        let page = env.observation().await?;
        self.step(&page).await
    }

    /// Decide the next action for `page`; returns it serialized as JSON
    pub async fn step(&mut self, page: &PageObservation) -> Result<String> {
        let html = serde_json::Value::String(page.html.clone());
        if self.agent.memory().timestamp() == 0 {
            self.agent.perceive(&html).await?;
        } else {
            tokio::try_join!(self.agent.feedback(&page.html), self.agent.perceive(&html))?;
        }

        if self.slow_loop.is_none() && self.slow_loop_config.enabled {
            self.slow_loop = Some(SlowLoop::spawn(
                Arc::clone(&self.agent),
                self.slow_loop_config.clone(),
            ));
        }

        self.agent.plan().await?;
        let action = self.agent.act(page).await?;
        let step = self.agent.memory().advance();
        tracing::debug!(step, "policy step complete");
        Ok(serde_json::to_string(&action)?)
    }

    /// Stop the background loop; safe to call more than once
    pub async fn close(&mut self) {
        if let Some(slow_loop) = self.slow_loop.take() {
            slow_loop.shutdown().await;
        }
    }

    pub fn formatted_memories(&self) -> String {
        self.agent.formatted_memories()
    }
}

impl Drop for CognitivePolicy {
    fn drop(&mut self) {
        if let Some(slow_loop) = &self.slow_loop {
            slow_loop.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::prompts;
    use crate::testing::{KeywordEmbedder, ScriptedChat, ScriptedEnvironment};
    use crate::types::MemoryKind;
    use std::time::Duration;

    fn scripted() -> ScriptedChat {
        ScriptedChat::new()
            .respond(prompts::PERCEIVE, vec![r#"{"observations": ["a lamp listing"]}"#])
            .respond(prompts::FEEDBACK, vec![r#"{"thoughts": ["the click landed"]}"#])
            .respond(
                prompts::PLANNING,
                vec![r#"{"plan": "buy the lamp", "rationale": "it is cheap", "next_step": "add to cart"}"#],
            )
            .respond(
                prompts::ACTION,
                vec![r#"{"actions": [{"type": "click", "target": "add_to_cart", "description": "add lamp to cart"}]}"#],
            )
            .respond(prompts::REFLECT, vec![r#"{"insights": ["lamps are cheap here"]}"#])
            .respond(prompts::WONDER, vec![r#"{"thoughts": ["is the lamp bright enough?"]}"#])
            .respond(prompts::MEMORY_IMPORTANCE, vec![r#"{"score": 6}"#])
    }

    fn policy_with(chat: ScriptedChat, slow_loop: SlowLoopConfig) -> (CognitivePolicy, Arc<ScriptedChat>) {
        let chat = Arc::new(chat);
        let agent = Agent::new(
            "retired librarian",
            "buy a reading lamp",
            chat.clone(),
            Arc::new(KeywordEmbedder::new(2)),
            AgentConfig::default(),
        );
        (CognitivePolicy::new(agent, slow_loop), chat)
    }

    fn no_slow_loop() -> SlowLoopConfig {
        SlowLoopConfig {
            enabled: false,
            ..SlowLoopConfig::default()
        }
    }

    #[tokio::test]
    async fn first_step_perceives_without_feedback() {
        let (mut policy, chat) = policy_with(scripted(), no_slow_loop());
        let mut env = ScriptedEnvironment::new(vec!["<p>lamp</p>", "<p>cart</p>"]);

        let action = policy.forward(&mut env).await.unwrap();

        let action: serde_json::Value = serde_json::from_str(&action).unwrap();
        assert_eq!(action["target"], "add_to_cart");
        assert_eq!(chat.calls_for(prompts::FEEDBACK), 0);
        assert_eq!(chat.calls_for(prompts::PERCEIVE), 1);
        assert_eq!(policy.agent().memory().timestamp(), 1);
        assert!(policy.slow_loop_stats().is_none());
    }

    #[tokio::test]
    async fn later_steps_judge_previous_action() {
        let (mut policy, chat) = policy_with(scripted(), no_slow_loop());
        let mut env = ScriptedEnvironment::new(vec!["<p>lamp</p>", "<p>cart</p>", "<p>done</p>"]);

        let first = policy.forward(&mut env).await.unwrap();
        env.step(&first).await.unwrap();
        policy.forward(&mut env).await.unwrap();

        assert_eq!(chat.calls_for(prompts::FEEDBACK), 1);
        let feedback = &chat.requests_for(prompts::FEEDBACK)[0];
        assert!(feedback.messages[1].content.contains("<p>cart</p>"));
        assert_eq!(policy.agent().memory().timestamp(), 2);

        let thoughts = policy
            .agent()
            .memory()
            .snapshot()
            .into_iter()
            .filter(|p| p.kind() == MemoryKind::Thought && p.timestamp == 1)
            .count();
        // feedback thought plus the plan rationale
        assert_eq!(thoughts, 2);
    }

    #[tokio::test]
    async fn failed_phase_leaves_clock_in_place() {
        let chat = scripted().fail(prompts::ACTION);
        let (mut policy, _) = policy_with(chat, no_slow_loop());
        let mut env = ScriptedEnvironment::new(vec!["<p>lamp</p>"]);

        assert!(policy.forward(&mut env).await.is_err());
        assert_eq!(policy.agent().memory().timestamp(), 0);
    }

    #[tokio::test]
    async fn slow_loop_runs_until_closed() {
        let (mut policy, chat) = policy_with(scripted(), SlowLoopConfig::default());
        let mut env = ScriptedEnvironment::new(vec!["<p>lamp</p>", "<p>cart</p>"]);

        policy.forward(&mut env).await.unwrap();
        let stats = policy.slow_loop_stats().unwrap();
        while stats.iterations() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        policy.close().await;

        assert!(chat.calls_for(prompts::WONDER) >= 2);
        assert!(policy.agent().memory().update_history().len() >= 2);

        let settled = chat.calls_for(prompts::WONDER);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(chat.calls_for(prompts::WONDER), settled);

        policy.close().await;
    }

    #[tokio::test]
    async fn slow_loop_survives_failing_steps() {
        let chat = scripted().fail(prompts::WONDER);
        let (mut policy, chat) = policy_with(
            chat,
            SlowLoopConfig {
                enabled: true,
                failure_backoff_ms: 1,
            },
        );
        let mut env = ScriptedEnvironment::new(vec!["<p>lamp</p>", "<p>cart</p>"]);

        policy.forward(&mut env).await.unwrap();
        let stats = policy.slow_loop_stats().unwrap();
        while stats.failures() < 2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        // the loop is still alive and the foreground keeps working
        let slow_loop = policy.slow_loop.as_ref().unwrap();
        assert!(!slow_loop.is_finished());
        assert!(stats.iterations() >= 1);
        policy.close().await;
        assert!(chat.calls_for(prompts::REFLECT) >= 1);
    }

    #[tokio::test]
    async fn memory_updates_continue_while_wonder_fails() {
        let chat = scripted().fail(prompts::WONDER);
        let (mut policy, _) = policy_with(
            chat,
            SlowLoopConfig {
                enabled: true,
                failure_backoff_ms: 1,
            },
        );
        let mut env = ScriptedEnvironment::new(vec!["<p>lamp</p>", "<p>cart</p>"]);

        policy.forward(&mut env).await.unwrap();
        let stats = policy.slow_loop_stats().unwrap();
        while stats.iterations() < 2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        policy.close().await;

        let memory = policy.agent().memory();
        assert!(stats.failures() >= 2);
        assert!(!memory.update_history().is_empty());
    }

    #[tokio::test]
    async fn dropping_policy_stops_slow_loop() {
        let (mut policy, chat) = policy_with(scripted(), SlowLoopConfig::default());
        let mut env = ScriptedEnvironment::new(vec!["<p>lamp</p>", "<p>cart</p>"]);
        policy.forward(&mut env).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        drop(policy);
        tokio::task::yield_now().await;
        let settled = chat.calls_for(prompts::WONDER);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(chat.calls_for(prompts::WONDER), settled);
    }
}
