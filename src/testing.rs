//! Deterministic chat, embedding and environment doubles for unit tests

use crate::embedding::EmbeddingProvider;
use crate::environment::{Environment, EnvironmentFactory, PageObservation};
use crate::error::{AgentError, Result};
use crate::llm::{ChatModel, ChatRequest};
use crate::session::SessionSpec;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Chat double answering by system prompt.
///
/// Each prompt has a queue of canned responses; the last one repeats forever.
#[derive(Default)]
pub struct ScriptedChat {
    scripts: Mutex<HashMap<String, VecDeque<String>>>,
    failing: Mutex<HashSet<String>>,
    requests: Mutex<Vec<ChatRequest>>,
    gate: Option<(String, Gate)>,
}

impl ScriptedChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, prompt: &str, responses: Vec<&str>) -> Self {
        self.scripts.lock().unwrap().insert(
            prompt.to_string(),
            responses.into_iter().map(String::from).collect(),
        );
        self
    }

    pub fn fail(self, prompt: &str) -> Self {
        self.failing.lock().unwrap().insert(prompt.to_string());
        self
    }

    /// Hold every call for `prompt` until `open` is called
    pub fn gated(mut self, prompt: &str) -> Self {
        self.gate = Some((prompt.to_string(), Gate::default()));
        self
    }

    pub async fn wait_until_blocked(&self) {
        if let Some((_, gate)) = &self.gate {
            gate.wait_until_blocked().await;
        }
    }

    pub fn open(&self) {
        if let Some((_, gate)) = &self.gate {
            gate.open();
        }
    }

    pub fn requests_for(&self, prompt: &str) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.messages[0].content == prompt)
            .cloned()
            .collect()
    }

    pub fn calls_for(&self, prompt: &str) -> usize {
        self.requests_for(prompt).len()
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    async fn chat(&self, request: &ChatRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        let prompt = &request.messages[0].content;

        if let Some((gated, gate)) = &self.gate {
            if gated == prompt {
                gate.pass().await;
            }
        }
        if self.failing.lock().unwrap().contains(prompt) {
            return Err(AgentError::Chat("scripted failure".into()));
        }

        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts
            .get_mut(prompt)
            .ok_or_else(|| AgentError::Chat("no script for prompt".into()))?;
        match queue.len() {
            0 => Err(AgentError::Chat("empty script".into())),
            1 => Ok(queue[0].clone()),
            _ => Ok(queue.pop_front().unwrap_or_default()),
        }
    }
}

/// Embeds text to the vector of the first keyword it contains, zeros otherwise
pub struct KeywordEmbedder {
    dimension: usize,
    keywords: Vec<(String, Vec<f32>)>,
    calls: AtomicUsize,
    failing: bool,
    gate: Option<Gate>,
}

/// Calls park in `pass` until the test opens the gate
struct Gate {
    blocked: Semaphore,
    open: Semaphore,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            blocked: Semaphore::new(0),
            open: Semaphore::new(0),
        }
    }
}

impl Gate {
    async fn pass(&self) {
        self.blocked.add_permits(1);
        let _ = self.open.acquire().await.unwrap();
    }

    async fn wait_until_blocked(&self) {
        self.blocked.acquire().await.unwrap().forget();
    }

    fn open(&self) {
        self.open.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

impl KeywordEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            keywords: Vec::new(),
            calls: AtomicUsize::new(0),
            failing: false,
            gate: None,
        }
    }

    pub fn with_keyword(mut self, keyword: &str, vector: Vec<f32>) -> Self {
        self.keywords.push((keyword.to_string(), vector));
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// Block every embed call until `open` is called
    pub fn gated(mut self) -> Self {
        self.gate = Some(Gate::default());
        self
    }

    pub async fn wait_until_blocked(&self) {
        if let Some(gate) = &self.gate {
            gate.wait_until_blocked().await;
        }
    }

    pub fn open(&self) {
        if let Some(gate) = &self.gate {
            gate.open();
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn name(&self) -> &'static str {
        "keyword"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.pass().await;
        }
        if self.failing {
            return Err(AgentError::Embedding("scripted failure".into()));
        }
        Ok(texts
            .iter()
            .map(|text| {
                self.keywords
                    .iter()
                    .find(|(keyword, _)| text.contains(keyword.as_str()))
                    .map(|(_, vector)| vector.clone())
                    .unwrap_or_else(|| vec![0.0; self.dimension])
            })
            .collect())
    }
}

/// Environment replaying a fixed list of pages; terminates after the last one
pub struct ScriptedEnvironment {
    pages: Vec<String>,
    cursor: usize,
    pub actions: Arc<Mutex<Vec<String>>>,
    pub closed: Arc<AtomicUsize>,
    /// Panic instead of returning an observation
    pub crash: bool,
}

impl ScriptedEnvironment {
    pub fn new(pages: Vec<&str>) -> Self {
        Self {
            pages: pages.into_iter().map(String::from).collect(),
            cursor: 0,
            actions: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicUsize::new(0)),
            crash: false,
        }
    }

    fn page(&self) -> PageObservation {
        let index = self.cursor.min(self.pages.len().saturating_sub(1));
        PageObservation {
            html: self.pages.get(index).cloned().unwrap_or_default(),
            clickable_elements: vec![
                Some(serde_json::json!({"name": "add_to_cart"})),
                None,
            ],
            terminated: self.cursor + 1 >= self.pages.len(),
            ..PageObservation::default()
        }
    }
}

#[async_trait]
impl Environment for ScriptedEnvironment {
    async fn observation(&mut self) -> Result<PageObservation> {
        if self.crash {
            panic!("renderer crashed");
        }
        Ok(self.page())
    }

    async fn step(&mut self, action: &str) -> Result<PageObservation> {
        self.actions.lock().unwrap().push(action.to_string());
        self.cursor += 1;
        Ok(self.page())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Builds a `ScriptedEnvironment` per session; intents containing "broken"
/// fail, intents containing "crash" get an environment that panics
pub struct ScriptedFactory {
    pub pages: Vec<&'static str>,
    pub closed: Arc<AtomicUsize>,
}

#[async_trait]
impl EnvironmentFactory for ScriptedFactory {
    async fn create(&self, spec: &SessionSpec) -> Result<Box<dyn Environment>> {
        if spec.intent.contains("broken") {
            return Err(AgentError::Environment("browser failed to launch".into()));
        }
        let mut env = ScriptedEnvironment::new(self.pages.clone());
        env.closed = Arc::clone(&self.closed);
        env.crash = spec.intent.contains("crash");
        Ok(Box::new(env))
    }
}
