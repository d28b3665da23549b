//! Per-call API tracing
//!
//! A [`CallScope`] is opened around each traced phase and passed explicitly to
//! everything that should be attributed to that call. The call counter lives in
//! the [`ApiTracer`] that hands scopes out, so independent orchestrators never
//! share numbering.

use crate::error::Result;
use crate::llm::ChatMessage;
use crate::types::MemoryPiece;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Hands out numbered call scopes and knows where to write their traces
#[derive(Debug, Clone, Default)]
pub struct ApiTracer {
    counter: Arc<AtomicU64>,
    trace_dir: Option<PathBuf>,
}

impl ApiTracer {
    /// Tracer that only logs
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracer sharing this counter that writes into `run_dir/api_trace`
    pub fn for_run(&self, run_dir: impl AsRef<Path>) -> Result<Self> {
        let trace_dir = run_dir.as_ref().join("api_trace");
        std::fs::create_dir_all(&trace_dir)?;
        Ok(Self {
            counter: Arc::clone(&self.counter),
            trace_dir: Some(trace_dir),
        })
    }

    /// Number of scopes opened so far
    pub fn call_count(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn begin(&self, method_name: &'static str) -> CallScope {
        let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(call = id, method = method_name, "API call started");
        CallScope {
            id,
            method_name,
            trace_dir: self.trace_dir.clone(),
            started: Instant::now(),
            started_at: Utc::now(),
            record: Mutex::new(CallRecord::default()),
        }
    }
}

#[derive(Debug, Default)]
struct CallRecord {
    requests: Vec<Vec<ChatMessage>>,
    responses: Vec<String>,
    retrieve_results: Vec<Vec<String>>,
}

/// Everything attributed to one traced call
#[derive(Debug)]
pub struct CallScope {
    id: u64,
    method_name: &'static str,
    trace_dir: Option<PathBuf>,
    started: Instant,
    started_at: DateTime<Utc>,
    record: Mutex<CallRecord>,
}

#[derive(Serialize)]
struct CallTrace<'a> {
    request: &'a [Vec<ChatMessage>],
    response: &'a [String],
    method_name: &'a str,
    retrieve_result: &'a [Vec<String>],
    started_at: DateTime<Utc>,
    time: f64,
}

impl CallScope {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, CallRecord> {
        self.record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_request(&self, messages: &[ChatMessage]) {
        self.lock().requests.push(messages.to_vec());
    }

    pub fn record_response(&self, response: &str) {
        self.lock().responses.push(response.to_string());
    }

    pub fn record_retrieval(&self, pieces: &[MemoryPiece]) {
        self.lock()
            .retrieve_results
            .push(pieces.iter().map(MemoryPiece::render).collect());
    }

    /// Close the scope, writing `api_trace_{id}.json` when a run directory is set
    pub fn finish(self) -> Result<()> {
        let elapsed = self.started.elapsed().as_secs_f64();
        tracing::info!(call = self.id, method = self.method_name, elapsed, "API call finished");

        let Some(dir) = &self.trace_dir else {
            return Ok(());
        };
        let record = self.lock();
        let trace = CallTrace {
            request: &record.requests,
            response: &record.responses,
            method_name: self.method_name,
            retrieve_result: &record.retrieve_results,
            started_at: self.started_at,
            time: elapsed,
        };
        let file = std::fs::File::create(dir.join(format!("api_trace_{}.json", self.id)))?;
        serde_json::to_writer(file, &trace)?;
        Ok(())
    }
}
