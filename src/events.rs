//! The ephemeral lane of the event bus, §5, plus [`EventBus`] — the single
//! entry point stages and the orchestrator use to publish both durable
//! events (forwarded to a [`DocumentStore`]) and ephemeral thinking chunks.
//!
//! Grounded on `pipeline.py::_push_thinking` / `_push_thinking_done`: a
//! bounded, drop-oldest, process-local queue, one per analysis id, created
//! on demand and destroyed once the analysis reaches a terminal state —
//! thinking text is a nice-to-have for a live viewer, never replayed to a
//! client that reconnects later (§3 invariant: "the ephemeral lane for
//! analysis A exists if and only if A is in an active stage").

use crate::error::Result;
use crate::model::{Event, EventType, Phase, ThinkingChunk};
use crate::store::DocumentStore;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Capacity of the ephemeral thinking-chunk queue per analysis (§5).
pub const THINKING_QUEUE_CAPACITY: usize = 500;

/// A bounded, drop-oldest queue of [`ThinkingChunk`]s for one analysis.
#[derive(Default)]
pub struct ThinkingQueue {
    chunks: Mutex<VecDeque<ThinkingChunk>>,
}

impl ThinkingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk, dropping the oldest entry if the queue is already at
    /// capacity (§5 — ephemeral data, never worth blocking a stage for).
    pub async fn push(&self, chunk: ThinkingChunk) {
        let mut guard = self.chunks.lock().await;
        if guard.len() >= THINKING_QUEUE_CAPACITY {
            guard.pop_front();
        }
        guard.push_back(chunk);
    }

    /// Drain everything currently queued.
    pub async fn drain(&self) -> Vec<ThinkingChunk> {
        let mut guard = self.chunks.lock().await;
        guard.drain(..).collect()
    }
}

/// The single object stages publish through: durable events go to the
/// injected [`DocumentStore`]; thinking chunks go to a process-local,
/// best-effort queue kept per analysis id and torn down on terminal states.
///
/// One `EventBus` is shared across all analyses (it is part of the
/// process-wide `Engine`, §9 "module-level singletons"); the ephemeral
/// lanes it owns are per-analysis, matching the durable lane's per-analysis
/// indexing.
pub struct EventBus {
    store: Arc<dyn DocumentStore>,
    thinking: Mutex<HashMap<String, Arc<ThinkingQueue>>>,
}

impl EventBus {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            thinking: Mutex::new(HashMap::new()),
        }
    }

    /// Append a durable event for `analysis_id`. Index assignment happens
    /// inside the store, atomically with the append (Open Question 2).
    pub async fn emit(
        &self,
        analysis_id: &str,
        event_type: EventType,
        data: HashMap<String, Value>,
    ) -> Result<Event> {
        self.store.append_event(analysis_id, event_type, data).await
    }

    /// Create (or return the existing) ephemeral lane for `analysis_id`.
    /// Idempotent, per §4.1 "Ephemeral lane" operations.
    pub async fn create_lane(&self, analysis_id: &str) {
        let mut lanes = self.thinking.lock().await;
        lanes
            .entry(analysis_id.to_string())
            .or_insert_with(|| Arc::new(ThinkingQueue::new()));
    }

    /// Destroy the ephemeral lane for `analysis_id`, if any. Called exactly
    /// once per analysis, on entry to any terminal state (§4.6 invariant).
    pub async fn remove_lane(&self, analysis_id: &str) {
        let mut lanes = self.thinking.lock().await;
        lanes.remove(analysis_id);
    }

    /// Whether an ephemeral lane currently exists for `analysis_id`.
    pub async fn lane_exists(&self, analysis_id: &str) -> bool {
        self.thinking.lock().await.contains_key(analysis_id)
    }

    /// Push a thinking chunk into `analysis_id`'s ephemeral lane. A no-op if
    /// the lane has already been destroyed (analysis reached a terminal
    /// state) — thinking text is best-effort only.
    pub async fn push_thinking(&self, analysis_id: &str, phase: Phase, text: String) {
        if let Some(queue) = self.thinking.lock().await.get(analysis_id).cloned() {
            queue.push(ThinkingChunk::Thinking { phase, text }).await;
        }
    }

    /// Signal the end of a phase's thinking stream.
    pub async fn push_thinking_done(&self, analysis_id: &str, phase: Phase) {
        if let Some(queue) = self.thinking.lock().await.get(analysis_id).cloned() {
            queue.push(ThinkingChunk::ThinkingDone { phase }).await;
        }
    }

    /// Drain all currently-buffered thinking chunks for `analysis_id`
    /// (called by the SSE stream handler on each poll tick). Returns an
    /// empty vec if the lane doesn't exist (never created, or already torn
    /// down).
    pub async fn drain_thinking(&self, analysis_id: &str) -> Vec<ThinkingChunk> {
        match self.thinking.lock().await.get(analysis_id).cloned() {
            Some(queue) => queue.drain().await,
            None => Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }
}
