//! The durable lane of the event bus plus analysis/document persistence,
//! §5 "Event Bus — durable lane". Grounded on `pipeline.py::_emit_event`'s
//! monotonic index counter (moved here per [Design Notes Open Question 2] —
//! index assignment must be atomic with the append, not kept pipeline-side)
//! and shaped after the teacher's `Backend` trait (object-safe, `async_trait`,
//! swappable implementation).

use crate::error::{PipelineError, Result};
use crate::model::{AnalysisPatch, AnalysisRecord, AnalysisStatus, DocumentRecord, Event, EventType};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// Durable persistence for analyses, their documents, and their event log.
///
/// Implementations must guarantee that `append_event` assigns indices
/// atomically — two concurrent appends for the same analysis must never
/// observe or assign the same index (§5).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_analysis(&self, model: &str) -> Result<String>;
    async fn update_analysis(&self, id: &str, patch: AnalysisPatch) -> Result<()>;
    async fn get_analysis(&self, id: &str) -> Result<Option<AnalysisRecord>>;
    async fn append_event(&self, id: &str, event_type: EventType, data: HashMap<String, Value>) -> Result<Event>;
    async fn read_events_from(&self, id: &str, since_index: u32) -> Result<Vec<Event>>;
    async fn add_document(&self, id: &str, doc: DocumentRecord) -> Result<()>;
    async fn list_documents(&self, id: &str) -> Result<Vec<DocumentRecord>>;
}

struct AnalysisSlot {
    record: AnalysisRecord,
    events: Vec<Event>,
    documents: Vec<DocumentRecord>,
    next_index: u32,
}

/// A reference, process-local implementation of [`DocumentStore`] backed by
/// a mutex-guarded map. Suitable for tests and single-process deployments;
/// a production store would swap this for a real database behind the same
/// trait, same as the teacher's `Backend` implementations are swappable.
#[derive(Default)]
pub struct InMemoryStore {
    analyses: Mutex<HashMap<String, AnalysisSlot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn create_analysis(&self, model: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let record = AnalysisRecord {
            id: id.clone(),
            created_at: Utc::now(),
            completed_at: None,
            status: AnalysisStatus::Pending,
            model: model.to_string(),
            report: None,
            qa: None,
            metrics: crate::model::Metrics {
                model_used: model.to_string(),
                ..Default::default()
            },
            error: None,
        };
        let mut guard = self.analyses.lock().unwrap();
        guard.insert(
            id.clone(),
            AnalysisSlot {
                record,
                events: Vec::new(),
                documents: Vec::new(),
                next_index: 0,
            },
        );
        Ok(id)
    }

    async fn update_analysis(&self, id: &str, patch: AnalysisPatch) -> Result<()> {
        let mut guard = self.analyses.lock().unwrap();
        let slot = guard
            .get_mut(id)
            .ok_or_else(|| PipelineError::Other(format!("unknown analysis id: {id}")))?;
        if let Some(status) = patch.status {
            slot.record.status = status;
        }
        if patch.completed_at.is_some() {
            slot.record.completed_at = patch.completed_at;
        }
        if patch.report.is_some() {
            slot.record.report = patch.report;
        }
        if patch.qa.is_some() {
            slot.record.qa = patch.qa;
        }
        if let Some(metrics) = patch.metrics {
            slot.record.metrics = metrics;
        }
        if patch.error.is_some() {
            slot.record.error = patch.error;
        }
        Ok(())
    }

    async fn get_analysis(&self, id: &str) -> Result<Option<AnalysisRecord>> {
        let guard = self.analyses.lock().unwrap();
        Ok(guard.get(id).map(|s| s.record.clone()))
    }

    async fn append_event(
        &self,
        id: &str,
        event_type: EventType,
        data: HashMap<String, Value>,
    ) -> Result<Event> {
        let mut guard = self.analyses.lock().unwrap();
        let slot = guard
            .get_mut(id)
            .ok_or_else(|| PipelineError::Other(format!("unknown analysis id: {id}")))?;
        let event = Event {
            index: slot.next_index,
            timestamp: Utc::now(),
            event_type,
            data,
        };
        slot.next_index += 1;
        slot.events.push(event.clone());
        Ok(event)
    }

    async fn read_events_from(&self, id: &str, since_index: u32) -> Result<Vec<Event>> {
        let guard = self.analyses.lock().unwrap();
        let slot = guard
            .get(id)
            .ok_or_else(|| PipelineError::Other(format!("unknown analysis id: {id}")))?;
        Ok(slot
            .events
            .iter()
            .filter(|e| e.index >= since_index)
            .cloned()
            .collect())
    }

    async fn add_document(&self, id: &str, doc: DocumentRecord) -> Result<()> {
        let mut guard = self.analyses.lock().unwrap();
        let slot = guard
            .get_mut(id)
            .ok_or_else(|| PipelineError::Other(format!("unknown analysis id: {id}")))?;
        slot.documents.push(doc);
        Ok(())
    }

    async fn list_documents(&self, id: &str) -> Result<Vec<DocumentRecord>> {
        let guard = self.analyses.lock().unwrap();
        let slot = guard
            .get(id)
            .ok_or_else(|| PipelineError::Other(format!("unknown analysis id: {id}")))?;
        Ok(slot.documents.clone())
    }
}
