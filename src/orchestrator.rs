//! The Pipeline Orchestrator (C6) and the `Engine` that owns the process-wide
//! singletons and launches analyses (§4.6, §9 "module-level singletons").
//!
//! Grounded on the teacher's `pipeline.rs::Pipeline::execute` (sequential
//! stage loop with a shared context and a cancellation flag checked between
//! stages), generalized from a fixed list of prompt-template stages into the
//! five-stage state machine this crate's domain calls for, and on
//! `exec_ctx.rs`'s "one long-lived context, built once, passed by reference"
//! shape for the `Engine`.

use crate::archive::{self, ExtractedFile};
use crate::chunk;
use crate::config::EngineConfig;
use crate::convert::DocumentConverter;
use crate::error::{PipelineError, Result};
use crate::events::EventBus;
use crate::gateway::{Gateway, Thinking};
use crate::model::{
    AnalysisPatch, AnalysisRecord, AnalysisStatus, DocumentRecord, EventType, ExtractionFacts, Metrics, Phase,
    QaReport, SourceDocumentRef, ThinkingChunk, Usage,
};
use crate::prompts;
use crate::stage::{ExtractStage, ParseStage};
use crate::store::DocumentStore;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Process-wide owner of the store, converter, gateway, and config — the
/// thing a caller's HTTP layer holds one of per process and calls into per
/// request (§9 "module-level singletons").
pub struct Engine {
    store: Arc<dyn DocumentStore>,
    converter: Arc<dyn DocumentConverter>,
    gateway: Arc<Gateway>,
    config: Arc<EngineConfig>,
    events: Arc<EventBus>,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
}

impl Engine {
    pub fn new(store: Arc<dyn DocumentStore>, converter: Arc<dyn DocumentConverter>, config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let gateway = Arc::new(Gateway::new(&config));
        let events = Arc::new(EventBus::new(store.clone()));
        Self {
            store,
            converter,
            gateway,
            config,
            events,
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    /// Validate the upload synchronously (§6 "createAnalysis"), then launch
    /// the pipeline in the background and return immediately with the new
    /// analysis id.
    pub async fn create_analysis(&self, model: Option<String>, upload_paths: Vec<PathBuf>) -> Result<String> {
        if upload_paths.is_empty() {
            return Err(PipelineError::Input("no files were uploaded".into()));
        }
        if upload_paths.len() > self.config.max_files {
            return Err(PipelineError::Input(format!(
                "too many files: {} exceeds the limit of {}",
                upload_paths.len(),
                self.config.max_files
            )));
        }
        for path in &upload_paths {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default().to_ascii_lowercase();
            if !archive::SUPPORTED_EXTENSIONS.contains(&ext.as_str()) && ext != "zip" {
                return Err(PipelineError::Input(format!("unsupported file extension: .{ext}")));
            }
            if let Ok(meta) = std::fs::metadata(path) {
                if meta.len() > self.config.max_file_size_bytes() {
                    return Err(PipelineError::Input(format!(
                        "file {} exceeds the {}MB size limit",
                        path.display(),
                        self.config.max_file_size_mb
                    )));
                }
            }
        }

        let model = model.unwrap_or_else(|| self.config.default_model.clone());
        let id = self.store.create_analysis(&model).await?;
        self.events.create_lane(&id).await;

        let token = CancellationToken::new();
        self.cancellations.lock().await.insert(id.clone(), token.clone());

        let orchestrator = Orchestrator {
            id: id.clone(),
            model,
            store: self.store.clone(),
            converter: self.converter.clone(),
            gateway: self.gateway.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            cancellation: token,
        };

        tokio::spawn(orchestrator.run(upload_paths));

        Ok(id)
    }

    pub async fn get_analysis(&self, id: &str) -> Result<Option<AnalysisRecord>> {
        self.store.get_analysis(id).await
    }

    pub async fn read_events_from(&self, id: &str, since_index: u32) -> Result<Vec<crate::model::Event>> {
        self.store.read_events_from(id, since_index).await
    }

    pub async fn drain_thinking(&self, id: &str) -> Vec<ThinkingChunk> {
        self.events.drain_thinking(id).await
    }

    /// Writes `status = canceled` if the analysis is still active and signals
    /// the in-process cancellation token. A no-op on a terminal analysis
    /// (§5 "Cancellation").
    pub async fn cancel_analysis(&self, id: &str) -> Result<()> {
        if let Some(record) = self.store.get_analysis(id).await? {
            if !record.status.is_terminal() {
                self.store.update_analysis(id, AnalysisPatch::status(AnalysisStatus::Canceled)).await?;
            }
        }
        if let Some(token) = self.cancellations.lock().await.get(id) {
            token.cancel();
        }
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }
}

/// Drives one analysis through its five stages. Constructed once per
/// analysis by [`Engine::create_analysis`] and consumed by its background
/// task.
struct Orchestrator {
    id: String,
    model: String,
    store: Arc<dyn DocumentStore>,
    converter: Arc<dyn DocumentConverter>,
    gateway: Arc<Gateway>,
    config: Arc<EngineConfig>,
    events: Arc<EventBus>,
    cancellation: CancellationToken,
}

impl Orchestrator {
    async fn run(self, upload_paths: Vec<PathBuf>) {
        let started = Instant::now();
        let mut metrics = Metrics {
            model_used: self.model.clone(),
            ..Metrics::default()
        };

        let outcome = self.drive(upload_paths, &mut metrics).await;
        metrics.elapsed_seconds = started.elapsed().as_secs_f64();

        match outcome {
            Ok((report, qa)) => {
                metrics.calculate_cost();
                let patch = AnalysisPatch {
                    status: Some(AnalysisStatus::Completed),
                    completed_at: Some(chrono::Utc::now()),
                    report: Some(report),
                    qa: Some(qa),
                    metrics: Some(metrics.clone()),
                    error: None,
                };
                if let Err(e) = self.store.update_analysis(&self.id, patch).await {
                    tracing::error!(analysis_id = %self.id, error = %e, "failed to persist completed analysis");
                }
                let mut data = HashMap::new();
                data.insert("total_input_tokens".to_string(), json!(self.total_input(&metrics)));
                data.insert("total_output_tokens".to_string(), json!(self.total_output(&metrics)));
                data.insert("estimated_cost_usd".to_string(), json!(metrics.estimated_cost_usd));
                let _ = self.events.emit(&self.id, EventType::MetricsUpdate, data).await;
            }
            Err(PipelineError::Cancelled) => {
                let patch = AnalysisPatch {
                    status: Some(AnalysisStatus::Canceled),
                    completed_at: Some(chrono::Utc::now()),
                    metrics: Some(metrics.clone()),
                    ..Default::default()
                };
                if let Err(e) = self.store.update_analysis(&self.id, patch).await {
                    tracing::error!(analysis_id = %self.id, error = %e, "failed to persist canceled analysis");
                }
            }
            Err(e) => {
                tracing::error!(analysis_id = %self.id, error = %e, "analysis failed");
                let patch = AnalysisPatch {
                    status: Some(AnalysisStatus::Failed),
                    completed_at: Some(chrono::Utc::now()),
                    error: Some(e.to_string()),
                    metrics: Some(metrics.clone()),
                    ..Default::default()
                };
                if let Err(update_err) = self.store.update_analysis(&self.id, patch).await {
                    tracing::error!(analysis_id = %self.id, error = %update_err, "failed to persist failed analysis");
                }
                let mut data = HashMap::new();
                data.insert("reason".to_string(), json!(e.to_string()));
                let _ = self.events.emit(&self.id, EventType::Error, data).await;
            }
        }

        self.events.remove_lane(&self.id).await;
    }

    fn total_input(&self, m: &Metrics) -> u64 {
        m.tokens_extraction_input + m.tokens_aggregation_input + m.tokens_evaluation_input
    }

    fn total_output(&self, m: &Metrics) -> u64 {
        m.tokens_extraction_output + m.tokens_aggregation_output + m.tokens_evaluation_output
    }

    /// Runs unpack → parse → extract → aggregate → evaluate, returning the
    /// final report and QA assessment. Any `Err` here is mapped to a terminal
    /// status by the caller.
    async fn drive(&self, upload_paths: Vec<PathBuf>, metrics: &mut Metrics) -> Result<(ExtractionFacts, QaReport)> {
        self.transition(AnalysisStatus::Unpacking).await?;

        let temp_dir = self.config.temp_dir.join(&self.id);
        std::fs::create_dir_all(&temp_dir)
            .map_err(|e| PipelineError::StageFatal { stage: "unpacking".into(), message: e.to_string() })?;
        let files = archive::extract_files(&upload_paths, &temp_dir)?;
        if files.is_empty() {
            return Err(PipelineError::StageFatal {
                stage: "unpacking".into(),
                message: "no supported files remained after unpacking".into(),
            });
        }
        metrics.total_files = files.len() as u32;

        self.transition(AnalysisStatus::Parsing).await?;
        let documents = self.parse(files).await;
        metrics.total_pages = documents.iter().map(|d| d.page_count).sum();
        for doc in &documents {
            self.store.add_document(&self.id, doc.clone()).await?;
        }

        self.transition(AnalysisStatus::Extracting).await?;
        let extracted = self.extract(&documents).await;
        for (_, usage) in &extracted {
            metrics.tokens_extraction_input += usage.input_tokens;
            metrics.tokens_extraction_output += usage.output_tokens;
        }
        self.events.push_thinking_done(&self.id, Phase::Extraction).await;

        self.transition(AnalysisStatus::Aggregating).await?;
        let facts: Vec<ExtractionFacts> = extracted.into_iter().map(|(f, _)| f).collect();
        let (report, aggregation_usage) = self.aggregate(&facts).await?;
        metrics.tokens_aggregation_input += aggregation_usage.input_tokens;
        metrics.tokens_aggregation_output += aggregation_usage.output_tokens;
        self.events.push_thinking_done(&self.id, Phase::Aggregation).await;

        self.transition(AnalysisStatus::Evaluating).await?;
        let (qa, evaluation_usage) = self.evaluate(&report, &documents).await?;
        metrics.tokens_evaluation_input += evaluation_usage.input_tokens;
        metrics.tokens_evaluation_output += evaluation_usage.output_tokens;
        self.events.push_thinking_done(&self.id, Phase::Evaluation).await;

        Ok((report, qa))
    }

    /// Persists the new status, then re-reads it to guard against a
    /// concurrent cancel having landed first (§4.6 "transitions are
    /// persisted before work begins").
    async fn transition(&self, status: AnalysisStatus) -> Result<()> {
        self.check_cancellation().await?;
        self.store.update_analysis(&self.id, AnalysisPatch::status(status)).await
    }

    /// Re-reads the stored status; a `canceled` status (written by
    /// [`Engine::cancel_analysis`]) raises cancellation for the caller to
    /// propagate. Also arms the in-process token so stage executors skip
    /// any work not yet started (§5 "Cancellation").
    async fn check_cancellation(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        match self.store.get_analysis(&self.id).await? {
            Some(record) if record.status == AnalysisStatus::Canceled => {
                self.cancellation.cancel();
                Err(PipelineError::Cancelled)
            }
            _ => Ok(()),
        }
    }

    async fn parse(&self, files: Vec<ExtractedFile>) -> Vec<DocumentRecord> {
        let stage = ParseStage {
            converter: self.converter.clone(),
            concurrency: self.config.parse_concurrency,
            deadline: self.config.parse_deadline,
            cancellation: self.cancellation.clone(),
        };
        stage.run(&self.events, &self.id, files).await
    }

    async fn extract(&self, documents: &[DocumentRecord]) -> Vec<(ExtractionFacts, Usage)> {
        let stage = ExtractStage {
            gateway: self.gateway.clone(),
            concurrency: self.config.extract_concurrency,
            chunk_concurrency: self.config.chunk_extract_concurrency,
            model: self.model.clone(),
            context_window_tokens: self.config.context_window_tokens,
            thinking: Thinking::Medium,
            cancellation: self.cancellation.clone(),
        };
        stage.run(&self.events, &self.id, documents).await
    }

    /// Merges per-document facts mechanically (§4.4), then asks the model to
    /// reconcile what the mechanical merge could not into one final report.
    async fn aggregate(&self, facts: &[ExtractionFacts]) -> Result<(ExtractionFacts, Usage)> {
        let mut data = HashMap::new();
        let _ = self.events.emit(&self.id, EventType::AggregationStarted, data.clone()).await;

        let max_chars = chunk::max_chars(self.config.context_window_tokens);
        let blocks: Vec<String> = facts
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let json_text = serde_json::to_string(f).unwrap_or_default();
                prompts::format_extraction_block(i + 1, &format!("document {}", i + 1), &json_text)
            })
            .collect();
        let mut per_doc_results = blocks.join("\n\n");

        if per_doc_results.len() > max_chars {
            let per_doc_budget = max_chars.saturating_sub(2_000) / facts.len().max(1);
            let shrunk: Vec<String> = facts
                .iter()
                .enumerate()
                .map(|(i, f)| {
                    let trimmed = chunk::shrink_for_aggregation(f, per_doc_budget);
                    let json_text = trimmed.to_string();
                    prompts::format_extraction_block(i + 1, &format!("document {}", i + 1), &json_text)
                })
                .collect();
            per_doc_results = shrunk.join("\n\n");
        }

        let user = prompts::aggregation_user(facts.len(), &per_doc_results);
        let schema = crate::gateway::schema::for_extraction_facts();
        let events = self.events.clone();
        let id = self.id.clone();
        let on_thinking = move |text: &str| {
            let events = events.clone();
            let id = id.clone();
            let text = text.to_string();
            tokio::spawn(async move { events.push_thinking(&id, Phase::Aggregation, text).await });
        };

        let (report, usage) = self
            .gateway
            .complete_structured_streaming::<ExtractionFacts>(
                prompts::aggregation_system(),
                &user,
                "ExtractionFacts",
                &schema,
                &self.model,
                Thinking::Medium,
                on_thinking,
            )
            .await?;

        data.insert("input_tokens".to_string(), json!(usage.input_tokens));
        data.insert("output_tokens".to_string(), json!(usage.output_tokens));
        let _ = self.events.emit(&self.id, EventType::AggregationCompleted, data).await;

        Ok((report, usage))
    }

    async fn evaluate(&self, report: &ExtractionFacts, documents: &[DocumentRecord]) -> Result<(QaReport, Usage)> {
        let mut data = HashMap::new();
        let _ = self.events.emit(&self.id, EventType::EvaluationStarted, data.clone()).await;

        let source_docs: Vec<SourceDocumentRef> = documents
            .iter()
            .map(|d| SourceDocumentRef { filename: d.filename.clone(), doc_type: d.doc_type, pages: Some(d.page_count) })
            .collect();
        let document_list = prompts::numbered_list(
            &source_docs
                .iter()
                .map(|d| format!("{} ({:?}, {} pages)", d.filename, d.doc_type, d.pages.unwrap_or(0)))
                .collect::<Vec<_>>(),
        );
        let report_json = serde_json::to_string(report).unwrap_or_default();
        let user = prompts::evaluation_user(&report_json, &document_list);
        let schema = crate::gateway::schema::for_qa_report();
        let events = self.events.clone();
        let id = self.id.clone();
        let on_thinking = move |text: &str| {
            let events = events.clone();
            let id = id.clone();
            let text = text.to_string();
            tokio::spawn(async move { events.push_thinking(&id, Phase::Evaluation, text).await });
        };

        let (mut qa, usage) = self
            .gateway
            .complete_structured_streaming::<QaReport>(
                prompts::evaluation_system(),
                &user,
                "QaReport",
                &schema,
                &self.model,
                Thinking::Low,
                on_thinking,
            )
            .await?;
        qa.source_documents = source_docs;

        data.insert("input_tokens".to_string(), json!(usage.input_tokens));
        data.insert("output_tokens".to_string(), json!(usage.output_tokens));
        let _ = self.events.emit(&self.id, EventType::EvaluationCompleted, data).await;

        Ok((qa, usage))
    }
}
