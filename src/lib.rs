//! # Procurement Pipeline
//!
//! A stage-structured, cancellable, concurrent pipeline that turns a batch
//! of uploaded procurement documents (technical specifications, contracts,
//! invitations, qualification and evaluation criteria, annexes — typically
//! Lithuanian-language public tender packages) into one aggregated report
//! plus a quality assessment.
//!
//! ## Shape
//!
//! - **[`Engine`]** — the process-wide owner of the store, document
//!   converter, LLM gateway, and configuration. Construct one per process
//!   and call [`Engine::create_analysis`] per request; it validates the
//!   upload synchronously and launches the pipeline in the background.
//! - **[`store::DocumentStore`]** — durable persistence boundary (analyses,
//!   documents, the event log); [`store::InMemoryStore`] is the reference
//!   implementation this crate ships.
//! - **[`convert::DocumentConverter`]** — bytes-to-markdown boundary; a real
//!   deployment supplies a PDF/DOCX/XLSX/PPTX-capable implementation.
//! - **[`gateway::Gateway`]** — the single outbound channel to the
//!   chat-completion service, with retries, schema normalization, and SSE
//!   streaming.
//! - **[`events::EventBus`]** — durable events (forwarded to the store) plus
//!   a per-analysis ephemeral "thinking" lane for live progress viewers.
//!
//! Five stages run in sequence per analysis: unpacking, parsing, extracting,
//! aggregating, evaluating. Each is driven by the internal `Orchestrator`;
//! [`archive`], [`stage`], [`chunk`], and [`classify`] implement the
//! unpacking, fan-out, chunk/merge, and document-classification mechanics
//! respectively.
//!
//! ## Quick start
//!
//! ```no_run
//! use procurement_pipeline::{Engine, EngineConfig};
//! use procurement_pipeline::store::InMemoryStore;
//! use procurement_pipeline::convert::PlainTextConverter;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_env()?;
//!     let engine = Engine::new(
//!         Arc::new(InMemoryStore::new()),
//!         Arc::new(PlainTextConverter),
//!         config,
//!     );
//!
//!     let id = engine
//!         .create_analysis(None, vec!["tender.pdf".into()])
//!         .await?;
//!
//!     let record = engine.get_analysis(&id).await?;
//!     println!("{record:?}");
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod chunk;
pub mod classify;
pub mod config;
pub mod convert;
pub mod error;
pub mod events;
pub mod gateway;
pub mod model;
pub mod orchestrator;
pub mod output_parser;
pub mod prompts;
pub mod sse;
pub mod stage;
pub mod store;

pub use config::EngineConfig;
pub use error::{PipelineError, Result};
pub use events::EventBus;
pub use gateway::Gateway;
pub use model::{
    AnalysisPatch, AnalysisRecord, AnalysisStatus, DocumentRecord, DocumentType, Event, EventType, ExtractionFacts,
    Metrics, Phase, QaReport, ThinkingChunk, Usage,
};
pub use orchestrator::Engine;
pub use store::{DocumentStore, InMemoryStore};
