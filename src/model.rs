//! The Data Model (§3): Analysis Record, Document Record, Event, ThinkingChunk,
//! Extraction Facts, QA Report.
//!
//! Every field that the LLM is asked to fill in is `Option`/`Vec`-shaped so a
//! missing fact never fails deserialization — the model is instructed to
//! return `null`/`[]` rather than guess, and the wire schema in
//! [`crate::gateway::schema`] is derived from these same types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// `status` lifecycle, §3. Only the Orchestrator may advance a non-terminal
/// state; only cancellation may write `Canceled`. `Completed`, `Failed`, and
/// `Canceled` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Unpacking,
    Parsing,
    Extracting,
    Aggregating,
    Evaluating,
    Completed,
    Failed,
    Canceled,
}

impl AnalysisStatus {
    /// Is this one of the three absorbing states?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AnalysisStatus::Completed | AnalysisStatus::Failed | AnalysisStatus::Canceled
        )
    }

    /// `progress.progressPercent` per §6 — status buckets, with `extracting`
    /// interpolated linearly by the caller using `completed/total`.
    pub fn progress_percent(self) -> u8 {
        match self {
            AnalysisStatus::Pending => 0,
            AnalysisStatus::Unpacking => 5,
            AnalysisStatus::Parsing => 15,
            AnalysisStatus::Extracting => 40,
            AnalysisStatus::Aggregating => 70,
            AnalysisStatus::Evaluating => 85,
            AnalysisStatus::Completed => 100,
            AnalysisStatus::Failed | AnalysisStatus::Canceled => 0,
        }
    }
}

/// §3 — classified document type, first-match-wins over an ordered regex list
/// (see [`crate::classify`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    TechnicalSpec,
    Contract,
    Invitation,
    Qualification,
    Evaluation,
    Annex,
    Other,
}

impl Default for DocumentType {
    fn default() -> Self {
        DocumentType::Other
    }
}

/// Per-stage/total token and timing accounting, §4.6 "Cost model".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    pub total_files: u32,
    pub total_pages: u32,
    pub elapsed_seconds: f64,
    pub tokens_extraction_input: u64,
    pub tokens_extraction_output: u64,
    pub tokens_aggregation_input: u64,
    pub tokens_aggregation_output: u64,
    pub tokens_evaluation_input: u64,
    pub tokens_evaluation_output: u64,
    pub estimated_cost_usd: f64,
    pub model_used: String,
}

impl Metrics {
    /// §4.6: `(inputTokensTotal / 1e6) * 3.0 + (outputTokensTotal / 1e6) * 15.0`.
    pub fn calculate_cost(&mut self) {
        let input_total = (self.tokens_extraction_input
            + self.tokens_aggregation_input
            + self.tokens_evaluation_input) as f64;
        let output_total = (self.tokens_extraction_output
            + self.tokens_aggregation_output
            + self.tokens_evaluation_output) as f64;
        self.estimated_cost_usd = (input_total / 1_000_000.0) * 3.0 + (output_total / 1_000_000.0) * 15.0;
    }
}

/// The durable unit, §3 "Analysis Record". Created when the client submits;
/// mutated only by the Orchestrator and the cancel operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: AnalysisStatus,
    pub model: String,
    pub report: Option<ExtractionFacts>,
    pub qa: Option<QaReport>,
    pub metrics: Metrics,
    pub error: Option<String>,
}

/// Patch applied to an [`AnalysisRecord`] by `DocumentStore::update_analysis`.
/// Every field is optional — only named fields are written.
#[derive(Debug, Clone, Default)]
pub struct AnalysisPatch {
    pub status: Option<AnalysisStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    pub report: Option<ExtractionFacts>,
    pub qa: Option<QaReport>,
    pub metrics: Option<Metrics>,
    pub error: Option<String>,
}

impl AnalysisPatch {
    pub fn status(status: AnalysisStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Per-parsed-file record, §3 "Document Record". Created during the parse
/// stage; immutable thereafter — even a failed parse produces one, with
/// content beginning with the `[ERROR]` sentinel (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub filename: String,
    pub doc_type: DocumentType,
    pub page_count: u32,
    pub content: String,
    pub extraction: Option<ExtractionFacts>,
}

impl DocumentRecord {
    pub const ERROR_SENTINEL: &'static str = "[ERROR]";

    pub fn is_error(&self) -> bool {
        self.content.starts_with(Self::ERROR_SENTINEL)
    }
}

/// §3 "Event" — `{index, timestamp, event_type, data}`. Indices are dense
/// and start at 0 per analysis; append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub index: u32,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub data: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FileParsed,
    ExtractionStarted,
    ExtractionCompleted,
    AggregationStarted,
    AggregationCompleted,
    EvaluationStarted,
    EvaluationCompleted,
    MetricsUpdate,
    Error,
}

/// §3 "ThinkingChunk" — ephemeral, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThinkingChunk {
    Thinking { phase: Phase, text: String },
    ThinkingDone { phase: Phase },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Extraction,
    Aggregation,
    Evaluation,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Extraction => "extraction",
            Phase::Aggregation => "aggregation",
            Phase::Evaluation => "evaluation",
        }
    }
}

// ── Extraction Facts, §3 / §4.4 / §9 ────────────────────────────────────────
//
// Declared once; both the runtime validator (via `Deserialize`) and the
// wire schema sent to the LLM (via `crate::gateway::schema::for_extraction_facts`)
// derive from this single shape, per the Design Notes' "declare once" guidance.

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Organization {
    pub name: Option<String>,
    pub registration_number: Option<String>,
    pub contact_email: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FinancialTerms {
    pub payment_schedule: Option<String>,
    pub advance_payment_percent: Option<f64>,
    #[serde(default)]
    pub penalty_clauses: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubmissionRequirements {
    pub format: Option<String>,
    pub language: Option<String>,
    #[serde(default)]
    pub required_documents: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EvaluationCriterion {
    pub name: String,
    pub weight: Option<f64>,
    pub description: Option<String>,
}

/// The structured container produced per-document by the extraction stage
/// and, after merge, for the whole analysis — same shape both times.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractionFacts {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub procurement_type: Option<String>,
    pub estimated_value: Option<f64>,
    pub currency: Option<String>,
    pub vat_included: Option<bool>,
    pub submission_deadline: Option<String>,
    pub contract_duration: Option<String>,

    pub organization: Option<Organization>,
    pub financial_terms: Option<FinancialTerms>,
    pub submission_requirements: Option<SubmissionRequirements>,

    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub evaluation_criteria: Vec<EvaluationCriterion>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub qualifications: Vec<String>,
    #[serde(default)]
    pub source_references: Vec<String>,
    #[serde(default)]
    pub confidence_notes: Vec<String>,
}

impl ExtractionFacts {
    /// §4.5 item-level extraction failure: an empty record carrying the
    /// failure reason in `confidence_notes`.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            confidence_notes: vec![reason.into()],
            ..Default::default()
        }
    }

    /// §4.4 "Aggregate shrink" — the essential-field allowlist an
    /// aggregation pass cannot reasonably proceed without.
    pub const ESSENTIAL_FIELDS: &'static [&'static str] = &[
        "title",
        "summary",
        "procurement_type",
        "estimated_value",
        "currency",
        "submission_deadline",
        "requirements",
        "risks",
    ];
}

/// §3 "QA Report", produced by the evaluation stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QaReport {
    pub completeness_score: f64,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub missing_fields: Vec<String>,
    #[serde(default)]
    pub source_documents: Vec<SourceDocumentRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceDocumentRef {
    pub filename: String,
    pub doc_type: DocumentType,
    pub pages: Option<u32>,
}

/// Token usage returned by a single LLM Gateway call (§4.2).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl std::ops::Add for Usage {
    type Output = Usage;
    fn add(self, rhs: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
        }
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_terminal_classification() {
        assert!(AnalysisStatus::Completed.is_terminal());
        assert!(AnalysisStatus::Failed.is_terminal());
        assert!(AnalysisStatus::Canceled.is_terminal());
        assert!(!AnalysisStatus::Extracting.is_terminal());
    }

    #[test]
    fn progress_buckets_match_spec() {
        assert_eq!(AnalysisStatus::Pending.progress_percent(), 0);
        assert_eq!(AnalysisStatus::Unpacking.progress_percent(), 5);
        assert_eq!(AnalysisStatus::Parsing.progress_percent(), 15);
        assert_eq!(AnalysisStatus::Aggregating.progress_percent(), 70);
        assert_eq!(AnalysisStatus::Evaluating.progress_percent(), 85);
        assert_eq!(AnalysisStatus::Completed.progress_percent(), 100);
        assert_eq!(AnalysisStatus::Failed.progress_percent(), 0);
    }

    #[test]
    fn cost_formula() {
        let mut m = Metrics {
            tokens_extraction_input: 500_000,
            tokens_aggregation_input: 300_000,
            tokens_evaluation_input: 200_000,
            tokens_extraction_output: 50_000,
            tokens_aggregation_output: 30_000,
            tokens_evaluation_output: 20_000,
            ..Default::default()
        };
        m.calculate_cost();
        // input total 1e6 -> $3.0, output total 1e5 -> $1.5
        assert!((m.estimated_cost_usd - 4.5).abs() < 1e-9);
    }

    #[test]
    fn document_record_error_sentinel() {
        let doc = DocumentRecord {
            filename: "a.pdf".into(),
            doc_type: DocumentType::Other,
            page_count: 0,
            content: "[ERROR] parse failed".into(),
            extraction: None,
        };
        assert!(doc.is_error());
    }

    #[test]
    fn extraction_failed_helper_sets_confidence_notes() {
        let facts = ExtractionFacts::failed("boom");
        assert_eq!(facts.confidence_notes, vec!["boom".to_string()]);
        assert!(facts.title.is_none());
    }
}
