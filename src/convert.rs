//! The Document Converter boundary, §4.5 supplement. Real PDF/DOCX/XLSX
//! conversion is out of scope (§1) and is the caller's responsibility to
//! supply via [`DocumentConverter`]; this module also carries a reference
//! plain-text implementation used by the crate's own tests, grounded on
//! `parser.py`'s `ParsedDocument` shape (markdown text + page count).

use crate::classify::estimate_pages;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The output of a single document conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedDocument {
    pub markdown: String,
    pub page_count: Option<u32>,
}

/// External collaborator that turns an on-disk file into markdown text.
/// A real deployment supplies a PDF/DOCX/XLSX-capable implementation;
/// the crate core only depends on this trait.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert(&self, path: &Path, deadline: Duration) -> Result<ConvertedDocument>;
}

/// Reads a file as UTF-8 text and reports it back unmodified, estimating
/// page count from its length (§4.2). Used for the crate's own tests and
/// for any already-text formats (e.g. plain `.txt`/`.md` uploads); real
/// binary document formats must be handled by an external converter.
pub struct PlainTextConverter;

#[async_trait]
impl DocumentConverter for PlainTextConverter {
    async fn convert(&self, path: &Path, deadline: Duration) -> Result<ConvertedDocument> {
        let path = path.to_path_buf();
        let read = tokio::task::spawn_blocking(move || read_text(&path));
        let markdown = tokio::time::timeout(deadline, read)
            .await
            .map_err(|_| PipelineError::TransientExternal("document conversion timed out".into()))?
            .map_err(|e| PipelineError::Other(format!("conversion task panicked: {e}")))??;

        // Plain text never hits the XLSX sheet-counting branch, so the
        // extension argument is irrelevant here.
        let page_count = Some(estimate_pages(&markdown, "txt"));
        Ok(ConvertedDocument { markdown, page_count })
    }
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| PipelineError::Other(format!("failed reading {}: {e}", path.display())))
}
