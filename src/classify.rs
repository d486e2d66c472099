//! Document classification, §4.2. Ordered Lithuanian keyword stems applied
//! first to the filename, then to the first 2000 characters of content;
//! first match wins. Grounded on `parser.py::classify_document` and
//! `_CLASSIFICATION_RULES`.

use crate::model::DocumentType;
use regex::Regex;
use std::sync::OnceLock;

/// Characters of leading content consulted when the filename doesn't match
/// any stem (`content_preview` in the original).
pub const CONTENT_PREVIEW_CHARS: usize = 2000;

struct Rule {
    pattern: &'static str,
    doc_type: DocumentType,
}

const RULES: &[Rule] = &[
    Rule { pattern: "technin|specifikacij", doc_type: DocumentType::TechnicalSpec },
    Rule { pattern: "sutart", doc_type: DocumentType::Contract },
    Rule { pattern: "kvietim|skelbim", doc_type: DocumentType::Invitation },
    Rule { pattern: "kvalifikacij", doc_type: DocumentType::Qualification },
    Rule { pattern: "vertinim|kriterij", doc_type: DocumentType::Evaluation },
    Rule { pattern: "pried|forma|šablon|sablon", doc_type: DocumentType::Annex },
];

fn compiled_rules() -> &'static [(Regex, DocumentType)] {
    static CELL: OnceLock<Vec<(Regex, DocumentType)>> = OnceLock::new();
    CELL.get_or_init(|| {
        RULES
            .iter()
            .map(|r| {
                let re = Regex::new(&format!("(?i){}", r.pattern))
                    .expect("classification regex is a compile-time constant");
                (re, r.doc_type)
            })
            .collect()
    })
}

/// Classify a document by filename first, then by a preview of its content.
/// Returns [`DocumentType::Other`] if nothing matches.
pub fn classify_document(filename: &str, content: &str) -> DocumentType {
    for (re, doc_type) in compiled_rules() {
        if re.is_match(filename) {
            return *doc_type;
        }
    }

    let preview_len = content
        .char_indices()
        .nth(CONTENT_PREVIEW_CHARS)
        .map(|(idx, _)| idx)
        .unwrap_or(content.len());
    let preview = &content[..preview_len];

    for (re, doc_type) in compiled_rules() {
        if re.is_match(preview) {
            return *doc_type;
        }
    }

    DocumentType::Other
}

/// Estimate page count from converted markdown, §4.2. XLSX documents count
/// `## ` section markers as sheets; everything else uses ~3000 chars/page.
pub fn estimate_pages(content: &str, file_ext: &str) -> u32 {
    if content.is_empty() {
        return 0;
    }

    let ext = file_ext.trim_start_matches('.').to_ascii_lowercase();
    if ext == "xlsx" || ext == "xls" {
        let sheet_markers = content
            .lines()
            .filter(|line| line.starts_with("## "))
            .count();
        return sheet_markers.max(1) as u32;
    }

    ((content.len() / 3000).max(1)) as u32
}
