//! Archive unpacking, §4.1. Recursively extracts ZIP archives, sanitizing
//! entry names against path traversal and filtering to supported document
//! extensions. Grounded on `zip_extractor.py`.

use crate::error::{PipelineError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Extensions the downstream parser can handle.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "pdf", "docx", "xlsx", "pptx", "png", "tiff", "jpg", "jpeg",
];

/// Maximum nested-ZIP recursion depth — ZIP-bomb protection (§4.1).
pub const MAX_DEPTH: u32 = 10;

/// A supported file discovered during unpacking, ready for the parse stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    /// Path on disk where the bytes live (either the original upload or a
    /// location under a temp extraction directory).
    pub path: PathBuf,
    /// The original filename as seen in the archive (or the upload name),
    /// used for classification and for the document record.
    pub original_name: String,
}

fn extension_lower(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Normalize a ZIP entry name into a safe relative path, or `None` if the
/// entry has no safe remainder once traversal components are stripped.
///
/// Mirrors `_sanitize_filename`: normalizes backslashes, then drops any
/// `.`, `..`, empty, or two-character drive-letter (`C:`) path segment.
fn sanitize_entry_name(name: &str) -> Option<PathBuf> {
    let cleaned = name.replace('\\', "/");
    let mut parts = Vec::new();
    for part in cleaned.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            continue;
        }
        if part.len() == 2 && part.as_bytes()[1] == b':' {
            continue;
        }
        parts.push(part);
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.iter().collect())
}

/// Extract a ZIP file into `dest_dir`, recursing into nested ZIPs up to
/// [`MAX_DEPTH`]. A corrupt or unreadable archive contributes zero files
/// without aborting the caller's batch (§4.1 edge case).
fn extract_zip(zip_path: &Path, dest_dir: &Path, depth: u32) -> Vec<ExtractedFile> {
    if depth > MAX_DEPTH {
        warn!(zip = %zip_path.display(), depth, "max ZIP nesting depth exceeded, skipping");
        return Vec::new();
    }

    let file = match fs::File::open(zip_path) {
        Ok(f) => f,
        Err(e) => {
            warn!(zip = %zip_path.display(), error = %e, "could not open archive, skipping");
            return Vec::new();
        }
    };

    let mut archive = match zip::ZipArchive::new(file) {
        Ok(a) => a,
        Err(e) => {
            warn!(zip = %zip_path.display(), error = %e, "corrupt or invalid ZIP, skipping");
            return Vec::new();
        }
    };

    let canonical_dest = match fs::canonicalize(dest_dir) {
        Ok(p) => p,
        Err(_) => dest_dir.to_path_buf(),
    };

    let mut results = Vec::new();

    for i in 0..archive.len() {
        let mut entry = match archive.by_index(i) {
            Ok(e) => e,
            Err(e) => {
                warn!(zip = %zip_path.display(), error = %e, "failed reading ZIP entry, skipping");
                continue;
            }
        };

        if entry.is_dir() {
            continue;
        }

        let raw_name = entry.name().to_string();
        let Some(safe_rel) = sanitize_entry_name(&raw_name) else {
            warn!(entry = %raw_name, zip = %zip_path.display(), "skipping entry with invalid name");
            continue;
        };

        let target_path = dest_dir.join(&safe_rel);

        // Belt-and-suspenders containment check, same as the original's
        // resolve().relative_to() guard.
        let would_resolve = canonical_dest.join(&safe_rel);
        if !would_resolve.starts_with(&canonical_dest) {
            warn!(entry = %raw_name, zip = %zip_path.display(), "path traversal detected, skipping");
            continue;
        }

        if let Some(parent) = target_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(entry = %raw_name, error = %e, "failed creating parent dir, skipping");
                continue;
            }
        }

        let mut out = match fs::File::create(&target_path) {
            Ok(f) => f,
            Err(e) => {
                warn!(entry = %raw_name, error = %e, "failed to create output file, skipping");
                continue;
            }
        };
        if let Err(e) = std::io::copy(&mut entry, &mut out) {
            warn!(entry = %raw_name, error = %e, "failed to extract entry, skipping");
            continue;
        }
        drop(out);

        let ext = extension_lower(&target_path);

        if ext == "zip" {
            let nested_dest = target_path.with_extension("extracted");
            if fs::create_dir_all(&nested_dest).is_ok() {
                debug!(entry = %raw_name, depth = depth + 1, "found nested ZIP, recursing");
                results.extend(extract_zip(&target_path, &nested_dest, depth + 1));
            }
        } else if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
            let original_name = safe_rel
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(&raw_name)
                .to_string();
            debug!(file = %original_name, "extracted supported file");
            results.push(ExtractedFile {
                path: target_path,
                original_name,
            });
        } else {
            debug!(entry = %raw_name, ext = %ext, "skipping unsupported file");
        }
    }

    results
}

/// §4.1 top-level entry point: take raw upload paths (which may include ZIP
/// archives), extract any archives, and return a flat list of supported
/// files ready for parsing. Unsupported or missing uploads are dropped with
/// a warning, never aborting the batch.
pub fn extract_files(upload_paths: &[PathBuf], temp_dir: &Path) -> Result<Vec<ExtractedFile>> {
    let mut results = Vec::new();

    for (i, path) in upload_paths.iter().enumerate() {
        if !path.exists() {
            warn!(path = %path.display(), "upload path does not exist, skipping");
            continue;
        }

        let ext = extension_lower(path);

        if ext == "zip" {
            let dest_dir = temp_dir.join(format!("zip_extract_{i}"));
            fs::create_dir_all(&dest_dir)
                .map_err(|e| PipelineError::StageFatal { stage: "unpacking".into(), message: e.to_string() })?;
            info!(zip = %path.display(), dest = %dest_dir.display(), "extracting archive");
            let extracted = extract_zip(path, &dest_dir, 0);
            info!(zip = %path.display(), count = extracted.len(), "archive extraction complete");
            results.extend(extracted);
        } else if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
            let original_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            results.push(ExtractedFile {
                path: path.clone(),
                original_name,
            });
        } else {
            warn!(path = %path.display(), ext = %ext, "unsupported file type, skipping");
        }
    }

    info!(inputs = upload_paths.len(), outputs = results.len(), "file extraction complete");
    Ok(results)
}
