//! Text-cleanup helpers for LLM completions: stripping `<think>` blocks and
//! markdown fences before JSON parsing, and repairing the small set of
//! malformations models reliably produce (trailing commas, single quotes,
//! unescaped control characters). The gateway's JSON-object fallback path
//! (§4.2) leans on these rather than re-requesting a clean completion.

pub mod extract;
pub mod repair;

pub use extract::{preprocess, strip_think_tags};
pub use repair::try_repair_json;
