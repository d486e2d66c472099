use thiserror::Error;

/// Errors produced by the pipeline and its components.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The pipeline or payload was cancelled via the cancellation flag.
    #[error("Pipeline was cancelled")]
    Cancelled,

    /// Invalid configuration detected at build time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),

    /// §7 taxonomy: bad input from the caller (unsupported archive, file too
    /// large, too many files, empty upload). Never retried.
    #[error("invalid input: {0}")]
    Input(String),

    /// §7 taxonomy: an external dependency failure that is worth retrying
    /// (rate limit, timeout, 5xx, transport reset). Surfaced to the retry
    /// loop in [`crate::gateway`]; never escapes it as-is.
    #[error("transient external failure: {0}")]
    TransientExternal(String),

    /// §7 taxonomy: an external dependency failure that retrying cannot fix
    /// (401, 400 schema rejection after repair attempt, 404 model).
    #[error("permanent external failure: {0}")]
    PermanentExternal(String),

    /// §7 taxonomy: a stage cannot continue and the whole analysis must
    /// transition to `failed` (distinct from an item-level failure, which
    /// is absorbed in-band and never becomes a `PipelineError`).
    #[error("stage '{stage}' is fatally broken: {message}")]
    StageFatal { stage: String, message: String },
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_human_readable() {
        assert_eq!(PipelineError::Input("bad".into()).to_string(), "invalid input: bad");
        assert_eq!(
            PipelineError::TransientExternal("rate limited".into()).to_string(),
            "transient external failure: rate limited"
        );
        assert_eq!(
            PipelineError::StageFatal { stage: "unpacking".into(), message: "no files".into() }.to_string(),
            "stage 'unpacking' is fatally broken: no files"
        );
    }
}
