//! Engine configuration, §7 "Config" — loaded from environment variables
//! (optionally via a `.env` file) with typed defaults, grounded on the
//! original `AppSettings` (`config.py`).

use crate::error::{PipelineError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// All tunables the Engine needs, collected in one place so callers
/// construct it once at startup and pass it down by `Arc`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub llm_api_key: String,
    pub llm_base_url: String,
    pub default_model: String,
    pub max_file_size_mb: u64,
    pub max_files: usize,
    pub max_concurrent_analyses: usize,
    pub parse_concurrency: usize,
    pub extract_concurrency: usize,
    pub chunk_extract_concurrency: usize,
    pub parse_deadline: Duration,
    pub temp_dir: PathBuf,
    /// Context window, in tokens, assumed for `default_model` when sizing
    /// extraction chunks (§4.4 "Size envelope"). Override per deployment if
    /// `default_model` changes to one with a materially different window.
    pub context_window_tokens: u64,
}

impl EngineConfig {
    /// Load from the process environment, applying `.env` first if present.
    /// Missing variables fall back to spec defaults (§7); `LLM_API_KEY` is
    /// the only variable without a sensible default and is required.
    pub fn from_env() -> Result<Self> {
        // Best-effort: a missing .env file is not an error.
        let _ = dotenvy::dotenv();

        let llm_api_key = std::env::var("LLM_API_KEY")
            .map_err(|_| PipelineError::InvalidConfig("LLM_API_KEY is required".into()))?;
        if llm_api_key.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("LLM_API_KEY is required".into()));
        }

        Ok(Self {
            llm_api_key,
            llm_base_url: env_or("LLM_BASE_URL", "https://openrouter.ai/api/v1"),
            default_model: env_or("DEFAULT_MODEL", "anthropic/claude-sonnet-4"),
            max_file_size_mb: env_parse_or("MAX_FILE_SIZE_MB", 50),
            max_files: env_parse_or("MAX_FILES", 20),
            max_concurrent_analyses: env_parse_or("MAX_CONCURRENT_ANALYSES", 5),
            parse_concurrency: env_parse_or("PARSE_CONCURRENCY", 5),
            extract_concurrency: env_parse_or("EXTRACT_CONCURRENCY", 5),
            chunk_extract_concurrency: env_parse_or("CHUNK_EXTRACT_CONCURRENCY", 3),
            parse_deadline: Duration::from_secs(env_parse_or("PARSE_DEADLINE_SECONDS", 120)),
            temp_dir: PathBuf::from(env_or("TEMP_DIR", "/tmp/procurement-analyzer")),
            context_window_tokens: env_parse_or("CONTEXT_WINDOW_TOKENS", 200_000),
        })
    }

    /// Maximum upload size per file, in bytes.
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that mutate them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_vars() {
        for key in [
            "LLM_API_KEY",
            "LLM_BASE_URL",
            "DEFAULT_MODEL",
            "MAX_FILE_SIZE_MB",
            "MAX_FILES",
            "MAX_CONCURRENT_ANALYSES",
            "PARSE_CONCURRENCY",
            "EXTRACT_CONCURRENCY",
            "CHUNK_EXTRACT_CONCURRENCY",
            "PARSE_DEADLINE_SECONDS",
            "TEMP_DIR",
            "CONTEXT_WINDOW_TOKENS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn missing_api_key_is_invalid_config() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_vars();
        let result = EngineConfig::from_env();
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn defaults_applied_when_only_key_set() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_vars();
        std::env::set_var("LLM_API_KEY", "sk-test");
        let cfg = EngineConfig::from_env().unwrap();
        assert_eq!(cfg.default_model, "anthropic/claude-sonnet-4");
        assert_eq!(cfg.max_file_size_mb, 50);
        assert_eq!(cfg.max_files, 20);
        assert_eq!(cfg.extract_concurrency, 5);
        assert_eq!(cfg.chunk_extract_concurrency, 3);
        assert_eq!(cfg.parse_deadline, Duration::from_secs(120));
        assert_eq!(cfg.context_window_tokens, 200_000);
        clear_vars();
    }

    #[test]
    fn overrides_are_respected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_vars();
        std::env::set_var("LLM_API_KEY", "sk-test");
        std::env::set_var("MAX_FILES", "7");
        std::env::set_var("EXTRACT_CONCURRENCY", "9");
        let cfg = EngineConfig::from_env().unwrap();
        assert_eq!(cfg.max_files, 7);
        assert_eq!(cfg.extract_concurrency, 9);
        clear_vars();
    }

    #[test]
    fn max_file_size_bytes_conversion() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_vars();
        std::env::set_var("LLM_API_KEY", "sk-test");
        let cfg = EngineConfig::from_env().unwrap();
        assert_eq!(cfg.max_file_size_bytes(), 50 * 1024 * 1024);
        clear_vars();
    }
}
