//! The LLM Gateway (C2): the single outbound channel to the chat-completion
//! service. One connection-pooled HTTP client, a bespoke retry policy,
//! schema normalization for two provider flavors, JSON extraction with a
//! schema-repair fallback, and SSE token streaming.
//!
//! Grounded stylistically on `backend/openai.rs` (body/request-builder
//! separation, redacting `Debug` impl) and `backend/mock.rs` (scripted
//! responses for tests), but the retry/parsing algorithm itself follows
//! `llm.py`'s `LLMClient` — this crate's closest real ancestor — enriched
//! with the anthropic-family JSON-object fallback and schema-repair retry
//! that the distilled spec added on top of it.

use crate::error::{PipelineError, Result};
use crate::sse::SseDecoder;
use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::model::Usage;

const BASE_DELAYS_SECONDS: [u64; 3] = [2, 4, 8];
const MAX_ATTEMPTS: usize = 3;
const EMPTY_RESPONSE_RETRIES: usize = 2;
const EMPTY_RESPONSE_DELAYS_SECONDS: [(u64, u64); 2] = [(1, 3), (3, 6)];

/// Coarse reasoning-effort knob. Maps to a token budget; `Off` omits the
/// `thinking` parameter from the request entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Thinking {
    Off,
    Low,
    Medium,
    High,
}

impl Thinking {
    pub fn budget_tokens(self) -> u32 {
        match self {
            Thinking::Off => 0,
            Thinking::Low => 2_000,
            Thinking::Medium => 5_000,
            Thinking::High => 10_000,
        }
    }
}

/// A model entry as returned by [`Gateway::list_models`].
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub supports_json_schema: bool,
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
}

/// Models always surfaced first in the filtered listing, regardless of
/// their advertised capability flags.
const ALWAYS_INCLUDE_MODELS: &[&str] = &["anthropic/claude-sonnet-4", "openai/gpt-4o"];

/// ── Schema normalization ────────────────────────────────────────────────

pub mod schema {
    use serde_json::{Map, Value};

    /// Strip `title`/`description`/`default` keys recursively and force
    /// `additionalProperties: false` on every object node, per §4.2.
    pub fn normalize(schema: &Value) -> Value {
        match schema {
            Value::Object(map) => {
                let mut cleaned = Map::new();
                for (key, value) in map {
                    if key == "title" || key == "description" || key == "default" {
                        continue;
                    }
                    cleaned.insert(key.clone(), normalize(value));
                }
                if cleaned.get("type").and_then(Value::as_str) == Some("object") {
                    cleaned.insert("additionalProperties".into(), Value::Bool(false));
                }
                Value::Object(cleaned)
            }
            Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
            other => other.clone(),
        }
    }

    /// A compact one-line `field: type, field: type, ...` hint built from a
    /// schema's top-level properties, used to steer JSON-object-only
    /// providers that cannot be given a strict schema directly.
    pub fn compact_type_hint(schema: &Value) -> String {
        let Some(props) = schema.get("properties").and_then(Value::as_object) else {
            return String::new();
        };
        props
            .iter()
            .map(|(name, def)| {
                let ty = def.get("type").and_then(Value::as_str).unwrap_or("any");
                format!("{name}: {ty}")
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn for_extraction_facts() -> Value {
        crate::gateway::extraction_facts_schema()
    }

    pub fn for_qa_report() -> Value {
        crate::gateway::qa_report_schema()
    }
}

/// `true` if `model` belongs to the JSON-object-only ("anthropic-family")
/// flavor rather than the strict-schema flavor.
fn is_anthropic_family(model: &str) -> bool {
    model.starts_with("anthropic/") || model.contains("claude")
}

/// ── Request/response plumbing ──────────────────────────────────────────

/// A fully-formed completion request, independent of transport.
#[derive(Debug, Clone)]
struct RequestSpec {
    model: String,
    system: String,
    user: String,
    temperature: f64,
    thinking: Thinking,
    /// `Some` for structured calls: the normalized schema plus a name.
    schema: Option<(String, Value)>,
    stream: bool,
}

/// The accumulated result of a (possibly streamed) completion call.
#[derive(Debug, Clone, Default)]
struct RawResponse {
    status: u16,
    content: String,
    reasoning: String,
    usage: Usage,
    body_text: String,
}

/// Errors a [`Transport`] can raise; the retry loop classifies these.
#[derive(Debug, Clone)]
enum TransportError {
    Http { status: u16, body: String },
    Connect(String),
}

/// A delta observed while streaming.
struct StreamChunk {
    content_delta: Option<String>,
    reasoning_delta: Option<String>,
}

/// Abstracts the wire transport so the retry/parsing logic can be unit
/// tested without a live HTTP connection.
#[async_trait]
trait Transport: Send + Sync {
    async fn send(&self, spec: &RequestSpec) -> std::result::Result<RawResponse, TransportError>;

    async fn send_streaming(
        &self,
        spec: &RequestSpec,
        on_chunk: &mut (dyn FnMut(StreamChunk) + Send),
    ) -> std::result::Result<RawResponse, TransportError>;

    /// Model catalog. `HttpTransport` fetches it live from `GET /models`;
    /// test doubles override this to return a fixed list without a network
    /// call.
    async fn catalog(&self) -> Option<Vec<ModelInfo>> {
        None
    }
}

/// ── HTTP transport ──────────────────────────────────────────────────────

struct HttpTransport {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl HttpTransport {
    fn new(api_key: impl Into<String>, base_url: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            default_model: default_model.into(),
        }
    }

    fn build_body(&self, spec: &RequestSpec) -> Value {
        let mut messages = vec![json!({"role": "system", "content": spec.system})];
        messages.push(json!({"role": "user", "content": spec.user}));

        let mut body = json!({
            "model": if spec.model.is_empty() { self.default_model.clone() } else { spec.model.clone() },
            "messages": messages,
            "temperature": spec.temperature,
            "stream": spec.stream,
        });

        if let Some((name, cleaned)) = &spec.schema {
            if is_anthropic_family(&spec.model) {
                body["response_format"] = json!({"type": "json_object"});
                // Anthropic-family providers get a compact type hint instead
                // of a strict schema, appended to the system message with an
                // ephemeral cache marker so repeated long prompts aren't
                // re-billed in full.
                let hint = schema::compact_type_hint(cleaned);
                let system_with_hint =
                    format!("{}\n\nGrąžink JSON objektą su laukais: {hint}", spec.system);
                body["messages"][0] = json!({
                    "role": "system",
                    "content": system_with_hint,
                    "cache_control": {"type": "ephemeral"},
                });
            } else {
                body["response_format"] = json!({
                    "type": "json_schema",
                    "json_schema": {"name": name, "schema": cleaned, "strict": true},
                });
            }
        }

        if spec.thinking != Thinking::Off {
            body["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": spec.thinking.budget_tokens(),
            });
        }

        body
    }

    fn auth_headers(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", "https://procurement-analyzer.app")
            .header("X-Title", "Procurement Analyzer")
    }

    fn extract_usage(data: &Value) -> Usage {
        let usage = data.get("usage").cloned().unwrap_or(Value::Null);
        Usage {
            input_tokens: usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
            output_tokens: usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, spec: &RequestSpec) -> std::result::Result<RawResponse, TransportError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = self.build_body(spec);
        let req = self.auth_headers(self.client.post(&url).json(&body));

        let resp = req.send().await.map_err(|e| TransportError::Connect(e.to_string()))?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| TransportError::Connect(e.to_string()))?;

        if status >= 400 {
            return Err(TransportError::Http { status, body: text });
        }

        let data: Value = serde_json::from_str(&text)
            .map_err(|e| TransportError::Connect(format!("invalid JSON body: {e}")))?;
        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        let reasoning = data["choices"][0]["message"]["reasoning"]
            .as_str()
            .or_else(|| data["choices"][0]["message"]["reasoning_content"].as_str())
            .unwrap_or("")
            .to_string();

        Ok(RawResponse {
            status,
            content,
            reasoning,
            usage: Self::extract_usage(&data),
            body_text: text,
        })
    }

    async fn send_streaming(
        &self,
        spec: &RequestSpec,
        on_chunk: &mut (dyn FnMut(StreamChunk) + Send),
    ) -> std::result::Result<RawResponse, TransportError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = self.build_body(spec);
        let req = self.auth_headers(self.client.post(&url).json(&body));

        let resp = req.send().await.map_err(|e| TransportError::Connect(e.to_string()))?;
        let status = resp.status().as_u16();
        if status >= 400 {
            let text = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http { status, body: text });
        }

        let mut decoder = SseDecoder::new();
        let mut content = String::new();
        let mut reasoning = String::new();
        let mut usage = Usage::default();
        let mut stream = resp.bytes_stream();

        while let Some(next) = stream.next().await {
            let bytes = next.map_err(|e| TransportError::Connect(e.to_string()))?;
            for value in decoder.decode(&bytes) {
                apply_stream_event(&value, &mut content, &mut reasoning, &mut usage, on_chunk);
            }
        }
        for value in decoder.flush() {
            apply_stream_event(&value, &mut content, &mut reasoning, &mut usage, on_chunk);
        }

        Ok(RawResponse { status, content, reasoning, usage, body_text: String::new() })
    }

    /// `GET /models`, per `original_source/.../llm.py::list_models`: the
    /// response's `data` array holds one entry per model, pricing given as
    /// per-token decimal strings and JSON-schema support signaled by
    /// `supported_parameters` containing `"json_schema"`.
    async fn catalog(&self) -> Option<Vec<ModelInfo>> {
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        let resp = self.auth_headers(self.client.get(&url)).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let data: Value = resp.json().await.ok()?;
        let entries = data.get("data")?.as_array()?;

        Some(
            entries
                .iter()
                .filter_map(|m| {
                    let id = m.get("id")?.as_str()?.to_string();
                    let name = m.get("name").and_then(Value::as_str).unwrap_or(&id).to_string();
                    let supports_json_schema = m
                        .get("supported_parameters")
                        .and_then(Value::as_array)
                        .is_some_and(|params| params.iter().any(|p| p.as_str() == Some("json_schema")));
                    let per_token = |key: &str| -> f64 {
                        m.get("pricing")
                            .and_then(|p| p.get(key))
                            .and_then(Value::as_str)
                            .and_then(|s| s.parse().ok())
                            .unwrap_or(0.0)
                    };
                    Some(ModelInfo {
                        id,
                        name,
                        supports_json_schema,
                        input_price_per_million: per_token("prompt") * 1_000_000.0,
                        output_price_per_million: per_token("completion") * 1_000_000.0,
                    })
                })
                .collect(),
        )
    }
}

/// Applies one decoded SSE JSON payload: updates running `content`/
/// `reasoning`/`usage` accumulators and forwards the delta to `on_chunk`.
fn apply_stream_event(
    value: &Value,
    content: &mut String,
    reasoning: &mut String,
    usage: &mut Usage,
    on_chunk: &mut (dyn FnMut(StreamChunk) + Send),
) {
    if let Some(u) = value.get("usage") {
        *usage = Usage {
            input_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
            output_tokens: u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
        };
    }
    let delta = &value["choices"][0]["delta"];
    let content_delta = delta.get("content").and_then(Value::as_str).map(String::from);
    let reasoning_delta = delta
        .get("reasoning")
        .or_else(|| delta.get("reasoning_content"))
        .and_then(Value::as_str)
        .map(String::from);

    if let Some(c) = &content_delta {
        content.push_str(c);
    }
    if let Some(r) = &reasoning_delta {
        reasoning.push_str(r);
    }
    on_chunk(StreamChunk { content_delta, reasoning_delta });
}

/// ── Retry loop ──────────────────────────────────────────────────────────

fn jittered_delay(base_seconds: u64) -> Duration {
    let jitter = 1.0 + fastrand::f64() * 0.5; // uniform in [1.0, 1.5)
    Duration::from_secs_f64(base_seconds as f64 * jitter)
}

fn jittered_delay_range(min_seconds: u64, max_seconds: u64) -> Duration {
    let span = (max_seconds - min_seconds) as f64;
    Duration::from_secs_f64(min_seconds as f64 + fastrand::f64() * span)
}

fn transport_error_is_retryable(err: &TransportError) -> bool {
    match err {
        TransportError::Http { status, .. } => *status == 429 || *status >= 500,
        TransportError::Connect(_) => true,
    }
}

fn map_transport_error(err: TransportError) -> PipelineError {
    match err {
        TransportError::Http { status: 429, body } => {
            PipelineError::TransientExternal(format!("rate limited: {}", truncate(&body, 200)))
        }
        TransportError::Http { status, body } if status >= 500 => {
            PipelineError::TransientExternal(format!("server error {status}: {}", truncate(&body, 200)))
        }
        TransportError::Http { status, body } => {
            PipelineError::PermanentExternal(format!("API error {status}: {}", truncate(&body, 500)))
        }
        TransportError::Connect(msg) => PipelineError::TransientExternal(format!("transport error: {msg}")),
    }
}

fn truncate(s: &str, n: usize) -> &str {
    let end = s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len());
    &s[..end]
}

/// Runs `attempt` up to [`MAX_ATTEMPTS`] times, retrying on 429/5xx/transport
/// errors with jittered exponential backoff, per §4.2 "Retry policy".
async fn with_retry<F, Fut>(mut attempt: F) -> Result<RawResponse>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<RawResponse, TransportError>>,
{
    let mut last_err: Option<TransportError> = None;

    for i in 0..MAX_ATTEMPTS {
        match attempt().await {
            Ok(resp) => return Ok(resp),
            Err(err) => {
                tracing::warn!(attempt = i + 1, max = MAX_ATTEMPTS, error = ?err, "LLM request failed");
                let retryable = transport_error_is_retryable(&err);
                last_err = Some(err);
                if !retryable {
                    break;
                }
                if i < MAX_ATTEMPTS - 1 {
                    tokio::time::sleep(jittered_delay(BASE_DELAYS_SECONDS[i])).await;
                }
            }
        }
    }

    Err(map_transport_error(last_err.expect("loop always runs at least once")))
}

/// ── JSON extraction ─────────────────────────────────────────────────────

/// Strip markdown fences, scan for the first balanced `{…}` object, and
/// validate it against `T`'s shape via `serde_json`, per §4.2 "JSON
/// extraction". Falls back to the repair utilities when the first pass
/// fails outright (truncated/garbled output), mirroring
/// `output_parser::json`'s strategy chain but stopping at the first match
/// rather than the last, and without its repair-retry loop (the Gateway's
/// own schema-repair call replaces that here).
fn extract_json_candidate(text: &str) -> Option<String> {
    let cleaned = crate::output_parser::extract::preprocess(text);
    let candidate = crate::output_parser::extract::find_first_bracketed(&cleaned, '{', '}')
        .or_else(|| crate::output_parser::extract::extract_code_block_for(&cleaned, "json"))
        .unwrap_or(&cleaned);
    if candidate.trim().is_empty() {
        None
    } else {
        Some(candidate.to_string())
    }
}

fn parse_candidate<T: DeserializeOwned>(candidate: &str) -> std::result::Result<T, String> {
    serde_json::from_str(candidate).map_err(|e| e.to_string()).or_else(|first_err| {
        crate::output_parser::repair::try_repair_json(candidate)
            .and_then(|repaired| serde_json::from_str(&repaired).ok())
            .ok_or(first_err)
    })
}

/// ── Gateway ─────────────────────────────────────────────────────────────

/// Single outbound channel to the chat-completion service (C2).
pub struct Gateway {
    transport: Box<dyn Transport>,
}

impl Gateway {
    pub fn new(config: &crate::config::EngineConfig) -> Self {
        Self {
            transport: Box::new(HttpTransport::new(
                config.llm_api_key.clone(),
                config.llm_base_url.clone(),
                config.default_model.clone(),
            )),
        }
    }

    fn with_transport(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Structured-output completion: returns a value matching `schema`.
    pub async fn complete_structured<T: DeserializeOwned>(
        &self,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: &Value,
        model: &str,
        thinking: Thinking,
    ) -> Result<(T, Usage)> {
        let normalized = schema::normalize(schema);
        let spec = RequestSpec {
            model: model.to_string(),
            system: system.to_string(),
            user: user.to_string(),
            temperature: 0.1,
            thinking,
            schema: Some((schema_name.to_string(), normalized)),
            stream: false,
        };

        let (raw, mut usage) = self.send_with_empty_retry(&spec).await?;

        match extract_json_candidate(&raw.content).and_then(|c| parse_candidate::<T>(&c).ok()) {
            Some(value) => Ok((value, usage)),
            None => {
                tracing::warn!("structured output failed schema validation, issuing repair call");
                let (repaired_value, repair_usage) =
                    self.repair_and_parse::<T>(&spec, &raw.content).await?;
                usage += repair_usage;
                Ok((repaired_value, usage))
            }
        }
    }

    /// Streaming structured-output completion. `on_thinking` receives
    /// reasoning-token deltas as they arrive.
    pub async fn complete_structured_streaming<T: DeserializeOwned>(
        &self,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: &Value,
        model: &str,
        thinking: Thinking,
        mut on_thinking: impl FnMut(&str) + Send,
    ) -> Result<(T, Usage)> {
        let normalized = schema::normalize(schema);
        let spec = RequestSpec {
            model: model.to_string(),
            system: system.to_string(),
            user: user.to_string(),
            temperature: 0.1,
            thinking,
            schema: Some((schema_name.to_string(), normalized)),
            stream: true,
        };

        let mut forward = |chunk: StreamChunk| {
            if let Some(r) = &chunk.reasoning_delta {
                on_thinking(r);
            }
        };
        let streamed = self.try_stream(&spec, &mut forward).await;
        let raw = match streamed {
            Some(raw) if looks_complete(&raw.content) => raw,
            _ => {
                // Any of the three fallback conditions (non-200 on open,
                // empty content, truncated JSON) silently downgrades to a
                // non-streaming call re-entering the full retry policy.
                tracing::debug!("streaming fell back to non-streaming completion");
                let (raw, _) = self.send_with_empty_retry(&spec).await?;
                raw
            }
        };

        let mut usage = raw.usage.clone();
        match extract_json_candidate(&raw.content).and_then(|c| parse_candidate::<T>(&c).ok()) {
            Some(value) => Ok((value, usage)),
            None => {
                let (repaired_value, repair_usage) =
                    self.repair_and_parse::<T>(&spec, &raw.content).await?;
                usage += repair_usage;
                Ok((repaired_value, usage))
            }
        }
    }

    /// Simple text completion (no schema).
    pub async fn complete_text(
        &self,
        system: &str,
        user: &str,
        model: &str,
        thinking: Thinking,
    ) -> Result<(String, Usage)> {
        let spec = RequestSpec {
            model: model.to_string(),
            system: system.to_string(),
            user: user.to_string(),
            temperature: 0.7,
            thinking,
            schema: None,
            stream: false,
        };
        let (raw, usage) = self.send_with_empty_retry(&spec).await?;
        Ok((raw.content, usage))
    }

    /// Streaming text completion. `on_token` receives content deltas;
    /// `on_thinking` receives reasoning deltas.
    pub async fn complete_text_streaming(
        &self,
        system: &str,
        user: &str,
        model: &str,
        thinking: Thinking,
        mut on_token: impl FnMut(&str) + Send,
        mut on_thinking: impl FnMut(&str) + Send,
    ) -> Result<(String, Usage)> {
        let spec = RequestSpec {
            model: model.to_string(),
            system: system.to_string(),
            user: user.to_string(),
            temperature: 0.7,
            thinking,
            schema: None,
            stream: true,
        };

        let mut forward = |chunk: StreamChunk| {
            if let Some(c) = &chunk.content_delta {
                on_token(c);
            }
            if let Some(r) = &chunk.reasoning_delta {
                on_thinking(r);
            }
        };

        let raw = match self.try_stream(&spec, &mut forward).await {
            Some(raw) if raw.status == 200 && !raw.content.is_empty() => raw,
            _ => {
                let (raw, _) = self.send_with_empty_retry(&spec).await?;
                raw
            }
        };
        Ok((raw.content, raw.usage))
    }

    /// Lists models, optionally filtered by a free-text search (at most 50
    /// results) instead of the default JSON-schema-capable + allowlist view.
    pub async fn list_models(&self, filter: Option<&str>) -> Result<Vec<ModelInfo>> {
        let all = self.fetch_model_catalog().await?;

        if let Some(query) = filter {
            let query = query.to_lowercase();
            return Ok(all
                .into_iter()
                .filter(|m| m.id.to_lowercase().contains(&query) || m.name.to_lowercase().contains(&query))
                .take(50)
                .collect());
        }

        let mut allowlisted = Vec::new();
        let mut rest = Vec::new();
        for model in all {
            if ALWAYS_INCLUDE_MODELS.contains(&model.id.as_str()) {
                allowlisted.push(model);
            } else if model.supports_json_schema {
                rest.push(model);
            }
        }
        allowlisted.sort_by(|a, b| a.name.cmp(&b.name));
        rest.sort_by(|a, b| a.name.cmp(&b.name));
        allowlisted.extend(rest);
        Ok(allowlisted)
    }

    async fn fetch_model_catalog(&self) -> Result<Vec<ModelInfo>> {
        self.transport
            .catalog()
            .await
            .ok_or_else(|| PipelineError::Other("model catalog unavailable for this transport".into()))
    }

    async fn try_stream(
        &self,
        spec: &RequestSpec,
        on_chunk: &mut (dyn FnMut(StreamChunk) + Send),
    ) -> Option<RawResponse> {
        self.transport.send_streaming(spec, on_chunk).await.ok()
    }

    /// Calls through [`with_retry`] (the network-level policy); if the
    /// response comes back with no content, retries up to
    /// [`EMPTY_RESPONSE_RETRIES`] more times with short jittered delays —
    /// a separate counter from the network retry budget, per §4.2
    /// "Empty-response handling".
    async fn send_with_empty_retry(&self, spec: &RequestSpec) -> Result<(RawResponse, Usage)> {
        for attempt in 0..=EMPTY_RESPONSE_RETRIES {
            let raw = with_retry(|| self.transport.send(spec)).await?;
            if !raw.content.trim().is_empty() {
                let usage = raw.usage;
                return Ok((raw, usage));
            }
            tracing::warn!(attempt, "empty completion content, retrying (cold-start glitch)");
            if attempt < EMPTY_RESPONSE_RETRIES {
                let (min, max) = EMPTY_RESPONSE_DELAYS_SECONDS[attempt];
                tokio::time::sleep(jittered_delay_range(min, max)).await;
            }
        }

        Err(PipelineError::PermanentExternal(
            "model returned no content after retries".into(),
        ))
    }

    /// Exactly one additional call instructing the model to convert its
    /// previous answer into schema-conforming JSON, at temperature 0 and
    /// thinking off. Token usage is summed by the caller.
    async fn repair_and_parse<T: DeserializeOwned>(
        &self,
        original: &RequestSpec,
        previous_content: &str,
    ) -> Result<(T, Usage)> {
        let Some((name, cleaned_schema)) = &original.schema else {
            return Err(PipelineError::PermanentExternal(
                "schema repair requested without a schema".into(),
            ));
        };

        let repair_system = "Ankstesnis atsakymas neatitiko reikalaujamos JSON schemos. \
Konvertuok jį į validų JSON, atitinkantį schemą. Atsakyk TIK JSON objektu, be jokio papildomo teksto.";
        let repair_user = format!("Ankstesnis atsakymas:\n{previous_content}");

        let repair_spec = RequestSpec {
            model: original.model.clone(),
            system: repair_system.to_string(),
            user: repair_user,
            temperature: 0.0,
            thinking: Thinking::Off,
            schema: Some((name.clone(), cleaned_schema.clone())),
            stream: false,
        };

        let raw = with_retry(|| self.transport.send(&repair_spec)).await?;
        if raw.content.trim().is_empty() {
            return Err(PipelineError::PermanentExternal(
                "schema repair call returned no content".into(),
            ));
        }

        let candidate = extract_json_candidate(&raw.content).ok_or_else(|| {
            PipelineError::PermanentExternal("schema repair output had no JSON object".into())
        })?;
        let value = parse_candidate::<T>(&candidate)
            .map_err(|e| PipelineError::PermanentExternal(format!("repair call still invalid: {e}")))?;

        Ok((value, raw.usage))
    }
}

/// Best-effort check that streamed content is syntactically complete JSON —
/// one of the three streaming fallback triggers (§4.2 "Streaming").
fn looks_complete(content: &str) -> bool {
    if content.trim().is_empty() {
        return false;
    }
    serde_json::from_str::<Value>(content).is_ok()
        || crate::output_parser::extract::find_first_bracketed(content, '{', '}').is_some()
}

/// Hand-written JSON schema for [`crate::model::ExtractionFacts`] — no
/// `schemars` derive since the shape needs provider-specific trimming
/// (§4.2 "Schema handling") that a generic derive wouldn't expose directly.
pub(crate) fn extraction_facts_schema() -> Value {
    fn string_field() -> Value {
        json!({"type": ["string", "null"]})
    }
    fn string_array() -> Value {
        json!({"type": "array", "items": {"type": "string"}})
    }

    let mut props = Map::new();
    props.insert("title".into(), string_field());
    props.insert("summary".into(), string_field());
    props.insert("procurement_type".into(), string_field());
    props.insert("estimated_value".into(), json!({"type": ["number", "null"]}));
    props.insert("currency".into(), string_field());
    props.insert("vat_included".into(), json!({"type": ["boolean", "null"]}));
    props.insert("submission_deadline".into(), string_field());
    props.insert("contract_duration".into(), string_field());
    props.insert(
        "organization".into(),
        json!({
            "type": ["object", "null"],
            "properties": {
                "name": string_field(),
                "registration_number": string_field(),
                "contact_email": string_field(),
            },
        }),
    );
    props.insert(
        "financial_terms".into(),
        json!({
            "type": ["object", "null"],
            "properties": {
                "payment_schedule": string_field(),
                "advance_payment_percent": json!({"type": ["number", "null"]}),
                "penalty_clauses": string_array(),
            },
        }),
    );
    props.insert(
        "submission_requirements".into(),
        json!({
            "type": ["object", "null"],
            "properties": {
                "format": string_field(),
                "language": string_field(),
                "required_documents": string_array(),
            },
        }),
    );
    props.insert("requirements".into(), string_array());
    props.insert("qualifications".into(), string_array());
    props.insert(
        "evaluation_criteria".into(),
        json!({
            "type": "array",
            "items": {
                "type": "object",
                "properties": {
                    "name": string_field(),
                    "weight": json!({"type": ["number", "null"]}),
                    "description": string_field(),
                },
            },
        }),
    );
    props.insert("risks".into(), string_array());
    props.insert("source_references".into(), string_array());
    props.insert("confidence_notes".into(), string_array());

    json!({"type": "object", "properties": Value::Object(props), "required": []})
}

pub(crate) fn qa_report_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "completeness_score": {"type": "number"},
            "findings": {"type": "array", "items": {"type": "string"}},
            "missing_fields": {"type": "array", "items": {"type": "string"}},
            "source_documents": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "filename": {"type": ["string", "null"]},
                        "doc_type": {"type": ["string", "null"]},
                        "pages": {"type": ["integer", "null"]},
                    },
                },
            },
        },
        "required": ["completeness_score"],
    })
}

/// A [`Gateway`] wired to a transport that must never actually be called —
/// for unit tests in other modules that need to construct an [`ExtractStage`]
/// or similar but never exercise the LLM call path (e.g. documents that are
/// skipped before any network call would happen).
#[cfg(test)]
pub(crate) fn unreachable_gateway() -> Gateway {
    struct UnreachableTransport;

    #[async_trait]
    impl Transport for UnreachableTransport {
        async fn send(&self, _spec: &RequestSpec) -> std::result::Result<RawResponse, TransportError> {
            Err(TransportError::Connect("unreachable test transport was called".into()))
        }

        async fn send_streaming(
            &self,
            _spec: &RequestSpec,
            _on_chunk: &mut (dyn FnMut(StreamChunk) + Send),
        ) -> std::result::Result<RawResponse, TransportError> {
            Err(TransportError::Connect("unreachable test transport was called".into()))
        }
    }

    Gateway::with_transport(Box::new(UnreachableTransport))
}

/// A [`Gateway`] that returns one scripted JSON body per call, in order —
/// for other modules' end-to-end tests that need to drive the orchestrator
/// through extraction/aggregation/evaluation without a live model. Each
/// response is reused for both the streaming and non-streaming path; the
/// queue is shared so concurrent callers each consume the next response.
#[cfg(test)]
pub(crate) fn scripted_gateway(bodies: Vec<&str>) -> Gateway {
    use std::sync::Mutex as StdMutex;

    struct ScriptedJsonTransport {
        queue: StdMutex<std::collections::VecDeque<String>>,
    }

    #[async_trait]
    impl Transport for ScriptedJsonTransport {
        async fn send(&self, _spec: &RequestSpec) -> std::result::Result<RawResponse, TransportError> {
            let content = self
                .queue
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TransportError::Connect("scripted gateway exhausted".into()))?;
            Ok(RawResponse {
                status: 200,
                content,
                reasoning: String::new(),
                usage: Usage { input_tokens: 100, output_tokens: 50 },
                body_text: String::new(),
            })
        }

        async fn send_streaming(
            &self,
            spec: &RequestSpec,
            _on_chunk: &mut (dyn FnMut(StreamChunk) + Send),
        ) -> std::result::Result<RawResponse, TransportError> {
            self.send(spec).await
        }
    }

    Gateway::with_transport(Box::new(ScriptedJsonTransport {
        queue: StdMutex::new(bodies.into_iter().map(String::from).collect()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    enum Scripted {
        Ok(RawResponse),
        Err(TransportError),
    }

    struct ScriptedTransport {
        queue: Mutex<std::collections::VecDeque<Scripted>>,
        catalog: Option<Vec<ModelInfo>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Scripted>) -> Self {
            Self { queue: Mutex::new(responses.into()), catalog: None }
        }

        fn with_catalog(mut self, catalog: Vec<ModelInfo>) -> Self {
            self.catalog = Some(catalog);
            self
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _spec: &RequestSpec) -> std::result::Result<RawResponse, TransportError> {
            let mut q = self.queue.lock().unwrap();
            match q.pop_front() {
                Some(Scripted::Ok(r)) => Ok(r),
                Some(Scripted::Err(e)) => Err(e),
                None => Err(TransportError::Connect("scripted transport exhausted".into())),
            }
        }

        async fn send_streaming(
            &self,
            spec: &RequestSpec,
            _on_chunk: &mut (dyn FnMut(StreamChunk) + Send),
        ) -> std::result::Result<RawResponse, TransportError> {
            self.send(spec).await
        }

        async fn catalog(&self) -> Option<Vec<ModelInfo>> {
            self.catalog.clone()
        }
    }

    fn ok_response(content: &str) -> Scripted {
        Scripted::Ok(RawResponse {
            status: 200,
            content: content.to_string(),
            reasoning: String::new(),
            usage: Usage { input_tokens: 100, output_tokens: 50 },
            body_text: String::new(),
        })
    }

    #[test]
    fn normalize_strips_metadata_and_locks_objects() {
        let schema = json!({
            "title": "Foo",
            "type": "object",
            "properties": {
                "a": {"type": "string", "description": "x", "default": "y"},
            },
        });
        let cleaned = schema::normalize(&schema);
        assert!(cleaned.get("title").is_none());
        assert_eq!(cleaned["additionalProperties"], json!(false));
        assert!(cleaned["properties"]["a"].get("description").is_none());
        assert!(cleaned["properties"]["a"].get("default").is_none());
    }

    #[test]
    fn compact_type_hint_lists_fields() {
        let schema = json!({"properties": {"a": {"type": "string"}, "b": {"type": "number"}}});
        let hint = schema::compact_type_hint(&schema);
        assert!(hint.contains("a: string"));
        assert!(hint.contains("b: number"));
    }

    #[test]
    fn anthropic_family_detection() {
        assert!(is_anthropic_family("anthropic/claude-sonnet-4"));
        assert!(is_anthropic_family("some-claude-clone"));
        assert!(!is_anthropic_family("openai/gpt-4o"));
    }

    #[tokio::test]
    async fn complete_structured_succeeds_on_first_try() {
        #[derive(serde::Deserialize)]
        struct Out { a: String }

        let gw = Gateway::with_transport(Box::new(ScriptedTransport::new(vec![ok_response(r#"{"a": "hi"}"#)])));
        let (out, usage) = gw
            .complete_structured::<Out>("sys", "user", "Test", &json!({"type": "object"}), "model", Thinking::Off)
            .await
            .unwrap();
        assert_eq!(out.a, "hi");
        assert_eq!(usage.input_tokens, 100);
    }

    #[tokio::test]
    async fn retries_on_rate_limit_then_succeeds() {
        #[derive(serde::Deserialize)]
        struct Out { a: String }

        let gw = Gateway::with_transport(Box::new(ScriptedTransport::new(vec![
            Scripted::Err(TransportError::Http { status: 429, body: "slow down".into() }),
            ok_response(r#"{"a": "ok"}"#),
        ])));
        let (out, _) = gw
            .complete_structured::<Out>("sys", "user", "Test", &json!({"type": "object"}), "model", Thinking::Off)
            .await
            .unwrap();
        assert_eq!(out.a, "ok");
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_on_sustained_rate_limit() {
        #[derive(serde::Deserialize)]
        struct Out { a: String }

        let gw = Gateway::with_transport(Box::new(ScriptedTransport::new(vec![
            Scripted::Err(TransportError::Http { status: 429, body: "1".into() }),
            Scripted::Err(TransportError::Http { status: 429, body: "2".into() }),
            Scripted::Err(TransportError::Http { status: 429, body: "3".into() }),
        ])));
        let result = gw
            .complete_structured::<Out>("sys", "user", "Test", &json!({"type": "object"}), "model", Thinking::Off)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn does_not_retry_non_429_client_errors() {
        #[derive(serde::Deserialize)]
        struct Out { a: String }

        let gw = Gateway::with_transport(Box::new(ScriptedTransport::new(vec![
            Scripted::Err(TransportError::Http { status: 400, body: "bad request".into() }),
            ok_response(r#"{"a": "should not be reached"}"#),
        ])));
        let result = gw
            .complete_structured::<Out>("sys", "user", "Test", &json!({"type": "object"}), "model", Thinking::Off)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn malformed_output_triggers_schema_repair() {
        #[derive(serde::Deserialize)]
        struct Out { a: String }

        let gw = Gateway::with_transport(Box::new(ScriptedTransport::new(vec![
            ok_response("Here is the answer: a is hi, not valid json"),
            ok_response(r#"{"a": "repaired"}"#),
        ])));
        let (out, usage) = gw
            .complete_structured::<Out>("sys", "user", "Test", &json!({"type": "object"}), "model", Thinking::Off)
            .await
            .unwrap();
        assert_eq!(out.a, "repaired");
        assert_eq!(usage.input_tokens, 200); // summed across both calls
    }

    #[tokio::test]
    async fn parse_failure_surfaces_when_repair_also_fails() {
        #[derive(serde::Deserialize)]
        struct Out { a: String }

        let gw = Gateway::with_transport(Box::new(ScriptedTransport::new(vec![
            ok_response("not json at all"),
            ok_response("still not json"),
        ])));
        let result = gw
            .complete_structured::<Out>("sys", "user", "Test", &json!({"type": "object"}), "model", Thinking::Off)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn list_models_puts_allowlist_first_then_filters_by_schema_support() {
        let catalog = vec![
            ModelInfo {
                id: "some/no-schema".into(),
                name: "No Schema".into(),
                supports_json_schema: false,
                input_price_per_million: 1.0,
                output_price_per_million: 2.0,
            },
            ModelInfo {
                id: "openai/gpt-4o".into(),
                name: "GPT-4o".into(),
                supports_json_schema: true,
                input_price_per_million: 2.5,
                output_price_per_million: 10.0,
            },
            ModelInfo {
                id: "anthropic/claude-sonnet-4".into(),
                name: "Claude Sonnet 4".into(),
                supports_json_schema: true,
                input_price_per_million: 3.0,
                output_price_per_million: 15.0,
            },
        ];
        let gw = Gateway::with_transport(Box::new(
            ScriptedTransport::new(vec![]).with_catalog(catalog),
        ));
        let models = gw.list_models(None).await.unwrap();
        let ids: Vec<_> = models.iter().map(|m| m.id.as_str()).collect();
        assert!(ids.contains(&"anthropic/claude-sonnet-4"));
        assert!(ids.contains(&"openai/gpt-4o"));
        assert!(!ids.contains(&"some/no-schema"));
    }

    #[tokio::test]
    async fn list_models_free_text_search_ignores_schema_support() {
        let catalog = vec![ModelInfo {
            id: "some/no-schema".into(),
            name: "No Schema".into(),
            supports_json_schema: false,
            input_price_per_million: 1.0,
            output_price_per_million: 2.0,
        }];
        let gw = Gateway::with_transport(Box::new(
            ScriptedTransport::new(vec![]).with_catalog(catalog),
        ));
        let models = gw.list_models(Some("schema")).await.unwrap();
        assert_eq!(models.len(), 1);
    }

    #[test]
    fn extraction_facts_schema_covers_essential_fields() {
        let schema = extraction_facts_schema();
        let props = schema["properties"].as_object().unwrap();
        for field in crate::model::ExtractionFacts::ESSENTIAL_FIELDS {
            assert!(props.contains_key(*field), "missing field {field}");
        }
    }

    /// Pins the schema to every field the struct actually has — not just
    /// the essential-field subset — so the two cannot silently drift apart
    /// the way `address`/`contact_phone`/`payment_terms`/`weight_percent`
    /// once did.
    #[test]
    fn extraction_facts_schema_mirrors_the_struct_field_for_field() {
        let schema = extraction_facts_schema();
        let props = schema["properties"].as_object().unwrap();
        for field in [
            "title",
            "summary",
            "procurement_type",
            "estimated_value",
            "currency",
            "vat_included",
            "submission_deadline",
            "contract_duration",
            "organization",
            "financial_terms",
            "submission_requirements",
            "requirements",
            "evaluation_criteria",
            "risks",
            "qualifications",
            "source_references",
            "confidence_notes",
        ] {
            assert!(props.contains_key(field), "top-level field {field} missing from schema");
        }
        assert_eq!(props.len(), 17, "schema has a field not in ExtractionFacts, or vice versa");

        let org = props["organization"]["properties"].as_object().unwrap();
        for field in ["name", "registration_number", "contact_email"] {
            assert!(org.contains_key(field), "organization.{field} missing from schema");
        }
        assert_eq!(org.len(), 3);

        let financial = props["financial_terms"]["properties"].as_object().unwrap();
        for field in ["payment_schedule", "advance_payment_percent", "penalty_clauses"] {
            assert!(financial.contains_key(field), "financial_terms.{field} missing from schema");
        }
        assert_eq!(financial.len(), 3);

        let submission = props["submission_requirements"]["properties"].as_object().unwrap();
        for field in ["format", "language", "required_documents"] {
            assert!(submission.contains_key(field), "submission_requirements.{field} missing from schema");
        }
        assert_eq!(submission.len(), 3);

        let criterion = props["evaluation_criteria"]["items"]["properties"].as_object().unwrap();
        for field in ["name", "weight", "description"] {
            assert!(criterion.contains_key(field), "evaluation_criteria item {field} missing from schema");
        }
        assert_eq!(criterion.len(), 3);
    }

    #[test]
    fn jittered_delay_stays_in_expected_band() {
        for _ in 0..50 {
            let d = jittered_delay(2).as_secs_f64();
            assert!((2.0..3.0).contains(&d), "delay {d} out of band");
        }
    }

    #[test]
    fn extract_json_candidate_strips_prose_and_fences() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nThanks!";
        let candidate = extract_json_candidate(text).unwrap();
        assert!(candidate.contains(r#""a": 1"#) || candidate.contains(r#"{"a": 1}"#));
    }

    #[test]
    fn looks_complete_detects_truncated_json() {
        assert!(looks_complete(r#"{"a": 1}"#));
        assert!(!looks_complete(r#"{"a": 1"#));
        assert!(!looks_complete(""));
    }
}
