// autotune-providers/src/http.rs
// ============================================================================
// Module: HTTP Providers
// Description: TraceStore, DatasetStore, and LlmClient implementations
//              backed by a bounded, scheme/host-restricted HTTP client.
// Purpose: The one real backend this deployment talks to.
// Dependencies: autotune-core, reqwest (blocking), serde_json
// ============================================================================

//! ## Overview
//! Every call here is synchronous (matching `LlmClient`'s blocking contract)
//! and bounded: a request timeout, a response size cap, and scheme
//! restriction to `https` unless explicitly overridden. Failures are mapped
//! to the caller's error enum by status code: `429` becomes a rate limit,
//! other `4xx`/`5xx` and transport failures become transient, and a response
//! that fails to parse against the expected schema becomes a non-recoverable
//! `Failed` (the trace/dataset/LLM backend is expected to be schema-stable).

use std::io::Read;
use std::time::Duration;

use autotune_core::DatasetName;
use autotune_core::DatasetSnapshot;
use autotune_core::DatasetStore;
use autotune_core::DatasetStoreError;
use autotune_core::DatasetVersion;
use autotune_core::ExperimentId;
use autotune_core::LlmClient;
use autotune_core::LlmError;
use autotune_core::PromptHash;
use autotune_core::TraceStore;
use autotune_core::TraceStoreError;
use autotune_core::VariantName;
use autotune_core::core::data::SourceTraces;
use autotune_core::core::identifiers::ExperimentRef;
use autotune_core::core::time::Timestamp;
use autotune_core::interfaces::AgentTurn;
use autotune_core::interfaces::EffectiveGenerationParams;
use autotune_core::interfaces::GenerateRequest;
use autotune_core::interfaces::TracePage;
use reqwest::StatusCode;
use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::blocking::RequestBuilder;
use reqwest::blocking::Response;
use serde_json::Value;

/// Configuration shared by every HTTP-backed provider in this crate.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    /// Base URL of the tracing/dataset/LLM service, e.g. `https://api.example.com`.
    pub base_url: Url,
    /// Bearer token sent as `Authorization: Bearer <token>`, if configured.
    pub api_key: Option<String>,
    /// Request timeout.
    pub timeout: Duration,
    /// Maximum response body size accepted, in bytes.
    pub max_response_bytes: usize,
    /// Allows cleartext HTTP for the base URL (disabled by default).
    pub allow_http: bool,
}

impl HttpProviderConfig {
    /// Maximum response body size accepted when a caller doesn't override it.
    pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

    /// Builds a client for `base_url` with this crate's defaults: a 30s
    /// timeout, a 4 MiB response cap, and `https` required.
    #[must_use]
    pub fn new(base_url: Url, api_key: Option<String>) -> Self {
        Self {
            base_url,
            api_key,
            timeout: Duration::from_secs(30),
            max_response_bytes: Self::DEFAULT_MAX_RESPONSE_BYTES,
            allow_http: false,
        }
    }
}

/// Internal classification of an HTTP call outcome before it is mapped into
/// whichever caller-facing error enum (`TraceStoreError`, `DatasetStoreError`,
/// `LlmError`) is in scope.
enum HttpOutcome {
    /// Rate limited (HTTP 429).
    RateLimited(String),
    /// Transient failure: transport error, timeout, or 5xx.
    Transient(String),
    /// Non-recoverable failure: other 4xx, or a response that failed to
    /// parse against the expected schema.
    Failed(String),
}

/// Builds a blocking client, rejecting non-`https` base URLs unless
/// `allow_http` is set.
fn build_client(config: &HttpProviderConfig) -> Result<Client, HttpOutcome> {
    if config.base_url.scheme() != "https" && !(config.allow_http && config.base_url.scheme() == "http") {
        return Err(HttpOutcome::Failed("base url must use https".to_string()));
    }
    Client::builder()
        .timeout(config.timeout)
        .build()
        .map_err(|err| HttpOutcome::Failed(format!("http client build failed: {err}")))
}

/// Attaches the bearer token, if configured, to an outgoing request.
fn with_auth(builder: RequestBuilder, config: &HttpProviderConfig) -> RequestBuilder {
    match &config.api_key {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    }
}

/// Maps a response status to an [`HttpOutcome`], or `None` for success.
fn classify_status(status: StatusCode) -> Option<HttpOutcome> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some(HttpOutcome::RateLimited(format!("http {status}")));
    }
    if status.is_server_error() {
        return Some(HttpOutcome::Transient(format!("http {status}")));
    }
    if status.is_client_error() {
        return Some(HttpOutcome::Failed(format!("http {status}")));
    }
    None
}

/// Reads a response body, enforcing `max_bytes`, then parses it as JSON.
fn read_json_limited(response: Response, max_bytes: usize) -> Result<Value, HttpOutcome> {
    let max_bytes_u64 = u64::try_from(max_bytes).unwrap_or(u64::MAX);
    if let Some(expected) = response.content_length()
        && expected > max_bytes_u64
    {
        return Err(HttpOutcome::Failed("response exceeds size limit".to_string()));
    }
    let mut buf = Vec::new();
    response
        .take(max_bytes_u64.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|err| HttpOutcome::Transient(format!("failed to read response: {err}")))?;
    if buf.len() > max_bytes {
        return Err(HttpOutcome::Failed("response exceeds size limit".to_string()));
    }
    serde_json::from_slice(&buf).map_err(|err| HttpOutcome::Failed(format!("response did not parse as json: {err}")))
}

/// Sends a request and reads its body as size-limited JSON.
fn send_and_read(builder: RequestBuilder, config: &HttpProviderConfig) -> Result<Value, HttpOutcome> {
    let response = builder.send().map_err(|err| {
        if err.is_timeout() {
            HttpOutcome::Transient(format!("request timed out: {err}"))
        } else {
            HttpOutcome::Transient(format!("request failed: {err}"))
        }
    })?;
    if let Some(outcome) = classify_status(response.status()) {
        return Err(outcome);
    }
    read_json_limited(response, config.max_response_bytes)
}

impl From<HttpOutcome> for TraceStoreError {
    fn from(outcome: HttpOutcome) -> Self {
        match outcome {
            HttpOutcome::RateLimited(detail) => Self::RateLimited(detail),
            HttpOutcome::Transient(detail) => Self::Transient(detail),
            HttpOutcome::Failed(detail) => Self::Failed(detail),
        }
    }
}

impl From<HttpOutcome> for LlmError {
    fn from(outcome: HttpOutcome) -> Self {
        match outcome {
            HttpOutcome::RateLimited(detail) => Self::RateLimited(detail),
            HttpOutcome::Transient(detail) => Self::Transient(detail),
            HttpOutcome::Failed(detail) => Self::Failed(detail),
        }
    }
}

// ============================================================================
// SECTION: Trace Store
// ============================================================================

/// `TraceStore` backed by `GET/POST {base_url}/traces` and `/prompts`.
pub struct HttpTraceStore {
    /// Shared HTTP configuration.
    config: HttpProviderConfig,
    /// Underlying blocking client.
    client: Client,
}

impl HttpTraceStore {
    /// Builds a trace store client from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`TraceStoreError::Failed`] when the client cannot be built.
    pub fn new(config: HttpProviderConfig) -> Result<Self, TraceStoreError> {
        let client = build_client(&config)?;
        Ok(Self { config, client })
    }
}

impl TraceStore for HttpTraceStore {
    fn fetch_traces_since(
        &self,
        cursor: Timestamp,
        source_experiment: Option<&ExperimentId>,
        max_count: usize,
    ) -> Result<TracePage, TraceStoreError> {
        let url = self
            .config
            .base_url
            .join("traces")
            .map_err(|err| TraceStoreError::Failed(format!("invalid traces url: {err}")))?;
        let mut builder = self.client.get(url).query(&[
            ("cursor", cursor.as_unix_millis().to_string()),
            ("max_count", max_count.to_string()),
        ]);
        if let Some(experiment) = source_experiment {
            builder = builder.query(&[("experiment", experiment.as_str())]);
        }
        let body = send_and_read(with_auth(builder, &self.config), &self.config)?;
        serde_json::from_value(body).map_err(|err| TraceStoreError::Failed(format!("malformed trace page: {err}")))
    }

    fn write_experiment(
        &self,
        name: &VariantName,
        split_label: &str,
        rows: &SourceTraces,
    ) -> Result<ExperimentRef, TraceStoreError> {
        let url = self
            .config
            .base_url
            .join("experiments")
            .map_err(|err| TraceStoreError::Failed(format!("invalid experiments url: {err}")))?;
        let payload = serde_json::json!({
            "variant_name": name.as_str(),
            "split_label": split_label,
            "traces": rows,
        });
        let builder = self.client.post(url).json(&payload);
        let body = send_and_read(with_auth(builder, &self.config), &self.config)?;
        let experiment_ref = body
            .get("experiment_ref")
            .and_then(Value::as_str)
            .ok_or_else(|| TraceStoreError::Failed("response missing experiment_ref".to_string()))?;
        Ok(ExperimentRef::from(experiment_ref))
    }

    fn publish_prompt(&self, prompt_hash: &PromptHash, text: &str, metadata: &Value) -> Result<(), TraceStoreError> {
        let url = self
            .config
            .base_url
            .join("prompts")
            .map_err(|err| TraceStoreError::Failed(format!("invalid prompts url: {err}")))?;
        let payload = serde_json::json!({
            "prompt_hash": prompt_hash.as_str(),
            "text": text,
            "metadata": metadata,
        });
        let builder = self.client.post(url).json(&payload);
        send_and_read(with_auth(builder, &self.config), &self.config)?;
        Ok(())
    }
}

// ============================================================================
// SECTION: Dataset Store
// ============================================================================

/// `DatasetStore` backed by `GET {base_url}/datasets/{name}`.
pub struct HttpDatasetStore {
    /// Shared HTTP configuration.
    config: HttpProviderConfig,
    /// Underlying blocking client.
    client: Client,
}

impl HttpDatasetStore {
    /// Builds a dataset store client from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetStoreError::Transient`] when the client cannot be
    /// built.
    pub fn new(config: HttpProviderConfig) -> Result<Self, DatasetStoreError> {
        let client = match build_client(&config) {
            Ok(client) => client,
            Err(HttpOutcome::Failed(detail) | HttpOutcome::Transient(detail) | HttpOutcome::RateLimited(detail)) => {
                return Err(DatasetStoreError::Transient(detail));
            }
        };
        Ok(Self { config, client })
    }
}

impl DatasetStore for HttpDatasetStore {
    fn load_dataset(
        &self,
        name: &DatasetName,
        version: Option<&DatasetVersion>,
    ) -> Result<DatasetSnapshot, DatasetStoreError> {
        let url = self
            .config
            .base_url
            .join(&format!("datasets/{}", name.as_str()))
            .map_err(|err| DatasetStoreError::Transient(format!("invalid dataset url: {err}")))?;
        let mut builder = self.client.get(url);
        if let Some(version) = version {
            builder = builder.query(&[("version", version.as_str())]);
        }
        let response = with_auth(builder, &self.config)
            .send()
            .map_err(|err| DatasetStoreError::Transient(format!("request failed: {err}")))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(DatasetStoreError::Missing { name: name.clone(), version: version.cloned() });
        }
        let body = match classify_status(response.status()) {
            Some(outcome) => return Err(to_dataset_error(outcome)),
            None => read_json_limited(response, self.config.max_response_bytes).map_err(to_dataset_error)?,
        };
        serde_json::from_value(body)
            .map_err(|err| DatasetStoreError::Transient(format!("malformed dataset snapshot: {err}")))
    }
}

/// Collapses an [`HttpOutcome`] into [`DatasetStoreError::Transient`];
/// `DatasetStoreError::Missing` is constructed directly by the caller on a
/// 404, which carries the requested name/version this function doesn't see.
fn to_dataset_error(outcome: HttpOutcome) -> DatasetStoreError {
    match outcome {
        HttpOutcome::RateLimited(detail) | HttpOutcome::Transient(detail) | HttpOutcome::Failed(detail) => {
            DatasetStoreError::Transient(detail)
        }
    }
}

// ============================================================================
// SECTION: LLM Client
// ============================================================================

/// `LlmClient` backed by `POST {base_url}/judge`, `/generate`, and `/simulate`.
pub struct HttpLlmClient {
    /// Shared HTTP configuration.
    config: HttpProviderConfig,
    /// Underlying blocking client.
    client: Client,
    /// Model identifier used for `/generate` and `/simulate` calls.
    pub agent_model: String,
}

impl HttpLlmClient {
    /// Builds an LLM client from `config`, driving the agent and generator
    /// endpoints with `agent_model`.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Failed`] when the client cannot be built.
    pub fn new(config: HttpProviderConfig, agent_model: impl Into<String>) -> Result<Self, LlmError> {
        let client = build_client(&config)?;
        Ok(Self { config, client, agent_model: agent_model.into() })
    }
}

impl LlmClient for HttpLlmClient {
    fn judge(&self, judge_prompt_version: &str, input: &Value) -> Result<Value, LlmError> {
        let url = self
            .config
            .base_url
            .join("judge")
            .map_err(|err| LlmError::Failed(format!("invalid judge url: {err}")))?;
        let payload = serde_json::json!({
            "judge_prompt_version": judge_prompt_version,
            "input": input,
        });
        let builder = self.client.post(url).json(&payload);
        Ok(send_and_read(with_auth(builder, &self.config), &self.config)?)
    }

    fn generate(&self, request: &GenerateRequest<'_>) -> Result<(Value, EffectiveGenerationParams), LlmError> {
        let url = self
            .config
            .base_url
            .join("generate")
            .map_err(|err| LlmError::Failed(format!("invalid generate url: {err}")))?;
        let payload = serde_json::json!({
            "model": self.agent_model,
            "current_prompt": request.current_prompt,
            "findings": request.findings,
            "variant_count": request.variant_count,
            "seed": request.seed,
            "temperature": request.temperature,
        });
        let builder = self.client.post(url).json(&payload);
        let body = send_and_read(with_auth(builder, &self.config), &self.config)?;
        let effective = EffectiveGenerationParams {
            seed: body.get("effective_seed").and_then(Value::as_u64),
            temperature: body.get("effective_temperature").and_then(Value::as_f64).unwrap_or(request.temperature),
        };
        let variants =
            body.get("variants").cloned().ok_or_else(|| LlmError::Failed("response missing variants".to_string()))?;
        Ok((variants, effective))
    }

    fn simulate_turn(&self, system_prompt: &str, history: &[Value]) -> Result<AgentTurn, LlmError> {
        let url = self
            .config
            .base_url
            .join("simulate")
            .map_err(|err| LlmError::Failed(format!("invalid simulate url: {err}")))?;
        let payload = serde_json::json!({
            "model": self.agent_model,
            "system_prompt": system_prompt,
            "history": history,
        });
        let builder = self.client.post(url).json(&payload);
        let body = send_and_read(with_auth(builder, &self.config), &self.config)?;
        let text = body
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| LlmError::Failed("response missing text".to_string()))?
            .to_string();
        let tool_calls = body.get("tool_calls").and_then(Value::as_array).cloned().unwrap_or_default();
        let end_of_call = body.get("end_of_call").and_then(Value::as_bool).unwrap_or(false);
        Ok(AgentTurn { text, tool_calls, end_of_call })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> HttpProviderConfig {
        HttpProviderConfig::new(Url::parse(url).expect("valid url"), None)
    }

    #[test]
    fn http_base_url_is_rejected_without_allow_http() {
        let result = build_client(&config("http://example.com"));
        assert!(matches!(result, Err(HttpOutcome::Failed(_))));
    }

    #[test]
    fn http_base_url_is_accepted_when_explicitly_allowed() {
        let mut cfg = config("http://example.com");
        cfg.allow_http = true;
        assert!(build_client(&cfg).is_ok());
    }

    #[test]
    fn https_base_url_builds_without_error() {
        assert!(build_client(&config("https://example.com")).is_ok());
    }

    #[test]
    fn rate_limit_status_is_classified_distinctly_from_other_errors() {
        assert!(matches!(classify_status(StatusCode::TOO_MANY_REQUESTS), Some(HttpOutcome::RateLimited(_))));
        assert!(matches!(classify_status(StatusCode::INTERNAL_SERVER_ERROR), Some(HttpOutcome::Transient(_))));
        assert!(matches!(classify_status(StatusCode::NOT_FOUND), Some(HttpOutcome::Failed(_))));
        assert!(classify_status(StatusCode::OK).is_none());
    }
}
