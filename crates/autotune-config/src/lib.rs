// autotune-config/src/lib.rs
// ============================================================================
// Crate: Autotune Config
// Description: Loads and validates the worker's configuration from the
//              process environment.
// Purpose: Fail closed before any tick runs rather than surface a bad value
//          mid-cycle.
// Dependencies: autotune-core, thiserror
// ============================================================================

//! ## Overview
//! Every setting the autotune binary needs comes from `AUTOTUNE_*`
//! environment variables. [`AutotuneConfig::load`] reads and validates all of
//! them in one pass; a missing required key or an out-of-range value produces
//! a [`ConfigError`] and nothing else in the process gets a chance to run.
//! CLI flags, when present, override the corresponding environment value
//! after loading; see [`AutotuneConfig::apply_cli_overrides`].
//!
//! Production code in this crate never touches `unsafe`; the test module
//! below is the sole exception, scoped to mutating process environment
//! variables under a lock (`std::env::set_var`/`remove_var` are `unsafe fn`
//! as of this workspace's edition).

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use autotune_core::DatasetName;
use autotune_core::DatasetVersion;
use autotune_core::ExperimentId;
use autotune_core::PromotionThresholds;
use autotune_core::WorkerConfig;
use autotune_core::runtime::evaluator::DEFAULT_CASE_TIMEOUT;
use autotune_core::runtime::evaluator::DEFAULT_PARALLELISM;
use autotune_core::runtime::proposer::DEFAULT_VARIANT_COUNT;
use autotune_core::runtime::worker::DEFAULT_MAX_TRACES_PER_POLL;

/// Default tick interval in seconds (spec §6).
pub const DEFAULT_POLL_SECONDS: u64 = 15;
/// Default per-case turn budget (spec §6).
pub const DEFAULT_TURN_LIMIT: u32 = 20;
/// Default primary promotion metric name (spec §4.9).
pub const DEFAULT_PRIMARY_METRIC: &str = "calmer_end_state";
/// Default secondary promotion metric name (spec §4.9).
pub const DEFAULT_SECONDARY_METRIC: &str = "emergency_services_when_needed";
/// Default bind address for the read-only status server.
pub const DEFAULT_STATUS_BIND: &str = "127.0.0.1:8080";

/// Configuration loading or validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable was not set.
    #[error("missing required config: {0}")]
    Missing(String),
    /// A value was present but could not be parsed as its expected type.
    #[error("config parse error: {0}")]
    Parse(String),
    /// A value parsed fine but failed a range or consistency check.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Fully validated worker configuration, sourced from the process
/// environment (spec §6).
#[derive(Debug, Clone)]
pub struct AutotuneConfig {
    /// Logical project name for trace/dataset scoping.
    pub project: String,
    /// Optional source bucket for traces; `None` means all experiments.
    pub source_experiment: Option<ExperimentId>,
    /// Dataset binding.
    pub dataset_name: DatasetName,
    /// Dataset version, if pinned.
    pub dataset_version: Option<DatasetVersion>,
    /// Model identifier used for LLM-judge scoring calls.
    pub judge_model: String,
    /// Model identifier used to drive the agent under evaluation.
    pub agent_llm: String,
    /// Model identifier used for the simulated caller.
    pub agent_model: String,
    /// Tick interval.
    pub poll_seconds: u64,
    /// Per-case turn budget.
    pub turn_limit: u32,
    /// Minimum number of new traces required to start a cycle.
    pub min_batch: u32,
    /// Name of the metric the Promotion Gate treats as primary.
    pub primary_metric: String,
    /// Name of the metric the Promotion Gate treats as secondary.
    pub secondary_metric: String,
    /// Promotion thresholds applied by the gate.
    pub thresholds: PromotionThresholds,
    /// If true, a promoted prompt is published to the live trace store;
    /// otherwise only the decision artifact is written.
    pub update_live_prompt: bool,
    /// Path to the dashboard-facing status file.
    pub status_file: PathBuf,
    /// Directory under which per-cycle run artifacts are written.
    pub runs_dir: PathBuf,
    /// Path to the durable `LoopState` file.
    pub loop_state_file: PathBuf,
    /// Path to a file containing the currently live prompt's full text,
    /// used to seed a fresh deployment that has never persisted a
    /// `LoopState` before.
    pub seed_prompt_file: PathBuf,
    /// Base URL of the HTTP trace/dataset/LLM backend.
    pub api_base_url: String,
    /// Bearer token presented to the HTTP backend, if it requires one.
    pub api_key: Option<String>,
    /// Socket address the read-only status server binds.
    pub status_bind: String,
}

impl AutotuneConfig {
    /// Loads and validates configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required key is missing, a value
    /// fails to parse, or a parsed value is out of its valid range.
    pub fn load() -> Result<Self, ConfigError> {
        let project = required_string("AUTOTUNE_PROJECT")?;
        let source_experiment = optional_string("AUTOTUNE_SOURCE_EXPERIMENT").map(ExperimentId::from);
        let dataset_name = DatasetName::from(required_string("AUTOTUNE_DATASET_NAME")?.as_str());
        let dataset_version = optional_string("AUTOTUNE_DATASET_VERSION").map(|v| DatasetVersion::from(v.as_str()));
        let judge_model = required_string("AUTOTUNE_JUDGE_MODEL")?;
        let agent_llm = required_string("AUTOTUNE_AGENT_LLM")?;
        let agent_model = required_string("AUTOTUNE_AGENT_MODEL")?;

        let poll_seconds = optional_u64("AUTOTUNE_POLL_SECONDS")?.unwrap_or(DEFAULT_POLL_SECONDS);
        let turn_limit = optional_u32("AUTOTUNE_TURN_LIMIT")?.unwrap_or(DEFAULT_TURN_LIMIT);
        let min_batch = required_u32("AUTOTUNE_MIN_BATCH")?;

        let min_delta_primary = required_unit_f64("AUTOTUNE_MIN_DELTA_PRIMARY")?;
        let max_regression_secondary = required_unit_f64("AUTOTUNE_MAX_REGRESSION_SECONDARY")?;
        let min_delta_primary_train =
            optional_unit_f64("AUTOTUNE_MIN_DELTA_PRIMARY_TRAIN")?.unwrap_or(min_delta_primary);

        let primary_metric =
            optional_string("AUTOTUNE_PRIMARY_METRIC").unwrap_or_else(|| DEFAULT_PRIMARY_METRIC.to_string());
        let secondary_metric =
            optional_string("AUTOTUNE_SECONDARY_METRIC").unwrap_or_else(|| DEFAULT_SECONDARY_METRIC.to_string());

        let update_live_prompt = optional_bool("AUTOTUNE_UPDATE_LIVE_PROMPT")?.unwrap_or(false);
        let status_file = PathBuf::from(required_string("AUTOTUNE_STATUS_FILE")?);
        let runs_dir = PathBuf::from(required_string("AUTOTUNE_RUNS_DIR")?);
        let loop_state_file = PathBuf::from(required_string("AUTOTUNE_LOOP_STATE_FILE")?);
        let seed_prompt_file = PathBuf::from(required_string("AUTOTUNE_SEED_PROMPT_FILE")?);
        let api_base_url = required_string("AUTOTUNE_API_BASE_URL")?;
        let api_key = optional_string("AUTOTUNE_API_KEY");
        let status_bind = optional_string("AUTOTUNE_STATUS_BIND").unwrap_or_else(|| DEFAULT_STATUS_BIND.to_string());

        if !api_base_url.starts_with("http://") && !api_base_url.starts_with("https://") {
            return Err(ConfigError::Invalid("AUTOTUNE_API_BASE_URL must start with http:// or https://".to_string()));
        }

        if poll_seconds == 0 {
            return Err(ConfigError::Invalid("AUTOTUNE_POLL_SECONDS must be greater than zero".to_string()));
        }
        if turn_limit == 0 {
            return Err(ConfigError::Invalid("AUTOTUNE_TURN_LIMIT must be greater than zero".to_string()));
        }
        if min_batch == 0 {
            return Err(ConfigError::Invalid("AUTOTUNE_MIN_BATCH must be greater than zero".to_string()));
        }

        Ok(Self {
            project,
            source_experiment,
            dataset_name,
            dataset_version,
            judge_model,
            agent_llm,
            agent_model,
            poll_seconds,
            turn_limit,
            min_batch,
            primary_metric,
            secondary_metric,
            thresholds: PromotionThresholds { min_delta_primary, max_regression_secondary, min_delta_primary_train },
            update_live_prompt,
            status_file,
            runs_dir,
            loop_state_file,
            seed_prompt_file,
            api_base_url,
            api_key,
            status_bind,
        })
    }

    /// Applies CLI flag overrides on top of the environment-loaded values.
    /// Only flags that were actually passed (`Some`) take effect.
    pub fn apply_cli_overrides(&mut self, poll_seconds: Option<u64>, update_live_prompt: Option<bool>) {
        if let Some(poll_seconds) = poll_seconds {
            self.poll_seconds = poll_seconds;
        }
        if let Some(update_live_prompt) = update_live_prompt {
            self.update_live_prompt = update_live_prompt;
        }
    }

    /// The tick interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_seconds)
    }

    /// Builds the [`WorkerConfig`] this configuration describes, using the
    /// evaluator/proposer defaults for knobs the environment table doesn't
    /// expose (spec §6 names only what operators need to tune).
    #[must_use]
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            min_batch: self.min_batch,
            max_traces_per_poll: DEFAULT_MAX_TRACES_PER_POLL,
            turn_limit: self.turn_limit,
            variant_count: DEFAULT_VARIANT_COUNT,
            seed: None,
            temperature: 0.0,
            primary_metric: self.primary_metric.clone(),
            secondary_metric: self.secondary_metric.clone(),
            thresholds: self.thresholds,
            update_live_prompt: self.update_live_prompt,
            parallelism: DEFAULT_PARALLELISM,
            case_timeout: DEFAULT_CASE_TIMEOUT,
            dataset_name: self.dataset_name.clone(),
            dataset_version: self.dataset_version.clone(),
            source_experiment: self.source_experiment.clone(),
        }
    }
}

/// Reads `key`, failing closed when it is unset or blank.
fn required_string(key: &str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) if value.trim().is_empty() => Err(ConfigError::Missing(key.to_string())),
        Ok(value) => Ok(value),
        Err(_) => Err(ConfigError::Missing(key.to_string())),
    }
}

/// Reads `key`, treating unset or blank as absent rather than an error.
fn optional_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Reads and parses a required `u32`-valued key.
fn required_u32(key: &str) -> Result<u32, ConfigError> {
    required_string(key)?.trim().parse::<u32>().map_err(|err| ConfigError::Parse(format!("{key}: {err}")))
}

/// Reads and parses an optional `u32`-valued key.
fn optional_u32(key: &str) -> Result<Option<u32>, ConfigError> {
    optional_string(key)
        .map(|value| value.trim().parse::<u32>())
        .transpose()
        .map_err(|err| ConfigError::Parse(format!("{key}: {err}")))
}

/// Reads and parses an optional `u64`-valued key.
fn optional_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    optional_string(key)
        .map(|value| value.trim().parse::<u64>())
        .transpose()
        .map_err(|err| ConfigError::Parse(format!("{key}: {err}")))
}

/// Reads and parses an optional boolean key, accepting `true`/`false`,
/// `1`/`0`, and `yes`/`no` (case-insensitive).
fn optional_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match optional_string(key) {
        None => Ok(None),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(ConfigError::Parse(format!("{key}: not a boolean"))),
        },
    }
}

/// Reads and parses a required `f64`-valued key, bounds-checked to `[0, 1]`.
fn required_unit_f64(key: &str) -> Result<f64, ConfigError> {
    let value =
        required_string(key)?.trim().parse::<f64>().map_err(|err| ConfigError::Parse(format!("{key}: {err}")))?;
    validate_unit_range(key, value)?;
    Ok(value)
}

/// Reads and parses an optional `f64`-valued key, bounds-checked to `[0, 1]`.
fn optional_unit_f64(key: &str) -> Result<Option<f64>, ConfigError> {
    let Some(value) = optional_string(key) else { return Ok(None) };
    let parsed = value.trim().parse::<f64>().map_err(|err| ConfigError::Parse(format!("{key}: {err}")))?;
    validate_unit_range(key, parsed)?;
    Ok(Some(parsed))
}

/// Rejects values outside the closed unit interval.
fn validate_unit_range(key: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::Invalid(format!("{key} must be within [0.0, 1.0], got {value}")));
    }
    Ok(())
}
