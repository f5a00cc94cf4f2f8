// autotune-core/src/interfaces/mod.rs
// ============================================================================
// Module: Interfaces
// Description: Backend-agnostic traits for trace/dataset access, the LLM
//              client, and state/artifact persistence.
// Purpose: Keep autotune-core free of network and filesystem I/O.
// Dependencies: crate::core
// ============================================================================

//! ## Overview
//! Every suspension point the worker can hit is expressed as a trait here.
//! Implementations live in other crates (`autotune-providers`,
//! `autotune-store`) and must be deterministic and fail closed on missing or
//! invalid data.

use serde_json::Value;
use thiserror::Error;

use crate::core::data::DatasetSnapshot;
use crate::core::data::PromotionDecision;
use crate::core::data::SourceTraces;
use crate::core::data::Trace;
use crate::core::identifiers::DatasetName;
use crate::core::identifiers::DatasetVersion;
use crate::core::identifiers::ExperimentId;
use crate::core::identifiers::ExperimentRef;
use crate::core::identifiers::PromptHash;
use crate::core::identifiers::RunDirId;
use crate::core::identifiers::VariantName;
use crate::core::state::LoopState;
use crate::core::state::StatusSnapshot;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Trace Store
// ============================================================================

/// Trace store errors.
#[derive(Debug, Error)]
pub enum TraceStoreError {
    /// The backend reported a transient failure (network, 5xx, timeout).
    #[error("trace store transient error: {0}")]
    Transient(String),
    /// The backend signalled a rate limit.
    #[error("trace store rate limited: {0}")]
    RateLimited(String),
    /// The backend reported a non-recoverable failure.
    #[error("trace store error: {0}")]
    Failed(String),
}

/// One page of traces plus an opaque continuation marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracePage {
    /// Traces in this page, ordered by `created_at` ascending.
    pub traces: Vec<Trace>,
    /// Whether another page is available.
    pub has_more: bool,
}

/// Reads traces from, and publishes prompts to, the external tracing
/// service.
pub trait TraceStore {
    /// Returns traces with `created_at > cursor`, optionally filtered to one
    /// experiment bucket, ordered by `created_at` ascending, bounded by
    /// `max_count` per call.
    ///
    /// # Errors
    ///
    /// Returns [`TraceStoreError`] when the backend cannot be reached or
    /// signals a rate limit.
    fn fetch_traces_since(
        &self,
        cursor: Timestamp,
        source_experiment: Option<&ExperimentId>,
        max_count: usize,
    ) -> Result<TracePage, TraceStoreError>;

    /// Creates an external experiment handle to which scored rows for one
    /// `(variant, split)` pair will be attached.
    ///
    /// # Errors
    ///
    /// Returns [`TraceStoreError`] when the backend cannot be reached.
    fn write_experiment(
        &self,
        name: &VariantName,
        split_label: &str,
        rows: &SourceTraces,
    ) -> Result<ExperimentRef, TraceStoreError>;

    /// Records a new candidate or promoted prompt.
    ///
    /// # Errors
    ///
    /// Returns [`TraceStoreError`] when the backend cannot be reached.
    fn publish_prompt(
        &self,
        prompt_hash: &PromptHash,
        text: &str,
        metadata: &Value,
    ) -> Result<(), TraceStoreError>;
}

// ============================================================================
// SECTION: Dataset Store
// ============================================================================

/// Dataset store errors.
#[derive(Debug, Error)]
pub enum DatasetStoreError {
    /// The backend reported a transient failure.
    #[error("dataset store transient error: {0}")]
    Transient(String),
    /// The requested `(name, version)` pair has no rows.
    #[error("dataset missing: {name}@{version:?}")]
    Missing {
        /// Dataset name that was requested.
        name: DatasetName,
        /// Dataset version that was requested.
        version: Option<DatasetVersion>,
    },
}

/// Loads frozen train/test datasets.
pub trait DatasetStore {
    /// Loads a dataset snapshot by `(name, version)`.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetStoreError::Missing`] when no rows exist for the
    /// given binding, or [`DatasetStoreError::Transient`] on backend failure.
    fn load_dataset(
        &self,
        name: &DatasetName,
        version: Option<&DatasetVersion>,
    ) -> Result<DatasetSnapshot, DatasetStoreError>;
}

// ============================================================================
// SECTION: LLM Client
// ============================================================================

/// LLM client errors.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The backend reported a transient failure (network, 5xx, timeout).
    #[error("llm transient error: {0}")]
    Transient(String),
    /// The backend signalled a rate limit.
    #[error("llm rate limited: {0}")]
    RateLimited(String),
    /// The backend reported a non-recoverable failure.
    #[error("llm error: {0}")]
    Failed(String),
}

/// One simulated agent turn produced by `LlmClient::simulate_turn`.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTurn {
    /// The assistant's reply text.
    pub text: String,
    /// Tool calls the agent made while producing this reply.
    pub tool_calls: Vec<Value>,
    /// Whether the agent emitted an end-of-call marker.
    pub end_of_call: bool,
}

/// A request to generate prompt variants.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest<'a> {
    /// The prompt the generator should mutate.
    pub current_prompt: &'a str,
    /// Aggregated findings to condition generation on.
    pub findings: &'a [String],
    /// Number of distinct variants requested.
    pub variant_count: usize,
    /// Requested seed, if the backend supports one.
    pub seed: Option<u64>,
    /// Requested sampling temperature.
    pub temperature: f64,
}

/// Effective parameters actually honoured by the generator backend, echoed
/// back for artifact recording (spec Open Question (a)).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveGenerationParams {
    /// Seed actually honoured, if any.
    pub seed: Option<u64>,
    /// Temperature actually honoured.
    pub temperature: f64,
}

/// Abstracted text-in/JSON-out calls to a judge model and a generator model.
pub trait LlmClient {
    /// Calls the judge model with one case's input and transcript, returning
    /// its raw JSON response for schema-checking by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`] when the backend cannot be reached or signals a
    /// rate limit. A successfully-returned non-JSON-schema-conformant value
    /// is not an error here; callers degrade it to "not reached".
    fn judge(&self, judge_prompt_version: &str, input: &Value) -> Result<Value, LlmError>;

    /// Asks the generator model to produce variant material given a
    /// request; returns the raw JSON response plus the effective
    /// seed/temperature actually used.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`] when the backend cannot be reached or signals a
    /// rate limit.
    fn generate(
        &self,
        request: &GenerateRequest<'_>,
    ) -> Result<(Value, EffectiveGenerationParams), LlmError>;

    /// Drives one turn of a simulated conversation: the agent replies to the
    /// history so far under the candidate system prompt.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`] when the backend cannot be reached or signals a
    /// rate limit.
    fn simulate_turn(
        &self,
        system_prompt: &str,
        history: &[Value],
    ) -> Result<AgentTurn, LlmError>;
}

// ============================================================================
// SECTION: Loop State Store
// ============================================================================

/// Loop state store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error reading or writing state or artifacts.
    #[error("store io error: {0}")]
    Io(String),
    /// Stored data failed a hash or schema check.
    #[error("store corruption: {0}")]
    Corrupt(String),
    /// Stored data version is incompatible with this build.
    #[error("store version mismatch: {0}")]
    VersionMismatch(String),
}

/// Persists the single `LoopState` instance.
pub trait LoopStateStore {
    /// Loads the current loop state, if one has ever been persisted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the stored state cannot be read or fails
    /// its hash check.
    fn load(&self) -> Result<Option<LoopState>, StoreError>;

    /// Persists the given loop state, atomically replacing any prior value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn save(&self, state: &LoopState) -> Result<(), StoreError>;
}

// ============================================================================
// SECTION: Artifact Store
// ============================================================================

/// Persists per-run artifacts and the dashboard-facing status snapshot.
pub trait ArtifactStore {
    /// Allocates a new, sortable run directory identifier.
    fn new_run_dir(&self, now: Timestamp) -> RunDirId;

    /// Writes `source_traces.json` for the given run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn write_source_traces(
        &self,
        run_dir: &RunDirId,
        traces: &SourceTraces,
    ) -> Result<(), StoreError>;

    /// Writes `findings_and_variants.json` for the given run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn write_findings_and_variants(
        &self,
        run_dir: &RunDirId,
        findings: &crate::core::data::FindingsAndVariants,
    ) -> Result<(), StoreError>;

    /// Writes `promotion_decision.json` for the given run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn write_promotion_decision(
        &self,
        run_dir: &RunDirId,
        decision: &PromotionDecision,
    ) -> Result<(), StoreError>;

    /// Atomically writes the dashboard-facing `status.json`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn write_status(&self, status: &StatusSnapshot) -> Result<(), StoreError>;

    /// Reads back the most recently written `status.json`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the file exists but fails its hash or
    /// schema check.
    fn read_status(&self) -> Result<Option<StatusSnapshot>, StoreError>;

    /// Reads back the identifier of the most recently completed run, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on I/O failure.
    fn latest_run_dir(&self) -> Result<Option<RunDirId>, StoreError>;

    /// Reads back `source_traces.json` for a run, if present.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the file exists but fails its hash or
    /// schema check.
    fn read_source_traces(&self, run_dir: &RunDirId) -> Result<Option<SourceTraces>, StoreError>;

    /// Reads back `findings_and_variants.json` for a run, if present.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the file exists but fails its hash or
    /// schema check.
    fn read_findings_and_variants(
        &self,
        run_dir: &RunDirId,
    ) -> Result<Option<crate::core::data::FindingsAndVariants>, StoreError>;

    /// Reads back `promotion_decision.json` for a run, if present.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the file exists but fails its hash or
    /// schema check.
    fn read_promotion_decision(
        &self,
        run_dir: &RunDirId,
    ) -> Result<Option<PromotionDecision>, StoreError>;
}
