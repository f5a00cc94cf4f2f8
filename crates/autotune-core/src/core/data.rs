// autotune-core/src/core/data.rs
// ============================================================================
// Module: Data Model
// Description: Traces, dataset rows, prompt variants, and run artifacts.
// Purpose: Define the typed schemas every component reads and writes.
// Dependencies: serde, serde_json, crate::core::identifiers, crate::core::time
// ============================================================================

//! ## Overview
//! These types are the wire format for everything persisted by the autotune
//! control loop: traces pulled from the tracing service, dataset rows driving
//! simulated conversations, prompt variants proposed by the generator model,
//! and the aggregated results of one evaluation run.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::core::identifiers::CaseId;
use crate::core::identifiers::DatasetName;
use crate::core::identifiers::DatasetVersion;
use crate::core::identifiers::ExperimentId;
use crate::core::identifiers::ExperimentRef;
use crate::core::identifiers::PromptHash;
use crate::core::identifiers::TraceId;
use crate::core::identifiers::VariantName;
use crate::core::time::Timestamp;

/// Sentinel score recorded when a metric could not be reached for a case
/// (spec: turn limit exceeded, malformed judge output, case timeout).
pub const NOT_REACHED: f64 = -1.0;

// ============================================================================
// SECTION: Trace
// ============================================================================

/// One turn of a recorded conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Who spoke this turn.
    pub role: TurnRole,
    /// The turn's text content.
    pub text: String,
}

/// Speaker role for one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    /// The simulated or real caller.
    User,
    /// The voice agent.
    Assistant,
}

/// One recorded tool invocation within a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallTrace {
    /// Name of the invoked tool.
    pub name: String,
    /// Arguments passed to the tool, as opaque JSON.
    pub arguments: Value,
    /// Result returned by the tool, as opaque JSON.
    pub result: Value,
}

/// One completed multi-turn conversation recorded by the external tracing
/// service. Immutable once written; identity is `trace_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Unique identifier of this trace.
    pub trace_id: TraceId,
    /// Source experiment bucket this trace was recorded under.
    pub experiment_id: ExperimentId,
    /// When the trace was recorded.
    pub created_at: Timestamp,
    /// Dataset row this trace corresponds to, if any.
    pub input_case_id: Option<CaseId>,
    /// Ordered user/assistant turns.
    pub turns: Vec<Turn>,
    /// Tool calls observed during the conversation.
    pub tool_calls: Vec<ToolCallTrace>,
    /// Scorer name to numeric score, as recorded by the originating system.
    pub metrics: BTreeMap<String, f64>,
    /// Content hash of the prompt that produced this trace.
    pub prompt_hash: PromptHash,
    /// Optional ground-truth hint: whether an emergency was actually needed.
    pub needs_emergency: Option<bool>,
}

impl Trace {
    /// Returns true when every field required for downstream use is present.
    ///
    /// The Trace Snapshot Builder drops traces that fail this check (spec
    /// §4.3): a trace with no turns carries no signal for scoring.
    #[must_use]
    pub fn has_required_fields(&self) -> bool {
        !self.trace_id.as_str().is_empty() && !self.turns.is_empty()
    }
}

// ============================================================================
// SECTION: Dataset
// ============================================================================

/// Enumerated caller disposition used to drive the simulated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attitude {
    /// Caller is cooperative and calm from the outset.
    Calm,
    /// Caller is anxious or distressed.
    Anxious,
    /// Caller is hostile or combative.
    Hostile,
    /// Caller is confused and needs repeated clarification.
    Confused,
}

/// Enumerated verbosity level for the simulated user's responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// Short, terse replies.
    Terse,
    /// Ordinary conversational length.
    Normal,
    /// Long, rambling replies.
    Rambling,
}

/// Enumerated patience level: how many turns before the caller disengages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Patience {
    /// Gives up after a couple of turns if unsatisfied.
    Low,
    /// Ordinary patience.
    Medium,
    /// Will stay engaged for the full turn budget.
    High,
}

/// Structured behaviour profile driving one simulated conversation.
///
/// Unknown keys are rejected at deserialization rather than accepted into a
/// free-form map, per the Design Notes in the specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulatedUserProfile {
    /// The caller's opening statement or goal, verbatim.
    pub text: String,
    /// Caller disposition.
    pub attitude: Option<Attitude>,
    /// Tone descriptor, free text (e.g. "panicked", "flat").
    pub tone: Option<String>,
    /// How willing the caller is to follow agent instructions.
    pub cooperativeness: Option<Attitude>,
    /// How much the caller says per turn.
    pub verbosity: Option<Verbosity>,
    /// How long the caller stays engaged.
    pub patience: Option<Patience>,
    /// What the caller is trying to accomplish.
    pub goal: Option<String>,
    /// Ground truth: whether this case actually needs emergency escalation.
    pub needs_emergency: Option<bool>,
}

/// One row in a frozen dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRow {
    /// Unique identifier within the dataset.
    pub case_id: CaseId,
    /// The simulated user profile driving this case.
    pub input: SimulatedUserProfile,
    /// Optional reference answer or label.
    pub expected: Option<Value>,
    /// Free-form metadata attached to the row.
    pub metadata: BTreeMap<String, Value>,
}

/// A loaded, immutable dataset snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSnapshot {
    /// Dataset name.
    pub name: DatasetName,
    /// Dataset version.
    pub version: Option<DatasetVersion>,
    /// Rows in the dataset.
    pub rows: Vec<DatasetRow>,
}

// ============================================================================
// SECTION: Prompt Variants
// ============================================================================

/// A candidate system prompt produced by the Strategy Proposer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVariant {
    /// Stable name for this variant within the run.
    pub name: VariantName,
    /// The full system prompt text.
    pub text: String,
    /// Why this variant was proposed.
    pub rationale: String,
    /// Content hash of the prompt this variant mutates.
    pub parent_hash: PromptHash,
    /// Content hash of this variant's own text.
    pub hash: PromptHash,
}

// ============================================================================
// SECTION: Scoring
// ============================================================================

/// Dataset split a `VariantRun` was evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    /// Held-out split used to decide a winner.
    Test,
    /// Confirmation split used to re-check a test winner.
    Train,
}

/// Event recorded whenever an LLM-judge scorer returns non-JSON or
/// schema-invalid output (spec §4.6, §7, scenario 4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MalformedJudgeEvent {
    /// Case the malformed output was recorded against.
    pub case_id: CaseId,
    /// Name of the scorer that produced malformed output.
    pub scorer_name: String,
    /// Bounded excerpt of the raw response, for diagnostics.
    pub raw_excerpt: String,
    /// When the event was recorded.
    pub recorded_at: Timestamp,
}

/// Maximum length of a `MalformedJudgeEvent::raw_excerpt`.
pub const MAX_RAW_EXCERPT_LEN: usize = 512;

impl MalformedJudgeEvent {
    /// Builds a malformed-judge event, truncating the excerpt to
    /// [`MAX_RAW_EXCERPT_LEN`].
    #[must_use]
    pub fn new(
        case_id: CaseId,
        scorer_name: impl Into<String>,
        raw: &str,
        recorded_at: Timestamp,
    ) -> Self {
        let mut excerpt: String = raw.chars().take(MAX_RAW_EXCERPT_LEN).collect();
        excerpt.shrink_to_fit();
        Self {
            case_id,
            scorer_name: scorer_name.into(),
            raw_excerpt: excerpt,
            recorded_at,
        }
    }
}

/// Aggregated result of evaluating one prompt variant against one split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRun {
    /// Variant that was evaluated (or a reserved name for the baseline).
    pub variant_name: VariantName,
    /// Dataset split this run evaluated against.
    pub split: Split,
    /// Dataset this run evaluated against, as `name@version`.
    pub dataset_ref: String,
    /// Per-case scorer results, keyed by case id then scorer name.
    pub per_case: BTreeMap<CaseId, BTreeMap<String, f64>>,
    /// Aggregate scorer name to aggregated metric value.
    pub metrics: BTreeMap<String, f64>,
    /// Mean turn count over cases that reached an end state.
    pub avg_turn_count: f64,
    /// Number of cases where a judge scorer returned malformed output.
    pub malformed_judge_count: u32,
    /// External experiment handle scored rows were attached to.
    pub experiment_ref: ExperimentRef,
    /// When evaluation started.
    pub started_at: Timestamp,
    /// When evaluation finished.
    pub finished_at: Timestamp,
}

// ============================================================================
// SECTION: Run Artifacts
// ============================================================================

/// `source_traces.json`: the exact set of traces used by one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTraces {
    /// Traces joined to a dataset row and used for evaluation bookkeeping.
    pub joined: Vec<TraceId>,
    /// Traces that did not join to any dataset row (diagnostic only).
    pub ad_hoc: Vec<TraceId>,
    /// Count of traces newly observed since the prior run's cursor.
    pub new_trace_count: u32,
}

/// `findings_and_variants.json`: the Strategy Proposer's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingsAndVariants {
    /// 3-6 aggregated failure-mode findings, most common first.
    pub findings: Vec<String>,
    /// Proposed prompt variants.
    pub variants: Vec<PromptVariant>,
    /// Effective seed used by the generator call.
    pub effective_seed: Option<u64>,
    /// Effective temperature actually honoured by the generator model.
    pub effective_temperature: f64,
}

/// `promotion_decision.json`: the Promotion Gate's recorded decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionDecision {
    /// Whether a new prompt was promoted.
    pub promoted: bool,
    /// Winning variant, if any.
    pub winner: Option<VariantName>,
    /// Baseline prompt hash prior to this decision.
    pub prior_hash: PromptHash,
    /// New prompt hash, equal to `prior_hash` when `promoted` is false.
    pub new_hash: PromptHash,
    /// Test-split run for the baseline.
    pub test_baseline: VariantRun,
    /// Test-split run for the winner, if any variant reached the test gate.
    pub test_winner: Option<VariantRun>,
    /// Train-split run for the baseline, if the train gate was evaluated.
    pub train_baseline: Option<VariantRun>,
    /// Train-split run for the winner, if the train gate was evaluated.
    pub train_winner: Option<VariantRun>,
    /// Threshold values used to make this decision.
    pub thresholds: PromotionThresholds,
    /// Human-readable explanation of the decision.
    pub reason: String,
}

/// Thresholds applied by the Promotion Gate, recorded for auditability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PromotionThresholds {
    /// Minimum primary-metric improvement required on the test split.
    pub min_delta_primary: f64,
    /// Maximum allowed secondary-metric regression on the test split.
    pub max_regression_secondary: f64,
    /// Minimum primary-metric improvement required on the train split.
    pub min_delta_primary_train: f64,
}
