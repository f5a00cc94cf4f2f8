// autotune-core/src/core/state.rs
// ============================================================================
// Module: Loop State
// Description: The process-wide state machine state and its audit trail.
// Purpose: Give the worker a single, durable, append-only record of progress.
// Dependencies: serde, crate::core::data, crate::core::identifiers, crate::core::time
// ============================================================================

//! ## Overview
//! `LoopState` is the single instance of process state the worker owns.
//! It is mutated only by the worker, persisted after every phase
//! transition, and read only (as a snapshot) by the Status API. Nothing else
//! may write to it, matching the single-owner rule in the specification.

use serde::Deserialize;
use serde::Serialize;

use crate::core::data::PromotionDecision;
use crate::core::data::PromptVariant;
use crate::core::data::Split;
use crate::core::data::VariantRun;
use crate::core::identifiers::PromptHash;
use crate::core::identifiers::RunDirId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Phase
// ============================================================================

/// One state of the autotune worker's finite state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No cycle in progress; waiting for the next tick.
    Idle,
    /// Polling the trace store for new traces.
    Polling,
    /// Below `MIN_BATCH`; waiting for more traces.
    Waiting,
    /// `source_traces.json` written; enough new traces to proceed.
    SnapshotBuilt,
    /// `findings_and_variants.json` written.
    StrategiesGenerated,
    /// Baseline and variants evaluated on the test split.
    EvalTest,
    /// Test winner re-evaluated on the train split.
    EvalTrain,
    /// A new prompt was promoted.
    Promoted,
    /// The cycle finished, with or without promotion.
    CycleComplete,
    /// A non-recoverable error occurred; the run is abandoned.
    Errored,
    /// A shutdown signal arrived mid-cycle; the in-flight case finished and
    /// a partial run was written.
    Cancelled,
}

impl Phase {
    /// Returns true when this phase represents a terminal state for a cycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::CycleComplete | Self::Errored | Self::Cancelled)
    }
}

// ============================================================================
// SECTION: Tick Outcome
// ============================================================================

/// Non-recoverable error kinds a tick may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Configuration was invalid; the process should not continue ticking.
    Config,
    /// An external dependency failed persistently across retries.
    ExternalDependency,
    /// A persisted artifact failed its schema/hash check.
    ArtifactCorrupt,
}

/// The explicit sum type returned by every call to `tick`, replacing
/// exceptions for control flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// The worker advanced to a new phase.
    Progressed {
        /// Phase reached by this tick.
        phase: Phase,
    },
    /// The worker made no progress and will retry on the next tick.
    Waited {
        /// Why no progress was made.
        reason: String,
    },
    /// The worker hit a non-recoverable error and marked the run `Errored`.
    Errored {
        /// Category of the error.
        kind: ErrorKind,
        /// Human-readable detail.
        detail: String,
    },
}

// ============================================================================
// SECTION: Loop State
// ============================================================================

/// Process-wide autotune worker state. There is exactly one instance per
/// deployment; it is owned solely by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopState {
    /// Timestamp watermark: only traces newer than this are new.
    pub last_trace_cursor: Timestamp,
    /// Count of new traces observed at the start of the current cycle.
    pub pending_trace_count: u32,
    /// Current phase of the state machine.
    pub current_phase: Phase,
    /// Directory of the run currently in progress, if any.
    pub current_run_dir: Option<RunDirId>,
    /// Content hash of the currently live (promoted) prompt.
    pub promoted_prompt_hash: PromptHash,
    /// Full text of the currently live prompt, needed to evaluate the
    /// baseline and to seed the Strategy Proposer each cycle. Kept alongside
    /// `promoted_prompt_hash` so the two never drift out of sync.
    pub promoted_prompt_text: String,
    /// When this state was last persisted.
    pub updated_at: Timestamp,
}

impl LoopState {
    /// Builds the initial state for a fresh deployment: idle, no traces seen,
    /// the given seed prompt as the current live prompt.
    #[must_use]
    pub fn initial(seed_prompt_hash: PromptHash, seed_prompt_text: impl Into<String>, now: Timestamp) -> Self {
        Self {
            last_trace_cursor: Timestamp::from_unix_millis(0),
            pending_trace_count: 0,
            current_phase: Phase::Idle,
            current_run_dir: None,
            promoted_prompt_hash: seed_prompt_hash,
            promoted_prompt_text: seed_prompt_text.into(),
            updated_at: now,
        }
    }

    /// Applies a phase transition, always updating `updated_at`. Does not
    /// persist; callers must hand the result to a `LoopStateStore`.
    #[must_use]
    pub fn transition(&self, phase: Phase, now: Timestamp) -> Self {
        let mut next = self.clone();
        next.current_phase = phase;
        next.updated_at = now;
        next
    }
}

// ============================================================================
// SECTION: Status Snapshot
// ============================================================================

/// `status.json`: the dashboard-facing snapshot written after every phase
/// transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Current phase.
    pub phase: Phase,
    /// Short human-readable reason for the current phase, if any.
    pub reason: Option<String>,
    /// When this snapshot was written.
    pub updated_at: Timestamp,
    /// Count of new traces considered in the current/most recent cycle.
    pub new_trace_count: u32,
    /// One-line summary of proposed variants, if any have been generated.
    pub variants_summary: Option<Vec<String>>,
    /// One-line summary of completed variant runs, if any.
    pub variant_runs_summary: Option<Vec<String>>,
    /// Name of the winning variant, if a winner was determined.
    pub winner: Option<String>,
    /// Whether the most recent cycle promoted a new prompt.
    pub promoted: bool,
}

impl StatusSnapshot {
    /// Builds a status snapshot reflecting the idle/waiting state.
    #[must_use]
    pub fn from_state(state: &LoopState, reason: Option<String>) -> Self {
        Self {
            phase: state.current_phase,
            reason,
            updated_at: state.updated_at,
            new_trace_count: state.pending_trace_count,
            variants_summary: None,
            variant_runs_summary: None,
            winner: None,
            promoted: false,
        }
    }

    /// Builds a status snapshot from a completed promotion decision,
    /// including the proposed variants and every run it recorded.
    #[must_use]
    pub fn from_decision(state: &LoopState, decision: &PromotionDecision, variants: &[PromptVariant]) -> Self {
        let mut snapshot = Self::from_state(state, Some(decision.reason.clone()));
        snapshot.winner = decision.winner.as_ref().map(ToString::to_string);
        snapshot.promoted = decision.promoted;
        snapshot.variants_summary = (!variants.is_empty())
            .then(|| variants.iter().map(|variant| format!("{}: {}", variant.name, variant.rationale)).collect());

        let mut runs = vec![summarize_variant_run(&decision.test_baseline)];
        runs.extend(decision.test_winner.as_ref().map(summarize_variant_run));
        runs.extend(decision.train_baseline.as_ref().map(summarize_variant_run));
        runs.extend(decision.train_winner.as_ref().map(summarize_variant_run));
        snapshot.variant_runs_summary = Some(runs);

        snapshot
    }
}

/// One-line summary of a variant run for `status.json`'s dashboard view.
fn summarize_variant_run(run: &VariantRun) -> String {
    let split = match run.split {
        Split::Test => "test",
        Split::Train => "train",
    };
    format!(
        "{} [{split}]: avg_turns={:.1}, malformed={}",
        run.variant_name, run.avg_turn_count, run.malformed_judge_count
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_idle_with_seed_hash() {
        let seed = PromptHash::new("seed-hash");
        let now = Timestamp::from_unix_millis(1000);
        let state = LoopState::initial(seed.clone(), "seed prompt text", now);
        assert_eq!(state.current_phase, Phase::Idle);
        assert_eq!(state.promoted_prompt_hash, seed);
        assert_eq!(state.pending_trace_count, 0);
    }

    #[test]
    fn transition_updates_phase_and_timestamp_only() {
        let seed = PromptHash::new("seed-hash");
        let state = LoopState::initial(seed, "seed prompt text", Timestamp::from_unix_millis(0));
        let next = state.transition(Phase::Polling, Timestamp::from_unix_millis(500));
        assert_eq!(next.current_phase, Phase::Polling);
        assert_eq!(next.updated_at, Timestamp::from_unix_millis(500));
        assert_eq!(next.promoted_prompt_hash, state.promoted_prompt_hash);
    }

    #[test]
    fn terminal_phases_are_marked() {
        assert!(Phase::CycleComplete.is_terminal());
        assert!(Phase::Errored.is_terminal());
        assert!(Phase::Cancelled.is_terminal());
        assert!(!Phase::Polling.is_terminal());
    }

    fn sample_run(now: Timestamp) -> VariantRun {
        VariantRun {
            variant_name: crate::core::identifiers::VariantName::from("calmer-v2"),
            split: Split::Test,
            dataset_ref: "calm-line@v1".to_string(),
            per_case: std::collections::BTreeMap::new(),
            metrics: std::collections::BTreeMap::new(),
            avg_turn_count: 3.5,
            malformed_judge_count: 0,
            experiment_ref: crate::core::identifiers::ExperimentRef::from("exp-1"),
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn from_decision_fills_winner_and_run_summaries() {
        let now = Timestamp::from_unix_millis(1_000);
        let state = LoopState::initial(PromptHash::new("hash-a"), "prior prompt", now);
        let decision = PromotionDecision {
            promoted: true,
            winner: Some(crate::core::identifiers::VariantName::from("calmer-v2")),
            prior_hash: PromptHash::new("hash-a"),
            new_hash: PromptHash::new("hash-b"),
            test_baseline: sample_run(now),
            test_winner: Some(sample_run(now)),
            train_baseline: Some(sample_run(now)),
            train_winner: Some(sample_run(now)),
            thresholds: crate::core::data::PromotionThresholds {
                min_delta_primary: 0.05,
                max_regression_secondary: 0.02,
                min_delta_primary_train: 0.03,
            },
            reason: "test and train gates both passed".to_string(),
        };
        let variant = PromptVariant {
            name: crate::core::identifiers::VariantName::from("calmer-v2"),
            text: "be calmer".to_string(),
            rationale: "callers de-escalate faster".to_string(),
            parent_hash: PromptHash::new("hash-a"),
            hash: PromptHash::new("hash-b"),
        };

        let snapshot = StatusSnapshot::from_decision(&state, &decision, std::slice::from_ref(&variant));

        assert_eq!(snapshot.winner.as_deref(), Some("calmer-v2"));
        assert!(snapshot.promoted);
        assert_eq!(snapshot.variants_summary.expect("variants summary").len(), 1);
        assert_eq!(snapshot.variant_runs_summary.expect("run summary").len(), 4);
    }
}
