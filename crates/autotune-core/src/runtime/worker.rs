// autotune-core/src/runtime/worker.rs
// ============================================================================
// Module: Autotune Worker
// Description: The finite-state-machine driver advancing one phase per tick.
// Purpose: Durably orchestrate polling, proposal, evaluation, and promotion.
// Dependencies: crate::core, crate::interfaces, crate::runtime::{evaluator,gate,proposer,scorer,snapshot}
// ============================================================================

//! ## Overview
//! `tick` is the worker's only public operation. Each call reads the
//! persisted `LoopState`, advances at most one edge of the state diagram,
//! persists the result, and returns a [`TickOutcome`]. No error unwinds past
//! `tick`: every component failure is caught and turned into either a
//! retriable `Waited` (rate limits) or a durable `Errored` phase.
//!
//! Control-plane calls (trace/dataset fetches, artifact writes, the judge
//! and generate round trips) run inline on the calling task, matching the
//! single-threaded cooperative loop in the specification; only the
//! Evaluator's bulk per-case calls get their own bounded thread pool.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value;
use tracing::info;
use tracing::warn;

use crate::core::data::DatasetRow;
use crate::core::data::DatasetSnapshot;
use crate::core::data::PromotionDecision;
use crate::core::data::PromotionThresholds;
use crate::core::data::PromptVariant;
use crate::core::data::Split;
use crate::core::data::Trace;
use crate::core::data::VariantRun;
use crate::core::identifiers::DatasetName;
use crate::core::identifiers::DatasetVersion;
use crate::core::identifiers::ExperimentId;
use crate::core::identifiers::RunDirId;
use crate::core::identifiers::VariantName;
use crate::core::state::ErrorKind;
use crate::core::state::LoopState;
use crate::core::state::Phase;
use crate::core::state::StatusSnapshot;
use crate::core::state::TickOutcome;
use crate::core::time::Timestamp;
use crate::interfaces::ArtifactStore;
use crate::interfaces::DatasetStore;
use crate::interfaces::DatasetStoreError;
use crate::interfaces::LlmClient;
use crate::interfaces::LlmError;
use crate::interfaces::LoopStateStore;
use crate::interfaces::StoreError;
use crate::interfaces::TraceStore;
use crate::interfaces::TraceStoreError;
use crate::runtime::evaluator;
use crate::runtime::evaluator::EvaluatorError;
use crate::runtime::gate;
use crate::runtime::proposer;
use crate::runtime::proposer::ProposerError;
use crate::runtime::scorer::Scorer;
use crate::runtime::snapshot;

/// Soft cap on traces pulled in a single `POLLING` tick (spec §4.2).
pub const DEFAULT_MAX_TRACES_PER_POLL: usize = 500;
/// Reserved variant name the Promotion Gate compares candidates against.
pub const BASELINE_VARIANT_NAME: &str = "baseline";

/// Tunable parameters for one worker deployment, loaded once at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Minimum new traces required to leave `WAITING` and start a cycle.
    pub min_batch: u32,
    /// Soft cap on traces pulled per `POLLING` tick.
    pub max_traces_per_poll: usize,
    /// Per-case turn budget passed to the Evaluator.
    pub turn_limit: u32,
    /// Number of prompt variants the Strategy Proposer should produce.
    pub variant_count: usize,
    /// Seed requested from the generator model.
    pub seed: Option<u64>,
    /// Sampling temperature requested from the generator model.
    pub temperature: f64,
    /// Metric name the Promotion Gate treats as primary.
    pub primary_metric: String,
    /// Metric name the Promotion Gate treats as secondary.
    pub secondary_metric: String,
    /// Promotion thresholds applied on both splits.
    pub thresholds: PromotionThresholds,
    /// When true, a promoted prompt is published through the Trace Store;
    /// when false, only the decision artifact and internal state are updated.
    pub update_live_prompt: bool,
    /// Bound on concurrently-evaluated cases within one `evaluate` call.
    pub parallelism: usize,
    /// Per-case wall-clock deadline.
    pub case_timeout: Duration,
    /// Dataset binding used for both splits.
    pub dataset_name: DatasetName,
    /// Dataset version, if pinned.
    pub dataset_version: Option<DatasetVersion>,
    /// Optional trace source bucket filter.
    pub source_experiment: Option<ExperimentId>,
}

/// Errors a worker tick can encounter while advancing one phase.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Trace Store Client failure.
    #[error(transparent)]
    TraceStore(#[from] TraceStoreError),
    /// Dataset Store Client failure.
    #[error(transparent)]
    DatasetStore(#[from] DatasetStoreError),
    /// Strategy Proposer failure.
    #[error(transparent)]
    Proposer(#[from] ProposerError),
    /// Evaluator failure.
    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),
    /// State or artifact store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkerError {
    /// Classifies this error for `TickOutcome::Errored` and CLI exit codes.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(_) => ErrorKind::ArtifactCorrupt,
            Self::TraceStore(_) | Self::DatasetStore(_) | Self::Proposer(_) | Self::Evaluator(_) => {
                ErrorKind::ExternalDependency
            }
        }
    }

    /// True when the backend reported a rate limit rather than a hard
    /// failure; these degrade to `WAITING` instead of `ERRORED` (spec §5).
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            Self::TraceStore(TraceStoreError::RateLimited(_))
                | Self::Proposer(ProposerError::Llm(LlmError::RateLimited(_)))
                | Self::Evaluator(EvaluatorError::Llm(LlmError::RateLimited(_)))
        )
    }
}

/// Bundle of collaborators a tick needs; borrowed for the duration of one
/// call so the CLI binary owns their lifetimes.
pub struct WorkerDeps<'a> {
    /// External tracing service client.
    pub trace_store: &'a dyn TraceStore,
    /// Frozen dataset client.
    pub dataset_store: &'a dyn DatasetStore,
    /// Judge/generator/simulated-agent model client.
    pub llm: Arc<dyn LlmClient + Send + Sync>,
    /// The configured scorer suite.
    pub scorers: Arc<Vec<Box<dyn Scorer + Send + Sync>>>,
    /// Durable `LoopState` persistence.
    pub state_store: &'a dyn LoopStateStore,
    /// Durable per-run artifact and status persistence.
    pub artifact_store: &'a dyn ArtifactStore,
    /// Set by the caller when a shutdown signal arrives. Checked between
    /// cases so an in-flight evaluation lets already-dispatched cases
    /// finish but starts no more, then winds the cycle down to `CANCELLED`.
    pub cancel: Arc<AtomicBool>,
}

/// The next state, an optional human-readable reason, and, only when a
/// handler just wrote a `promotion_decision.json`, the richer status
/// snapshot built from it. `persist_progress` falls back to
/// `StatusSnapshot::from_state` whenever the third element is `None`.
type PhaseOutcome = (LoopState, Option<String>, Option<StatusSnapshot>);

/// Bookkeeping carried in-process between the ticks of a single run that
/// `LoopState` and the artifact schema do not persist directly.
///
/// `source_traces.json` records trace ids, not bodies, so the Strategy
/// Proposer's judge calls need the joined traces kept around for the single
/// tick between `SNAPSHOT_BUILT` and `STRATEGIES_GENERATED`. Likewise the
/// test-split winner is carried from `STRATEGIES_GENERATED` into
/// `EVAL_TEST`, and the fully gated decision from `EVAL_TEST` into
/// `EVAL_TRAIN`, without re-running evaluation. If the process restarts in
/// one of these narrow windows the cache is empty; `tick` recovers by
/// stepping back to an earlier, artifact-backed phase and redoing the lost
/// work rather than aborting the run.
#[derive(Debug, Clone, Default)]
pub struct RunTraceCache {
    /// Run directory the current cycle is writing artifacts under.
    run_dir: Option<RunDirId>,
    /// Joined traces for the in-progress run, kept between `SNAPSHOT_BUILT`
    /// and `STRATEGIES_GENERATED`.
    joined_traces: Vec<Trace>,
    /// Test-split winner, kept between `STRATEGIES_GENERATED` and `EVAL_TEST`.
    test_winner: Option<TestWinner>,
    /// Fully gated candidate, kept between `EVAL_TEST` and `EVAL_TRAIN`.
    pending_promotion: Option<PendingPromotion>,
}

/// The variant the test-split evaluation selected, carried into
/// `EVAL_TEST` so the train-split re-run doesn't need to re-derive it.
#[derive(Debug, Clone)]
struct TestWinner {
    /// The winning prompt variant itself.
    variant: PromptVariant,
    /// Baseline's test-split run.
    test_baseline: VariantRun,
    /// Winning variant's test-split run.
    test_winner: VariantRun,
}

/// A fully gated promotion candidate, carried into `EVAL_TRAIN` so
/// `handle_promoted` can write the decision without re-running evaluation.
#[derive(Debug, Clone)]
struct PendingPromotion {
    /// The candidate prompt variant.
    variant: PromptVariant,
    /// Baseline's test-split run.
    test_baseline: VariantRun,
    /// Candidate's test-split run.
    test_winner: VariantRun,
    /// Baseline's train-split run.
    train_baseline: VariantRun,
    /// Candidate's train-split run.
    train_winner: VariantRun,
}

/// The `metadata["split"]` tag a dataset row carries for this split.
fn split_tag(split: Split) -> &'static str {
    match split {
        Split::Test => "test",
        Split::Train => "train",
    }
}

/// Rows bound to one split. A row's `metadata["split"]` string tag decides
/// its split; rows carrying no tag default to the test split, so a dataset
/// authored without the tag still evaluates sensibly end to end.
fn rows_for_split(dataset: &DatasetSnapshot, split: Split) -> Vec<DatasetRow> {
    dataset
        .rows
        .iter()
        .filter(|row| {
            row.metadata
                .get("split")
                .and_then(Value::as_str)
                .map_or(split == Split::Test, |tag| tag == split_tag(split))
        })
        .cloned()
        .collect()
}

/// Formats a dataset reference as `name` or `name@version` for `VariantRun::dataset_ref`.
fn dataset_ref_string(name: &DatasetName, version: Option<&DatasetVersion>) -> String {
    version.map_or_else(|| name.as_str().to_string(), |v| format!("{name}@{v}"))
}

/// Advances the worker by at most one phase transition.
pub async fn tick(
    state: &LoopState,
    config: &WorkerConfig,
    cache: &mut RunTraceCache,
    deps: &WorkerDeps<'_>,
    now: Timestamp,
) -> TickOutcome {
    let result = match state.current_phase {
        Phase::Idle => Ok(handle_idle(state, now)),
        Phase::Polling => handle_polling(state, config, cache, deps, now),
        Phase::Waiting => Ok(handle_waiting(state, now)),
        Phase::SnapshotBuilt => handle_snapshot_built(state, config, cache, deps, now),
        Phase::StrategiesGenerated => handle_eval_test(state, config, cache, deps, now).await,
        Phase::EvalTest => handle_eval_train(state, config, cache, deps, now).await,
        Phase::EvalTrain => handle_promoted(state, config, cache, deps, now),
        Phase::Promoted => Ok(handle_cycle_complete(state, now)),
        Phase::CycleComplete | Phase::Errored | Phase::Cancelled => Ok(handle_cycle_reset(state, now)),
    };

    match result {
        Ok((next_state, reason, status)) => persist_progress(deps, &next_state, reason, status),
        Err(err) if err.is_rate_limited() => {
            warn!(phase = ?state.current_phase, "tick waiting on rate limit");
            let status = StatusSnapshot::from_state(state, Some("rate_limited".to_string()));
            if let Err(store_err) = deps.artifact_store.write_status(&status) {
                warn!(error = %store_err, "failed to write rate-limited status snapshot");
            }
            TickOutcome::Waited { reason: "rate_limited".to_string() }
        }
        Err(err) => {
            let detail = err.to_string();
            let kind = err.kind();
            warn!(phase = ?state.current_phase, %detail, "tick hit a non-recoverable error");
            let errored_state = state.transition(Phase::Errored, now);
            persist_progress_errored(deps, &errored_state, kind, detail)
        }
    }
}

/// Saves `next_state`, writes a status snapshot, and reports the phase reached.
///
/// `status` is the richer snapshot a handler built from a just-written
/// `promotion_decision.json`, if any; otherwise one is derived from
/// `next_state` alone, leaving the decision-related fields at their
/// defaults.
fn persist_progress(
    deps: &WorkerDeps<'_>,
    next_state: &LoopState,
    reason: Option<String>,
    status: Option<StatusSnapshot>,
) -> TickOutcome {
    if let Err(err) = deps.state_store.save(next_state) {
        return TickOutcome::Errored { kind: ErrorKind::ArtifactCorrupt, detail: err.to_string() };
    }
    let status = status.unwrap_or_else(|| StatusSnapshot::from_state(next_state, reason));
    if let Err(err) = deps.artifact_store.write_status(&status) {
        warn!(error = %err, "failed to write status snapshot after phase transition");
    }
    info!(phase = ?next_state.current_phase, "tick progressed");
    TickOutcome::Progressed { phase: next_state.current_phase }
}

/// Saves `errored_state` best-effort and reports an errored outcome
/// regardless of whether the save itself succeeded.
fn persist_progress_errored(
    deps: &WorkerDeps<'_>,
    errored_state: &LoopState,
    kind: ErrorKind,
    detail: String,
) -> TickOutcome {
    if deps.state_store.save(errored_state).is_ok() {
        let status = StatusSnapshot::from_state(errored_state, Some(detail.clone()));
        if let Err(err) = deps.artifact_store.write_status(&status) {
            warn!(error = %err, "failed to write status snapshot for errored state");
        }
    }
    TickOutcome::Errored { kind, detail }
}

/// `IDLE` always moves straight to `POLLING`; there is nothing to check first.
fn handle_idle(state: &LoopState, now: Timestamp) -> PhaseOutcome {
    (state.transition(Phase::Polling, now), None, None)
}

/// A rate-limited wait always retries by returning to `POLLING`.
fn handle_waiting(state: &LoopState, now: Timestamp) -> PhaseOutcome {
    (state.transition(Phase::Polling, now), None, None)
}

/// `PROMOTED` always moves straight to `CYCLE_COMPLETE`; the decision
/// artifact is already written by `handle_promoted`.
fn handle_cycle_complete(state: &LoopState, now: Timestamp) -> PhaseOutcome {
    (state.transition(Phase::CycleComplete, now), None, None)
}

/// Returns a finished or cancelled run to `IDLE`, clearing the run dir so
/// the next cycle starts a fresh one.
fn handle_cycle_reset(state: &LoopState, now: Timestamp) -> PhaseOutcome {
    let mut next = state.transition(Phase::Idle, now);
    next.current_run_dir = None;
    (next, None, None)
}

/// Pulls new traces, checks the minimum-batch gate, and either stays in
/// `POLLING` (not enough traces yet) or opens a run directory and advances
/// to `SNAPSHOT_BUILT`.
fn handle_polling(
    state: &LoopState,
    config: &WorkerConfig,
    cache: &mut RunTraceCache,
    deps: &WorkerDeps<'_>,
    now: Timestamp,
) -> Result<PhaseOutcome, WorkerError> {
    let page = deps.trace_store.fetch_traces_since(
        state.last_trace_cursor,
        config.source_experiment.as_ref(),
        config.max_traces_per_poll,
    )?;
    let new_cursor = page.traces.iter().map(|trace| trace.created_at).max().unwrap_or(state.last_trace_cursor);

    let dataset = deps.dataset_store.load_dataset(&config.dataset_name, config.dataset_version.as_ref())?;
    let known_case_ids: BTreeSet<_> = dataset.rows.iter().map(|row| row.case_id.clone()).collect();
    let snapshot = snapshot::build_snapshot(page.traces, &known_case_ids);

    let mut next = state.clone();
    next.last_trace_cursor = new_cursor;
    next.pending_trace_count = snapshot.source_traces.new_trace_count;

    if snapshot.below_min_batch(config.min_batch) {
        next.current_run_dir = None;
        let next = next.transition(Phase::Waiting, now);
        return Ok((
            next,
            Some(format!("below min batch: {} new traces", snapshot.source_traces.new_trace_count)),
            None,
        ));
    }

    let run_dir = deps.artifact_store.new_run_dir(now);
    deps.artifact_store.write_source_traces(&run_dir, &snapshot.source_traces)?;
    *cache = RunTraceCache {
        run_dir: Some(run_dir.clone()),
        joined_traces: snapshot.joined_traces,
        test_winner: None,
        pending_promotion: None,
    };
    next.current_run_dir = Some(run_dir);
    let next = next.transition(Phase::SnapshotBuilt, now);
    Ok((next, None, None))
}

/// Runs the Strategy Proposer over the cached joined traces and advances to
/// `STRATEGIES_GENERATED` once findings and variants are written.
fn handle_snapshot_built(
    state: &LoopState,
    config: &WorkerConfig,
    cache: &mut RunTraceCache,
    deps: &WorkerDeps<'_>,
    now: Timestamp,
) -> Result<PhaseOutcome, WorkerError> {
    let Some(run_dir) = state.current_run_dir.clone() else {
        return Ok((state.transition(Phase::Polling, now), Some("missing run dir, restarting poll".to_string()), None));
    };
    if cache.run_dir.as_ref() != Some(&run_dir) {
        // Crashed between SNAPSHOT_BUILT and STRATEGIES_GENERATED with no
        // in-process cache to resume from: abandon this run directory and
        // rebuild a fresh snapshot rather than fabricate trace bodies.
        return Ok((
            state.transition(Phase::Polling, now),
            Some("lost trace cache, restarting poll".to_string()),
            None,
        ));
    }

    let result = proposer::propose(
        deps.llm.as_ref(),
        &cache.joined_traces,
        &state.promoted_prompt_text,
        &state.promoted_prompt_hash,
        config.variant_count,
        config.seed,
        config.temperature,
    )?;
    deps.artifact_store.write_findings_and_variants(&run_dir, &result)?;
    cache.joined_traces.clear();
    let next = state.transition(Phase::StrategiesGenerated, now);
    Ok((next, None, None))
}

/// Reads back the proposed variants for the current run, for status
/// summaries written after evaluation has already moved past
/// `STRATEGIES_GENERATED` and no longer has them cached in-process.
fn load_variants(deps: &WorkerDeps<'_>, run_dir: &RunDirId) -> Result<Vec<PromptVariant>, WorkerError> {
    Ok(deps.artifact_store.read_findings_and_variants(run_dir)?.map_or_else(Vec::new, |found| found.variants))
}

/// Writes a partial `promotion_decision.json` and transitions to `CANCELLED`
/// when a shutdown signal arrives mid-evaluation. Cases already dispatched
/// to the evaluator are allowed to finish; this is only reached once no
/// further cases will be started.
#[allow(clippy::too_many_arguments, reason = "assembles every field of a PromotionDecision plus its status context")]
fn write_cancelled_decision(
    deps: &WorkerDeps<'_>,
    run_dir: &RunDirId,
    state: &LoopState,
    now: Timestamp,
    winner: Option<VariantName>,
    test_baseline: VariantRun,
    test_winner: Option<VariantRun>,
    train_baseline: Option<VariantRun>,
    train_winner: Option<VariantRun>,
    thresholds: PromotionThresholds,
    reason: String,
    variants: &[PromptVariant],
) -> Result<PhaseOutcome, WorkerError> {
    let decision = PromotionDecision {
        promoted: false,
        winner,
        prior_hash: state.promoted_prompt_hash.clone(),
        new_hash: state.promoted_prompt_hash.clone(),
        test_baseline,
        test_winner,
        train_baseline,
        train_winner,
        thresholds,
        reason: reason.clone(),
    };
    deps.artifact_store.write_promotion_decision(run_dir, &decision)?;
    let next = state.transition(Phase::Cancelled, now);
    let status = StatusSnapshot::from_decision(&next, &decision, variants);
    Ok((next, Some(reason), Some(status)))
}

/// Evaluates the baseline and each proposed variant on the test split,
/// caches the winner, and advances to `EVAL_TEST`.
async fn handle_eval_test(
    state: &LoopState,
    config: &WorkerConfig,
    cache: &mut RunTraceCache,
    deps: &WorkerDeps<'_>,
    now: Timestamp,
) -> Result<PhaseOutcome, WorkerError> {
    let Some(run_dir) = state.current_run_dir.clone() else {
        return Ok((state.transition(Phase::Polling, now), Some("missing run dir, restarting poll".to_string()), None));
    };
    let findings_and_variants = deps
        .artifact_store
        .read_findings_and_variants(&run_dir)?
        .ok_or_else(|| StoreError::Corrupt(format!("missing findings_and_variants.json in {run_dir}")))?;
    let source_traces = deps
        .artifact_store
        .read_source_traces(&run_dir)?
        .ok_or_else(|| StoreError::Corrupt(format!("missing source_traces.json in {run_dir}")))?;

    let dataset = deps.dataset_store.load_dataset(&config.dataset_name, config.dataset_version.as_ref())?;
    let test_rows = rows_for_split(&dataset, Split::Test);
    let dataset_ref = dataset_ref_string(&config.dataset_name, config.dataset_version.as_ref());

    let baseline_name = VariantName::from(BASELINE_VARIANT_NAME);
    let baseline_experiment = deps.trace_store.write_experiment(&baseline_name, "test", &source_traces)?;
    let baseline_run = evaluator::evaluate(
        Arc::clone(&deps.llm),
        Arc::from(state.promoted_prompt_text.as_str()),
        baseline_name,
        Split::Test,
        dataset_ref.clone(),
        test_rows.clone(),
        Arc::clone(&deps.scorers),
        config.turn_limit,
        config.parallelism,
        config.case_timeout,
        baseline_experiment,
        now,
        || now,
        Arc::clone(&deps.cancel),
    )
    .await?;

    if deps.cancel.load(Ordering::Relaxed) {
        return write_cancelled_decision(
            deps,
            &run_dir,
            state,
            now,
            None,
            baseline_run,
            None,
            None,
            None,
            config.thresholds,
            "cancelled mid-run: shutdown signal received after the test-split baseline".to_string(),
            &findings_and_variants.variants,
        );
    }

    let mut candidate_runs = Vec::with_capacity(findings_and_variants.variants.len());
    let mut cancelled_before_all_candidates = false;
    for variant in &findings_and_variants.variants {
        if deps.cancel.load(Ordering::Relaxed) {
            cancelled_before_all_candidates = true;
            break;
        }
        let experiment_ref = deps.trace_store.write_experiment(&variant.name, "test", &source_traces)?;
        let run = evaluator::evaluate(
            Arc::clone(&deps.llm),
            Arc::from(variant.text.as_str()),
            variant.name.clone(),
            Split::Test,
            dataset_ref.clone(),
            test_rows.clone(),
            Arc::clone(&deps.scorers),
            config.turn_limit,
            config.parallelism,
            config.case_timeout,
            experiment_ref,
            now,
            || now,
            Arc::clone(&deps.cancel),
        )
        .await?;
        candidate_runs.push(run);
    }

    if cancelled_before_all_candidates {
        return write_cancelled_decision(
            deps,
            &run_dir,
            state,
            now,
            None,
            baseline_run,
            None,
            None,
            None,
            config.thresholds,
            "cancelled mid-run: shutdown signal received during test-split evaluation".to_string(),
            &findings_and_variants.variants,
        );
    }

    let winner = gate::select_test_winner(
        &baseline_run,
        &candidate_runs,
        &config.primary_metric,
        &config.secondary_metric,
        &config.thresholds,
    );

    let Some(winner) = winner else {
        let decision = PromotionDecision {
            promoted: false,
            winner: None,
            prior_hash: state.promoted_prompt_hash.clone(),
            new_hash: state.promoted_prompt_hash.clone(),
            test_baseline: baseline_run,
            test_winner: None,
            train_baseline: None,
            train_winner: None,
            thresholds: config.thresholds,
            reason: "no variant passed the test-split gate".to_string(),
        };
        deps.artifact_store.write_promotion_decision(&run_dir, &decision)?;
        let next = state.transition(Phase::CycleComplete, now);
        let status = StatusSnapshot::from_decision(&next, &decision, &findings_and_variants.variants);
        return Ok((next, Some(decision.reason), Some(status)));
    };

    let winner_variant = findings_and_variants
        .variants
        .iter()
        .find(|candidate| candidate.name == winner.variant_name)
        .cloned()
        .ok_or_else(|| StoreError::Corrupt("test winner not found among generated variants".to_string()))?;
    let winner_run = candidate_runs
        .into_iter()
        .find(|run| run.variant_name == winner.variant_name)
        .ok_or_else(|| StoreError::Corrupt("test winner run missing from candidate runs".to_string()))?;

    let reason = format!(
        "test split: {} wins (delta_primary={:.4}, delta_secondary={:.4})",
        winner_variant.name, winner.delta_primary, winner.delta_secondary
    );
    cache.test_winner =
        Some(TestWinner { variant: winner_variant, test_baseline: baseline_run, test_winner: winner_run });
    let next = state.transition(Phase::EvalTest, now);
    Ok((next, Some(reason), None))
}

/// Re-evaluates the cached test-split winner on the train split and
/// advances to `EVAL_TRAIN`, carrying both splits' results for the gate.
async fn handle_eval_train(
    state: &LoopState,
    config: &WorkerConfig,
    cache: &mut RunTraceCache,
    deps: &WorkerDeps<'_>,
    now: Timestamp,
) -> Result<PhaseOutcome, WorkerError> {
    let Some(run_dir) = state.current_run_dir.clone() else {
        return Ok((state.transition(Phase::Polling, now), Some("missing run dir, restarting poll".to_string()), None));
    };
    let Some(test_winner) = cache.test_winner.clone().filter(|_| cache.run_dir.as_ref() == Some(&run_dir)) else {
        // Crashed after selecting the test winner but before the train gate
        // ran; the test-split runs are not persisted anywhere on their own,
        // so the only safe recovery is to redo test evaluation.
        return Ok((
            state.transition(Phase::StrategiesGenerated, now),
            Some("lost test winner, redoing test split evaluation".to_string()),
            None,
        ));
    };

    let source_traces = deps
        .artifact_store
        .read_source_traces(&run_dir)?
        .ok_or_else(|| StoreError::Corrupt(format!("missing source_traces.json in {run_dir}")))?;
    let dataset = deps.dataset_store.load_dataset(&config.dataset_name, config.dataset_version.as_ref())?;
    let train_rows = rows_for_split(&dataset, Split::Train);
    let dataset_ref = dataset_ref_string(&config.dataset_name, config.dataset_version.as_ref());

    let baseline_name = VariantName::from(BASELINE_VARIANT_NAME);
    let baseline_experiment = deps.trace_store.write_experiment(&baseline_name, "train", &source_traces)?;
    let train_baseline = evaluator::evaluate(
        Arc::clone(&deps.llm),
        Arc::from(state.promoted_prompt_text.as_str()),
        baseline_name,
        Split::Train,
        dataset_ref.clone(),
        train_rows.clone(),
        Arc::clone(&deps.scorers),
        config.turn_limit,
        config.parallelism,
        config.case_timeout,
        baseline_experiment,
        now,
        || now,
        Arc::clone(&deps.cancel),
    )
    .await?;

    if deps.cancel.load(Ordering::Relaxed) {
        let variants = load_variants(deps, &run_dir)?;
        return write_cancelled_decision(
            deps,
            &run_dir,
            state,
            now,
            Some(test_winner.variant.name.clone()),
            test_winner.test_baseline,
            Some(test_winner.test_winner),
            Some(train_baseline),
            None,
            config.thresholds,
            "cancelled mid-run: shutdown signal received after the train-split baseline".to_string(),
            &variants,
        );
    }

    let winner_experiment = deps.trace_store.write_experiment(&test_winner.variant.name, "train", &source_traces)?;
    let train_winner = evaluator::evaluate(
        Arc::clone(&deps.llm),
        Arc::from(test_winner.variant.text.as_str()),
        test_winner.variant.name.clone(),
        Split::Train,
        dataset_ref,
        train_rows,
        Arc::clone(&deps.scorers),
        config.turn_limit,
        config.parallelism,
        config.case_timeout,
        winner_experiment,
        now,
        || now,
        Arc::clone(&deps.cancel),
    )
    .await?;

    let holds = gate::passes_train_gate(&train_baseline, &train_winner, &config.primary_metric, &config.thresholds);

    if !holds {
        let decision = PromotionDecision {
            promoted: false,
            winner: Some(test_winner.variant.name.clone()),
            prior_hash: state.promoted_prompt_hash.clone(),
            new_hash: state.promoted_prompt_hash.clone(),
            test_baseline: test_winner.test_baseline,
            test_winner: Some(test_winner.test_winner),
            train_baseline: Some(train_baseline),
            train_winner: Some(train_winner),
            thresholds: config.thresholds,
            reason: "train split gate failed: regression did not clear the confirmation threshold".to_string(),
        };
        deps.artifact_store.write_promotion_decision(&run_dir, &decision)?;
        let next = state.transition(Phase::CycleComplete, now);
        let variants = load_variants(deps, &run_dir)?;
        let status = StatusSnapshot::from_decision(&next, &decision, &variants);
        return Ok((next, Some(decision.reason), Some(status)));
    }

    cache.pending_promotion = Some(PendingPromotion {
        variant: test_winner.variant,
        test_baseline: test_winner.test_baseline,
        test_winner: test_winner.test_winner,
        train_baseline,
        train_winner,
    });
    let next = state.transition(Phase::EvalTrain, now);
    Ok((next, Some("train split gate passed, promoting".to_string()), None))
}

/// Applies the Promotion Gate to the cached test/train results, writes the
/// decision artifact, optionally publishes the prompt, and advances to
/// `PROMOTED`.
fn handle_promoted(
    state: &LoopState,
    config: &WorkerConfig,
    cache: &mut RunTraceCache,
    deps: &WorkerDeps<'_>,
    now: Timestamp,
) -> Result<PhaseOutcome, WorkerError> {
    let Some(run_dir) = state.current_run_dir.clone() else {
        return Ok((state.transition(Phase::Polling, now), Some("missing run dir, restarting poll".to_string()), None));
    };
    let Some(pending) = cache.pending_promotion.take().filter(|_| cache.run_dir.as_ref() == Some(&run_dir)) else {
        // Crashed after the train gate passed but before publish: the
        // gated result is not itself persisted, so redo evaluation from
        // the top of the proposal rather than risk publishing stale
        // numbers.
        return Ok((
            state.transition(Phase::StrategiesGenerated, now),
            Some("lost pending promotion, redoing evaluation".to_string()),
            None,
        ));
    };

    if deps.cancel.load(Ordering::Relaxed) {
        let variants = load_variants(deps, &run_dir)?;
        return write_cancelled_decision(
            deps,
            &run_dir,
            state,
            now,
            Some(pending.variant.name.clone()),
            pending.test_baseline,
            Some(pending.test_winner),
            Some(pending.train_baseline),
            Some(pending.train_winner),
            config.thresholds,
            "cancelled mid-run: shutdown signal received before the gated prompt was published".to_string(),
            &variants,
        );
    }

    let publish_result = if config.update_live_prompt {
        deps.trace_store.publish_prompt(
            &pending.variant.hash,
            &pending.variant.text,
            &serde_json::json!({
                "rationale": pending.variant.rationale,
                "parent_hash": pending.variant.parent_hash.to_string(),
            }),
        )
    } else {
        Ok(())
    };

    let (promoted, new_hash, new_text, reason) = match publish_result {
        Ok(()) => (
            true,
            pending.variant.hash.clone(),
            pending.variant.text.clone(),
            format!("promoted: {} passed both gates", pending.variant.name),
        ),
        Err(err) => (
            false,
            state.promoted_prompt_hash.clone(),
            state.promoted_prompt_text.clone(),
            format!("publish_failed: {err}"),
        ),
    };

    let decision = PromotionDecision {
        promoted,
        winner: Some(pending.variant.name.clone()),
        prior_hash: state.promoted_prompt_hash.clone(),
        new_hash: new_hash.clone(),
        test_baseline: pending.test_baseline,
        test_winner: Some(pending.test_winner),
        train_baseline: Some(pending.train_baseline),
        train_winner: Some(pending.train_winner),
        thresholds: config.thresholds,
        reason: reason.clone(),
    };
    deps.artifact_store.write_promotion_decision(&run_dir, &decision)?;

    let mut next = state.transition(Phase::Promoted, now);
    next.promoted_prompt_hash = new_hash;
    next.promoted_prompt_text = new_text;
    let variants = load_variants(deps, &run_dir)?;
    let status = StatusSnapshot::from_decision(&next, &decision, &variants);
    Ok((next, Some(reason), Some(status)))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::PoisonError;

    use serde_json::json;

    use super::*;
    use crate::core::data::FindingsAndVariants;
    use crate::core::data::SimulatedUserProfile;
    use crate::core::data::SourceTraces;
    use crate::core::data::Turn;
    use crate::core::data::TurnRole;
    use crate::core::identifiers::CaseId;
    use crate::core::identifiers::ExperimentRef;
    use crate::core::identifiers::PromptHash;
    use crate::core::identifiers::TraceId;
    use crate::interfaces::AgentTurn;
    use crate::interfaces::EffectiveGenerationParams;
    use crate::interfaces::GenerateRequest;
    use crate::interfaces::TracePage;
    use crate::runtime::scorer::LengthHeuristicScorer;

    #[derive(Default)]
    struct InMemoryLoopStateStore {
        state: Mutex<Option<LoopState>>,
    }

    impl LoopStateStore for InMemoryLoopStateStore {
        fn load(&self) -> Result<Option<LoopState>, StoreError> {
            Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner).clone())
        }

        fn save(&self, state: &LoopState) -> Result<(), StoreError> {
            *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
            Ok(())
        }
    }

    /// Plain `Mutex`-guarded maps standing in for a run-keyed filesystem
    /// layout; every method mirrors the real `ArtifactStore` contract
    /// without touching disk.
    #[derive(Default)]
    struct InMemoryArtifactStore {
        run_counter: Mutex<u64>,
        latest_run_dir: Mutex<Option<RunDirId>>,
        source_traces: Mutex<HashMap<RunDirId, SourceTraces>>,
        findings: Mutex<HashMap<RunDirId, FindingsAndVariants>>,
        decisions: Mutex<HashMap<RunDirId, PromotionDecision>>,
        status: Mutex<Option<StatusSnapshot>>,
    }

    impl ArtifactStore for InMemoryArtifactStore {
        fn new_run_dir(&self, now: Timestamp) -> RunDirId {
            let mut counter = self.run_counter.lock().unwrap_or_else(PoisonError::into_inner);
            *counter += 1;
            let run_dir = RunDirId::from(format!("{:020}-{}", now.as_unix_millis(), counter));
            *self.latest_run_dir.lock().unwrap_or_else(PoisonError::into_inner) = Some(run_dir.clone());
            run_dir
        }

        fn write_source_traces(&self, run_dir: &RunDirId, traces: &SourceTraces) -> Result<(), StoreError> {
            self.source_traces
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(run_dir.clone(), traces.clone());
            Ok(())
        }

        fn write_findings_and_variants(&self, run_dir: &RunDirId, findings: &FindingsAndVariants) -> Result<(), StoreError> {
            self.findings.lock().unwrap_or_else(PoisonError::into_inner).insert(run_dir.clone(), findings.clone());
            Ok(())
        }

        fn write_promotion_decision(&self, run_dir: &RunDirId, decision: &PromotionDecision) -> Result<(), StoreError> {
            self.decisions.lock().unwrap_or_else(PoisonError::into_inner).insert(run_dir.clone(), decision.clone());
            Ok(())
        }

        fn write_status(&self, status: &StatusSnapshot) -> Result<(), StoreError> {
            *self.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(status.clone());
            Ok(())
        }

        fn read_status(&self) -> Result<Option<StatusSnapshot>, StoreError> {
            Ok(self.status.lock().unwrap_or_else(PoisonError::into_inner).clone())
        }

        fn latest_run_dir(&self) -> Result<Option<RunDirId>, StoreError> {
            Ok(self.latest_run_dir.lock().unwrap_or_else(PoisonError::into_inner).clone())
        }

        fn read_source_traces(&self, run_dir: &RunDirId) -> Result<Option<SourceTraces>, StoreError> {
            Ok(self.source_traces.lock().unwrap_or_else(PoisonError::into_inner).get(run_dir).cloned())
        }

        fn read_findings_and_variants(&self, run_dir: &RunDirId) -> Result<Option<FindingsAndVariants>, StoreError> {
            Ok(self.findings.lock().unwrap_or_else(PoisonError::into_inner).get(run_dir).cloned())
        }

        fn read_promotion_decision(&self, run_dir: &RunDirId) -> Result<Option<PromotionDecision>, StoreError> {
            Ok(self.decisions.lock().unwrap_or_else(PoisonError::into_inner).get(run_dir).cloned())
        }
    }

    /// Fixed trace list plus a toggle driving the publish-failure scenario.
    struct StubTraceStore {
        traces: Vec<Trace>,
        fail_publish: bool,
    }

    impl TraceStore for StubTraceStore {
        fn fetch_traces_since(
            &self,
            _cursor: Timestamp,
            _source_experiment: Option<&ExperimentId>,
            _max_count: usize,
        ) -> Result<TracePage, TraceStoreError> {
            Ok(TracePage { traces: self.traces.clone(), has_more: false })
        }

        fn write_experiment(
            &self,
            name: &VariantName,
            split_label: &str,
            _rows: &SourceTraces,
        ) -> Result<ExperimentRef, TraceStoreError> {
            Ok(ExperimentRef::from(format!("{name}-{split_label}")))
        }

        fn publish_prompt(&self, _prompt_hash: &PromptHash, _text: &str, _metadata: &Value) -> Result<(), TraceStoreError> {
            if self.fail_publish {
                Err(TraceStoreError::Failed("publish endpoint unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct StubDatasetStore {
        rows: Vec<DatasetRow>,
    }

    impl DatasetStore for StubDatasetStore {
        fn load_dataset(
            &self,
            name: &DatasetName,
            version: Option<&DatasetVersion>,
        ) -> Result<DatasetSnapshot, DatasetStoreError> {
            Ok(DatasetSnapshot { name: name.clone(), version: version.cloned(), rows: self.rows.clone() })
        }
    }

    /// A deterministic agent: its simulated reply is short unless the
    /// prompt it was given carries `longer_reply_marker`, so
    /// `LengthHeuristicScorer` alone is enough to tell baseline and
    /// candidate apart without any judge machinery.
    struct StubLlmClient {
        generate_response: Value,
        longer_reply_marker: &'static str,
    }

    impl LlmClient for StubLlmClient {
        fn judge(&self, _judge_prompt_version: &str, _input: &Value) -> Result<Value, LlmError> {
            Ok(json!({"worked": [], "failed": []}))
        }

        fn generate(&self, _request: &GenerateRequest<'_>) -> Result<(Value, EffectiveGenerationParams), LlmError> {
            Ok((self.generate_response.clone(), EffectiveGenerationParams { seed: Some(1), temperature: 0.5 }))
        }

        fn simulate_turn(&self, system_prompt: &str, _history: &[Value]) -> Result<AgentTurn, LlmError> {
            let text = if system_prompt.contains(self.longer_reply_marker) {
                "one two three four five six seven eight nine ten"
            } else {
                "one two"
            };
            Ok(AgentTurn { text: text.to_string(), tool_calls: vec![], end_of_call: true })
        }
    }

    fn seed_state(now: Timestamp) -> LoopState {
        LoopState::initial(PromptHash::new("seed-hash"), "baseline system prompt", now)
    }

    fn base_config() -> WorkerConfig {
        WorkerConfig {
            min_batch: 1,
            max_traces_per_poll: DEFAULT_MAX_TRACES_PER_POLL,
            turn_limit: 5,
            variant_count: 1,
            seed: None,
            temperature: 0.5,
            primary_metric: "avg_assistant_turn_words".to_string(),
            secondary_metric: "avg_assistant_turn_words".to_string(),
            thresholds: PromotionThresholds {
                min_delta_primary: 2.0,
                max_regression_secondary: 100.0,
                min_delta_primary_train: 2.0,
            },
            update_live_prompt: true,
            parallelism: 4,
            case_timeout: Duration::from_secs(5),
            dataset_name: DatasetName::from("calm-line"),
            dataset_version: None,
            source_experiment: None,
        }
    }

    fn sample_trace(id: &str, now: Timestamp) -> Trace {
        Trace {
            trace_id: TraceId::from(id),
            experiment_id: ExperimentId::from("exp-source"),
            created_at: now,
            input_case_id: None,
            turns: vec![Turn { role: TurnRole::User, text: "I need help".to_string() }],
            tool_calls: vec![],
            metrics: BTreeMap::new(),
            prompt_hash: PromptHash::new("seed-hash"),
            needs_emergency: None,
        }
    }

    fn sample_dataset_row(case_id: &str, split: &str) -> DatasetRow {
        let mut metadata = BTreeMap::new();
        metadata.insert("split".to_string(), Value::String(split.to_string()));
        DatasetRow {
            case_id: CaseId::from(case_id),
            input: SimulatedUserProfile {
                text: "I need help".to_string(),
                attitude: None,
                tone: None,
                cooperativeness: None,
                verbosity: None,
                patience: None,
                goal: None,
                needs_emergency: None,
            },
            expected: None,
            metadata,
        }
    }

    fn longer_variant_response() -> Value {
        json!([{"name": "longer-variant", "text": "LONGER system prompt", "rationale": "say more per turn"}])
    }

    /// Drives one `tick` and reloads the state it persisted, mirroring how
    /// the CLI's poll loop uses the two in tandem.
    async fn run_tick(
        state: &LoopState,
        config: &WorkerConfig,
        cache: &mut RunTraceCache,
        deps: &WorkerDeps<'_>,
        now: Timestamp,
    ) -> (TickOutcome, LoopState) {
        let outcome = tick(state, config, cache, deps, now).await;
        let next = deps.state_store.load().expect("state store load").expect("tick always persists a state");
        (outcome, next)
    }

    #[tokio::test]
    async fn insufficient_batch_waits_in_polling() {
        let now = Timestamp::from_unix_millis(1_000);
        let state_store = InMemoryLoopStateStore::default();
        let artifact_store = InMemoryArtifactStore::default();
        let trace_store = StubTraceStore { traces: vec![sample_trace("t1", now)], fail_publish: false };
        let dataset_store = StubDatasetStore { rows: vec![sample_dataset_row("case-1", "test")] };
        let llm: Arc<dyn LlmClient + Send + Sync> =
            Arc::new(StubLlmClient { generate_response: Value::Null, longer_reply_marker: "LONGER" });
        let scorers: Arc<Vec<Box<dyn Scorer + Send + Sync>>> = Arc::new(vec![Box::new(LengthHeuristicScorer)]);
        let mut config = base_config();
        config.min_batch = 5;
        let deps = WorkerDeps {
            trace_store: &trace_store,
            dataset_store: &dataset_store,
            llm,
            scorers,
            state_store: &state_store,
            artifact_store: &artifact_store,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        let mut cache = RunTraceCache::default();
        let state = seed_state(now);

        let (outcome, state) = run_tick(&state, &config, &mut cache, &deps, now).await;
        assert!(matches!(outcome, TickOutcome::Progressed { phase: Phase::Polling }));

        let (outcome, state) = run_tick(&state, &config, &mut cache, &deps, now).await;
        assert!(matches!(outcome, TickOutcome::Progressed { phase: Phase::Waiting }));
        assert_eq!(state.current_run_dir, None);
    }

    #[tokio::test]
    async fn clear_win_promotes_through_the_full_cycle() {
        let now = Timestamp::from_unix_millis(1_000);
        let state_store = InMemoryLoopStateStore::default();
        let artifact_store = InMemoryArtifactStore::default();
        let trace_store =
            StubTraceStore { traces: vec![sample_trace("t1", now), sample_trace("t2", now)], fail_publish: false };
        let dataset_store = StubDatasetStore {
            rows: vec![sample_dataset_row("case-1", "test"), sample_dataset_row("case-2", "train")],
        };
        let llm: Arc<dyn LlmClient + Send + Sync> =
            Arc::new(StubLlmClient { generate_response: longer_variant_response(), longer_reply_marker: "LONGER" });
        let scorers: Arc<Vec<Box<dyn Scorer + Send + Sync>>> = Arc::new(vec![Box::new(LengthHeuristicScorer)]);
        let config = base_config();
        let deps = WorkerDeps {
            trace_store: &trace_store,
            dataset_store: &dataset_store,
            llm,
            scorers,
            state_store: &state_store,
            artifact_store: &artifact_store,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        let mut cache = RunTraceCache::default();
        let mut state = seed_state(now);

        for expected_phase in [
            Phase::Polling,
            Phase::SnapshotBuilt,
            Phase::StrategiesGenerated,
            Phase::EvalTest,
            Phase::EvalTrain,
            Phase::Promoted,
        ] {
            let (outcome, next) = run_tick(&state, &config, &mut cache, &deps, now).await;
            assert!(matches!(outcome, TickOutcome::Progressed { phase } if phase == expected_phase));
            state = next;
        }

        assert_eq!(state.promoted_prompt_text, "LONGER system prompt");
        assert_ne!(state.promoted_prompt_hash, PromptHash::new("seed-hash"));

        let run_dir = state.current_run_dir.clone().expect("promoted state keeps its run dir");
        let decision =
            artifact_store.read_promotion_decision(&run_dir).expect("read decision").expect("decision written");
        assert!(decision.promoted);
        assert_eq!(decision.winner, Some(VariantName::from("longer-variant")));

        let status = artifact_store.read_status().expect("read status").expect("status written");
        assert_eq!(status.winner.as_deref(), Some("longer-variant"));
        assert!(status.promoted);
        assert_eq!(status.variants_summary.expect("variants summary").len(), 1);
        assert_eq!(status.variant_runs_summary.expect("run summary").len(), 4);
    }

    #[tokio::test]
    async fn malformed_generator_response_marks_the_run_errored() {
        let now = Timestamp::from_unix_millis(1_000);
        let state_store = InMemoryLoopStateStore::default();
        let artifact_store = InMemoryArtifactStore::default();
        let trace_store = StubTraceStore { traces: vec![sample_trace("t1", now)], fail_publish: false };
        let dataset_store = StubDatasetStore { rows: vec![sample_dataset_row("case-1", "test")] };
        let llm: Arc<dyn LlmClient + Send + Sync> = Arc::new(StubLlmClient {
            generate_response: json!({"not": "an array of variants"}),
            longer_reply_marker: "LONGER",
        });
        let scorers: Arc<Vec<Box<dyn Scorer + Send + Sync>>> = Arc::new(vec![Box::new(LengthHeuristicScorer)]);
        let config = base_config();
        let deps = WorkerDeps {
            trace_store: &trace_store,
            dataset_store: &dataset_store,
            llm,
            scorers,
            state_store: &state_store,
            artifact_store: &artifact_store,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        let mut cache = RunTraceCache::default();
        let mut state = seed_state(now);

        for expected_phase in [Phase::Polling, Phase::SnapshotBuilt] {
            let (outcome, next) = run_tick(&state, &config, &mut cache, &deps, now).await;
            assert!(matches!(outcome, TickOutcome::Progressed { phase } if phase == expected_phase));
            state = next;
        }

        let (outcome, state) = run_tick(&state, &config, &mut cache, &deps, now).await;
        assert!(matches!(outcome, TickOutcome::Errored { kind: ErrorKind::ExternalDependency, .. }));
        assert_eq!(state.current_phase, Phase::Errored);
    }

    #[tokio::test]
    async fn publish_failure_keeps_the_prior_prompt_live() {
        let now = Timestamp::from_unix_millis(1_000);
        let state_store = InMemoryLoopStateStore::default();
        let artifact_store = InMemoryArtifactStore::default();
        let trace_store =
            StubTraceStore { traces: vec![sample_trace("t1", now), sample_trace("t2", now)], fail_publish: true };
        let dataset_store = StubDatasetStore {
            rows: vec![sample_dataset_row("case-1", "test"), sample_dataset_row("case-2", "train")],
        };
        let llm: Arc<dyn LlmClient + Send + Sync> =
            Arc::new(StubLlmClient { generate_response: longer_variant_response(), longer_reply_marker: "LONGER" });
        let scorers: Arc<Vec<Box<dyn Scorer + Send + Sync>>> = Arc::new(vec![Box::new(LengthHeuristicScorer)]);
        let config = base_config();
        let deps = WorkerDeps {
            trace_store: &trace_store,
            dataset_store: &dataset_store,
            llm,
            scorers,
            state_store: &state_store,
            artifact_store: &artifact_store,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        let mut cache = RunTraceCache::default();
        let mut state = seed_state(now);

        for expected_phase in [
            Phase::Polling,
            Phase::SnapshotBuilt,
            Phase::StrategiesGenerated,
            Phase::EvalTest,
            Phase::EvalTrain,
            Phase::Promoted,
        ] {
            let (outcome, next) = run_tick(&state, &config, &mut cache, &deps, now).await;
            assert!(matches!(outcome, TickOutcome::Progressed { phase } if phase == expected_phase));
            state = next;
        }

        assert_eq!(state.promoted_prompt_hash, PromptHash::new("seed-hash"));
        assert_eq!(state.promoted_prompt_text, "baseline system prompt");

        let run_dir = state.current_run_dir.clone().expect("promoted state keeps its run dir");
        let decision =
            artifact_store.read_promotion_decision(&run_dir).expect("read decision").expect("decision written");
        assert!(!decision.promoted);
        assert!(decision.reason.starts_with("publish_failed:"));

        let status = artifact_store.read_status().expect("read status").expect("status written");
        assert!(!status.promoted);
        assert_eq!(status.winner.as_deref(), Some("longer-variant"));
    }

    #[tokio::test]
    async fn crash_between_snapshot_and_strategies_restarts_the_poll() {
        let now = Timestamp::from_unix_millis(1_000);
        let state_store = InMemoryLoopStateStore::default();
        let artifact_store = InMemoryArtifactStore::default();
        let trace_store = StubTraceStore { traces: vec![], fail_publish: false };
        let dataset_store = StubDatasetStore { rows: vec![] };
        let llm: Arc<dyn LlmClient + Send + Sync> =
            Arc::new(StubLlmClient { generate_response: Value::Null, longer_reply_marker: "LONGER" });
        let scorers: Arc<Vec<Box<dyn Scorer + Send + Sync>>> = Arc::new(vec![Box::new(LengthHeuristicScorer)]);
        let config = base_config();
        let deps = WorkerDeps {
            trace_store: &trace_store,
            dataset_store: &dataset_store,
            llm,
            scorers,
            state_store: &state_store,
            artifact_store: &artifact_store,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        let mut cache = RunTraceCache::default();
        let mut state = seed_state(now);
        state.current_run_dir = Some(RunDirId::from("orphaned-run"));
        state.current_phase = Phase::SnapshotBuilt;

        let (outcome, state) = run_tick(&state, &config, &mut cache, &deps, now).await;
        assert!(matches!(outcome, TickOutcome::Progressed { phase: Phase::Polling }));
        assert_eq!(state.current_phase, Phase::Polling);

        let status = artifact_store.read_status().expect("read status").expect("status written");
        assert_eq!(status.reason.as_deref(), Some("lost trace cache, restarting poll"));
    }
}
