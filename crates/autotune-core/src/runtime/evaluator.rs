// autotune-core/src/runtime/evaluator.rs
// ============================================================================
// Module: Evaluator
// Description: Simulates conversations for every case in a split and scores
//              them against the scorer suite.
// Purpose: Produce one VariantRun per (prompt, dataset split) pair.
// Dependencies: tokio, crate::core::data, crate::interfaces, crate::runtime::scorer
// ============================================================================

//! ## Overview
//! Each case is independent, so cases within a split run concurrently up to
//! a bounded pool (spec §4.5/§5 default 8). Work is dispatched onto Tokio's
//! blocking thread pool because the `LlmClient` trait is a synchronous,
//! blocking interface (matching the rest of this codebase's HTTP clients);
//! a semaphore permit is acquired before a case's blocking task is spawned,
//! so at most `parallelism` blocking calls are ever in flight at once.
//! Results are gathered into a case-id-sorted map before aggregation so
//! output never depends on completion order. A case not yet dispatched when
//! cancellation is requested is fail-scored rather than started; a case
//! already running is left to finish.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::core::data::DatasetRow;
use crate::core::data::NOT_REACHED;
use crate::core::data::Split;
use crate::core::data::Turn;
use crate::core::data::TurnRole;
use crate::core::data::VariantRun;
use crate::core::identifiers::CaseId;
use crate::core::identifiers::ExperimentRef;
use crate::core::identifiers::VariantName;
use crate::core::time::Timestamp;
use crate::interfaces::LlmClient;
use crate::interfaces::LlmError;
use crate::runtime::scorer::ScoreOutcome;
use crate::runtime::scorer::Scorer;

/// Default bound on concurrently-evaluated cases.
pub const DEFAULT_PARALLELISM: usize = 8;
/// Default per-case turn budget.
pub const DEFAULT_TURN_LIMIT: u32 = 20;
/// Default per-case wall-clock deadline.
pub const DEFAULT_CASE_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors raised while evaluating a prompt against a split.
#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    /// The LLM backend failed outright for every case (not a per-case
    /// timeout, which is scored rather than propagated).
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Runs one simulated conversation for a case, alternating turns until
/// satisfaction, the turn limit, or an end-of-call marker (spec §4.5 step 2).
fn run_case_conversation(llm: &dyn LlmClient, prompt_text: &str, row: &DatasetRow, turn_limit: u32) -> Vec<Turn> {
    let mut history: Vec<Value> = Vec::new();
    let mut transcript = vec![Turn { role: TurnRole::User, text: row.input.text.clone() }];
    history.push(serde_json::json!({"role": "user", "text": row.input.text}));

    for _ in 0..turn_limit {
        match llm.simulate_turn(prompt_text, &history) {
            Ok(turn) => {
                transcript.push(Turn { role: TurnRole::Assistant, text: turn.text.clone() });
                history.push(serde_json::json!({"role": "assistant", "text": turn.text}));
                if turn.end_of_call {
                    break;
                }
            }
            Err(_) => break,
        }
    }

    transcript
}

/// Evaluates `prompt_text` against every row in `rows`, scoring each case
/// with `scorers` under a bounded wall-clock `case_timeout`, with at most
/// `parallelism` cases in flight at once.
///
/// # Errors
///
/// Returns [`EvaluatorError`] only when the evaluation cannot proceed at
/// all; individual case failures and timeouts are scored as "not reached"
/// rather than propagated (spec §4.5 cancellation/timeout policy).
#[allow(clippy::too_many_arguments, reason = "mirrors the single linear evaluate() contract from the specification")]
pub async fn evaluate(
    llm: Arc<dyn LlmClient + Send + Sync>,
    prompt_text: Arc<str>,
    variant_name: VariantName,
    split: Split,
    dataset_ref: String,
    rows: Vec<DatasetRow>,
    scorers: Arc<Vec<Box<dyn Scorer + Send + Sync>>>,
    turn_limit: u32,
    parallelism: usize,
    case_timeout: Duration,
    experiment_ref: ExperimentRef,
    started_at: Timestamp,
    finished_at_fn: impl Fn() -> Timestamp,
    cancel: Arc<AtomicBool>,
) -> Result<VariantRun, EvaluatorError> {
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut join_set: JoinSet<(CaseId, Option<(BTreeMap<String, f64>, u32, u32)>)> = JoinSet::new();
    let mut skipped: Vec<CaseId> = Vec::new();

    for row in rows {
        if cancel.load(Ordering::Relaxed) {
            skipped.push(row.case_id.clone());
            continue;
        }
        let semaphore = Arc::clone(&semaphore);
        let llm = Arc::clone(&llm);
        let scorers = Arc::clone(&scorers);
        let prompt = Arc::clone(&prompt_text);
        let case_id = row.case_id.clone();
        join_set.spawn(async move {
            // Hold the permit across the blocking call so at most
            // `parallelism` cases run concurrently; a case already holding
            // one is allowed to finish even if cancellation arrives next.
            let Ok(permit) = semaphore.acquire_owned().await else {
                return (case_id, None);
            };
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let transcript = run_case_conversation(llm.as_ref(), &prompt, &row, turn_limit);
                let mut scores = BTreeMap::new();
                let mut malformed = 0u32;
                for scorer in scorers.iter() {
                    let outcome = scorer.score(&transcript, row.expected.as_ref());
                    if outcome == ScoreOutcome::Malformed {
                        malformed += 1;
                    }
                    scores.insert(scorer.name().to_string(), outcome.as_metric());
                }
                let turn_count = u32::try_from(transcript.len()).unwrap_or(u32::MAX);
                (scores, turn_count, malformed)
            });
            match tokio::time::timeout(case_timeout, handle).await {
                Ok(Ok(result)) => (case_id, Some(result)),
                // Wall-clock deadline exceeded or the blocking task panicked:
                // fail-score the case rather than aborting the run.
                Ok(Err(_)) | Err(_) => (case_id, None),
            }
        });
    }

    let mut per_case: BTreeMap<CaseId, BTreeMap<String, f64>> = BTreeMap::new();
    let mut turn_counts: Vec<u32> = Vec::new();
    let mut malformed_judge_count = 0u32;

    while let Some(result) = join_set.join_next().await {
        if let Ok((case_id, outcome)) = result {
            match outcome {
                Some((scores, turn_count, malformed)) => {
                    turn_counts.push(turn_count);
                    malformed_judge_count += malformed;
                    per_case.insert(case_id, scores);
                }
                None => {
                    // Wall-clock timeout or panic: fail-score every configured
                    // metric. Not counted as malformed judge output, which is
                    // a distinct failure mode tracked at the scorer level.
                    let fail_scores: BTreeMap<String, f64> =
                        scorers.iter().map(|scorer| (scorer.name().to_string(), NOT_REACHED)).collect();
                    per_case.insert(case_id, fail_scores);
                }
            }
        }
    }

    for case_id in skipped {
        let fail_scores: BTreeMap<String, f64> =
            scorers.iter().map(|scorer| (scorer.name().to_string(), NOT_REACHED)).collect();
        per_case.insert(case_id, fail_scores);
    }

    let mut aggregate: BTreeMap<String, f64> = BTreeMap::new();
    let metric_names: std::collections::BTreeSet<String> =
        per_case.values().flat_map(BTreeMap::keys).cloned().collect();
    for metric_name in metric_names {
        let values: Vec<f64> = per_case
            .values()
            .filter_map(|scores| scores.get(&metric_name).copied())
            .collect();
        let reached: Vec<f64> =
            values.iter().copied().filter(|value| (*value - NOT_REACHED).abs() > f64::EPSILON).collect();
        if reached.is_empty() {
            aggregate.insert(metric_name, NOT_REACHED);
        } else {
            #[allow(clippy::cast_precision_loss, reason = "case counts are far below f64's exact-integer range")]
            let mean = reached.iter().sum::<f64>() / reached.len() as f64;
            aggregate.insert(metric_name, mean);
        }
    }

    #[allow(clippy::cast_precision_loss, reason = "turn counts are far below f64's exact-integer range")]
    let avg_turn_count = if turn_counts.is_empty() {
        0.0
    } else {
        turn_counts.iter().copied().sum::<u32>() as f64 / turn_counts.len() as f64
    };

    Ok(VariantRun {
        variant_name,
        split,
        dataset_ref,
        per_case,
        metrics: aggregate,
        avg_turn_count,
        malformed_judge_count,
        experiment_ref,
        started_at,
        finished_at: finished_at_fn(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::SimulatedUserProfile;
    use crate::interfaces::AgentTurn;
    use crate::interfaces::EffectiveGenerationParams;
    use crate::interfaces::GenerateRequest;
    use crate::runtime::scorer::LengthHeuristicScorer;

    struct StubLlm;

    impl LlmClient for StubLlm {
        fn judge(&self, _version: &str, _input: &Value) -> Result<Value, LlmError> {
            Ok(Value::Null)
        }

        fn generate(
            &self,
            _request: &GenerateRequest<'_>,
        ) -> Result<(Value, EffectiveGenerationParams), LlmError> {
            Ok((Value::Null, EffectiveGenerationParams { seed: None, temperature: 0.0 }))
        }

        fn simulate_turn(&self, _prompt: &str, history: &[Value]) -> Result<AgentTurn, LlmError> {
            let end_of_call = history.len() > 1;
            Ok(AgentTurn { text: "ok".to_string(), tool_calls: vec![], end_of_call })
        }
    }

    fn sample_row(case_id: &str) -> DatasetRow {
        DatasetRow {
            case_id: CaseId::from(case_id),
            input: SimulatedUserProfile {
                text: "help".to_string(),
                attitude: None,
                tone: None,
                cooperativeness: None,
                verbosity: None,
                patience: None,
                goal: None,
                needs_emergency: None,
            },
            expected: None,
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn aggregates_case_results_sorted_by_case_id_regardless_of_completion_order() {
        let llm: Arc<dyn LlmClient + Send + Sync> = Arc::new(StubLlm);
        let scorers: Arc<Vec<Box<dyn Scorer + Send + Sync>>> = Arc::new(vec![Box::new(LengthHeuristicScorer)]);
        let rows = vec![sample_row("c2"), sample_row("c1")];
        let run = evaluate(
            llm,
            Arc::from("you are a helpful agent"),
            VariantName::from("baseline"),
            Split::Test,
            "ds@v1".to_string(),
            rows,
            scorers,
            DEFAULT_TURN_LIMIT,
            DEFAULT_PARALLELISM,
            DEFAULT_CASE_TIMEOUT,
            ExperimentRef::from("exp-ref"),
            Timestamp::from_unix_millis(0),
            || Timestamp::from_unix_millis(1),
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .expect("evaluate");

        assert_eq!(run.per_case.len(), 2);
        assert!(run.per_case.contains_key(&CaseId::from("c1")));
        assert!(run.per_case.contains_key(&CaseId::from("c2")));
    }

    #[tokio::test]
    async fn cancellation_fail_scores_cases_not_yet_dispatched() {
        let llm: Arc<dyn LlmClient + Send + Sync> = Arc::new(StubLlm);
        let scorers: Arc<Vec<Box<dyn Scorer + Send + Sync>>> = Arc::new(vec![Box::new(LengthHeuristicScorer)]);
        let rows = vec![sample_row("c1")];
        let cancel = Arc::new(AtomicBool::new(true));
        let run = evaluate(
            llm,
            Arc::from("you are a helpful agent"),
            VariantName::from("baseline"),
            Split::Test,
            "ds@v1".to_string(),
            rows,
            scorers,
            DEFAULT_TURN_LIMIT,
            DEFAULT_PARALLELISM,
            DEFAULT_CASE_TIMEOUT,
            ExperimentRef::from("exp-ref"),
            Timestamp::from_unix_millis(0),
            || Timestamp::from_unix_millis(1),
            cancel,
        )
        .await
        .expect("evaluate");

        let scores = run.per_case.get(&CaseId::from("c1")).expect("case present");
        assert_eq!(scores.get(LengthHeuristicScorer.name()), Some(&NOT_REACHED));
    }
}
