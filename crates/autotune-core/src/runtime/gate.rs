// autotune-core/src/runtime/gate.rs
// ============================================================================
// Module: Promotion Gate
// Description: The strict statistical/contract gate deciding a winner.
// Purpose: Decide, deterministically and auditably, whether a candidate
//          prompt replaces the live baseline.
// Dependencies: crate::core::data
// ============================================================================

//! ## Overview
//! The gate never mutates state itself; it is a pure decision function over
//! already-computed `VariantRun`s. The worker is responsible for persisting
//! the resulting `PromotionDecision` and, on promotion, publishing the new
//! prompt.

use crate::core::data::PromotionThresholds;
use crate::core::data::VariantName;
use crate::core::data::VariantRun;

/// The candidate selected by the test-split gate, with the deltas that
/// justified the selection.
#[derive(Debug, Clone, PartialEq)]
pub struct TestWinner {
    /// Name of the selected variant.
    pub variant_name: VariantName,
    /// Primary-metric improvement over baseline.
    pub delta_primary: f64,
    /// Secondary-metric delta over baseline (negative means regression).
    pub delta_secondary: f64,
}

/// Returns the metric value for `metric_name`, or `0.0` if absent.
fn metric(run: &VariantRun, metric_name: &str) -> f64 {
    run.metrics.get(metric_name).copied().unwrap_or(0.0)
}

/// Returns true when `candidate` passes the test-split condition against
/// `baseline` under `thresholds` (spec §4.7 step 1).
fn passes_test_condition(
    baseline: &VariantRun,
    candidate: &VariantRun,
    primary_metric: &str,
    secondary_metric: &str,
    thresholds: &PromotionThresholds,
) -> bool {
    let delta_primary = metric(candidate, primary_metric) - metric(baseline, primary_metric);
    let delta_secondary = metric(candidate, secondary_metric) - metric(baseline, secondary_metric);
    delta_primary >= thresholds.min_delta_primary && delta_secondary >= -thresholds.max_regression_secondary
}

/// Selects the best test-split winner among `candidates`, or `None` when no
/// candidate passes the test condition, or all passing candidates tie all
/// the way through the tie-break chain (spec §4.6, §4.7 step 1).
///
/// Tie-break order: primary metric (higher wins), then secondary metric
/// (higher wins), then `turns_to_calm` (lower wins). Exhausting the chain
/// with a tie means no winner; the baseline is retained.
#[must_use]
pub fn select_test_winner(
    baseline: &VariantRun,
    candidates: &[VariantRun],
    primary_metric: &str,
    secondary_metric: &str,
    thresholds: &PromotionThresholds,
) -> Option<TestWinner> {
    let mut passing: Vec<&VariantRun> = candidates
        .iter()
        .filter(|candidate| {
            passes_test_condition(baseline, candidate, primary_metric, secondary_metric, thresholds)
        })
        .collect();

    if passing.is_empty() {
        return None;
    }

    passing.sort_by(|a, b| {
        metric(b, primary_metric)
            .total_cmp(&metric(a, primary_metric))
            .then_with(|| metric(b, secondary_metric).total_cmp(&metric(a, secondary_metric)))
            .then_with(|| metric(a, "turns_to_calm").total_cmp(&metric(b, "turns_to_calm")))
    });

    let best = passing[0];
    let runner_up = passing.get(1);
    if let Some(runner_up) = runner_up {
        let tied = (metric(best, primary_metric) - metric(runner_up, primary_metric)).abs() < f64::EPSILON
            && (metric(best, secondary_metric) - metric(runner_up, secondary_metric)).abs() < f64::EPSILON
            && (metric(best, "turns_to_calm") - metric(runner_up, "turns_to_calm")).abs() < f64::EPSILON;
        if tied {
            return None;
        }
    }

    Some(TestWinner {
        variant_name: best.variant_name.clone(),
        delta_primary: metric(best, primary_metric) - metric(baseline, primary_metric),
        delta_secondary: metric(best, secondary_metric) - metric(baseline, secondary_metric),
    })
}

/// Returns true when the test winner still beats the baseline on the train
/// split, under the (possibly looser) train threshold (spec §4.7 step 2).
#[must_use]
pub fn passes_train_gate(
    baseline_train: &VariantRun,
    winner_train: &VariantRun,
    primary_metric: &str,
    thresholds: &PromotionThresholds,
) -> bool {
    metric(winner_train, primary_metric) - metric(baseline_train, primary_metric)
        >= thresholds.min_delta_primary_train
}
