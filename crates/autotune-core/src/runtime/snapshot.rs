// autotune-core/src/runtime/snapshot.rs
// ============================================================================
// Module: Trace Snapshot Builder
// Description: Filters, dedupes, and splits newly pulled traces.
// Purpose: Freeze the exact set of traces one run will learn from.
// Dependencies: crate::core::data, crate::core::identifiers, crate::core::time
// ============================================================================

//! ## Overview
//! Given the traces fetched since the last cursor and the dataset currently
//! bound to this deployment, the snapshot builder drops unusable traces,
//! removes duplicates, and joins each remaining trace to a dataset row by
//! `input_case_id`. Traces that don't join form a diagnostic-only "ad-hoc"
//! split (spec Open Question (b)): they are counted but never evaluated or
//! promoted on.

use std::collections::BTreeSet;

use crate::core::data::SourceTraces;
use crate::core::data::Trace;
use crate::core::identifiers::CaseId;
use crate::core::identifiers::TraceId;

/// Outcome of building one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// The exact set of traces used, ready to be persisted as
    /// `source_traces.json`.
    pub source_traces: SourceTraces,
    /// Traces that joined to a dataset row, kept for the Evaluator/Proposer.
    pub joined_traces: Vec<Trace>,
}

impl Snapshot {
    /// Returns true when there are too few new traces to start a cycle.
    #[must_use]
    pub fn below_min_batch(&self, min_batch: u32) -> bool {
        self.source_traces.new_trace_count < min_batch
    }
}

/// Builds a snapshot from newly fetched traces.
///
/// `known_case_ids` is the set of case ids present in the currently bound
/// dataset; a trace joins when its `input_case_id` is `Some` and present in
/// this set.
#[must_use]
pub fn build_snapshot(traces: Vec<Trace>, known_case_ids: &BTreeSet<CaseId>) -> Snapshot {
    let mut seen: BTreeSet<TraceId> = BTreeSet::new();
    let mut joined: Vec<Trace> = Vec::new();
    let mut joined_ids: Vec<TraceId> = Vec::new();
    let mut ad_hoc_ids: Vec<TraceId> = Vec::new();

    for trace in traces {
        if !trace.has_required_fields() {
            continue;
        }
        if !seen.insert(trace.trace_id.clone()) {
            continue;
        }
        let is_joined = trace
            .input_case_id
            .as_ref()
            .is_some_and(|case_id| known_case_ids.contains(case_id));
        if is_joined {
            joined_ids.push(trace.trace_id.clone());
            joined.push(trace);
        } else {
            ad_hoc_ids.push(trace.trace_id.clone());
        }
    }

    let new_trace_count = u32::try_from(joined_ids.len() + ad_hoc_ids.len()).unwrap_or(u32::MAX);

    Snapshot {
        source_traces: SourceTraces {
            joined: joined_ids,
            ad_hoc: ad_hoc_ids,
            new_trace_count,
        },
        joined_traces: joined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::ToolCallTrace;
    use crate::core::data::Turn;
    use crate::core::data::TurnRole;
    use crate::core::identifiers::ExperimentId;
    use crate::core::identifiers::PromptHash;
    use crate::core::time::Timestamp;

    fn sample_trace(id: &str, case_id: Option<&str>) -> Trace {
        let _ = ToolCallTrace {
            name: "noop".to_string(),
            arguments: serde_json::json!({}),
            result: serde_json::json!({}),
        };
        Trace {
            trace_id: TraceId::from(id),
            experiment_id: ExperimentId::from("exp-1"),
            created_at: Timestamp::from_unix_millis(10),
            input_case_id: case_id.map(CaseId::from),
            turns: vec![Turn { role: TurnRole::User, text: "hi".to_string() }],
            tool_calls: vec![],
            metrics: Default::default(),
            prompt_hash: PromptHash::from("hash-1"),
            needs_emergency: None,
        }
    }

    #[test]
    fn dedupes_by_trace_id() {
        let traces = vec![sample_trace("t1", Some("c1")), sample_trace("t1", Some("c1"))];
        let mut known = BTreeSet::new();
        known.insert(CaseId::from("c1"));
        let snapshot = build_snapshot(traces, &known);
        assert_eq!(snapshot.source_traces.new_trace_count, 1);
        assert_eq!(snapshot.joined_traces.len(), 1);
    }

    #[test]
    fn unjoined_traces_are_ad_hoc_and_excluded_from_evaluation() {
        let traces = vec![sample_trace("t1", Some("unknown-case"))];
        let known = BTreeSet::new();
        let snapshot = build_snapshot(traces, &known);
        assert_eq!(snapshot.source_traces.ad_hoc.len(), 1);
        assert!(snapshot.joined_traces.is_empty());
    }

    #[test]
    fn drops_traces_missing_required_fields() {
        let mut trace = sample_trace("t1", Some("c1"));
        trace.turns.clear();
        let known = BTreeSet::new();
        let snapshot = build_snapshot(vec![trace], &known);
        assert_eq!(snapshot.source_traces.new_trace_count, 0);
    }

    #[test]
    fn below_min_batch_signals_waiting() {
        let traces = vec![sample_trace("t1", None), sample_trace("t2", None)];
        let known = BTreeSet::new();
        let snapshot = build_snapshot(traces, &known);
        assert!(snapshot.below_min_batch(5));
        assert!(!snapshot.below_min_batch(1));
    }
}
