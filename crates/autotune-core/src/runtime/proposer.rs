// autotune-core/src/runtime/proposer.rs
// ============================================================================
// Module: Strategy Proposer
// Description: Turns a trace snapshot into findings and candidate prompts.
// Purpose: Ask the generator model for distinct, hash-unique prompt variants.
// Dependencies: crate::core::data, crate::core::hashing, crate::interfaces
// ============================================================================

//! ## Overview
//! For each trace in the snapshot, a judge call summarises what worked and
//! what failed. Summaries are aggregated into a handful of findings, which
//! condition a generator call for `N` distinct prompt variants. Variants
//! that collide (by content hash) with the current prompt or with each other
//! are rejected and regenerated up to a retry budget.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::core::data::FindingsAndVariants;
use crate::core::data::PromptVariant;
use crate::core::data::Trace;
use crate::core::hashing::HashAlgorithm;
use crate::core::hashing::hash_canonical_json;
use crate::core::identifiers::VariantName;
use crate::interfaces::GenerateRequest;
use crate::interfaces::LlmClient;
use crate::interfaces::LlmError;

/// Default number of variants to propose per cycle.
pub const DEFAULT_VARIANT_COUNT: usize = 2;
/// Default retry budget for rejecting hash-colliding variants.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Version tag for the per-trace judge prompt, recorded for audit.
pub const JUDGE_PROMPT_VERSION: &str = "autotune.trace_summary.v1";

/// Expected shape of a per-trace judge response.
#[derive(Debug, Clone, Deserialize)]
struct TraceSummary {
    #[serde(default)]
    #[allow(dead_code, reason = "parsed for schema validation; not yet folded into findings text")]
    worked: Vec<String>,
    #[serde(default)]
    failed: Vec<String>,
    #[allow(dead_code, reason = "recorded by the judge but not yet surfaced in findings text")]
    fix_snippet: Option<String>,
}

/// Expected shape of one generated variant inside the generator response.
#[derive(Debug, Clone, Deserialize)]
struct GeneratedVariant {
    name: String,
    text: String,
    rationale: String,
}

/// Errors raised while proposing new prompt variants.
#[derive(Debug, thiserror::Error)]
pub enum ProposerError {
    /// The LLM backend failed.
    #[error(transparent)]
    Llm(#[from] LlmError),
    /// The generator's response did not parse into the expected shape.
    #[error("generator response did not match the expected schema: {0}")]
    MalformedGeneratorResponse(String),
}

/// Proposes up to `variant_count` distinct prompt variants from a snapshot.
///
/// # Errors
///
/// Returns [`ProposerError`] when the judge or generator backend fails
/// outright (network/rate-limit); malformed per-trace judge JSON degrades to
/// an empty summary rather than erroring, matching the scorer suite's
/// malformed-output policy.
pub fn propose(
    llm: &dyn LlmClient,
    traces: &[Trace],
    current_prompt: &str,
    parent_hash: &crate::core::identifiers::PromptHash,
    variant_count: usize,
    seed: Option<u64>,
    temperature: f64,
) -> Result<FindingsAndVariants, ProposerError> {
    let mut failed_counts: BTreeMap<String, u32> = BTreeMap::new();

    for trace in traces {
        let input = serde_json::json!({
            "turns": trace.turns,
            "metrics": trace.metrics,
        });
        match llm.judge(JUDGE_PROMPT_VERSION, &input) {
            Ok(value) => {
                if let Ok(summary) = serde_json::from_value::<TraceSummary>(value) {
                    // `worked` entries are judged but not currently folded
                    // into findings text, which names failures only.
                    for item in summary.failed {
                        *failed_counts.entry(item).or_insert(0) += 1;
                    }
                }
                // Malformed JSON for one trace's summary is silently skipped
                // here; it does not block proposal the way a malformed
                // scorer result is tracked during evaluation, since findings
                // are advisory text, not a gating metric.
            }
            Err(err) => return Err(ProposerError::Llm(err)),
        }
    }

    let mut findings = most_common_first(&failed_counts);
    findings.truncate(6);
    if findings.is_empty() {
        findings.push("no recurring failure pattern found in this snapshot".to_string());
    }

    let mut variants: Vec<PromptVariant> = Vec::new();
    let mut seen_hashes = std::collections::BTreeSet::new();
    let current_hash = hash_canonical_json(HashAlgorithm::Sha256, &Value::String(current_prompt.to_string()))
        .map_err(|err| ProposerError::MalformedGeneratorResponse(err.to_string()))?;
    seen_hashes.insert(current_hash.value.clone());

    let mut effective_seed = seed;
    let mut effective_temperature = temperature;
    let mut attempts = 0u32;

    while variants.len() < variant_count && attempts <= DEFAULT_MAX_RETRIES {
        attempts += 1;
        let request = GenerateRequest {
            current_prompt,
            findings: &findings,
            variant_count: variant_count - variants.len(),
            seed,
            temperature,
        };
        let (response, effective) = llm.generate(&request)?;
        effective_seed = effective.seed;
        effective_temperature = effective.temperature;

        let generated: Vec<GeneratedVariant> = serde_json::from_value(response)
            .map_err(|err| ProposerError::MalformedGeneratorResponse(err.to_string()))?;

        for candidate in generated {
            if variants.len() >= variant_count {
                break;
            }
            let hash = hash_canonical_json(HashAlgorithm::Sha256, &Value::String(candidate.text.clone()))
                .map_err(|err| ProposerError::MalformedGeneratorResponse(err.to_string()))?;
            if seen_hashes.contains(&hash.value) {
                continue;
            }
            seen_hashes.insert(hash.value.clone());
            variants.push(PromptVariant {
                name: VariantName::from(candidate.name),
                text: candidate.text,
                rationale: candidate.rationale,
                parent_hash: parent_hash.clone(),
                hash: crate::core::identifiers::PromptHash::from(hash.value),
            });
        }
    }

    if variants.len() < variant_count {
        findings.push(format!(
            "why: only {} of {} requested variants were distinct after {} attempts",
            variants.len(),
            variant_count,
            attempts
        ));
    }

    Ok(FindingsAndVariants {
        findings,
        variants,
        effective_seed,
        effective_temperature,
    })
}

/// Sorts finding labels by descending frequency, breaking ties alphabetically.
fn most_common_first(counts: &BTreeMap<String, u32>) -> Vec<String> {
    let mut entries: Vec<(&String, &u32)> = counts.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    entries.into_iter().map(|(text, _)| text.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::AgentTurn;
    use crate::interfaces::EffectiveGenerationParams;

    struct StubLlm {
        judge_response: Value,
        generate_response: Value,
    }

    impl LlmClient for StubLlm {
        fn judge(&self, _version: &str, _input: &Value) -> Result<Value, LlmError> {
            Ok(self.judge_response.clone())
        }

        fn generate(
            &self,
            _request: &GenerateRequest<'_>,
        ) -> Result<(Value, EffectiveGenerationParams), LlmError> {
            Ok((
                self.generate_response.clone(),
                EffectiveGenerationParams { seed: Some(42), temperature: 0.7 },
            ))
        }

        fn simulate_turn(&self, _prompt: &str, _history: &[Value]) -> Result<AgentTurn, LlmError> {
            Ok(AgentTurn { text: String::new(), tool_calls: vec![], end_of_call: true })
        }
    }

    #[test]
    fn rejects_variant_equal_to_current_prompt() {
        let llm = StubLlm {
            judge_response: serde_json::json!({"worked": [], "failed": ["escalated too slowly"]}),
            generate_response: serde_json::json!([
                {"name": "v1", "text": "same as current", "rationale": "r1"},
                {"name": "v2", "text": "different text", "rationale": "r2"},
            ]),
        };
        let parent_hash = crate::core::identifiers::PromptHash::from("parent");
        let result = propose(&llm, &[], "same as current", &parent_hash, 2, Some(1), 0.8).expect("propose");
        assert_eq!(result.variants.len(), 1);
        assert_eq!(result.variants[0].text, "different text");
    }

    #[test]
    fn aggregates_failures_most_common_first() {
        let llm = StubLlm {
            judge_response: serde_json::json!({"worked": [], "failed": ["a"]}),
            generate_response: serde_json::json!([
                {"name": "v1", "text": "x", "rationale": "r"},
            ]),
        };
        let trace = Trace {
            trace_id: crate::core::identifiers::TraceId::from("t1"),
            experiment_id: crate::core::identifiers::ExperimentId::from("exp-1"),
            created_at: crate::core::time::Timestamp::from_unix_millis(0),
            input_case_id: None,
            turns: vec![crate::core::data::Turn {
                role: crate::core::data::TurnRole::Assistant,
                text: "ok".to_string(),
            }],
            tool_calls: vec![],
            metrics: Default::default(),
            prompt_hash: crate::core::identifiers::PromptHash::from("current"),
            needs_emergency: None,
        };
        let parent_hash = crate::core::identifiers::PromptHash::from("parent");
        let result = propose(&llm, &[trace], "current", &parent_hash, 1, None, 0.5).expect("propose");
        assert_eq!(result.findings.first().map(String::as_str), Some("a"));
    }
}
