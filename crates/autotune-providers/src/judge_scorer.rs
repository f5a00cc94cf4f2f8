// autotune-providers/src/judge_scorer.rs
// ============================================================================
// Module: Judge Scorer
// Description: LLM-judge-backed Scorer implementations.
// Purpose: Score qualities a regex or exact-match rule cannot express.
// Dependencies: autotune-core, serde_json
// ============================================================================

//! ## Overview
//! `calmer_end_state` and `emergency_services_when_needed` are the two
//! promotion-gate metrics that need judgment rather than pattern matching
//! (spec §4.6). Both share one implementation, [`JudgeScorer`], that differs
//! only in which judge prompt version it invokes.
//!
//! [`Scorer::score`] has no `Result` in its signature, so a judge call that
//! fails outright (network error, rate limit) is indistinguishable here from
//! one that returns unparseable output; both collapse to
//! [`ScoreOutcome::Malformed`] and are tallied in
//! `VariantRun::malformed_judge_count`. This mirrors the deterministic
//! scorers' constraint of never suspending mid-score, at the cost of losing
//! the transient/malformed distinction the worker makes for its own direct
//! `LlmClient` calls.

use std::sync::Arc;

use autotune_core::Scorer;
use autotune_core::core::data::Turn;
use autotune_core::core::data::TurnRole;
use autotune_core::interfaces::LlmClient;
use autotune_core::runtime::scorer::ScoreOutcome;
use serde_json::Value;

/// Judge prompt version for the "did the caller end the call calmer than
/// they started" metric.
pub const DEFAULT_CALMER_END_STATE_PROMPT_VERSION: &str = "autotune.judge.calmer_end_state.v1";
/// Judge prompt version for the "were emergency services correctly
/// dispatched exactly when needed" metric.
pub const DEFAULT_EMERGENCY_JUDGE_PROMPT_VERSION: &str = "autotune.judge.emergency_services_when_needed.v1";

/// A [`Scorer`] whose value comes from one judge-model round trip per case.
pub struct JudgeScorer {
    llm: Arc<dyn LlmClient + Send + Sync>,
    name: &'static str,
    judge_prompt_version: String,
}

impl JudgeScorer {
    /// Builds the "caller ends the call calmer than they started" judge
    /// scorer.
    #[must_use]
    pub fn calmer_end_state(llm: Arc<dyn LlmClient + Send + Sync>) -> Self {
        Self { llm, name: "calmer_end_state", judge_prompt_version: DEFAULT_CALMER_END_STATE_PROMPT_VERSION.to_string() }
    }

    /// Builds the "emergency services dispatched exactly when needed" judge
    /// scorer.
    #[must_use]
    pub fn emergency_services_when_needed(llm: Arc<dyn LlmClient + Send + Sync>) -> Self {
        Self {
            llm,
            name: "emergency_services_when_needed",
            judge_prompt_version: DEFAULT_EMERGENCY_JUDGE_PROMPT_VERSION.to_string(),
        }
    }

    /// Builds a scorer under a caller-supplied judge prompt version, for
    /// deployments that run their own judge prompt revisions.
    #[must_use]
    pub fn with_prompt_version(
        llm: Arc<dyn LlmClient + Send + Sync>,
        name: &'static str,
        judge_prompt_version: impl Into<String>,
    ) -> Self {
        Self { llm, name, judge_prompt_version: judge_prompt_version.into() }
    }
}

fn turn_role_label(role: TurnRole) -> &'static str {
    match role {
        TurnRole::User => "user",
        TurnRole::Assistant => "assistant",
    }
}

fn build_judge_input(transcript: &[Turn], expected: Option<&Value>) -> Value {
    let turns: Vec<Value> =
        transcript.iter().map(|turn| serde_json::json!({"role": turn_role_label(turn.role), "text": turn.text})).collect();
    serde_json::json!({
        "transcript": turns,
        "expected": expected,
    })
}

/// Parses a judge response of the form `{"score": <0..=1>}` or
/// `{"not_reached": true}`; anything else is malformed.
fn parse_judge_response(response: &Value) -> ScoreOutcome {
    if response.get("not_reached").and_then(Value::as_bool) == Some(true) {
        return ScoreOutcome::NotReached;
    }
    match response.get("score").and_then(Value::as_f64) {
        Some(score) if (0.0..=1.0).contains(&score) => ScoreOutcome::Value(score),
        _ => ScoreOutcome::Malformed,
    }
}

impl Scorer for JudgeScorer {
    fn name(&self) -> &str {
        self.name
    }

    fn score(&self, transcript: &[Turn], expected: Option<&Value>) -> ScoreOutcome {
        let input = build_judge_input(transcript, expected);
        match self.llm.judge(&self.judge_prompt_version, &input) {
            Ok(response) => parse_judge_response(&response),
            Err(_) => ScoreOutcome::Malformed,
        }
    }
}

#[cfg(test)]
mod tests {
    use autotune_core::interfaces::AgentTurn;
    use autotune_core::interfaces::EffectiveGenerationParams;
    use autotune_core::interfaces::GenerateRequest;
    use autotune_core::interfaces::LlmError;

    use super::*;

    struct StubLlm {
        response: Value,
    }

    impl LlmClient for StubLlm {
        fn judge(&self, _version: &str, _input: &Value) -> Result<Value, LlmError> {
            Ok(self.response.clone())
        }

        fn generate(&self, _request: &GenerateRequest<'_>) -> Result<(Value, EffectiveGenerationParams), LlmError> {
            Ok((Value::Null, EffectiveGenerationParams { seed: None, temperature: 0.0 }))
        }

        fn simulate_turn(&self, _prompt: &str, _history: &[Value]) -> Result<AgentTurn, LlmError> {
            Ok(AgentTurn { text: String::new(), tool_calls: vec![], end_of_call: true })
        }
    }

    struct FailingLlm;

    impl LlmClient for FailingLlm {
        fn judge(&self, _version: &str, _input: &Value) -> Result<Value, LlmError> {
            Err(LlmError::Transient("connection reset".to_string()))
        }

        fn generate(&self, _request: &GenerateRequest<'_>) -> Result<(Value, EffectiveGenerationParams), LlmError> {
            Err(LlmError::Transient("connection reset".to_string()))
        }

        fn simulate_turn(&self, _prompt: &str, _history: &[Value]) -> Result<AgentTurn, LlmError> {
            Err(LlmError::Transient("connection reset".to_string()))
        }
    }

    fn turn(role: TurnRole, text: &str) -> Turn {
        Turn { role, text: text.to_string() }
    }

    #[test]
    fn well_formed_score_passes_through() {
        let llm: Arc<dyn LlmClient + Send + Sync> = Arc::new(StubLlm { response: serde_json::json!({"score": 0.75}) });
        let scorer = JudgeScorer::calmer_end_state(llm);
        let transcript = vec![turn(TurnRole::User, "I'm panicking"), turn(TurnRole::Assistant, "let's breathe together")];
        assert_eq!(scorer.score(&transcript, None), ScoreOutcome::Value(0.75));
    }

    #[test]
    fn not_reached_flag_is_honoured() {
        let llm: Arc<dyn LlmClient + Send + Sync> = Arc::new(StubLlm { response: serde_json::json!({"not_reached": true}) });
        let scorer = JudgeScorer::emergency_services_when_needed(llm);
        assert_eq!(scorer.score(&[], None), ScoreOutcome::NotReached);
    }

    #[test]
    fn out_of_range_score_is_malformed() {
        let llm: Arc<dyn LlmClient + Send + Sync> = Arc::new(StubLlm { response: serde_json::json!({"score": 4.2}) });
        let scorer = JudgeScorer::calmer_end_state(llm);
        assert_eq!(scorer.score(&[], None), ScoreOutcome::Malformed);
    }

    #[test]
    fn non_schema_response_is_malformed() {
        let llm: Arc<dyn LlmClient + Send + Sync> = Arc::new(StubLlm { response: serde_json::json!({"unexpected": 1}) });
        let scorer = JudgeScorer::calmer_end_state(llm);
        assert_eq!(scorer.score(&[], None), ScoreOutcome::Malformed);
    }

    #[test]
    fn llm_failure_collapses_to_malformed() {
        let scorer = JudgeScorer::calmer_end_state(Arc::new(FailingLlm));
        assert_eq!(scorer.score(&[], None), ScoreOutcome::Malformed);
    }
}
