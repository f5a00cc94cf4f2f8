// autotune-status/src/lib.rs
// ============================================================================
// Crate: Autotune Status
// Description: Read-only HTTP status server merging LoopState and the
//              latest run's artifacts for a dashboard.
// Purpose: Give operators visibility into the worker without giving them a
//          write path into its state.
// Dependencies: autotune-core, axum, serde, serde_json, thiserror, tokio
// ============================================================================

//! ## Overview
//! One route, `GET /status`, merges `status.json` with the latest run's
//! `source_traces.json` (count only), `findings_and_variants.json`, and
//! `promotion_decision.json` (spec §4.9), and stamps the response with
//! `server_time`. The handler only ever calls [`autotune_core::ArtifactStore`]
//! read methods; nothing in this crate can mutate `LoopState`.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use autotune_core::ArtifactStore;
use autotune_core::Phase;
use autotune_core::PromotionDecision;
use autotune_core::PromptVariant;
use autotune_core::StoreError;
use autotune_core::Timestamp;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Serialize;

/// Errors raised starting or running the status server.
#[derive(Debug, thiserror::Error)]
pub enum StatusServerError {
    /// The bind address could not be parsed or bound.
    #[error("status server bind failed: {0}")]
    Bind(String),
    /// The server loop itself failed.
    #[error("status server transport error: {0}")]
    Transport(String),
}

/// The merged, dashboard-facing response body for `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    /// Current phase of the worker state machine.
    pub phase: Phase,
    /// Short human-readable reason for the current phase, if any.
    pub reason: Option<String>,
    /// When the underlying status snapshot was last written.
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
    /// Count of traces considered by the latest run, if one exists.
    pub source_trace_count: Option<u32>,
    /// Aggregated failure-mode findings from the latest run, if any.
    pub findings: Option<Vec<String>>,
    /// Proposed prompt variants from the latest run, if any.
    pub variants: Option<Vec<PromptVariant>>,
    /// Full promotion decision from the latest run, if one was recorded.
    pub promotion_decision: Option<PromotionDecision>,
    /// Wall-clock time the response was built, in unix milliseconds.
    pub server_time: Timestamp,
}

/// Shared state handed to the `GET /status` handler.
#[derive(Clone)]
struct AppState {
    /// Artifact store read for every request.
    artifact_store: Arc<dyn ArtifactStore + Send + Sync>,
}

/// Builds the merged status response by reading `status.json` and, if
/// present, the latest run directory's artifacts.
///
/// # Errors
///
/// Returns [`StoreError`] when a present artifact file fails its hash or
/// schema check.
fn build_status_response(artifact_store: &(dyn ArtifactStore + Send + Sync), now: Timestamp) -> Result<StatusResponse, StoreError> {
    let status = artifact_store.read_status()?;
    let mut response = match status {
        Some(snapshot) => StatusResponse {
            phase: snapshot.phase,
            reason: snapshot.reason,
            updated_at: snapshot.updated_at,
            new_trace_count: snapshot.new_trace_count,
            variants_summary: snapshot.variants_summary,
            variant_runs_summary: snapshot.variant_runs_summary,
            winner: snapshot.winner,
            promoted: snapshot.promoted,
            source_trace_count: None,
            findings: None,
            variants: None,
            promotion_decision: None,
            server_time: now,
        },
        None => StatusResponse {
            phase: Phase::Idle,
            reason: Some("no cycle has run yet".to_string()),
            updated_at: now,
            new_trace_count: 0,
            variants_summary: None,
            variant_runs_summary: None,
            winner: None,
            promoted: false,
            source_trace_count: None,
            findings: None,
            variants: None,
            promotion_decision: None,
            server_time: now,
        },
    };

    if let Some(run_dir) = artifact_store.latest_run_dir()? {
        if let Some(traces) = artifact_store.read_source_traces(&run_dir)? {
            response.source_trace_count = Some(traces.new_trace_count);
        }
        if let Some(findings_and_variants) = artifact_store.read_findings_and_variants(&run_dir)? {
            response.findings = Some(findings_and_variants.findings);
            response.variants = Some(findings_and_variants.variants);
        }
        response.promotion_decision = artifact_store.read_promotion_decision(&run_dir)?;
    }

    Ok(response)
}

/// Returns the current wall-clock time as a [`Timestamp`], clamping to
/// `i64::MAX` on overflow rather than panicking.
fn now() -> Timestamp {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let millis = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
    Timestamp::from_unix_millis(millis)
}

/// Handles `GET /status`.
async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    match build_status_response(state.artifact_store.as_ref(), now()) {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": err.to_string()}))).into_response(),
    }
}

/// Builds the `GET /status` router over the given artifact store.
#[must_use]
pub fn router(artifact_store: Arc<dyn ArtifactStore + Send + Sync>) -> Router {
    Router::new().route("/status", get(handle_status)).with_state(AppState { artifact_store })
}

/// Binds and serves the status API until the process is killed or the
/// listener fails.
///
/// # Errors
///
/// Returns [`StatusServerError::Bind`] when the address cannot be bound, or
/// [`StatusServerError::Transport`] when the server loop fails.
pub async fn serve(bind: SocketAddr, artifact_store: Arc<dyn ArtifactStore + Send + Sync>) -> Result<(), StatusServerError> {
    let app = router(artifact_store);
    let listener = tokio::net::TcpListener::bind(bind).await.map_err(|err| StatusServerError::Bind(err.to_string()))?;
    axum::serve(listener, app).await.map_err(|err| StatusServerError::Transport(err.to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use autotune_core::PromotionThresholds;
    use autotune_core::RunDirId;
    use autotune_core::Split;
    use autotune_core::StatusSnapshot;
    use autotune_core::VariantRun;
    use autotune_core::core::data::SourceTraces;
    use autotune_core::core::identifiers::ExperimentRef;
    use autotune_store::FilesystemArtifactStore;
    use tempfile::tempdir;

    use super::*;

    fn sample_variant_run(now: Timestamp) -> VariantRun {
        VariantRun {
            variant_name: autotune_core::VariantName::from("baseline"),
            split: Split::Test,
            dataset_ref: "calm-line@v1".to_string(),
            per_case: BTreeMap::new(),
            metrics: BTreeMap::new(),
            avg_turn_count: 4.0,
            malformed_judge_count: 0,
            experiment_ref: ExperimentRef::from("exp-1"),
            started_at: now,
            finished_at: now,
        }
    }

    #[tokio::test]
    async fn missing_status_yields_idle_placeholder() {
        let dir = tempdir().expect("tempdir");
        let store: Arc<dyn ArtifactStore + Send + Sync> =
            Arc::new(FilesystemArtifactStore::new(dir.path().join("runs"), dir.path().join("status.json")));
        let response = build_status_response(store.as_ref(), Timestamp::from_unix_millis(10)).expect("build");
        assert_eq!(response.phase, Phase::Idle);
        assert!(!response.promoted);
        assert!(response.promotion_decision.is_none());
    }

    #[tokio::test]
    async fn merges_status_with_latest_run_artifacts() {
        let dir = tempdir().expect("tempdir");
        let store = FilesystemArtifactStore::new(dir.path().join("runs"), dir.path().join("status.json"));
        let now = Timestamp::from_unix_millis(1_000);

        let run_dir: RunDirId = store.new_run_dir(now);
        store
            .write_source_traces(&run_dir, &SourceTraces { joined: vec![], ad_hoc: vec![], new_trace_count: 7 })
            .expect("write traces");

        let decision = PromotionDecision {
            promoted: true,
            winner: Some(autotune_core::VariantName::from("calmer-v2")),
            prior_hash: autotune_core::PromptHash::from("hash-a"),
            new_hash: autotune_core::PromptHash::from("hash-b"),
            test_baseline: sample_variant_run(now),
            test_winner: Some(sample_variant_run(now)),
            train_baseline: None,
            train_winner: None,
            thresholds: PromotionThresholds { min_delta_primary: 0.05, max_regression_secondary: 0.02, min_delta_primary_train: 0.03 },
            reason: "test and train gates both passed".to_string(),
        };
        store.write_promotion_decision(&run_dir, &decision).expect("write decision");

        let snapshot = StatusSnapshot::from_decision(
            &autotune_core::LoopState::initial(autotune_core::PromptHash::from("hash-b"), "new prompt text", now),
            &decision,
            &[],
        );
        store.write_status(&snapshot).expect("write status");

        let response = build_status_response(&store, Timestamp::from_unix_millis(2_000)).expect("build");
        assert_eq!(response.phase, Phase::Promoted);
        assert_eq!(response.source_trace_count, Some(7));
        assert_eq!(response.promotion_decision.map(|decision| decision.promoted), Some(true));
        assert_eq!(response.server_time, Timestamp::from_unix_millis(2_000));
    }
}
