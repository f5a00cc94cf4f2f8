// autotune-cli/src/main.rs
// ============================================================================
// Module: Autotune CLI Entry Point
// Description: Boots the autotune worker loop and its read-only status API.
// Purpose: Wire autotune-config/-core/-providers/-store/-status into one
//          binary.
// Dependencies: autotune-config, autotune-core, autotune-providers,
//               autotune-status, autotune-store, clap, reqwest, thiserror,
//               tokio, tracing, tracing-subscriber
// ============================================================================

//! ## Overview
//! `autotune` loads its configuration from the process environment (spec
//! §6), builds the HTTP-backed trace/dataset/LLM providers and the
//! deterministic + judge scorer suite, then drives [`autotune_core::tick`]
//! on a fixed interval while a read-only status server runs alongside it.
//!
//! A tick never returns an error the caller has to interpret: every outcome
//! converges to [`TickOutcome::Progressed`]/[`TickOutcome::Waited`]/
//! [`TickOutcome::Errored`], so this binary's only job is to log each
//! outcome, reload the persisted [`LoopState`] for the next iteration, and
//! decide when a string of [`TickOutcome::Errored`] results means the
//! external backend is never coming back (see
//! [`MAX_CONSECUTIVE_ERRORED_TICKS`]).

use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use autotune_config::AutotuneConfig;
use autotune_core::ArtifactStore;
use autotune_core::LlmClient;
use autotune_core::LoopState;
use autotune_core::LoopStateStore;
use autotune_core::Phase;
use autotune_core::PromptHash;
use autotune_core::RunTraceCache;
use autotune_core::Scorer;
use autotune_core::TickOutcome;
use autotune_core::Timestamp;
use autotune_core::WorkerDeps;
use autotune_core::core::hashing::DEFAULT_HASH_ALGORITHM;
use autotune_core::hash_bytes;
use autotune_core::runtime::scorer::EmergencyMentionScorer;
use autotune_core::runtime::scorer::ExactMatchScorer;
use autotune_core::runtime::scorer::TurnsToDeEscalationScorer;
use autotune_core::runtime::scorer::TurnsToEmergencyScorer;
use autotune_providers::HttpDatasetStore;
use autotune_providers::HttpLlmClient;
use autotune_providers::HttpProviderConfig;
use autotune_providers::HttpTraceStore;
use autotune_providers::JudgeScorer;
use autotune_store::FileLoopStateStore;
use autotune_store::FilesystemArtifactStore;
use clap::Parser;
use reqwest::Url;
use tracing_subscriber::EnvFilter;

/// Exit status for a clean shutdown (spec §7).
const NORMAL_EXIT_CODE: u8 = 0;
/// Exit status for a configuration failure detected before any tick runs
/// (spec §7). Startup-time provider/bind wiring failures map here too, since
/// they are really configuration problems surfaced one layer later.
const CONFIG_ERROR_EXIT_CODE: u8 = 2;
/// Exit status once the worker gives up after too many consecutive
/// `TickOutcome::Errored` results (spec §7's "persistent external-dependency
/// failure").
const PERSISTENT_FAILURE_EXIT_CODE: u8 = 3;
/// Number of consecutive errored ticks tolerated before exiting with
/// [`PERSISTENT_FAILURE_EXIT_CODE`]. `tick` itself always converges to a
/// well-defined next state and never signals "stop retrying"; this binary
/// owns that decision.
const MAX_CONSECUTIVE_ERRORED_TICKS: u32 = 10;

/// Command-line flags overriding the environment-loaded configuration.
#[derive(Parser, Debug)]
#[command(name = "autotune", disable_help_subcommand = true, disable_version_flag = true)]
struct Cli {
    /// Override `AUTOTUNE_POLL_SECONDS` for this run.
    #[arg(long)]
    poll_seconds: Option<u64>,
    /// Force-enable publishing promoted prompts to the live trace store,
    /// overriding `AUTOTUNE_UPDATE_LIVE_PROMPT`.
    #[arg(long)]
    update_live_prompt: bool,
    /// Run exactly one tick and exit instead of polling forever.
    #[arg(long)]
    once: bool,
}

/// Failures wiring up providers and stores from validated configuration.
/// Distinct from [`autotune_config::ConfigError`] only in that it is raised
/// one layer later, after the environment has already parsed cleanly.
#[derive(Debug, thiserror::Error)]
enum CliError {
    /// A dependency could not be constructed from otherwise-valid
    /// configuration (bad URL, unbindable address, unreadable seed file).
    #[error("{0}")]
    Startup(String),
}

/// Entry point: loads configuration, then runs a single tick or polls
/// forever depending on `--once`.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match AutotuneConfig::load() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration failed to load");
            return ExitCode::from(CONFIG_ERROR_EXIT_CODE);
        }
    };
    config.apply_cli_overrides(cli.poll_seconds, cli.update_live_prompt.then_some(true));

    match run(&config, cli.once).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "fatal startup error");
            ExitCode::from(CONFIG_ERROR_EXIT_CODE)
        }
    }
}

/// Initializes JSON-structured logging, honouring `RUST_LOG` when set.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("autotune=info,autotune_core=info,autotune_providers=info")),
        )
        .json()
        .init();
}

/// Builds every collaborator, then either runs a single tick or polls
/// forever until a shutdown signal or a persistent failure.
///
/// # Errors
///
/// Returns [`CliError::Startup`] when the HTTP base URL or status bind
/// address fail to parse, a provider client fails to build, or the seed
/// prompt file cannot be read on a fresh deployment.
async fn run(config: &AutotuneConfig, once: bool) -> Result<ExitCode, CliError> {
    let base_url =
        Url::parse(&config.api_base_url).map_err(|err| CliError::Startup(format!("invalid AUTOTUNE_API_BASE_URL: {err}")))?;
    let bind: SocketAddr = config
        .status_bind
        .parse()
        .map_err(|err| CliError::Startup(format!("invalid AUTOTUNE_STATUS_BIND: {err}")))?;

    let provider_config = HttpProviderConfig::new(base_url, config.api_key.clone());
    let trace_store =
        HttpTraceStore::new(provider_config.clone()).map_err(|err| CliError::Startup(err.to_string()))?;
    let dataset_store =
        HttpDatasetStore::new(provider_config.clone()).map_err(|err| CliError::Startup(err.to_string()))?;
    let llm: Arc<dyn LlmClient + Send + Sync> = Arc::new(
        HttpLlmClient::new(provider_config, config.agent_model.clone())
            .map_err(|err| CliError::Startup(err.to_string()))?,
    );

    let scorers: Arc<Vec<Box<dyn Scorer + Send + Sync>>> = Arc::new(vec![
        Box::new(ExactMatchScorer) as Box<dyn Scorer + Send + Sync>,
        Box::new(EmergencyMentionScorer::new()),
        Box::new(TurnsToEmergencyScorer::new()),
        Box::new(TurnsToDeEscalationScorer::new()),
        Box::new(JudgeScorer::calmer_end_state(Arc::clone(&llm))),
        Box::new(JudgeScorer::emergency_services_when_needed(Arc::clone(&llm))),
    ]);

    let state_store = FileLoopStateStore::new(config.loop_state_file.clone());
    let artifact_store = FilesystemArtifactStore::new(config.runs_dir.clone(), config.status_file.clone());
    let status_artifact_store: Arc<dyn ArtifactStore + Send + Sync> = Arc::new(artifact_store.clone());

    let server_handle = tokio::spawn(async move {
        if let Err(err) = autotune_status::serve(bind, status_artifact_store).await {
            tracing::error!(error = %err, "status server exited");
        }
    });

    let mut state = load_or_seed_state(&state_store, &config.seed_prompt_file)?;
    let worker_config = config.worker_config();
    let cancel = Arc::new(AtomicBool::new(false));
    let deps = WorkerDeps {
        trace_store: &trace_store,
        dataset_store: &dataset_store,
        llm,
        scorers,
        state_store: &state_store,
        artifact_store: &artifact_store,
        cancel: Arc::clone(&cancel),
    };
    let mut cache = RunTraceCache::default();

    if once {
        let outcome = autotune_core::tick(&state, &worker_config, &mut cache, &deps, current_timestamp()).await;
        log_tick_outcome(&outcome);
        server_handle.abort();
        return Ok(ExitCode::from(NORMAL_EXIT_CODE));
    }

    spawn_shutdown_listener(Arc::clone(&cancel));

    let mut interval = tokio::time::interval(config.poll_interval());
    let mut consecutive_errors = 0u32;
    loop {
        interval.tick().await;
        let outcome = autotune_core::tick(&state, &worker_config, &mut cache, &deps, current_timestamp()).await;
        log_tick_outcome(&outcome);
        consecutive_errors =
            if matches!(outcome, TickOutcome::Errored { .. }) { consecutive_errors + 1 } else { 0 };
        state = reload_state(&state_store, state);
        if consecutive_errors >= MAX_CONSECUTIVE_ERRORED_TICKS {
            tracing::error!("giving up after too many consecutive errored ticks");
            server_handle.abort();
            return Ok(ExitCode::from(PERSISTENT_FAILURE_EXIT_CODE));
        }
        if cancel.load(Ordering::Relaxed) && shutdown_drained(state.current_phase) {
            tracing::info!(phase = ?state.current_phase, "shutdown complete, cycle reached a stopping point");
            server_handle.abort();
            return Ok(ExitCode::from(NORMAL_EXIT_CODE));
        }
    }
}

/// Spawns a background task that flips `cancel` on the first `SIGINT`/ctrl-c
/// and returns immediately; the poll loop notices it between ticks. Running
/// this independently of the tick loop means the signal is observed even
/// while a tick is mid-evaluation, rather than only at the top of the loop.
fn spawn_shutdown_listener(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal, draining in-flight work");
            cancel.store(true, Ordering::Relaxed);
        }
    });
}

/// True once a cancelled shutdown can stop polling: either the phase is
/// already terminal, or no run is in progress to cancel at all.
fn shutdown_drained(phase: Phase) -> bool {
    phase.is_terminal() || matches!(phase, Phase::Idle | Phase::Waiting)
}

/// Loads the persisted [`LoopState`], or seeds one from `seed_prompt_file`
/// when this deployment has never run a cycle before.
fn load_or_seed_state(state_store: &FileLoopStateStore, seed_prompt_file: &Path) -> Result<LoopState, CliError> {
    match state_store.load() {
        Ok(Some(state)) => Ok(state),
        Ok(None) => {
            let seed_text = std::fs::read_to_string(seed_prompt_file)
                .map_err(|err| CliError::Startup(format!("failed to read {}: {err}", seed_prompt_file.display())))?;
            let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, seed_text.as_bytes());
            let state = LoopState::initial(PromptHash::new(digest.value), seed_text, current_timestamp());
            state_store.save(&state).map_err(|err| CliError::Startup(err.to_string()))?;
            Ok(state)
        }
        Err(err) => Err(CliError::Startup(err.to_string())),
    }
}

/// Reloads `LoopState` after a tick; `tick` persists state itself, so this
/// binary's only copy of the truth is what the store returns next.
fn reload_state(state_store: &FileLoopStateStore, current: LoopState) -> LoopState {
    match state_store.load() {
        Ok(Some(next)) => next,
        Ok(None) => current,
        Err(err) => {
            tracing::error!(error = %err, "failed to reload loop state after tick");
            current
        }
    }
}

/// Logs one tick's outcome at a level matching its severity.
fn log_tick_outcome(outcome: &TickOutcome) {
    match outcome {
        TickOutcome::Progressed { phase } => tracing::info!(?phase, "tick progressed"),
        TickOutcome::Waited { reason } => tracing::info!(reason = %reason, "tick waited"),
        TickOutcome::Errored { kind, detail } => tracing::warn!(?kind, detail = %detail, "tick errored"),
    }
}

/// Returns the current wall-clock time as a [`Timestamp`], clamping to
/// `i64::MAX` on overflow rather than panicking.
fn current_timestamp() -> Timestamp {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let millis = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
    Timestamp::from_unix_millis(millis)
}
