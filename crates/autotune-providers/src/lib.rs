// autotune-providers/src/lib.rs
// ============================================================================
// Crate: Autotune Providers
// Description: HTTP-backed implementations of the trace/dataset/LLM traits,
//              plus the LLM-judge scorer suite.
// Purpose: Connect the backend-agnostic engine to a real tracing/LLM stack.
// ============================================================================

//! ## Overview
//! `autotune-core` defines its external dependencies as traits; this crate
//! supplies the one real implementation this deployment uses: a bounded,
//! scheme/host-restricted HTTP client for the trace and dataset stores and
//! the LLM backend, and the two LLM-judge [`autotune_core::Scorer`]
//! implementations the deterministic scorer suite cannot express.

#![forbid(unsafe_code)]

pub mod http;
pub mod judge_scorer;

pub use http::HttpDatasetStore;
pub use http::HttpLlmClient;
pub use http::HttpProviderConfig;
pub use http::HttpTraceStore;
pub use judge_scorer::DEFAULT_CALMER_END_STATE_PROMPT_VERSION;
pub use judge_scorer::DEFAULT_EMERGENCY_JUDGE_PROMPT_VERSION;
pub use judge_scorer::JudgeScorer;
