// autotune-core/src/lib.rs
// ============================================================================
// Crate: Autotune Core
// Description: Data model, interfaces, and the worker state machine for the
//              autotune control loop.
// Purpose: Provide a pure, backend-agnostic engine with no network or
//          filesystem I/O of its own.
// ============================================================================

//! ## Overview
//! `autotune-core` defines the data model for traces, datasets, prompt
//! variants, and run artifacts; the backend-agnostic trait interfaces other
//! crates implement (trace/dataset stores, the LLM client, state and artifact
//! persistence); and the worker state machine that drives one tick of the
//! autotune control loop. It performs no I/O directly — every suspension
//! point is behind a trait.

#![forbid(unsafe_code)]

pub mod core;
pub mod interfaces;
pub mod runtime;

pub use core::data::DatasetRow;
pub use core::data::DatasetSnapshot;
pub use core::data::FindingsAndVariants;
pub use core::data::PromotionDecision;
pub use core::data::PromotionThresholds;
pub use core::data::PromptVariant;
pub use core::data::SimulatedUserProfile;
pub use core::data::Split;
pub use core::data::Trace;
pub use core::data::VariantRun;
pub use core::hashing::HashAlgorithm;
pub use core::hashing::HashDigest;
pub use core::hashing::hash_bytes;
pub use core::hashing::hash_canonical_json;
pub use core::identifiers::CaseId;
pub use core::identifiers::DatasetName;
pub use core::identifiers::DatasetVersion;
pub use core::identifiers::ExperimentId;
pub use core::identifiers::PromptHash;
pub use core::identifiers::RunDirId;
pub use core::identifiers::TraceId;
pub use core::identifiers::VariantName;
pub use core::state::ErrorKind;
pub use core::state::LoopState;
pub use core::state::Phase;
pub use core::state::StatusSnapshot;
pub use core::state::TickOutcome;
pub use core::time::Timestamp;
pub use interfaces::ArtifactStore;
pub use interfaces::DatasetStore;
pub use interfaces::DatasetStoreError;
pub use interfaces::LlmClient;
pub use interfaces::LlmError;
pub use interfaces::LoopStateStore;
pub use interfaces::StoreError;
pub use interfaces::TraceStore;
pub use interfaces::TraceStoreError;
pub use runtime::scorer::ScoreOutcome;
pub use runtime::scorer::Scorer;
pub use runtime::worker::BASELINE_VARIANT_NAME;
pub use runtime::worker::RunTraceCache;
pub use runtime::worker::WorkerConfig;
pub use runtime::worker::WorkerDeps;
pub use runtime::worker::WorkerError;
pub use runtime::worker::tick;
