// autotune-store/src/lib.rs
// ============================================================================
// Crate: Autotune Store
// Description: Filesystem-backed LoopStateStore and ArtifactStore.
// Purpose: Durable, hash-verified persistence without a database dependency.
// Dependencies: autotune-core, serde, serde_json
// ============================================================================

//! ## Overview
//! Every write goes through [`atomic_write`]: serialize, write to a sibling
//! `.tmp` file, `sync_all`, then `rename` over the destination. Every read
//! goes through [`read_checked`], which recomputes a canonical-JSON hash
//! over the payload and rejects the read if it doesn't match the digest
//! recorded alongside it at write time. This is the same fail-closed
//! integrity posture a SQL-backed store gets from a checksum column,
//! without requiring a database.

#![forbid(unsafe_code)]

use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use autotune_core::ArtifactStore;
use autotune_core::FindingsAndVariants;
use autotune_core::HashAlgorithm;
use autotune_core::HashDigest;
use autotune_core::LoopState;
use autotune_core::LoopStateStore;
use autotune_core::PromotionDecision;
use autotune_core::RunDirId;
use autotune_core::StatusSnapshot;
use autotune_core::StoreError;
use autotune_core::Timestamp;
use autotune_core::core::data::SourceTraces;
use autotune_core::core::hashing::DEFAULT_HASH_ALGORITHM;
use autotune_core::core::hashing::canonical_json_bytes;
use autotune_core::hash_bytes;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

// ============================================================================
// SECTION: Envelope
// ============================================================================

/// On-disk wrapper pairing a payload with a content digest of itself.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    /// Digest of `payload`'s canonical JSON, recorded at write time.
    digest: HashDigest,
    /// The stored value.
    payload: T,
}

/// Serializes `value` into an [`Envelope`], writes it atomically to `path`.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let canonical = canonical_json_bytes(value).map_err(|err| StoreError::Corrupt(err.to_string()))?;
    let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, &canonical);
    let envelope = Envelope { digest, payload: value };
    let bytes = serde_json::to_vec_pretty(&envelope).map_err(|err| StoreError::Corrupt(err.to_string()))?;
    atomic_write(path, &bytes)
}

/// Reads and verifies an [`Envelope`] at `path`, returning `None` if the
/// file does not exist.
fn read_checked<T: DeserializeOwned + Serialize>(path: &Path) -> Result<Option<T>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).map_err(|err| StoreError::Io(err.to_string()))?;
    let envelope: Envelope<T> =
        serde_json::from_slice(&bytes).map_err(|err| StoreError::Corrupt(format!("invalid envelope at {}: {err}", path.display())))?;
    let recomputed = canonical_json_bytes(&envelope.payload).map_err(|err| StoreError::Corrupt(err.to_string()))?;
    let recomputed_digest = hash_bytes(envelope.digest.algorithm, &recomputed);
    if recomputed_digest != envelope.digest {
        return Err(StoreError::Corrupt(format!("hash mismatch reading {}", path.display())));
    }
    Ok(Some(envelope.payload))
}

/// Writes `bytes` to `path` via a sibling temp file, fsync, then rename.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| StoreError::Io(err.to_string()))?;
    }
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|err| StoreError::Io(err.to_string()))?;
    file.write_all(bytes).map_err(|err| StoreError::Io(err.to_string()))?;
    file.sync_all().map_err(|err| StoreError::Io(err.to_string()))?;
    fs::rename(&tmp_path, path).map_err(|err| StoreError::Io(err.to_string()))?;
    Ok(())
}

// ============================================================================
// SECTION: Loop State Store
// ============================================================================

/// Filesystem-backed [`LoopStateStore`]: a single hash-verified JSON file.
#[derive(Debug, Clone)]
pub struct FileLoopStateStore {
    /// Path to the single `loop_state.json` file.
    path: PathBuf,
}

impl FileLoopStateStore {
    /// Builds a store backed by the given file path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LoopStateStore for FileLoopStateStore {
    fn load(&self) -> Result<Option<LoopState>, StoreError> {
        read_checked(&self.path)
    }

    fn save(&self, state: &LoopState) -> Result<(), StoreError> {
        write_atomic(&self.path, state)
    }
}

// ============================================================================
// SECTION: Artifact Store
// ============================================================================

/// Filesystem-backed [`ArtifactStore`]: one directory per run under
/// `runs_dir`, plus a single dashboard-facing `status_file`.
#[derive(Debug, Clone)]
pub struct FilesystemArtifactStore {
    /// Root directory holding one subdirectory per run.
    runs_dir: PathBuf,
    /// Path to the dashboard-facing `status.json` file.
    status_file: PathBuf,
}

impl FilesystemArtifactStore {
    /// Builds a store backed by the given runs directory and status file.
    #[must_use]
    pub fn new(runs_dir: impl Into<PathBuf>, status_file: impl Into<PathBuf>) -> Self {
        Self { runs_dir: runs_dir.into(), status_file: status_file.into() }
    }

    /// Resolves the path of one artifact file within a run's directory.
    fn run_artifact_path(&self, run_dir: &RunDirId, file_name: &str) -> PathBuf {
        self.runs_dir.join(run_dir.as_str()).join(file_name)
    }
}

impl ArtifactStore for FilesystemArtifactStore {
    fn new_run_dir(&self, now: Timestamp) -> RunDirId {
        let base = format!("{:020}", now.as_unix_millis());
        let mut candidate = base.clone();
        let mut suffix = 0u32;
        while self.runs_dir.join(&candidate).exists() {
            suffix += 1;
            candidate = format!("{base}-{suffix}");
        }
        RunDirId::from(candidate)
    }

    fn write_source_traces(&self, run_dir: &RunDirId, traces: &SourceTraces) -> Result<(), StoreError> {
        write_atomic(&self.run_artifact_path(run_dir, "source_traces.json"), traces)
    }

    fn write_findings_and_variants(&self, run_dir: &RunDirId, findings: &FindingsAndVariants) -> Result<(), StoreError> {
        write_atomic(&self.run_artifact_path(run_dir, "findings_and_variants.json"), findings)
    }

    fn write_promotion_decision(&self, run_dir: &RunDirId, decision: &PromotionDecision) -> Result<(), StoreError> {
        write_atomic(&self.run_artifact_path(run_dir, "promotion_decision.json"), decision)
    }

    fn write_status(&self, status: &StatusSnapshot) -> Result<(), StoreError> {
        write_atomic(&self.status_file, status)
    }

    fn read_status(&self) -> Result<Option<StatusSnapshot>, StoreError> {
        read_checked(&self.status_file)
    }

    fn latest_run_dir(&self) -> Result<Option<RunDirId>, StoreError> {
        if !self.runs_dir.exists() {
            return Ok(None);
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.runs_dir).map_err(|err| StoreError::Io(err.to_string()))? {
            let entry = entry.map_err(|err| StoreError::Io(err.to_string()))?;
            if entry.file_type().map_err(|err| StoreError::Io(err.to_string()))?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names.into_iter().max().map(|name| RunDirId::from(name.as_str())))
    }

    fn read_source_traces(&self, run_dir: &RunDirId) -> Result<Option<SourceTraces>, StoreError> {
        read_checked(&self.run_artifact_path(run_dir, "source_traces.json"))
    }

    fn read_findings_and_variants(&self, run_dir: &RunDirId) -> Result<Option<FindingsAndVariants>, StoreError> {
        read_checked(&self.run_artifact_path(run_dir, "findings_and_variants.json"))
    }

    fn read_promotion_decision(&self, run_dir: &RunDirId) -> Result<Option<PromotionDecision>, StoreError> {
        read_checked(&self.run_artifact_path(run_dir, "promotion_decision.json"))
    }
}

#[cfg(test)]
mod tests {
    use autotune_core::PromptHash;
    use tempfile::tempdir;

    use super::*;

    fn sample_state(now: Timestamp) -> LoopState {
        LoopState::initial(PromptHash::new("seed-hash"), "seed prompt text", now)
    }

    #[test]
    fn loop_state_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = FileLoopStateStore::new(dir.path().join("loop_state.json"));
        assert_eq!(store.load().expect("load"), None);

        let state = sample_state(Timestamp::from_unix_millis(1_000));
        store.save(&state).expect("save");
        assert_eq!(store.load().expect("load"), Some(state));
    }

    #[test]
    fn corrupted_loop_state_file_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("loop_state.json");
        let store = FileLoopStateStore::new(&path);
        store.save(&sample_state(Timestamp::from_unix_millis(1_000))).expect("save");

        let mut bytes = fs::read(&path).expect("read");
        bytes.extend_from_slice(b"tampered");
        fs::write(&path, bytes).expect("overwrite");

        let err = store.load().expect_err("corrupt file must fail closed");
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn run_artifacts_round_trip_and_latest_run_dir_sorts_lexicographically() {
        let dir = tempdir().expect("tempdir");
        let store = FilesystemArtifactStore::new(dir.path().join("runs"), dir.path().join("status.json"));

        let earlier = store.new_run_dir(Timestamp::from_unix_millis(1_000));
        let traces = SourceTraces { joined: vec![], ad_hoc: vec![], new_trace_count: 3 };
        store.write_source_traces(&earlier, &traces).expect("write");

        let later = store.new_run_dir(Timestamp::from_unix_millis(2_000));
        assert_ne!(earlier, later);
        store.write_source_traces(&later, &traces).expect("write");

        assert_eq!(store.latest_run_dir().expect("latest"), Some(later.clone()));
        assert_eq!(store.read_source_traces(&later).expect("read"), Some(traces));
        assert_eq!(store.read_findings_and_variants(&later).expect("read"), None);
    }

    #[test]
    fn new_run_dir_disambiguates_identical_timestamps() {
        let dir = tempdir().expect("tempdir");
        let store = FilesystemArtifactStore::new(dir.path().join("runs"), dir.path().join("status.json"));
        let now = Timestamp::from_unix_millis(5_000);

        let first = store.new_run_dir(now);
        let traces = SourceTraces { joined: vec![], ad_hoc: vec![], new_trace_count: 0 };
        store.write_source_traces(&first, &traces).expect("write");

        let second = store.new_run_dir(now);
        assert_ne!(first, second);
    }

    #[test]
    fn status_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = FilesystemArtifactStore::new(dir.path().join("runs"), dir.path().join("status.json"));
        assert_eq!(store.read_status().expect("read"), None);

        let status = StatusSnapshot::from_state(&sample_state(Timestamp::from_unix_millis(1_000)), Some("waiting".to_string()));
        store.write_status(&status).expect("write");
        assert_eq!(store.read_status().expect("read"), Some(status));
    }
}
