//! Per-run manifest: the integrity root of a run's artifacts.
//!
//! The manifest is written as YAML at run start (status `running`) and
//! finalized at run end. Finalization walks the run directory, hashes every
//! artifact with BLAKE3, and records the redaction log and storage class.
//! Reading a manifest back re-verifies every artifact hash.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical::hash_bytes;
use crate::error::{CoreError, Result};
use crate::events::RunId;
use crate::redaction::RedactionLogEntry;
use crate::retention::StorageClass;
use crate::telemetry::LedgerDriver;

/// Terminal (or in-flight) status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Ok,
    PolicyViolation,
    ReplayMismatch,
    AdapterError,
    Incomplete,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Ok => "ok",
            RunStatus::PolicyViolation => "policy_violation",
            RunStatus::ReplayMismatch => "replay_mismatch",
            RunStatus::AdapterError => "adapter_error",
            RunStatus::Incomplete => "incomplete",
        };
        f.write_str(s)
    }
}

/// One artifact path with its BLAKE3 hash, relative to the run directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub path: String,
    pub hash: String,
}

/// Active policy reference captured at run start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRef {
    pub active: String,
    pub digest: String,
}

/// The per-run manifest, serialized as `manifest.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: RunId,
    pub adapter_version: String,
    pub source_digest: String,
    pub seed: u64,
    /// Model identifiers by role, e.g. `{"primary": "gpt-x"}`.
    pub models: std::collections::BTreeMap<String, String>,
    pub policies: PolicyRef,
    pub artifacts: Vec<ArtifactEntry>,
    pub redaction_log: Vec<RedactionLogEntry>,
    pub storage_class: StorageClass,
    pub ledger_driver: LedgerDriver,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
}

pub const MANIFEST_FILE: &str = "manifest.yaml";

impl RunManifest {
    /// A fresh manifest in `running` state.
    #[allow(clippy::too_many_arguments)]
    pub fn begin(
        run_id: RunId,
        adapter_version: impl Into<String>,
        source_digest: impl Into<String>,
        seed: u64,
        policy_name: impl Into<String>,
        policy_digest: impl Into<String>,
        storage_class: StorageClass,
        ledger_driver: LedgerDriver,
    ) -> Self {
        Self {
            run_id,
            adapter_version: adapter_version.into(),
            source_digest: source_digest.into(),
            seed,
            models: Default::default(),
            policies: PolicyRef {
                active: policy_name.into(),
                digest: policy_digest.into(),
            },
            artifacts: Vec::new(),
            redaction_log: Vec::new(),
            storage_class,
            ledger_driver,
            created_at: Utc::now(),
            finalized_at: None,
            status: RunStatus::Running,
        }
    }

    /// Record a model identifier for a role.
    pub fn set_model(&mut self, role: &str, id: &str) {
        self.models.insert(role.to_string(), id.to_string());
    }

    /// Write the manifest to `<run_dir>/manifest.yaml`.
    pub fn write(&self, run_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(run_dir)?;
        let path = run_dir.join(MANIFEST_FILE);
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(&path, yaml)?;
        Ok(path)
    }

    /// Finalize: hash every artifact under `run_dir` (except the manifest
    /// itself), stamp the status and redaction log, and rewrite the file.
    pub fn finalize(
        &mut self,
        run_dir: &Path,
        status: RunStatus,
        redaction_log: Vec<RedactionLogEntry>,
    ) -> Result<PathBuf> {
        self.artifacts = collect_artifacts(run_dir)?;
        self.redaction_log = redaction_log;
        self.status = status;
        self.finalized_at = Some(Utc::now());
        self.write(run_dir)
    }

    /// Load `<run_dir>/manifest.yaml` without verification.
    pub fn read(run_dir: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(run_dir.join(MANIFEST_FILE))?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Load and re-hash every listed artifact; any mismatch is an error.
    pub fn read_verified(run_dir: &Path) -> Result<Self> {
        let manifest = Self::read(run_dir)?;
        for entry in &manifest.artifacts {
            let path = run_dir.join(&entry.path);
            let bytes = std::fs::read(&path).map_err(|e| {
                CoreError::Manifest(format!("artifact {} unreadable: {e}", entry.path))
            })?;
            let actual = hash_bytes(&bytes);
            if actual != entry.hash {
                return Err(CoreError::DigestMismatch {
                    subject: entry.path.clone(),
                    expected: entry.hash.clone(),
                    actual,
                });
            }
        }
        Ok(manifest)
    }
}

/// Walk a run directory and hash every regular file except the manifest.
fn collect_artifacts(run_dir: &Path) -> Result<Vec<ArtifactEntry>> {
    let mut entries = Vec::new();
    collect_into(run_dir, run_dir, &mut entries)?;
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn collect_into(root: &Path, dir: &Path, out: &mut Vec<ArtifactEntry>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_into(root, &path, out)?;
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .map_err(|_| CoreError::Manifest("artifact outside run dir".to_string()))?;
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if rel_str == MANIFEST_FILE {
            continue;
        }
        let bytes = std::fs::read(&path)?;
        out.push(ArtifactEntry {
            path: rel_str,
            hash: hash_bytes(&bytes),
        });
    }
    Ok(())
}
