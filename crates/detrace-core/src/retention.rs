//! Storage classes and retention-driven garbage collection.
//!
//! Each run's manifest names a storage class; the garbage collector deletes
//! run directories whose manifests have aged past the class's maximum
//! lifetime. Runs younger than the class minimum are never deleted, and
//! nothing referenced by an active bookmark is ever collected.

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::manifest::{RunManifest, MANIFEST_FILE};

/// Storage class recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    Dev,
    Ci,
    Prod,
}

impl std::fmt::Display for StorageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StorageClass::Dev => "dev",
            StorageClass::Ci => "ci",
            StorageClass::Prod => "prod",
        };
        f.write_str(s)
    }
}

/// Artifact categories a class may keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactCategory {
    Events,
    Blobs,
    Traces,
}

/// Lifetime and category rules for one storage class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionClass {
    pub class: StorageClass,
    /// Runs younger than this are never collected.
    pub min_age_days: u64,
    /// Runs older than this are collected.
    pub max_age_days: u64,
    /// After age rules, keep at most this many runs of this class.
    pub max_runs: Option<usize>,
    pub keep: Vec<ArtifactCategory>,
}

impl RetentionClass {
    pub fn builtin(class: StorageClass) -> Self {
        match class {
            StorageClass::Dev => Self {
                class,
                min_age_days: 0,
                max_age_days: 7,
                max_runs: Some(50),
                keep: vec![ArtifactCategory::Events, ArtifactCategory::Blobs],
            },
            StorageClass::Ci => Self {
                class,
                min_age_days: 1,
                max_age_days: 30,
                max_runs: Some(500),
                keep: vec![
                    ArtifactCategory::Events,
                    ArtifactCategory::Blobs,
                    ArtifactCategory::Traces,
                ],
            },
            StorageClass::Prod => Self {
                class,
                min_age_days: 30,
                max_age_days: 365,
                max_runs: None,
                keep: vec![
                    ArtifactCategory::Events,
                    ArtifactCategory::Blobs,
                    ArtifactCategory::Traces,
                ],
            },
        }
    }
}

/// Result of one garbage-collection pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionSweep {
    pub scanned: usize,
    pub deleted: Vec<String>,
    pub kept_bookmarked: Vec<String>,
}

/// File beside the artifact root listing bookmarked run ids, one per line.
pub const BOOKMARKS_FILE: &str = "bookmarks";

fn load_bookmarks(artifacts_root: &Path) -> HashSet<String> {
    std::fs::read_to_string(artifacts_root.join(BOOKMARKS_FILE))
        .map(|text| {
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Sweep `artifacts_root`, deleting run directories aged past their class
/// limits. Bookmarked runs are always kept. Returns what happened.
pub fn sweep(artifacts_root: &Path, classes: &[RetentionClass]) -> Result<RetentionSweep> {
    let mut report = RetentionSweep::default();
    let bookmarks = load_bookmarks(artifacts_root);
    let now = Utc::now();

    let read_dir = match std::fs::read_dir(artifacts_root) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(e.into()),
    };

    // (class, created_at, run dir name, path), newest first per class later.
    let mut candidates = Vec::new();
    for entry in read_dir {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() || !path.join(MANIFEST_FILE).exists() {
            continue;
        }
        let Ok(manifest) = RunManifest::read(&path) else {
            continue;
        };
        report.scanned += 1;
        let name = entry.file_name().to_string_lossy().to_string();
        candidates.push((manifest.storage_class, manifest.created_at, name, path));
    }

    for rule in classes {
        let mut of_class: Vec<_> = candidates
            .iter()
            .filter(|(class, _, _, _)| *class == rule.class)
            .collect();
        // Newest first for count-based pruning.
        of_class.sort_by(|a, b| b.1.cmp(&a.1));

        let mut survivors = 0usize;
        for (_, created_at, name, path) in of_class {
            let age_days = (now - *created_at).num_days().max(0) as u64;

            if bookmarks.contains(name) {
                report.kept_bookmarked.push(name.clone());
                continue;
            }

            let over_age = age_days > rule.max_age_days;
            let over_count = rule
                .max_runs
                .is_some_and(|max| survivors >= max);

            if (over_age || over_count) && age_days >= rule.min_age_days {
                std::fs::remove_dir_all(path)?;
                report.deleted.push(name.clone());
            } else {
                survivors += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RunId;
    use crate::manifest::RunStatus;
    use crate::telemetry::LedgerDriver;
    use tempfile::tempdir;

    fn write_run(root: &Path, class: StorageClass, age_days: i64) -> String {
        let run_id = RunId::new();
        let dir = root.join(run_id.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("events.jsonl"), b"{}\n").unwrap();
        let mut m = RunManifest::begin(
            run_id,
            "a@1",
            "d",
            1,
            "standard",
            "pd",
            class,
            LedgerDriver::Jsonl,
        );
        m.created_at = Utc::now() - chrono::Duration::days(age_days);
        m.finalize(&dir, RunStatus::Ok, vec![]).unwrap();
        run_id.to_string()
    }

    #[test]
    fn test_sweep_deletes_aged_out_runs() {
        let root = tempdir().unwrap();
        let old = write_run(root.path(), StorageClass::Dev, 30);
        let fresh = write_run(root.path(), StorageClass::Dev, 0);

        let report = sweep(root.path(), &[RetentionClass::builtin(StorageClass::Dev)]).unwrap();
        assert_eq!(report.deleted, vec![old.clone()]);
        assert!(!root.path().join(&old).exists());
        assert!(root.path().join(&fresh).exists());
    }

    #[test]
    fn test_sweep_never_deletes_bookmarked() {
        let root = tempdir().unwrap();
        let old = write_run(root.path(), StorageClass::Dev, 30);
        std::fs::write(root.path().join(BOOKMARKS_FILE), format!("{old}\n")).unwrap();

        let report = sweep(root.path(), &[RetentionClass::builtin(StorageClass::Dev)]).unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(report.kept_bookmarked, vec![old.clone()]);
        assert!(root.path().join(&old).exists());
    }

    #[test]
    fn test_sweep_respects_min_age() {
        let root = tempdir().unwrap();
        // Prod: min 30 days. A 10-day-old run past a hypothetical max is kept.
        let young = write_run(root.path(), StorageClass::Prod, 10);
        let rule = RetentionClass {
            class: StorageClass::Prod,
            min_age_days: 30,
            max_age_days: 5,
            max_runs: None,
            keep: vec![ArtifactCategory::Events],
        };
        let report = sweep(root.path(), &[rule]).unwrap();
        assert!(report.deleted.is_empty());
        assert!(root.path().join(&young).exists());
    }

    #[test]
    fn test_sweep_count_pruning_keeps_newest() {
        let root = tempdir().unwrap();
        let oldest = write_run(root.path(), StorageClass::Dev, 3);
        let newer = write_run(root.path(), StorageClass::Dev, 1);
        let newest = write_run(root.path(), StorageClass::Dev, 0);

        let rule = RetentionClass {
            class: StorageClass::Dev,
            min_age_days: 0,
            max_age_days: 365,
            max_runs: Some(2),
            keep: vec![ArtifactCategory::Events],
        };
        let report = sweep(root.path(), &[rule]).unwrap();
        assert_eq!(report.deleted, vec![oldest.clone()]);
        assert!(root.path().join(&newer).exists());
        assert!(root.path().join(&newest).exists());
    }

    #[test]
    fn test_sweep_missing_root_is_noop() {
        let report = sweep(
            Path::new("/nonexistent/detrace-artifacts"),
            &[RetentionClass::builtin(StorageClass::Dev)],
        )
        .unwrap();
        assert_eq!(report.scanned, 0);
    }

    #[test]
    fn test_builtin_classes_are_ordered() {
        let dev = RetentionClass::builtin(StorageClass::Dev);
        let ci = RetentionClass::builtin(StorageClass::Ci);
        let prod = RetentionClass::builtin(StorageClass::Prod);
        assert!(dev.max_age_days < ci.max_age_days);
        assert!(ci.max_age_days < prod.max_age_days);
    }
}
