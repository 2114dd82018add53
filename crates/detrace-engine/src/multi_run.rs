//! Multi-run executor: N seeded executions of one task.
//!
//! Each child run inherits the active policy, gets a distinct seed and its
//! own artifact subtree, and fails independently; the group only fails when
//! every child does. A group manifest ties the children together for later
//! forensic replay.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use detrace_core::RunStatus;
use detrace_safety::PolicyManager;

use crate::adapter::{Adapter, RunResult, TaskSpec};
use crate::error::{EngineError, Result};
use crate::runner::{record_run, RunOptions};

/// How child seeds are chosen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum SeedStrategy {
    /// `start`, `start+1`, `start+2`, …
    Sequential { start: u64 },
    /// Fresh random seeds, recorded in the group manifest.
    Random,
    /// Caller-supplied list; its length must be ≥ N.
    Explicit(Vec<u64>),
}

impl SeedStrategy {
    fn seeds(&self, n: usize) -> Result<Vec<u64>> {
        match self {
            SeedStrategy::Sequential { start } => Ok((0..n as u64).map(|i| start + i).collect()),
            SeedStrategy::Random => Ok((0..n)
                .map(|_| {
                    let bytes = uuid::Uuid::new_v4().into_bytes();
                    u64::from_le_bytes(bytes[..8].try_into().unwrap_or_default())
                })
                .collect()),
            SeedStrategy::Explicit(seeds) => {
                if seeds.len() < n {
                    return Err(EngineError::Configuration(format!(
                        "{} seeds supplied for {} runs",
                        seeds.len(),
                        n
                    )));
                }
                Ok(seeds[..n].to_vec())
            }
        }
    }
}

/// Serial or parallel child execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Serial,
    Parallel,
}

/// Multi-run configuration.
#[derive(Debug, Clone)]
pub struct MultiRunConfig {
    pub n: usize,
    pub mode: ExecutionMode,
    pub seeds: SeedStrategy,
}

impl Default for MultiRunConfig {
    fn default() -> Self {
        Self {
            n: 5,
            mode: ExecutionMode::Serial,
            seeds: SeedStrategy::Sequential { start: 1 },
        }
    }
}

/// One child entry in the group manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupChild {
    pub run_id: String,
    pub seed: u64,
    pub status: String,
    pub verified_pass: bool,
}

/// Group manifest written as `group.yaml` under the output directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupManifest {
    pub group_id: String,
    pub task_id: String,
    pub framework: String,
    pub policy: String,
    pub children: Vec<GroupChild>,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

pub const GROUP_MANIFEST_FILE: &str = "group.yaml";

impl GroupManifest {
    pub fn write(&self, out_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(out_dir)?;
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| EngineError::Configuration(format!("group manifest: {e}")))?;
        std::fs::write(out_dir.join(GROUP_MANIFEST_FILE), yaml)?;
        Ok(())
    }

    pub fn read(out_dir: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(out_dir.join(GROUP_MANIFEST_FILE))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| EngineError::Configuration(format!("group manifest: {e}")))
    }
}

/// Run `task` N times with distinct seeds and collect per-run results.
///
/// Individual failures are recorded and do not abort the group; the call
/// errors only when every child failed to produce a result. Flipping
/// `cancel` aborts the children still in flight (their sandboxed processes
/// are killed within the policy's grace window) and finalizes the group
/// manifest with what completed.
pub async fn run_group(
    adapter: Arc<dyn Adapter>,
    task: &TaskSpec,
    base: &RunOptions,
    policies: &Arc<PolicyManager>,
    config: &MultiRunConfig,
    mut cancel: watch::Receiver<bool>,
) -> Result<(GroupManifest, Vec<RunResult>)> {
    let seeds = config.seeds.seeds(config.n)?;
    let group_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(
        event = "multi_run.started",
        group_id = %group_id,
        task_id = %task.id,
        n = config.n,
        mode = ?config.mode,
    );

    let mut results: Vec<Option<RunResult>> = Vec::with_capacity(config.n);
    let mut cancelled = false;

    match config.mode {
        ExecutionMode::Serial => {
            for seed in &seeds {
                if *cancel.borrow() {
                    cancelled = true;
                    break;
                }
                let mut opts = base.clone();
                opts.seed = *seed;
                let result = record_run(adapter.as_ref(), task, &opts, policies).await;
                results.push(result.ok());
            }
        }
        ExecutionMode::Parallel => {
            let handles: Vec<_> = seeds
                .iter()
                .map(|seed| {
                    let adapter = Arc::clone(&adapter);
                    let task = task.clone();
                    let mut opts = base.clone();
                    opts.seed = *seed;
                    let policies = Arc::clone(policies);
                    tokio::spawn(async move {
                        record_run(adapter.as_ref(), &task, &opts, &policies).await
                    })
                })
                .collect();

            let joined = tokio::select! {
                joined = join_all(handles) => joined,
                _ = cancel.changed() => {
                    // Aborting drops the child futures; kill_on_drop reaps
                    // their sandboxed processes.
                    cancelled = true;
                    Vec::new()
                }
            };
            for join in joined {
                match join {
                    Ok(result) => results.push(result.ok()),
                    Err(_) => results.push(None),
                }
            }
        }
    }

    let completed: Vec<RunResult> = results.into_iter().flatten().collect();
    if completed.is_empty() && !cancelled {
        return Err(EngineError::Adapter {
            run_id: group_id,
            message: "all child runs failed".to_string(),
        });
    }
    let all_failed = !completed.is_empty()
        && completed
            .iter()
            .all(|r| r.status != RunStatus::Ok);
    if all_failed {
        tracing::warn!(event = "multi_run.all_failed", group_id = %group_id);
    }

    let manifest = GroupManifest {
        group_id: group_id.clone(),
        task_id: task.id.clone(),
        framework: base.framework.clone(),
        policy: policies.active_policy().name.clone(),
        children: completed
            .iter()
            .map(|r| GroupChild {
                run_id: r.run_id.to_string(),
                seed: r.seed,
                status: r.status.to_string(),
                verified_pass: r.verified_pass,
            })
            .collect(),
        cancelled,
        created_at: Utc::now(),
    };
    manifest.write(&base.out_dir)?;

    tracing::info!(
        event = "multi_run.finished",
        group_id = %group_id,
        completed = completed.len(),
        cancelled = cancelled,
    );
    Ok((manifest, completed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_seeds() {
        let seeds = SeedStrategy::Sequential { start: 10 }.seeds(3).unwrap();
        assert_eq!(seeds, vec![10, 11, 12]);
    }

    #[test]
    fn test_explicit_seeds_truncated_to_n() {
        let seeds = SeedStrategy::Explicit(vec![5, 6, 7, 8]).seeds(2).unwrap();
        assert_eq!(seeds, vec![5, 6]);
    }

    #[test]
    fn test_explicit_seeds_too_few_rejected() {
        assert!(SeedStrategy::Explicit(vec![1]).seeds(3).is_err());
    }

    #[test]
    fn test_random_seeds_distinct() {
        let seeds = SeedStrategy::Random.seeds(8).unwrap();
        let unique: std::collections::HashSet<_> = seeds.iter().collect();
        assert_eq!(unique.len(), seeds.len());
    }

    #[test]
    fn test_default_config() {
        let config = MultiRunConfig::default();
        assert_eq!(config.n, 5);
        assert_eq!(config.mode, ExecutionMode::Serial);
    }
}
