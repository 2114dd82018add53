//! Safety policies: declarative, validated, immutable once installed.
//!
//! A policy bundles four subpolicies (execution, filesystem, network,
//! injection) under a named level. Built-in levels cover the whole
//! spectrum from `disabled` (tests only) to `paranoid`. Custom policies are
//! derived from a base level plus typed overrides and go through the same
//! validation; validation failures are never downgraded.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SafetyError};
use crate::violation::{PolicyViolation, ViolationRing};

/// Violation / decision severity, ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// The four enforcement domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyDomain {
    Execution,
    Filesystem,
    Network,
    Injection,
}

impl std::fmt::Display for SafetyDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SafetyDomain::Execution => "execution",
            SafetyDomain::Filesystem => "filesystem",
            SafetyDomain::Network => "network",
            SafetyDomain::Injection => "injection",
        };
        f.write_str(s)
    }
}

/// Built-in policy levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyLevel {
    Disabled,
    Permissive,
    Standard,
    Strict,
    Paranoid,
}

/// Sandbox isolation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackend {
    /// Container with no network and a read-only rootfs. Preferred.
    Container,
    /// Subprocess with OS-level resource limits. Portable fallback.
    Subprocess,
}

/// Resource caps for sandboxed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    pub backend: SandboxBackend,
    pub max_cpu_seconds: u64,
    pub max_memory_mb: u64,
    pub max_wall_time_ms: u64,
    pub max_open_files: u64,
    /// Grace window for kill-on-cancel before escalation, in milliseconds.
    pub kill_grace_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub breaker_threshold: u32,
}

/// Filesystem allowlist rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemPolicy {
    /// Extra allowed roots beyond the repo root and the per-run temp dir.
    pub extra_roots: Vec<PathBuf>,
    pub max_write_bytes: u64,
    /// When set, writes are restricted to these file extensions.
    pub allowed_extensions: Option<Vec<String>>,
}

/// Network egress rules. Default-deny: only listed domains pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub allowed_domains: Vec<String>,
    pub allowed_protocols: Vec<String>,
    pub requests_per_minute: u32,
    /// Log denials instead of failing the edge (development only).
    pub log_only: bool,
}

/// Extra injection pattern shipped with a policy file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionPatternDef {
    pub name: String,
    pub pattern: String,
    pub severity: Severity,
}

/// Prompt-injection screening rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionPolicy {
    pub enabled: bool,
    /// Matches at or above this severity produce a warning.
    pub warn_at: Severity,
    /// Matches at or above this severity block the edge. `None` never blocks.
    pub block_at: Option<Severity>,
    pub extra_patterns: Vec<InjectionPatternDef>,
}

/// A complete, validated safety policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub level: PolicyLevel,
    pub execution: ExecutionPolicy,
    pub filesystem: FilesystemPolicy,
    pub network: NetworkPolicy,
    pub injection: InjectionPolicy,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Policy {
    /// Built-in policy for a level.
    pub fn builtin(level: PolicyLevel) -> Self {
        let name = match level {
            PolicyLevel::Disabled => "disabled",
            PolicyLevel::Permissive => "permissive",
            PolicyLevel::Standard => "standard",
            PolicyLevel::Strict => "strict",
            PolicyLevel::Paranoid => "paranoid",
        };
        let execution = match level {
            PolicyLevel::Disabled | PolicyLevel::Permissive => ExecutionPolicy {
                backend: SandboxBackend::Subprocess,
                max_cpu_seconds: 300,
                max_memory_mb: 4096,
                max_wall_time_ms: 600_000,
                max_open_files: 1024,
                kill_grace_ms: 2000,
                max_retries: 2,
                backoff_base_ms: 500,
                breaker_threshold: 5,
            },
            PolicyLevel::Standard => ExecutionPolicy {
                backend: SandboxBackend::Container,
                max_cpu_seconds: 120,
                max_memory_mb: 2048,
                max_wall_time_ms: 300_000,
                max_open_files: 512,
                kill_grace_ms: 2000,
                max_retries: 2,
                backoff_base_ms: 500,
                breaker_threshold: 5,
            },
            PolicyLevel::Strict => ExecutionPolicy {
                backend: SandboxBackend::Container,
                max_cpu_seconds: 60,
                max_memory_mb: 1024,
                max_wall_time_ms: 120_000,
                max_open_files: 256,
                kill_grace_ms: 2000,
                max_retries: 1,
                backoff_base_ms: 500,
                breaker_threshold: 3,
            },
            PolicyLevel::Paranoid => ExecutionPolicy {
                backend: SandboxBackend::Container,
                max_cpu_seconds: 30,
                max_memory_mb: 512,
                max_wall_time_ms: 60_000,
                max_open_files: 64,
                kill_grace_ms: 1000,
                max_retries: 0,
                backoff_base_ms: 500,
                breaker_threshold: 2,
            },
        };
        let filesystem = FilesystemPolicy {
            extra_roots: Vec::new(),
            max_write_bytes: match level {
                PolicyLevel::Strict => 16 * 1024 * 1024,
                PolicyLevel::Paranoid => 4 * 1024 * 1024,
                _ => 256 * 1024 * 1024,
            },
            allowed_extensions: match level {
                PolicyLevel::Strict | PolicyLevel::Paranoid => Some(
                    ["rs", "py", "js", "ts", "json", "yaml", "toml", "md", "txt", "diff"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                ),
                _ => None,
            },
        };
        let network = NetworkPolicy {
            allowed_domains: Vec::new(),
            allowed_protocols: vec!["https".to_string()],
            requests_per_minute: match level {
                PolicyLevel::Paranoid => 0,
                PolicyLevel::Strict => 30,
                _ => 60,
            },
            log_only: matches!(level, PolicyLevel::Disabled | PolicyLevel::Permissive),
        };
        let injection = InjectionPolicy {
            enabled: !matches!(level, PolicyLevel::Disabled),
            warn_at: Severity::Low,
            block_at: match level {
                PolicyLevel::Disabled | PolicyLevel::Permissive => None,
                PolicyLevel::Standard | PolicyLevel::Strict => Some(Severity::High),
                PolicyLevel::Paranoid => Some(Severity::Medium),
            },
            extra_patterns: Vec::new(),
        };
        Self {
            name: name.to_string(),
            level,
            execution,
            filesystem,
            network,
            injection,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    /// BLAKE3 digest over the canonical serialized policy, excluding
    /// `created_at` so reloads of the same rules agree.
    pub fn digest(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(ref mut map) = value {
            map.remove("created_at");
        }
        detrace_core::fingerprint(&value).unwrap_or_default()
    }

    /// Validate resource limits, allowlist syntax, and pattern files.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| {
            Err(SafetyError::InvalidPolicy {
                name: self.name.clone(),
                reason,
            })
        };

        if self.name.is_empty() {
            return fail("name must not be empty".to_string());
        }
        if self.level != PolicyLevel::Disabled {
            if self.execution.max_wall_time_ms == 0 {
                return fail("max_wall_time_ms must be positive".to_string());
            }
            if self.execution.max_memory_mb == 0 {
                return fail("max_memory_mb must be positive".to_string());
            }
        }
        if self.execution.kill_grace_ms > 60_000 {
            return fail("kill_grace_ms must not exceed 60s".to_string());
        }
        for domain in &self.network.allowed_domains {
            if domain.is_empty() || domain.contains('/') || domain.contains(' ') {
                return fail(format!("malformed network allowlist entry: {domain:?}"));
            }
        }
        if !self.network.allowed_domains.is_empty() && self.network.allowed_protocols.is_empty() {
            return fail("allowed_protocols must not be empty when domains are allowed".to_string());
        }
        for def in &self.injection.extra_patterns {
            if let Err(e) = regex::Regex::new(&def.pattern) {
                return fail(format!("injection pattern '{}' invalid: {e}", def.name));
            }
        }
        if let Some(block_at) = self.injection.block_at {
            if block_at < self.injection.warn_at {
                return fail("block_at must be at or above warn_at".to_string());
            }
        }
        Ok(())
    }
}

/// Typed overrides applied to a base level by `create_custom`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOverrides {
    pub execution: Option<ExecutionPolicy>,
    pub filesystem: Option<FilesystemPolicy>,
    pub network: Option<NetworkPolicy>,
    pub injection: Option<InjectionPolicy>,
    pub metadata: Option<serde_json::Value>,
}

/// Outcome of a `decide` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub allow: bool,
    pub reason: String,
    pub severity: Severity,
}

impl Decision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allow: true,
            reason: reason.into(),
            severity: Severity::Low,
        }
    }

    pub fn deny(reason: impl Into<String>, severity: Severity) -> Self {
        Self {
            allow: false,
            reason: reason.into(),
            severity,
        }
    }
}

/// On-disk policy file: a base level plus overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PolicyFile {
    name: String,
    level: PolicyLevel,
    #[serde(default)]
    overrides: PolicyOverrides,
}

/// Loads, validates, and caches policies; owns the active policy slot and
/// the violation ring. Exactly one policy is active per process.
pub struct PolicyManager {
    policies: RwLock<HashMap<String, Arc<Policy>>>,
    active: RwLock<Arc<Policy>>,
    violations: ViolationRing,
}

impl std::fmt::Debug for PolicyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyManager")
            .field("active", &self.active_policy().name)
            .finish()
    }
}

impl PolicyManager {
    /// Manager preloaded with the built-in levels; `standard` active.
    pub fn new() -> Self {
        let mut policies = HashMap::new();
        for level in [
            PolicyLevel::Disabled,
            PolicyLevel::Permissive,
            PolicyLevel::Standard,
            PolicyLevel::Strict,
            PolicyLevel::Paranoid,
        ] {
            let policy = Arc::new(Policy::builtin(level));
            policies.insert(policy.name.clone(), policy);
        }
        let active = Arc::clone(&policies["standard"]);
        Self {
            policies: RwLock::new(policies),
            active: RwLock::new(active),
            violations: ViolationRing::new(1024),
        }
    }

    /// Load every `*.yaml` policy file in `dir`. Any invalid file aborts
    /// the load; the process must refuse to start in that case.
    pub fn load_dir(&self, dir: &std::path::Path) -> Result<usize> {
        let mut loaded = 0usize;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.extension().is_some_and(|e| e == "yaml" || e == "yml") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            let file: PolicyFile = serde_yaml::from_str(&raw)?;
            self.create_custom(&file.name, file.level, file.overrides)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn get_policy(&self, name: &str) -> Option<Arc<Policy>> {
        self.policies
            .read()
            .expect("policy map lock poisoned")
            .get(name)
            .cloned()
    }

    /// Install `name` as the active policy. Fails closed: an unknown or
    /// invalid policy leaves the current one active and returns false.
    pub fn set_active(&self, name: &str) -> bool {
        let Some(policy) = self.get_policy(name) else {
            tracing::warn!(event = "policy.set_active_rejected", name = %name, reason = "unknown");
            return false;
        };
        if policy.validate().is_err() {
            tracing::warn!(event = "policy.set_active_rejected", name = %name, reason = "invalid");
            return false;
        }
        *self.active.write().expect("active policy lock poisoned") = Arc::clone(&policy);
        tracing::info!(event = "policy.activated", name = %name, digest = %policy.digest());
        true
    }

    /// The currently active policy.
    pub fn active_policy(&self) -> Arc<Policy> {
        Arc::clone(&self.active.read().expect("active policy lock poisoned"))
    }

    /// Derive, validate, and cache a custom policy. The base level's
    /// subpolicies apply wherever an override is absent.
    pub fn create_custom(
        &self,
        name: &str,
        base: PolicyLevel,
        overrides: PolicyOverrides,
    ) -> Result<Arc<Policy>> {
        let mut policy = Policy::builtin(base);
        policy.name = name.to_string();
        if let Some(execution) = overrides.execution {
            policy.execution = execution;
        }
        if let Some(filesystem) = overrides.filesystem {
            policy.filesystem = filesystem;
        }
        if let Some(network) = overrides.network {
            policy.network = network;
        }
        if let Some(injection) = overrides.injection {
            policy.injection = injection;
        }
        if let Some(metadata) = overrides.metadata {
            policy.metadata = metadata;
        }
        policy.validate()?;
        let policy = Arc::new(policy);
        self.policies
            .write()
            .expect("policy map lock poisoned")
            .insert(name.to_string(), Arc::clone(&policy));
        Ok(policy)
    }

    /// Uniform decision API consulted by every enforcement surface.
    ///
    /// `action` is domain-specific: a path for filesystem, a domain name
    /// for network, a command for execution, a matched severity for
    /// injection. Detailed enforcement (symlink resolution, rate limits)
    /// lives in the enforcers; this is the policy-level verdict.
    pub fn decide(&self, domain: SafetyDomain, action: &str, context: &serde_json::Value) -> Decision {
        let policy = self.active_policy();
        if policy.level == PolicyLevel::Disabled {
            return Decision::allow("policy disabled");
        }
        match domain {
            SafetyDomain::Execution => {
                if context["direct_os_nondeterminism"].as_bool() == Some(true) {
                    return Decision::deny(
                        "direct OS clock/rng use bypasses deterministic providers",
                        Severity::Medium,
                    );
                }
                Decision::allow("sandboxed execution permitted")
            }
            SafetyDomain::Filesystem => {
                if action.split('/').any(|part| part == "..") {
                    return Decision::deny("path traversal", Severity::High);
                }
                Decision::allow("path subject to allowlist check")
            }
            SafetyDomain::Network => {
                let allowed = policy
                    .network
                    .allowed_domains
                    .iter()
                    .any(|d| d == action);
                if allowed {
                    Decision::allow(format!("domain {action} allowlisted"))
                } else if policy.network.log_only {
                    Decision::allow(format!("domain {action} not allowlisted (log-only)"))
                } else {
                    Decision::deny(format!("egress to {action} denied"), Severity::High)
                }
            }
            SafetyDomain::Injection => {
                if !policy.injection.enabled {
                    return Decision::allow("injection screening disabled");
                }
                let severity = serde_yaml::from_str::<Severity>(action)
                    .unwrap_or(Severity::Low);
                match policy.injection.block_at {
                    Some(block_at) if severity >= block_at => {
                        Decision::deny(format!("injection severity {severity}"), severity)
                    }
                    _ => Decision::allow(format!("injection severity {severity} below block threshold")),
                }
            }
        }
    }

    /// Append a violation to the bounded ring (idempotent for consecutive
    /// duplicates) and log it for the telemetry flush.
    pub fn record_violation(&self, violation: PolicyViolation) {
        detrace_core::obs::emit_policy_violation(
            violation.session_id.as_deref().unwrap_or("-"),
            &violation.domain.to_string(),
            &violation.violation_type,
            &violation.severity.to_string(),
        );
        self.violations.record(violation);
    }

    /// Violations recorded so far, oldest first.
    pub fn violations(&self) -> Vec<PolicyViolation> {
        self.violations.snapshot()
    }
}

impl Default for PolicyManager {
    fn default() -> Self {
        Self::new()
    }
}
