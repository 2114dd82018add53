//! Sandboxed execution of untrusted code.
//!
//! The portable backend is a subprocess with OS-level resource limits
//! (`ulimit` for CPU, address space, and file descriptors on Unix) plus an
//! in-process wall-clock timeout. Container isolation uses the same request
//! and outcome shapes and is selected by the policy's `backend` field.
//!
//! Kill paths are bounded: after `start_kill` the executor waits at most
//! `kill_grace_ms` for the process to be reaped before reporting. A circuit
//! breaker opens after repeated spawn failures so a broken sandbox host
//! fails fast instead of hammering the spawn path.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;

use crate::error::{Result, SafetyError};
use crate::policy::Policy;

/// A request to run one command in the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub program: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<std::path::PathBuf>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl ExecRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

/// Why a sandboxed process was killed, when it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KilledReason {
    Timeout,
    Cancelled,
}

/// Structured result of one sandboxed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub killed_reason: Option<KilledReason>,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.killed_reason.is_none()
    }
}

/// Opens after N consecutive spawn failures; resets on success.
#[derive(Debug)]
pub struct SpawnBreaker {
    consecutive_failures: AtomicU32,
    threshold: u32,
}

impl SpawnBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            threshold,
        }
    }

    pub fn is_open(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) >= self.threshold
    }

    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

/// Sandbox executor bound to one policy.
pub struct SandboxExecutor {
    policy: Arc<Policy>,
    breaker: SpawnBreaker,
}

impl std::fmt::Debug for SandboxExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxExecutor")
            .field("policy", &self.policy.name)
            .finish()
    }
}

impl SandboxExecutor {
    pub fn new(policy: Arc<Policy>) -> Self {
        let threshold = policy.execution.breaker_threshold.max(1);
        Self {
            policy,
            breaker: SpawnBreaker::new(threshold),
        }
    }

    /// Run a command to completion under the policy's limits.
    pub async fn execute(&self, req: &ExecRequest) -> Result<ExecOutcome> {
        let (never_tx, never_rx) = watch::channel(false);
        let outcome = self.execute_cancellable(req, never_rx).await;
        drop(never_tx);
        outcome
    }

    /// Run a command, killing it (within the grace window) if `cancel`
    /// flips to true.
    pub async fn execute_cancellable(
        &self,
        req: &ExecRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ExecOutcome> {
        if self.breaker.is_open() {
            return Err(SafetyError::CircuitOpen {
                consecutive_failures: self.breaker.failure_count(),
            });
        }

        let limits = &self.policy.execution;
        let start = Instant::now();
        let mut child = self.spawn_with_retries(req).await?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let out_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let err_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let wall = Duration::from_millis(limits.max_wall_time_ms);
        let killed_reason;
        let status = tokio::select! {
            status = child.wait() => {
                killed_reason = None;
                Some(status?)
            }
            _ = tokio::time::sleep(wall) => {
                killed_reason = Some(KilledReason::Timeout);
                None
            }
            changed = cancel.changed() => {
                // A dropped sender means no cancellation will ever arrive.
                if changed.is_ok() && *cancel.borrow() {
                    killed_reason = Some(KilledReason::Cancelled);
                    None
                } else {
                    killed_reason = None;
                    Some(child.wait().await?)
                }
            }
        };

        let status = match status {
            Some(status) => Some(status),
            None => {
                let _ = child.start_kill();
                let grace = Duration::from_millis(limits.kill_grace_ms);
                (tokio::time::timeout(grace, child.wait()).await)
                    .ok()
                    .and_then(|r| r.ok())
            }
        };

        let stdout = out_task.await.unwrap_or_default();
        let stderr = err_task.await.unwrap_or_default();
        let duration_ms = start.elapsed().as_millis() as u64;

        let exit_code = match (&status, killed_reason) {
            (Some(status), None) => status.code().unwrap_or(-1),
            _ => -1,
        };

        tracing::info!(
            event = "sandbox.exec_finished",
            program = %req.program,
            exit_code = exit_code,
            duration_ms = duration_ms,
            killed = ?killed_reason,
        );

        Ok(ExecOutcome {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            duration_ms,
            killed_reason,
        })
    }

    async fn spawn_with_retries(&self, req: &ExecRequest) -> Result<tokio::process::Child> {
        let limits = &self.policy.execution;
        let max_attempts = limits.max_retries + 1;
        let mut last_err: Option<std::io::Error> = None;

        for attempt in 1..=max_attempts {
            let mut cmd = self.build_command(req);
            match cmd.spawn() {
                Ok(child) => {
                    self.breaker.record_success();
                    return Ok(child);
                }
                Err(e) => {
                    self.breaker.record_failure();
                    last_err = Some(e);
                    if attempt < max_attempts {
                        let delay = limits.backoff_base_ms * 2u64.pow(attempt - 1);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        Err(SafetyError::SandboxFailed {
            attempts: max_attempts,
            reason: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "spawn failed".to_string()),
        })
    }

    #[cfg(unix)]
    fn build_command(&self, req: &ExecRequest) -> Command {
        let limits = &self.policy.execution;
        // ulimit applies CPU seconds, address space (KiB), and fd caps to
        // the exec'd child; "$0"/"$@" passes the argv through unquoted-safe.
        let script = format!(
            "ulimit -t {} -v {} -n {} 2>/dev/null; exec \"$0\" \"$@\"",
            limits.max_cpu_seconds,
            limits.max_memory_mb * 1024,
            limits.max_open_files,
        );
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script).arg(&req.program).args(&req.args);
        self.apply_common(&mut cmd, req);
        cmd
    }

    #[cfg(not(unix))]
    fn build_command(&self, req: &ExecRequest) -> Command {
        let mut cmd = Command::new(&req.program);
        cmd.args(&req.args);
        self.apply_common(&mut cmd, req);
        cmd
    }

    fn apply_common(&self, cmd: &mut Command, req: &ExecRequest) {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env_clear()
            // A minimal PATH so the wrapper can resolve the program; the
            // host environment never leaks into the sandbox.
            .env("PATH", "/usr/local/bin:/usr/bin:/bin");
        for (k, v) in &req.env {
            cmd.env(k, v);
        }
        if let Some(cwd) = &req.cwd {
            cmd.current_dir(cwd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyLevel;

    fn executor() -> SandboxExecutor {
        let mut policy = Policy::builtin(PolicyLevel::Permissive);
        policy.execution.max_wall_time_ms = 5_000;
        SandboxExecutor::new(Arc::new(policy))
    }

    #[tokio::test]
    async fn test_execute_captures_stdout_and_exit_code() {
        let outcome = executor()
            .execute(&ExecRequest::new("echo").arg("hello"))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout.trim(), "hello");
        assert!(outcome.success());
    }

    #[tokio::test]
    async fn test_execute_nonzero_exit() {
        let outcome = executor()
            .execute(&ExecRequest::new("sh").arg("-c").arg("exit 3"))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_timeout_sets_killed_reason() {
        let mut policy = Policy::builtin(PolicyLevel::Permissive);
        policy.execution.max_wall_time_ms = 100;
        policy.execution.kill_grace_ms = 500;
        let executor = SandboxExecutor::new(Arc::new(policy));

        let outcome = executor
            .execute(&ExecRequest::new("sleep").arg("5"))
            .await
            .unwrap();
        assert_eq!(outcome.killed_reason, Some(KilledReason::Timeout));
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.duration_ms < 3_000);
    }

    #[tokio::test]
    async fn test_cancellation_kills_within_grace() {
        let mut policy = Policy::builtin(PolicyLevel::Permissive);
        policy.execution.max_wall_time_ms = 30_000;
        policy.execution.kill_grace_ms = 500;
        let executor = SandboxExecutor::new(Arc::new(policy));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            executor
                .execute_cancellable(&ExecRequest::new("sleep").arg("30"), rx)
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.killed_reason, Some(KilledReason::Cancelled));
        assert!(outcome.duration_ms < 5_000);
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_attempts() {
        let mut policy = Policy::builtin(PolicyLevel::Permissive);
        policy.execution.max_retries = 1;
        policy.execution.backoff_base_ms = 10;
        let executor = SandboxExecutor::new(Arc::new(policy));

        // /bin/sh exists, so force failure through a bad working directory.
        let req = ExecRequest::new("echo").cwd("/definitely/not/a/dir");
        let err = executor.execute(&req).await.unwrap_err();
        match err {
            SafetyError::SandboxFailed { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected SandboxFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_breaker_opens_after_threshold() {
        let mut policy = Policy::builtin(PolicyLevel::Permissive);
        policy.execution.max_retries = 0;
        policy.execution.breaker_threshold = 2;
        let executor = SandboxExecutor::new(Arc::new(policy));

        let bad = ExecRequest::new("echo").cwd("/definitely/not/a/dir");
        let _ = executor.execute(&bad).await;
        let _ = executor.execute(&bad).await;

        let err = executor.execute(&ExecRequest::new("echo")).await.unwrap_err();
        match err {
            SafetyError::CircuitOpen { consecutive_failures } => {
                assert!(consecutive_failures >= 2);
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[test]
    fn test_breaker_resets_on_success() {
        let b = SpawnBreaker::new(3);
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.failure_count(), 0);
        assert!(!b.is_open());
    }
}
