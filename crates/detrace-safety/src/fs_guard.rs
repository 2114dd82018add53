//! Filesystem controller: allowlist-rooted path validation for adapters.
//!
//! Every adapter file access goes through here. The allowlist is the repo
//! root, the per-run temp dir, and any extra roots the policy names.
//! Traversal components are rejected before resolution, and the resolved
//! path (symlinks followed) must still land under an allowed root, so a
//! symlink pointing outside the allowlist cannot escape.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, SafetyError};
use crate::policy::{Policy, SafetyDomain, Severity};

/// Access mode for a filesystem decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsAccess {
    Read,
    Write,
}

/// Path validator bound to a policy and the run's allowed roots.
pub struct FilesystemController {
    policy: Arc<Policy>,
    roots: Vec<PathBuf>,
}

impl std::fmt::Debug for FilesystemController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemController")
            .field("policy", &self.policy.name)
            .field("roots", &self.roots)
            .finish()
    }
}

impl FilesystemController {
    /// Build a controller for one run. `repo_root` and `run_temp` are
    /// canonicalized now so later prefix checks compare resolved paths.
    pub fn new(policy: Arc<Policy>, repo_root: &Path, run_temp: &Path) -> Result<Self> {
        let mut roots = Vec::new();
        for root in [repo_root, run_temp]
            .into_iter()
            .chain(policy.filesystem.extra_roots.iter().map(PathBuf::as_path))
        {
            // Roots that do not exist yet (e.g. the temp dir) are kept as
            // given; existing roots are canonicalized.
            roots.push(root.canonicalize().unwrap_or_else(|_| root.to_path_buf()));
        }
        Ok(Self { policy, roots })
    }

    /// Validate a read. Returns the resolved path on success.
    pub fn validate_read(&self, path: &Path) -> Result<PathBuf> {
        self.validate(path, FsAccess::Read, 0)
    }

    /// Validate a write of `size` bytes. Returns the resolved path.
    pub fn validate_write(&self, path: &Path, size: u64) -> Result<PathBuf> {
        self.validate(path, FsAccess::Write, size)
    }

    fn validate(&self, path: &Path, access: FsAccess, size: u64) -> Result<PathBuf> {
        let verdict = self.check(path, access, size);
        match &verdict {
            Ok(resolved) => {
                tracing::debug!(
                    event = "fs.access_allowed",
                    path = %resolved.display(),
                    mode = ?access,
                );
            }
            Err(e) => {
                tracing::warn!(
                    event = "fs.access_denied",
                    path = %path.display(),
                    mode = ?access,
                    reason = %e,
                );
            }
        }
        verdict
    }

    fn check(&self, path: &Path, access: FsAccess, size: u64) -> Result<PathBuf> {
        let deny = |reason: String, severity: Severity| {
            Err(SafetyError::denied(SafetyDomain::Filesystem, severity, reason))
        };

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return deny(
                format!("traversal component in {}", path.display()),
                Severity::High,
            );
        }

        // Resolve symlinks on the deepest existing ancestor, then re-attach
        // the not-yet-created tail so new files are checked too.
        let resolved = resolve_with_tail(path);

        if !self.roots.iter().any(|root| resolved.starts_with(root)) {
            return deny(
                format!("{} escapes the allowed roots", resolved.display()),
                Severity::High,
            );
        }

        if access == FsAccess::Write {
            if size > self.policy.filesystem.max_write_bytes {
                return deny(
                    format!(
                        "write of {size} bytes exceeds limit {}",
                        self.policy.filesystem.max_write_bytes
                    ),
                    Severity::Medium,
                );
            }
            if let Some(allowed) = &self.policy.filesystem.allowed_extensions {
                let ext = resolved
                    .extension()
                    .map(|e| e.to_string_lossy().to_string())
                    .unwrap_or_default();
                if !allowed.iter().any(|a| a == &ext) {
                    return deny(
                        format!("extension {ext:?} not in write allowlist"),
                        Severity::Medium,
                    );
                }
            }
        }

        Ok(resolved)
    }
}

/// Canonicalize the deepest existing ancestor of `path` and append the
/// remaining components. Symlinks in the existing part are resolved.
fn resolve_with_tail(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(resolved) => {
                let mut out = resolved;
                for part in tail.iter().rev() {
                    out.push(part);
                }
                return out;
            }
            Err(_) => match existing.file_name() {
                Some(name) => {
                    tail.push(name.to_os_string());
                    existing.pop();
                }
                None => {
                    let mut out = existing;
                    for part in tail.iter().rev() {
                        out.push(part);
                    }
                    return out;
                }
            },
        }
    }
}
