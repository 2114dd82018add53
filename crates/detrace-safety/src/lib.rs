//! detrace-safety: the policy manager and its four enforcement surfaces.
//!
//! Policies are declarative, validated at load, and immutable once
//! installed. Enforcement happens at the edges:
//!
//! - [`sandbox`]: resource-capped execution of untrusted code
//! - [`fs_guard`]: filesystem allowlist with traversal/symlink defenses
//! - [`net_guard`]: default-deny egress with per-domain rate limits
//! - [`injection`]: prompt-injection screening on LLM inputs and outputs
//!
//! Every denial flows back through [`policy::PolicyManager::record_violation`]
//! so the run ledger carries a `policy_violation` event for each one.

pub mod error;
pub mod fs_guard;
pub mod injection;
pub mod net_guard;
pub mod policy;
pub mod sandbox;
pub mod violation;

pub use error::{SafetyError, Result};
pub use fs_guard::FilesystemController;
pub use injection::{InjectionScreener, ScreenAction, ScreenVerdict};
pub use net_guard::NetworkController;
pub use policy::{
    Decision, ExecutionPolicy, FilesystemPolicy, InjectionPolicy, NetworkPolicy, Policy,
    PolicyLevel, PolicyManager, PolicyOverrides, SafetyDomain, Severity,
};
pub use sandbox::{ExecOutcome, ExecRequest, KilledReason, SandboxExecutor};
pub use violation::{PolicyViolation, ViolationRing};
