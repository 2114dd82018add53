//! Safety error taxonomy.

use crate::policy::{SafetyDomain, Severity};

/// Errors raised by the policy manager and enforcers.
#[derive(Debug, thiserror::Error)]
pub enum SafetyError {
    #[error("policy violation [{domain}/{severity}]: {reason}")]
    Violation {
        domain: SafetyDomain,
        severity: Severity,
        reason: String,
    },

    #[error("invalid policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: String },

    #[error("unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("sandbox timeout after {elapsed_ms}ms (limit {limit_ms}ms)")]
    SandboxTimeout { elapsed_ms: u64, limit_ms: u64 },

    #[error("sandbox execution failed after {attempts} attempt(s): {reason}")]
    SandboxFailed { attempts: u32, reason: String },

    #[error("sandbox circuit open after {consecutive_failures} consecutive failures")]
    CircuitOpen { consecutive_failures: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SafetyError {
    /// Denial with the given domain/severity. Convenience for enforcers.
    pub fn denied(domain: SafetyDomain, severity: Severity, reason: impl Into<String>) -> Self {
        SafetyError::Violation {
            domain,
            severity,
            reason: reason.into(),
        }
    }
}

/// Result type for safety operations.
pub type Result<T> = std::result::Result<T, SafetyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_display_names_domain_and_severity() {
        let err = SafetyError::denied(SafetyDomain::Network, Severity::High, "egress to evil.example");
        let msg = err.to_string();
        assert!(msg.contains("network"));
        assert!(msg.contains("high"));
        assert!(msg.contains("evil.example"));
    }
}
