//! Network controller: default-deny egress gating for adapters.
//!
//! Adapters declare every outbound request (protocol + domain) before
//! opening a connection; the controller answers allow/deny. Denials are
//! fatal to the calling edge. Replay mode locks the controller so every
//! request is denied regardless of policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::{Result, SafetyError};
use crate::policy::{Policy, SafetyDomain, Severity};

/// Per-domain token bucket: `requests_per_minute` tokens, refilled
/// continuously.
struct RateBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Egress gatekeeper bound to one policy.
pub struct NetworkController {
    policy: Arc<Policy>,
    buckets: Mutex<HashMap<String, RateBucket>>,
    /// When set, every request is denied (replay mode).
    replay_locked: bool,
}

impl std::fmt::Debug for NetworkController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkController")
            .field("policy", &self.policy.name)
            .field("replay_locked", &self.replay_locked)
            .finish()
    }
}

impl NetworkController {
    pub fn new(policy: Arc<Policy>) -> Self {
        Self {
            policy,
            buckets: Mutex::new(HashMap::new()),
            replay_locked: false,
        }
    }

    /// Controller for replay: network disabled regardless of policy.
    pub fn replay_locked(policy: Arc<Policy>) -> Self {
        Self {
            replay_locked: true,
            ..Self::new(policy)
        }
    }

    /// Authorize one outbound request. Errors are policy violations and
    /// must fail the calling edge.
    pub fn authorize(&self, protocol: &str, domain: &str) -> Result<()> {
        let verdict = self.check(protocol, domain);
        match &verdict {
            Ok(()) => {
                tracing::debug!(event = "net.egress_allowed", protocol = %protocol, domain = %domain);
            }
            Err(e) => {
                tracing::warn!(event = "net.egress_denied", protocol = %protocol, domain = %domain, reason = %e);
            }
        }
        verdict
    }

    fn check(&self, protocol: &str, domain: &str) -> Result<()> {
        if self.replay_locked {
            return Err(SafetyError::denied(
                SafetyDomain::Network,
                Severity::Critical,
                format!("network disabled under replay: {protocol}://{domain}"),
            ));
        }

        let net = &self.policy.network;

        if !net.allowed_protocols.iter().any(|p| p == protocol) {
            if net.log_only {
                return Ok(());
            }
            return Err(SafetyError::denied(
                SafetyDomain::Network,
                Severity::High,
                format!("protocol {protocol} not allowed"),
            ));
        }

        let domain_allowed = net.allowed_domains.iter().any(|d| d == domain);
        if !domain_allowed {
            if net.log_only {
                return Ok(());
            }
            return Err(SafetyError::denied(
                SafetyDomain::Network,
                Severity::High,
                format!("egress to {domain} denied"),
            ));
        }

        self.take_token(domain)
    }

    fn take_token(&self, domain: &str) -> Result<()> {
        let per_minute = self.policy.network.requests_per_minute;
        if per_minute == 0 {
            return Err(SafetyError::denied(
                SafetyDomain::Network,
                Severity::High,
                format!("rate limit is zero for {domain}"),
            ));
        }

        let mut buckets = self.buckets.lock().expect("rate bucket lock poisoned");
        let bucket = buckets.entry(domain.to_string()).or_insert(RateBucket {
            tokens: per_minute as f64,
            last_refill: Instant::now(),
        });

        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * per_minute as f64 / 60.0).min(per_minute as f64);
        bucket.last_refill = Instant::now();

        if bucket.tokens < 1.0 {
            return Err(SafetyError::denied(
                SafetyDomain::Network,
                Severity::Medium,
                format!("rate limit exceeded for {domain}"),
            ));
        }
        bucket.tokens -= 1.0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{NetworkPolicy, PolicyLevel};

    fn policy_with(domains: &[&str], per_minute: u32) -> Arc<Policy> {
        let mut policy = Policy::builtin(PolicyLevel::Standard);
        policy.network = NetworkPolicy {
            allowed_domains: domains.iter().map(|s| s.to_string()).collect(),
            allowed_protocols: vec!["https".to_string()],
            requests_per_minute: per_minute,
            log_only: false,
        };
        Arc::new(policy)
    }

    #[test]
    fn test_default_deny() {
        let c = NetworkController::new(policy_with(&[], 60));
        assert!(c.authorize("https", "example.com").is_err());
    }

    #[test]
    fn test_allowlisted_domain_passes() {
        let c = NetworkController::new(policy_with(&["api.example.com"], 60));
        assert!(c.authorize("https", "api.example.com").is_ok());
        assert!(c.authorize("https", "other.example.com").is_err());
    }

    #[test]
    fn test_protocol_allowlist() {
        let c = NetworkController::new(policy_with(&["api.example.com"], 60));
        assert!(c.authorize("http", "api.example.com").is_err());
        assert!(c.authorize("ftp", "api.example.com").is_err());
    }

    #[test]
    fn test_rate_limit_exhausts() {
        let c = NetworkController::new(policy_with(&["api.example.com"], 3));
        for _ in 0..3 {
            assert!(c.authorize("https", "api.example.com").is_ok());
        }
        assert!(c.authorize("https", "api.example.com").is_err());
    }

    #[test]
    fn test_rate_limit_is_per_domain() {
        let c = NetworkController::new(policy_with(&["a.example.com", "b.example.com"], 1));
        assert!(c.authorize("https", "a.example.com").is_ok());
        assert!(c.authorize("https", "b.example.com").is_ok());
    }

    #[test]
    fn test_log_only_allows_everything_but_logs() {
        let mut policy = Policy::builtin(PolicyLevel::Permissive);
        policy.network.log_only = true;
        let c = NetworkController::new(Arc::new(policy));
        assert!(c.authorize("https", "anywhere.example").is_ok());
    }

    #[test]
    fn test_replay_lock_denies_even_allowlisted() {
        let c = NetworkController::replay_locked(policy_with(&["api.example.com"], 60));
        let err = c.authorize("https", "api.example.com").unwrap_err();
        match err {
            SafetyError::Violation { severity, .. } => assert_eq!(severity, Severity::Critical),
            other => panic!("expected Violation, got {other:?}"),
        }
    }
}
