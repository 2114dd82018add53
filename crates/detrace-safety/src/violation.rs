//! Policy violation records and the bounded in-memory ring.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::{SafetyDomain, Severity};

/// One recorded policy violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub ts: DateTime<Utc>,
    pub domain: SafetyDomain,
    pub policy_name: String,
    pub violation_type: String,
    pub severity: Severity,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl PolicyViolation {
    pub fn new(
        domain: SafetyDomain,
        policy_name: impl Into<String>,
        violation_type: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            ts: Utc::now(),
            domain,
            policy_name: policy_name.into(),
            violation_type: violation_type.into(),
            severity,
            description: description.into(),
            session_id: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Equality ignoring the timestamp; used for idempotent appends.
    fn same_incident(&self, other: &Self) -> bool {
        self.domain == other.domain
            && self.violation_type == other.violation_type
            && self.description == other.description
            && self.session_id == other.session_id
    }
}

/// Bounded ring of recent violations. Appends are idempotent: a violation
/// identical to the most recent one (timestamp aside) is dropped.
pub struct ViolationRing {
    inner: Mutex<VecDeque<PolicyViolation>>,
    capacity: usize,
}

impl ViolationRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    pub fn record(&self, violation: PolicyViolation) {
        let mut ring = self.inner.lock().expect("violation ring lock poisoned");
        if ring.back().is_some_and(|last| last.same_incident(&violation)) {
            return;
        }
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(violation);
    }

    pub fn snapshot(&self) -> Vec<PolicyViolation> {
        self.inner
            .lock()
            .expect("violation ring lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("violation ring lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(desc: &str) -> PolicyViolation {
        PolicyViolation::new(
            SafetyDomain::Network,
            "standard",
            "egress_denied",
            Severity::High,
            desc,
        )
    }

    #[test]
    fn test_ring_appends_in_order() {
        let ring = ViolationRing::new(8);
        ring.record(violation("a"));
        ring.record(violation("b"));
        let all = ring.snapshot();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].description, "a");
        assert_eq!(all[1].description, "b");
    }

    #[test]
    fn test_ring_drops_consecutive_duplicates() {
        let ring = ViolationRing::new(8);
        ring.record(violation("same"));
        ring.record(violation("same"));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_ring_is_bounded() {
        let ring = ViolationRing::new(3);
        for i in 0..10 {
            ring.record(violation(&format!("v{i}")));
        }
        let all = ring.snapshot();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].description, "v7");
        assert_eq!(all[2].description, "v9");
    }
}
