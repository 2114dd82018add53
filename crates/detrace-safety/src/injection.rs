//! Prompt-injection screening for LLM edge inputs and outputs.
//!
//! Severity-ranked pattern rules; the highest-severity match decides the
//! verdict, and the policy maps severities to actions (allow, warn, block).
//! In replay mode the recorded verdict is replayed, never recomputed, so
//! screener rule updates cannot change a recorded trajectory.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::policy::{Policy, Severity};

/// Action derived from the policy for a screening verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenAction {
    Allow,
    Warn,
    Block,
}

/// Outcome of screening one text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenVerdict {
    pub action: ScreenAction,
    /// Highest severity among matches; `None` when nothing matched.
    pub severity: Option<Severity>,
    /// Names of the rules that fired.
    pub matched: Vec<String>,
}

impl ScreenVerdict {
    pub fn clean() -> Self {
        Self {
            action: ScreenAction::Allow,
            severity: None,
            matched: Vec::new(),
        }
    }
}

struct Rule {
    name: String,
    severity: Severity,
    regex: Regex,
}

/// Pattern-based screener bound to one policy.
pub struct InjectionScreener {
    policy: Arc<Policy>,
    rules: Vec<Rule>,
}

impl std::fmt::Debug for InjectionScreener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectionScreener")
            .field("policy", &self.policy.name)
            .field("rules", &self.rules.len())
            .finish()
    }
}

impl InjectionScreener {
    /// Compile the built-in rules plus the policy's extra patterns.
    /// Pattern validity was checked at policy validation.
    pub fn new(policy: Arc<Policy>) -> Self {
        let mut rules = Vec::new();
        for (name, severity, pattern) in BUILTIN_RULES {
            if let Ok(regex) = Regex::new(pattern) {
                rules.push(Rule {
                    name: (*name).to_string(),
                    severity: *severity,
                    regex,
                });
            }
        }
        for def in &policy.injection.extra_patterns {
            if let Ok(regex) = Regex::new(&def.pattern) {
                rules.push(Rule {
                    name: def.name.clone(),
                    severity: def.severity,
                    regex,
                });
            }
        }
        Self { policy, rules }
    }

    /// Screen a text and map the result through the policy's thresholds.
    pub fn screen(&self, text: &str) -> ScreenVerdict {
        if !self.policy.injection.enabled {
            return ScreenVerdict::clean();
        }

        let mut matched = Vec::new();
        let mut severity: Option<Severity> = None;
        for rule in &self.rules {
            if rule.regex.is_match(text) {
                matched.push(rule.name.clone());
                severity = Some(severity.map_or(rule.severity, |s| s.max(rule.severity)));
            }
        }

        let Some(severity_hit) = severity else {
            return ScreenVerdict::clean();
        };

        let injection = &self.policy.injection;
        let action = match injection.block_at {
            Some(block_at) if severity_hit >= block_at => ScreenAction::Block,
            _ if severity_hit >= injection.warn_at => ScreenAction::Warn,
            _ => ScreenAction::Allow,
        };

        if action != ScreenAction::Allow {
            tracing::warn!(
                event = "injection.matched",
                action = ?action,
                severity = %severity_hit,
                rules = ?matched,
            );
        }

        ScreenVerdict {
            action,
            severity: Some(severity_hit),
            matched,
        }
    }
}

const BUILTIN_RULES: &[(&str, Severity, &str)] = &[
    (
        "ignore_previous_instructions",
        Severity::High,
        r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+instructions",
    ),
    (
        "system_prompt_exfiltration",
        Severity::High,
        r"(?i)(reveal|print|repeat|show)\s+(your\s+)?(system\s+prompt|initial\s+instructions)",
    ),
    (
        "role_override",
        Severity::Critical,
        r"(?i)you\s+are\s+now\s+(dan|developer\s+mode|jailbroken)",
    ),
    (
        "instruction_smuggling_tags",
        Severity::Medium,
        r"(?i)<\s*(system|assistant)\s*>",
    ),
    (
        "exfiltrate_secrets",
        Severity::Critical,
        r"(?i)(send|post|upload)\s+.{0,40}(api\s*key|credential|token|password)s?\s+to\s+",
    ),
    (
        "base64_payload",
        Severity::Low,
        r"[A-Za-z0-9+/]{120,}={0,2}",
    ),
];
