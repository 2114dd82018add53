//! Structured observability hooks for the run lifecycle.
//!
//! Emission goes through `tracing` at `info!` level (filterable via the
//! `DETRACE_LOG` env var; JSON output with `DETRACE_LOG_FORMAT=json`).
//! These hooks are operator telemetry only and are never part of the
//! recorded event ledger.

use tracing::info;

use crate::events::Event;

/// RAII guard that enters a run-scoped tracing span.
///
/// While held, every tracing call is tagged with the run id.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        let span = tracing::info_span!("detrace.run", run_id = %run_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit: run started.
pub fn emit_run_started(run_id: &str, framework: &str, task_id: &str, seed: u64) {
    info!(
        event = "run.started",
        run_id = %run_id,
        framework = %framework,
        task_id = %task_id,
        seed = seed,
    );
}

/// Emit: run finished with its terminal status.
pub fn emit_run_finished(run_id: &str, status: &str, duration_ms: u64, total_events: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        duration_ms = duration_ms,
        total_events = total_events,
    );
}

/// Emit: one event appended to the ledger.
pub fn emit_event_appended(run_id: &str, event: &Event) {
    info!(
        event = "run.event_appended",
        run_id = %run_id,
        kind = ?event.event_type,
        step = event.step,
    );
}

/// Emit: a policy violation was recorded.
pub fn emit_policy_violation(run_id: &str, domain: &str, violation_type: &str, severity: &str) {
    tracing::warn!(
        event = "policy.violation",
        run_id = %run_id,
        domain = %domain,
        violation_type = %violation_type,
        severity = %severity,
    );
}

/// Emit: a replay assertion (miss or mismatch).
pub fn emit_replay_assert(run_id: &str, reason: &str, fatal: bool) {
    tracing::warn!(
        event = "replay.assert",
        run_id = %run_id,
        reason = %reason,
        fatal = fatal,
    );
}

/// Emit: a consensus evaluation completed.
pub fn emit_consensus_evaluated(task_id: &str, decision: &str, confidence: f64, reliability: f64) {
    info!(
        event = "consensus.evaluated",
        task_id = %task_id,
        decision = %decision,
        confidence = confidence,
        reliability = reliability,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _span = RunSpan::enter("test-run-id");
    }

    #[test]
    fn test_emitters_do_not_panic() {
        emit_run_started("r", "fw", "t", 1);
        emit_run_finished("r", "ok", 10, 3);
        emit_policy_violation("r", "network", "egress_denied", "high");
        emit_replay_assert("r", "lookup_miss", true);
        emit_consensus_evaluated("t", "pass", 0.2, 0.7);
    }
}
