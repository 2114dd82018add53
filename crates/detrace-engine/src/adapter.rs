//! The adapter contract: what every orchestrator integration implements.
//!
//! Adapters never touch the OS directly. Code execution goes through the
//! sandbox, file and network access through the enforcers, nondeterminism
//! through the providers, and every I/O edge through the [`EdgeRunner`]
//! handed to them in the [`RunContext`]. The edge runner is the recorder in
//! live runs and the replay engine in replayed runs; the adapter cannot
//! tell the difference, which is the point.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use detrace_core::{
    EdgeKind, Event, EventType, Providers, RunId, RunStatus, TelemetryBus,
};
use detrace_safety::{
    FilesystemController, InjectionScreener, NetworkController, Policy, SandboxExecutor,
};

use crate::error::{EngineError, Result};

/// A benchmark task handed to an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub input: Value,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            input,
        }
    }
}

/// Parity mode: apply changes, or produce a plan only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParityMode {
    Autonomous,
    Advisory,
}

/// One I/O edge invocation as seen by the edge runner.
#[derive(Debug, Clone)]
pub struct EdgeCall {
    pub edge_kind: EdgeKind,
    pub agent_id: String,
    /// Tool or model name.
    pub name: String,
    pub input: Value,
}

/// What a live edge produced.
#[derive(Debug, Clone, Default)]
pub struct EdgeOutput {
    pub value: Value,
    /// Streamed chunks, in order, for LLM edges.
    pub chunks: Option<Vec<Value>>,
    pub token_in: Option<u64>,
    pub token_out: Option<u64>,
    pub cost_estimate: Option<f64>,
}

impl EdgeOutput {
    pub fn of(value: Value) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }
}

/// Failure of a live edge closure. Policy denials keep their type so the
/// recorder can log the violation and the process can exit with the right
/// code; everything else collapses to a message.
#[derive(Debug)]
pub enum EdgeError {
    Policy(detrace_safety::SafetyError),
    Failed(String),
}

impl From<detrace_safety::SafetyError> for EdgeError {
    fn from(e: detrace_safety::SafetyError) -> Self {
        match e {
            detrace_safety::SafetyError::Violation { .. } => EdgeError::Policy(e),
            other => EdgeError::Failed(other.to_string()),
        }
    }
}

impl From<String> for EdgeError {
    fn from(message: String) -> Self {
        EdgeError::Failed(message)
    }
}

/// Boxed future returned by an edge's live execution closure.
pub type EdgeFuture =
    Pin<Box<dyn Future<Output = std::result::Result<EdgeOutput, EdgeError>> + Send>>;

/// The live execution closure an adapter passes to the edge runner. Under
/// strict replay it is never invoked.
pub type EdgeFn = Box<dyn FnOnce() -> EdgeFuture + Send>;

/// Uniform wrapper over every I/O edge: the recorder when live, the replay
/// engine when replaying.
#[async_trait]
pub trait EdgeRunner: Send + Sync {
    async fn run_edge(&self, call: EdgeCall, run: EdgeFn) -> Result<Value>;
}

/// Everything an adapter needs for one run.
pub struct RunContext {
    pub run_id: RunId,
    pub bus: Arc<TelemetryBus>,
    pub edges: Arc<dyn EdgeRunner>,
    pub providers: Arc<Providers>,
    pub policy: Arc<Policy>,
    pub parity: ParityMode,
    pub sandbox: Arc<SandboxExecutor>,
    pub fs: Arc<FilesystemController>,
    pub net: Arc<NetworkController>,
    pub screener: Arc<InjectionScreener>,
}

impl RunContext {
    /// Snapshot of the events emitted so far, in step order.
    pub fn events(&self) -> Vec<Event> {
        self.bus.events_snapshot()
    }
}

/// Task-level outcome reported by an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterOutcome {
    pub verified_pass: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_score: Option<f64>,
    pub summary: Value,
}

/// The result of one run, live or replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    pub verified_pass: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_score: Option<f64>,
    pub duration_ms: u64,
    pub token_total: u64,
    /// Equals the run id; included for log correlation.
    pub trace_id: String,
    pub seed: u64,
}

/// The contract every orchestrator integration implements.
#[async_trait]
pub trait Adapter: Send + Sync + std::fmt::Debug {
    /// Framework name, e.g. `"scripted"`.
    fn name(&self) -> &str;

    /// Adapter version recorded in the manifest.
    fn version(&self) -> &str {
        "0.0.0"
    }

    /// Apply framework configuration. Called once before any run.
    async fn configure(&mut self, config: Value) -> Result<()>;

    /// Execute one task, routing every edge through `ctx.edges`.
    async fn run_task(&self, task: &TaskSpec, ctx: &RunContext) -> Result<AdapterOutcome>;
}

// ============================================================================
// SCRIPTED ADAPTER
// ============================================================================

/// One pre-scripted edge call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedCall {
    pub edge_kind: EdgeKind,
    pub agent_id: String,
    pub name: String,
    pub input: Value,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<Value>>,
    #[serde(default)]
    pub token_in: u64,
    #[serde(default)]
    pub token_out: u64,
}

/// Deterministic in-process adapter driven by a script of edge calls.
///
/// Used by the conformance tests and by the CLI's `scripted` framework:
/// live runs produce the scripted outputs, replayed runs must reproduce
/// them from the recording alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptedAdapter {
    pub calls: Vec<ScriptedCall>,
    pub verified_pass: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_score: Option<f64>,
}

impl ScriptedAdapter {
    /// The single-LLM-call script used by the smoke scenarios.
    pub fn echo_hello() -> Self {
        Self {
            calls: vec![ScriptedCall {
                edge_kind: EdgeKind::Llm,
                agent_id: "agent-0".to_string(),
                name: "test-model".to_string(),
                input: serde_json::json!({"prompt": "say hi"}),
                output: serde_json::json!({"text": "hi"}),
                chunks: None,
                token_in: 2,
                token_out: 1,
            }],
            verified_pass: true,
            verification_score: Some(1.0),
        }
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn configure(&mut self, config: Value) -> Result<()> {
        if config.is_null() {
            return Ok(());
        }
        *self = serde_json::from_value(config)
            .map_err(|e| EngineError::Configuration(format!("scripted adapter config: {e}")))?;
        Ok(())
    }

    async fn run_task(&self, _task: &TaskSpec, ctx: &RunContext) -> Result<AdapterOutcome> {
        for call in &self.calls {
            let edge = EdgeCall {
                edge_kind: call.edge_kind,
                agent_id: call.agent_id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            };
            let scripted = call.clone();
            ctx.edges
                .run_edge(
                    edge,
                    Box::new(move || {
                        Box::pin(async move {
                            Ok(EdgeOutput {
                                value: scripted.output,
                                chunks: scripted.chunks,
                                token_in: Some(scripted.token_in),
                                token_out: Some(scripted.token_out),
                                cost_estimate: None,
                            })
                        })
                    }),
                )
                .await?;
        }
        Ok(AdapterOutcome {
            verified_pass: self.verified_pass,
            verification_score: self.verification_score,
            summary: serde_json::json!({"calls": self.calls.len()}),
        })
    }
}

// ============================================================================
// CONFORMANCE CHECKS
// ============================================================================

/// Validate the core stream invariants over a finished run's events.
///
/// - assigned steps form a strict increasing gapless sequence from 0
///   (terminal and chunk events reuse their call's step)
/// - every `*.started` has exactly one terminal `*.finished` or
///   `adapter_error` at the same step
/// - chunk events only appear under an open `*.started` step
pub fn validate_stream(events: &[Event]) -> std::result::Result<(), String> {
    let mut expected_next = 0u64;
    let mut last_assigned: Option<u64> = None;
    let mut open: std::collections::HashMap<u64, EventType> = Default::default();
    let mut terminals: std::collections::HashMap<u64, usize> = Default::default();

    for event in events {
        let reuses_step = last_assigned == Some(event.step)
            && (matches!(event.event_type, EventType::LlmCallChunk | EventType::AdapterError)
                || event.event_type.is_finished());
        if reuses_step {
            match event.event_type {
                EventType::LlmCallChunk => {
                    if !open.contains_key(&event.step) {
                        return Err(format!("chunk at step {} with no open call", event.step));
                    }
                }
                _ => {
                    if open.remove(&event.step).is_none() {
                        return Err(format!(
                            "terminal event at step {} with no open started",
                            event.step
                        ));
                    }
                    *terminals.entry(event.step).or_insert(0) += 1;
                }
            }
            continue;
        }

        if event.step != expected_next {
            return Err(format!(
                "step {} out of sequence (expected {})",
                event.step, expected_next
            ));
        }
        expected_next += 1;
        last_assigned = Some(event.step);
        if event.event_type.is_started() {
            open.insert(event.step, event.event_type);
        }
    }

    if let Some((step, _)) = open.iter().next() {
        return Err(format!("started at step {step} never terminated"));
    }
    if let Some((step, n)) = terminals.iter().find(|(_, n)| **n > 1) {
        return Err(format!("step {step} has {n} terminal events"));
    }
    Ok(())
}

/// Check the minimal event sequence obligation: first event `agent_start`,
/// last event `agent_stop`, at least one edge in between.
pub fn minimal_sequence_ok(events: &[Event]) -> std::result::Result<(), String> {
    let first = events.first().ok_or("empty event stream")?;
    if first.event_type != EventType::AgentStart {
        return Err(format!("first event is {:?}, not agent_start", first.event_type));
    }
    let last = events.last().ok_or("empty event stream")?;
    if last.event_type != EventType::AgentStop {
        return Err(format!("last event is {:?}, not agent_stop", last.event_type));
    }
    if !events.iter().any(|e| e.edge_kind.is_some()) {
        return Err("no edge events between agent_start and agent_stop".to_string());
    }
    Ok(())
}

/// Compare two event streams for replay determinism, ignoring the
/// allow-listed nondeterministic fields (`run_id`, `ts`, `duration_ms`,
/// `cost_estimate`).
pub fn streams_equal(recorded: &[Event], replayed: &[Event]) -> std::result::Result<(), String> {
    if recorded.len() != replayed.len() {
        return Err(format!(
            "event count differs: recorded {} vs replayed {}",
            recorded.len(),
            replayed.len()
        ));
    }
    for (i, (a, b)) in recorded.iter().zip(replayed.iter()).enumerate() {
        let norm = |e: &Event| {
            let mut v = serde_json::to_value(e).unwrap_or(Value::Null);
            if let Value::Object(ref mut map) = v {
                map.remove("run_id");
                map.remove("ts");
                map.remove("duration_ms");
                map.remove("cost_estimate");
            }
            v
        };
        if norm(a) != norm(b) {
            return Err(format!(
                "event {} differs: {:?} vs {:?}",
                i, a.event_type, b.event_type
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(step: u64, event_type: EventType) -> Event {
        Event {
            run_id: RunId::nil(),
            framework: "fw".to_string(),
            agent_id: "a".to_string(),
            task_id: "t".to_string(),
            step,
            parent_step: None,
            call_index: None,
            ts: Utc::now(),
            event_type,
            edge_kind: match event_type {
                EventType::LlmCallStarted | EventType::LlmCallFinished | EventType::LlmCallChunk => {
                    Some(EdgeKind::Llm)
                }
                _ => None,
            },
            model: None,
            seed: Some(1),
            inputs_fingerprint: None,
            result_ref: None,
            duration_ms: None,
            token_in: None,
            token_out: None,
            cost_estimate: None,
            payload: Value::Null,
        }
    }

    #[test]
    fn test_validate_stream_accepts_paired_run() {
        let events = vec![
            event(0, EventType::AgentStart),
            event(1, EventType::LlmCallStarted),
            event(1, EventType::LlmCallChunk),
            event(1, EventType::LlmCallFinished),
            event(2, EventType::AgentStop),
        ];
        validate_stream(&events).unwrap();
    }

    #[test]
    fn test_validate_stream_rejects_gap() {
        let events = vec![event(0, EventType::AgentStart), event(2, EventType::AgentStop)];
        assert!(validate_stream(&events).is_err());
    }

    #[test]
    fn test_validate_stream_rejects_unterminated_started() {
        let events = vec![
            event(0, EventType::AgentStart),
            event(1, EventType::LlmCallStarted),
        ];
        assert!(validate_stream(&events).is_err());
    }

    #[test]
    fn test_validate_stream_rejects_orphan_chunk() {
        let events = vec![
            event(0, EventType::AgentStart),
            event(0, EventType::LlmCallChunk),
        ];
        assert!(validate_stream(&events).is_err());
    }

    #[test]
    fn test_validate_stream_accepts_adapter_error_terminal() {
        let events = vec![
            event(0, EventType::AgentStart),
            event(1, EventType::SandboxExecStarted),
            event(1, EventType::AdapterError),
            event(2, EventType::AgentStop),
        ];
        let mut events = events;
        events[1].edge_kind = Some(EdgeKind::Sandbox);
        validate_stream(&events).unwrap();
    }

    #[test]
    fn test_minimal_sequence() {
        let good = vec![
            event(0, EventType::AgentStart),
            event(1, EventType::LlmCallStarted),
            event(1, EventType::LlmCallFinished),
            event(2, EventType::AgentStop),
        ];
        minimal_sequence_ok(&good).unwrap();

        let no_edges = vec![event(0, EventType::AgentStart), event(1, EventType::AgentStop)];
        assert!(minimal_sequence_ok(&no_edges).is_err());
    }

    #[test]
    fn test_streams_equal_ignores_timestamps() {
        let mut a = vec![event(0, EventType::AgentStart)];
        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut b = vec![event(0, EventType::AgentStart)];
        a[0].duration_ms = Some(10);
        b[0].duration_ms = Some(99);
        streams_equal(&a, &b).unwrap();
    }

    #[test]
    fn test_streams_equal_detects_payload_drift() {
        let a = vec![event(0, EventType::AgentStart)];
        let mut b = vec![event(0, EventType::AgentStart)];
        b[0].payload = serde_json::json!({"x": 1});
        assert!(streams_equal(&a, &b).is_err());
    }
}
