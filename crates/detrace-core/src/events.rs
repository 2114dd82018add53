//! Run event schema: the append-only ground truth for every run.
//!
//! Events are created by the telemetry bus and never mutated. Everything
//! else (manifests, reports, replay indexes) derives from this stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 128-bit run identifier minted at run start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        RunId(Uuid::nil())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(RunId)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The nondeterministic I/O edges the core intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Llm,
    Tool,
    Sandbox,
    Vcs,
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EdgeKind::Llm => "llm",
            EdgeKind::Tool => "tool",
            EdgeKind::Sandbox => "sandbox",
            EdgeKind::Vcs => "vcs",
        };
        f.write_str(s)
    }
}

/// Event type tags. The wire names follow `<edge>.<phase>` convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "agent_start")]
    AgentStart,
    #[serde(rename = "agent_stop")]
    AgentStop,
    #[serde(rename = "llm_call.started")]
    LlmCallStarted,
    #[serde(rename = "llm_call.chunk")]
    LlmCallChunk,
    #[serde(rename = "llm_call.finished")]
    LlmCallFinished,
    #[serde(rename = "tool_call.started")]
    ToolCallStarted,
    #[serde(rename = "tool_call.finished")]
    ToolCallFinished,
    #[serde(rename = "sandbox_exec.started")]
    SandboxExecStarted,
    #[serde(rename = "sandbox_exec.finished")]
    SandboxExecFinished,
    #[serde(rename = "vcs_action")]
    VcsAction,
    #[serde(rename = "checkpoint")]
    Checkpoint,
    #[serde(rename = "adapter_error")]
    AdapterError,
    #[serde(rename = "replay_assert")]
    ReplayAssert,
    #[serde(rename = "recording_note")]
    RecordingNote,
    #[serde(rename = "policy_violation")]
    PolicyViolation,
}

impl EventType {
    /// The `started` type for an edge kind.
    pub fn started(edge: EdgeKind) -> Self {
        match edge {
            EdgeKind::Llm => EventType::LlmCallStarted,
            EdgeKind::Tool => EventType::ToolCallStarted,
            EdgeKind::Sandbox => EventType::SandboxExecStarted,
            EdgeKind::Vcs => EventType::VcsAction,
        }
    }

    /// The terminal `finished` type for an edge kind.
    pub fn finished(edge: EdgeKind) -> Self {
        match edge {
            EdgeKind::Llm => EventType::LlmCallFinished,
            EdgeKind::Tool => EventType::ToolCallFinished,
            EdgeKind::Sandbox => EventType::SandboxExecFinished,
            EdgeKind::Vcs => EventType::VcsAction,
        }
    }

    /// True for `*.started` markers that demand a matching terminal event.
    pub fn is_started(&self) -> bool {
        matches!(
            self,
            EventType::LlmCallStarted | EventType::ToolCallStarted | EventType::SandboxExecStarted
        )
    }

    /// True for terminal `*.finished` markers.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            EventType::LlmCallFinished
                | EventType::ToolCallFinished
                | EventType::SandboxExecFinished
        )
    }
}

/// A single immutable run event.
///
/// `ts` comes from the live wall clock and is excluded from determinism
/// checks; `step` is the primary ordering key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub run_id: RunId,
    pub framework: String,
    pub agent_id: String,
    pub task_id: String,

    /// Monotone per-run sequence, assigned by the telemetry bus.
    pub step: u64,
    /// Step of the enclosing span, `None` for root events.
    pub parent_step: Option<u64>,
    /// Per `(agent_id, edge_kind, name)` call counter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_index: Option<u64>,

    pub ts: DateTime<Utc>,

    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_kind: Option<EdgeKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs_fingerprint: Option<String>,
    /// Relative path to a payload blob when the output is large.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_out: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_estimate: Option<f64>,

    pub payload: serde_json::Value,
}

/// Everything the caller supplies for an event; the bus fills in identity,
/// `step`, `parent_step`, `ts`, and runs redaction over the payload.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub agent_id: String,
    pub event_type: EventType,
    pub edge_kind: Option<EdgeKind>,
    pub call_index: Option<u64>,
    pub model: Option<String>,
    pub inputs_fingerprint: Option<String>,
    pub result_ref: Option<String>,
    pub duration_ms: Option<u64>,
    pub token_in: Option<u64>,
    pub token_out: Option<u64>,
    pub cost_estimate: Option<f64>,
    pub payload: serde_json::Value,
    /// Override the bus's span stack, used for chunk events that must carry
    /// the surrounding call's step.
    pub step_override: Option<u64>,
}

impl EventDraft {
    pub fn new(agent_id: impl Into<String>, event_type: EventType) -> Self {
        Self {
            agent_id: agent_id.into(),
            event_type,
            edge_kind: None,
            call_index: None,
            model: None,
            inputs_fingerprint: None,
            result_ref: None,
            duration_ms: None,
            token_in: None,
            token_out: None,
            cost_estimate: None,
            payload: serde_json::Value::Null,
            step_override: None,
        }
    }

    pub fn edge(mut self, edge: EdgeKind) -> Self {
        self.edge_kind = Some(edge);
        self
    }

    pub fn call_index(mut self, idx: u64) -> Self {
        self.call_index = Some(idx);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn fingerprint(mut self, fp: impl Into<String>) -> Self {
        self.inputs_fingerprint = Some(fp.into());
        self
    }

    pub fn result_ref(mut self, path: impl Into<String>) -> Self {
        self.result_ref = Some(path.into());
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn tokens(mut self, token_in: u64, token_out: u64) -> Self {
        self.token_in = Some(token_in);
        self.token_out = Some(token_out);
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn at_step(mut self, step: u64) -> Self {
        self.step_override = Some(step);
        self
    }
}

/// Stable key used to look up a recorded edge output during replay.
///
/// Two live calls colliding on the same key is a programmer error the
/// recorder reports at record time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplayLookupKey {
    pub edge_kind: EdgeKind,
    pub agent_id: String,
    /// Tool or model name.
    pub name: String,
    pub call_index: u64,
    pub inputs_fingerprint: String,
}

impl std::fmt::Display for ReplayLookupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}#{}@{}",
            self.edge_kind,
            self.agent_id,
            self.name,
            self.call_index,
            &self.inputs_fingerprint[..self.inputs_fingerprint.len().min(12)]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_value(EventType::LlmCallStarted).unwrap();
        assert_eq!(json, json!("llm_call.started"));
        let json = serde_json::to_value(EventType::SandboxExecFinished).unwrap();
        assert_eq!(json, json!("sandbox_exec.finished"));
        let back: EventType = serde_json::from_value(json!("policy_violation")).unwrap();
        assert_eq!(back, EventType::PolicyViolation);
    }

    #[test]
    fn test_started_finished_pairing_by_edge() {
        assert_eq!(EventType::started(EdgeKind::Llm), EventType::LlmCallStarted);
        assert_eq!(
            EventType::finished(EdgeKind::Sandbox),
            EventType::SandboxExecFinished
        );
        assert!(EventType::ToolCallStarted.is_started());
        assert!(EventType::ToolCallFinished.is_finished());
        assert!(!EventType::Checkpoint.is_started());
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let event = Event {
            run_id: RunId::new(),
            framework: "scripted".to_string(),
            agent_id: "agent-0".to_string(),
            task_id: "echo-hello".to_string(),
            step: 3,
            parent_step: Some(1),
            call_index: Some(0),
            ts: Utc::now(),
            event_type: EventType::LlmCallFinished,
            edge_kind: Some(EdgeKind::Llm),
            model: Some("test-model".to_string()),
            seed: Some(42),
            inputs_fingerprint: Some("ab".repeat(32)),
            result_ref: None,
            duration_ms: Some(12),
            token_in: Some(4),
            token_out: Some(2),
            cost_estimate: None,
            payload: json!({"text": "hi"}),
        };
        let line = serde_json::to_string(&event).unwrap();
        assert!(line.contains(r#""type":"llm_call.finished""#));
        let back: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(back.step, 3);
        assert_eq!(back.edge_kind, Some(EdgeKind::Llm));
    }

    #[test]
    fn test_run_id_parse_roundtrip() {
        let id = RunId::new();
        assert_eq!(RunId::parse(&id.to_string()), Some(id));
        assert_eq!(RunId::parse("not-a-uuid"), None);
    }

    #[test]
    fn test_lookup_key_display_is_compact() {
        let key = ReplayLookupKey {
            edge_kind: EdgeKind::Tool,
            agent_id: "a1".to_string(),
            name: "grep".to_string(),
            call_index: 2,
            inputs_fingerprint: "c".repeat(64),
        };
        let shown = key.to_string();
        assert!(shown.starts_with("tool/a1/grep#2@"));
        assert!(shown.len() < 40);
    }
}
