//! The replay engine: serves recorded edge outputs without touching the
//! network.
//!
//! A recording is indexed by [`ReplayLookupKey`]. During replay the engine
//! sits where the recorder sat: the adapter performs the same calls, the
//! engine answers them from the index and re-emits the recorded events on
//! the new run's bus, so a strict replay produces an event stream equal to
//! the recording up to timestamps and durations.
//!
//! Modes: `strict` (any miss or integrity failure is fatal), `warn` (miss
//! emits a warning and falls through to live execution under the current
//! policy), `hybrid` (a per-edge-kind map of the two).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use detrace_core::canonical::hash_bytes;
use detrace_core::telemetry::read_events;
use detrace_core::{
    fingerprint, EdgeKind, Event, EventDraft, EventType, ReplayLookupKey, RunManifest,
    TelemetryBus,
};

use crate::adapter::{EdgeCall, EdgeFn, EdgeRunner};
use crate::error::{EngineError, Result};
use crate::recorder::Recorder;

/// Per-edge replay behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeReplayMode {
    Strict,
    Warn,
}

/// Replay mode for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayMode {
    Strict,
    Warn,
    /// Per-edge-kind map; unlisted kinds default to strict.
    Hybrid(BTreeMap<EdgeKind, EdgeReplayMode>),
}

impl ReplayMode {
    pub fn mode_for(&self, edge: EdgeKind) -> EdgeReplayMode {
        match self {
            ReplayMode::Strict => EdgeReplayMode::Strict,
            ReplayMode::Warn => EdgeReplayMode::Warn,
            ReplayMode::Hybrid(map) => map.get(&edge).copied().unwrap_or(EdgeReplayMode::Strict),
        }
    }

    /// Parse `strict`, `warn`, or a hybrid map like `llm=strict,tool=warn`.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "strict" => return Ok(ReplayMode::Strict),
            "warn" => return Ok(ReplayMode::Warn),
            _ => {}
        }
        let mut map = BTreeMap::new();
        for part in s.split(',') {
            let (kind, mode) = part.split_once('=').ok_or_else(|| {
                EngineError::Configuration(format!("bad replay mode segment: {part:?}"))
            })?;
            let kind = match kind.trim() {
                "llm" => EdgeKind::Llm,
                "tool" => EdgeKind::Tool,
                "sandbox" => EdgeKind::Sandbox,
                "vcs" => EdgeKind::Vcs,
                other => {
                    return Err(EngineError::Configuration(format!(
                        "unknown edge kind: {other:?}"
                    )))
                }
            };
            let mode = match mode.trim() {
                "strict" => EdgeReplayMode::Strict,
                "warn" => EdgeReplayMode::Warn,
                other => {
                    return Err(EngineError::Configuration(format!(
                        "unknown replay mode: {other:?}"
                    )))
                }
            };
            map.insert(kind, mode);
        }
        Ok(ReplayMode::Hybrid(map))
    }
}

/// One recorded edge call reassembled from the event stream.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub step: u64,
    pub payload: Value,
    pub result_ref: Option<String>,
    pub chunks: Vec<Value>,
    pub duration_ms: Option<u64>,
    pub token_in: Option<u64>,
    pub token_out: Option<u64>,
    pub cost_estimate: Option<f64>,
    /// Terminal was `adapter_error` with this message.
    pub error: Option<String>,
}

/// A loaded recording: events, lookup index, and provenance.
pub struct Recording {
    pub run_dir: PathBuf,
    pub manifest: RunManifest,
    pub events: Vec<Event>,
    pub index: HashMap<ReplayLookupKey, RecordedCall>,
    pub clock_reads: Vec<u64>,
    /// False when the ledger file no longer matches its manifest hash.
    pub ledger_intact: bool,
}

impl Recording {
    /// Load a recorded run directory and build the replay index.
    pub fn load(run_dir: &Path) -> Result<Self> {
        let manifest = RunManifest::read(run_dir)
            .map_err(|e| EngineError::Configuration(format!("recording manifest: {e}")))?;
        let ledger_name = manifest.ledger_driver.file_name();
        let events_path = run_dir.join(ledger_name);
        let events = read_events(&events_path)?;

        let ledger_intact = match manifest.artifacts.iter().find(|a| a.path == ledger_name) {
            Some(entry) => {
                let bytes = std::fs::read(&events_path)?;
                hash_bytes(&bytes) == entry.hash
            }
            // An unfinalized manifest has no artifact hashes to check.
            None => true,
        };

        let index = build_index(&events)?;
        let clock_reads = events
            .iter()
            .find(|e| {
                e.event_type == EventType::RecordingNote
                    && e.payload["kind"] == "clock_reads"
            })
            .and_then(|e| {
                e.payload["values"]
                    .as_array()
                    .map(|vs| vs.iter().filter_map(Value::as_u64).collect())
            })
            .unwrap_or_default();

        Ok(Self {
            run_dir: run_dir.to_path_buf(),
            manifest,
            events,
            index,
            clock_reads,
            ledger_intact,
        })
    }
}

/// Reassemble per-call records from a recorded stream. Events for one call
/// share the started event's step; chunk ordinals must be gapless.
fn build_index(events: &[Event]) -> Result<HashMap<ReplayLookupKey, RecordedCall>> {
    let mut index = HashMap::new();
    let mut open: HashMap<u64, (ReplayLookupKey, RecordedCall)> = HashMap::new();

    for event in events {
        let Some(edge_kind) = event.edge_kind else {
            continue;
        };
        let is_start = event.event_type.is_started()
            || (event.event_type == EventType::VcsAction && !open.contains_key(&event.step));

        if is_start {
            let name = event.payload["name"].as_str().unwrap_or_default().to_string();
            let key = ReplayLookupKey {
                edge_kind,
                agent_id: event.agent_id.clone(),
                name,
                call_index: event.call_index.unwrap_or(0),
                inputs_fingerprint: event.inputs_fingerprint.clone().unwrap_or_default(),
            };
            open.insert(
                event.step,
                (
                    key,
                    RecordedCall {
                        step: event.step,
                        payload: Value::Null,
                        result_ref: None,
                        chunks: Vec::new(),
                        duration_ms: None,
                        token_in: None,
                        token_out: None,
                        cost_estimate: None,
                        error: None,
                    },
                ),
            );
            continue;
        }

        let Some((_, call)) = open.get_mut(&event.step) else {
            continue;
        };
        match event.event_type {
            EventType::LlmCallChunk => {
                let ordinal = event.payload["ordinal"].as_u64().unwrap_or(u64::MAX);
                if ordinal != call.chunks.len() as u64 {
                    return Err(EngineError::ReplayMismatch {
                        reason: format!(
                            "replay_out_of_order: chunk ordinal {ordinal} at step {} (expected {})",
                            event.step,
                            call.chunks.len()
                        ),
                    });
                }
                call.chunks.push(event.payload["chunk"].clone());
            }
            EventType::AdapterError => {
                call.error = Some(
                    event.payload["message"].as_str().unwrap_or("adapter error").to_string(),
                );
                let (key, call) = open.remove(&event.step).unwrap_or_else(|| unreachable!());
                index.insert(key, call);
            }
            t if t.is_finished() || t == EventType::VcsAction => {
                call.payload = event.payload.clone();
                call.result_ref = event.result_ref.clone();
                call.duration_ms = event.duration_ms;
                call.token_in = event.token_in;
                call.token_out = event.token_out;
                call.cost_estimate = event.cost_estimate;
                let (key, call) = open.remove(&event.step).unwrap_or_else(|| unreachable!());
                index.insert(key, call);
            }
            _ => {}
        }
    }

    Ok(index)
}

/// Options for one replay run.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub mode: ReplayMode,
    /// Collapse inter-chunk waits to zero.
    pub fast: bool,
    /// Skip (serve silently, without re-emitting) calls recorded before
    /// this step.
    pub from_checkpoint: Option<u64>,
    /// Halt the run once a lookup would pass this step.
    pub until_step: Option<u64>,
    /// Deadline for a single lookup, against wedged reads.
    pub lookup_deadline_ms: u64,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            mode: ReplayMode::Strict,
            fast: false,
            from_checkpoint: None,
            until_step: None,
            lookup_deadline_ms: 30_000,
        }
    }
}

/// Edge runner that answers from a recording.
pub struct ReplayEngine {
    bus: Arc<TelemetryBus>,
    recording: Recording,
    opts: ReplayOptions,
    /// Recorded step of the last lookup served; enforces ascending order.
    cursor: Mutex<u64>,
    /// Live fallthrough for warn-mode misses.
    fallback: Option<Arc<Recorder>>,
}

impl ReplayEngine {
    pub fn new(
        bus: Arc<TelemetryBus>,
        recording: Recording,
        opts: ReplayOptions,
        fallback: Option<Arc<Recorder>>,
    ) -> Self {
        Self {
            bus,
            recording,
            opts,
            cursor: Mutex::new(0),
            fallback,
        }
    }

    pub fn recording(&self) -> &Recording {
        &self.recording
    }

    /// Emit a `replay_assert` event. `fatal` mirrors the mode decision.
    fn emit_assert(&self, agent_id: &str, reason: &str, key: &ReplayLookupKey, fatal: bool) {
        detrace_core::obs::emit_replay_assert(&self.bus.run_id().to_string(), reason, fatal);
        let _ = self.bus.emit(
            EventDraft::new(agent_id, EventType::ReplayAssert).payload(serde_json::json!({
                "reason": reason,
                "key": key.to_string(),
                "severity": if fatal { "fatal" } else { "warn" },
            })),
        );
    }

    /// Verify the integrity of a recorded call's payload.
    fn verify_payload(&self, call: &RecordedCall) -> std::result::Result<(), String> {
        if !self.recording.ledger_intact {
            return Err("payload_hash_mismatch".to_string());
        }
        if let Some(rel) = &call.result_ref {
            let bytes = std::fs::read(self.recording.run_dir.join(rel))
                .map_err(|_| "payload_hash_mismatch".to_string())?;
            let expected = call.payload["$blob"].as_str().unwrap_or_default();
            if hash_bytes(&bytes) != expected {
                return Err("payload_hash_mismatch".to_string());
            }
        }
        Ok(())
    }

    async fn serve_recorded(&self, call: &EdgeCall, recorded: &RecordedCall) -> Result<Value> {
        // Re-emit the recorded sequence on the new run's bus so the replayed
        // stream matches the recording.
        let mut started = EventDraft::new(&call.agent_id, EventType::started(call.edge_kind))
            .edge(call.edge_kind)
            .call_index(self.bus.next_call_index(&call.agent_id, call.edge_kind, &call.name))
            .fingerprint(fingerprint(&call.input)?)
            .payload(serde_json::json!({
                "name": call.name,
                "input": call.input,
            }));
        if call.edge_kind == EdgeKind::Llm {
            started = started.model(&call.name);
        }
        let started = self.bus.emit(started)?;

        let call_index = started.call_index.unwrap_or(0);
        let inter_chunk = if self.opts.fast || recorded.chunks.is_empty() {
            Duration::ZERO
        } else {
            let total = recorded.duration_ms.unwrap_or(0).min(2_000);
            Duration::from_millis(total / recorded.chunks.len() as u64)
        };
        for (ordinal, chunk) in recorded.chunks.iter().enumerate() {
            if !inter_chunk.is_zero() {
                tokio::time::sleep(inter_chunk).await;
            }
            self.bus.emit(
                EventDraft::new(&call.agent_id, EventType::LlmCallChunk)
                    .at_step(started.step)
                    .edge(call.edge_kind)
                    .call_index(call_index)
                    .payload(serde_json::json!({
                        "ordinal": ordinal,
                        "chunk": chunk,
                    })),
            )?;
        }

        if let Some(message) = &recorded.error {
            self.bus.emit(
                EventDraft::new(&call.agent_id, EventType::AdapterError)
                    .at_step(started.step)
                    .edge(call.edge_kind)
                    .call_index(call_index)
                    .duration_ms(recorded.duration_ms.unwrap_or(0))
                    .payload(serde_json::json!({
                        "name": call.name,
                        "message": message,
                    })),
            )?;
            return Err(EngineError::Edge {
                message: message.clone(),
            });
        }

        let mut finished = EventDraft::new(&call.agent_id, EventType::finished(call.edge_kind))
            .at_step(started.step)
            .edge(call.edge_kind)
            .call_index(call_index)
            .payload(recorded.payload.clone());
        if call.edge_kind == EdgeKind::Llm {
            finished = finished.model(&call.name);
        }
        if let Some(rel) = &recorded.result_ref {
            finished = finished.result_ref(rel.clone());
        }
        if let Some(ms) = recorded.duration_ms {
            finished = finished.duration_ms(ms);
        }
        if let (Some(token_in), Some(token_out)) = (recorded.token_in, recorded.token_out) {
            finished = finished.tokens(token_in, token_out);
        }
        finished.cost_estimate = recorded.cost_estimate;
        self.bus.emit(finished)?;

        // The caller gets the payload; blob-referenced outputs resolve to
        // the stored bytes.
        if let Some(rel) = &recorded.result_ref {
            let bytes = std::fs::read(self.recording.run_dir.join(rel))?;
            return Ok(serde_json::from_slice(&bytes)?);
        }
        Ok(recorded.payload.clone())
    }
}

#[async_trait]
impl EdgeRunner for ReplayEngine {
    async fn run_edge(&self, call: EdgeCall, run: EdgeFn) -> Result<Value> {
        let deadline = Duration::from_millis(self.opts.lookup_deadline_ms);
        let fut = self.run_edge_inner(call, run);
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::ReplayMismatch {
                reason: "lookup deadline exceeded".to_string(),
            }),
        }
    }
}

impl ReplayEngine {
    async fn run_edge_inner(&self, call: EdgeCall, run: EdgeFn) -> Result<Value> {
        let inputs_fingerprint = fingerprint(&call.input)?;

        // Peek the call index without consuming it; whichever path emits
        // the events (serve or live fallthrough) advances the counter.
        let key = ReplayLookupKey {
            edge_kind: call.edge_kind,
            agent_id: call.agent_id.clone(),
            name: call.name.clone(),
            call_index: self
                .bus
                .peek_call_index(&call.agent_id, call.edge_kind, &call.name),
            inputs_fingerprint,
        };

        let mode = self.opts.mode.mode_for(call.edge_kind);
        let recorded = match self.recording.index.get(&key).cloned() {
            Some(recorded) => recorded,
            None => return self.miss(&call, &key, "lookup_miss", mode, run).await,
        };
        if let Err(reason) = self.verify_payload(&recorded) {
            return self.miss(&call, &key, &reason, mode, run).await;
        }

        // Ordering: recorded steps must be consumed ascending.
        {
            let mut cursor = self.cursor.lock().expect("replay cursor poisoned");
            if recorded.step < *cursor {
                self.emit_assert(&call.agent_id, "replay_out_of_order", &key, true);
                return Err(EngineError::ReplayOutOfOrder {
                    expected: *cursor,
                    got: recorded.step,
                });
            }
            *cursor = recorded.step;
        }

        if let Some(until) = self.opts.until_step {
            if recorded.step > until {
                return Err(EngineError::ReplayHalt { at_step: recorded.step });
            }
        }

        if let Some(from) = self.opts.from_checkpoint {
            if recorded.step < from {
                // Fast-skip: serve the output without re-emitting events,
                // still consuming the call index.
                let _ = self
                    .bus
                    .next_call_index(&call.agent_id, call.edge_kind, &call.name);
                if let Some(message) = &recorded.error {
                    return Err(EngineError::Edge {
                        message: message.clone(),
                    });
                }
                return Ok(recorded.payload.clone());
            }
        }

        self.serve_recorded(&call, &recorded).await
    }

    async fn miss(
        &self,
        call: &EdgeCall,
        key: &ReplayLookupKey,
        reason: &str,
        mode: EdgeReplayMode,
        run: EdgeFn,
    ) -> Result<Value> {
        match mode {
            EdgeReplayMode::Strict => {
                self.emit_assert(&call.agent_id, reason, key, true);
                Err(EngineError::ReplayMismatch {
                    reason: format!("{reason}: {key}"),
                })
            }
            EdgeReplayMode::Warn => {
                self.emit_assert(&call.agent_id, reason, key, false);
                let Some(fallback) = &self.fallback else {
                    return Err(EngineError::ReplayMismatch {
                        reason: format!("{reason} and no live fallback: {key}"),
                    });
                };
                fallback.run_edge(call.clone(), run).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use detrace_core::RunId;
    use serde_json::json;

    fn edge_event(step: u64, event_type: EventType, payload: Value) -> Event {
        Event {
            run_id: RunId::nil(),
            framework: "fw".to_string(),
            agent_id: "a".to_string(),
            task_id: "t".to_string(),
            step,
            parent_step: None,
            call_index: Some(0),
            ts: Utc::now(),
            event_type,
            edge_kind: Some(EdgeKind::Llm),
            model: Some("m".to_string()),
            seed: Some(1),
            inputs_fingerprint: Some("f".repeat(64)),
            result_ref: None,
            duration_ms: None,
            token_in: None,
            token_out: None,
            cost_estimate: None,
            payload,
        }
    }

    #[test]
    fn test_build_index_reassembles_call() {
        let events = vec![
            edge_event(
                1,
                EventType::LlmCallStarted,
                json!({"name": "m", "input": {"prompt": "x"}}),
            ),
            edge_event(1, EventType::LlmCallChunk, json!({"ordinal": 0, "chunk": "h"})),
            edge_event(1, EventType::LlmCallChunk, json!({"ordinal": 1, "chunk": "i"})),
            edge_event(1, EventType::LlmCallFinished, json!({"text": "hi"})),
        ];
        let index = build_index(&events).unwrap();
        assert_eq!(index.len(), 1);
        let call = index.values().next().unwrap();
        assert_eq!(call.step, 1);
        assert_eq!(call.chunks, vec![json!("h"), json!("i")]);
        assert_eq!(call.payload, json!({"text": "hi"}));
    }

    #[test]
    fn test_build_index_rejects_chunk_ordinal_gap() {
        let events = vec![
            edge_event(
                1,
                EventType::LlmCallStarted,
                json!({"name": "m", "input": {"prompt": "x"}}),
            ),
            edge_event(1, EventType::LlmCallChunk, json!({"ordinal": 1, "chunk": "i"})),
        ];
        let err = build_index(&events).unwrap_err();
        assert!(err.to_string().contains("replay_out_of_order"));
    }

    #[test]
    fn test_build_index_keeps_adapter_error_terminal() {
        let events = vec![
            edge_event(
                1,
                EventType::LlmCallStarted,
                json!({"name": "m", "input": {"prompt": "x"}}),
            ),
            edge_event(1, EventType::AdapterError, json!({"message": "boom"})),
        ];
        let index = build_index(&events).unwrap();
        assert_eq!(index.values().next().unwrap().error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_replay_mode_parse() {
        assert_eq!(ReplayMode::parse("strict").unwrap(), ReplayMode::Strict);
        assert_eq!(ReplayMode::parse("warn").unwrap(), ReplayMode::Warn);
        let hybrid = ReplayMode::parse("llm=strict,tool=warn").unwrap();
        assert_eq!(hybrid.mode_for(EdgeKind::Llm), EdgeReplayMode::Strict);
        assert_eq!(hybrid.mode_for(EdgeKind::Tool), EdgeReplayMode::Warn);
        // Unlisted kinds default to strict.
        assert_eq!(hybrid.mode_for(EdgeKind::Vcs), EdgeReplayMode::Strict);
        assert!(ReplayMode::parse("llm=lenient").is_err());
        assert!(ReplayMode::parse("nonsense").is_err());
    }
}
