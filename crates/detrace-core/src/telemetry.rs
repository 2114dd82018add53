//! Per-run telemetry bus: the single writer of the event ledger.
//!
//! A run is logically single-threaded from the bus's perspective. All step
//! assignment happens behind one lock, so observed `step` order equals
//! causal order no matter how much internal parallelism the adapter uses.
//!
//! The sink is an append-only JSONL file, optionally zstd-framed. The file
//! is fsynced on `checkpoint` events and at finalization. Subscribers get a
//! best-effort broadcast copy, never the authoritative record.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{CoreError, Result};
use crate::events::{EdgeKind, Event, EventDraft, EventType, RunId};
use crate::redaction::{RedactionLogEntry, Redactor};

/// Ledger file driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerDriver {
    #[serde(rename = "jsonl")]
    Jsonl,
    #[serde(rename = "jsonl.zst")]
    JsonlZst,
}

impl LedgerDriver {
    pub fn file_name(&self) -> &'static str {
        match self {
            LedgerDriver::Jsonl => "events.jsonl",
            LedgerDriver::JsonlZst => "events.jsonl.zst",
        }
    }
}

enum SinkWriter {
    Jsonl(File),
    JsonlZst(Option<zstd::stream::write::Encoder<'static, File>>),
    Memory(Vec<u8>),
}

impl SinkWriter {
    fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        match self {
            SinkWriter::Jsonl(f) => {
                f.write_all(line)?;
                f.write_all(b"\n")
            }
            SinkWriter::JsonlZst(enc) => {
                let enc = enc
                    .as_mut()
                    .ok_or_else(|| std::io::Error::other("ledger already finalized"))?;
                enc.write_all(line)?;
                enc.write_all(b"\n")
            }
            SinkWriter::Memory(buf) => {
                buf.extend_from_slice(line);
                buf.push(b'\n');
                Ok(())
            }
        }
    }

    fn sync(&mut self) -> std::io::Result<()> {
        match self {
            SinkWriter::Jsonl(f) => f.sync_all(),
            SinkWriter::JsonlZst(enc) => {
                if let Some(enc) = enc.as_mut() {
                    enc.flush()?;
                    enc.get_mut().sync_all()?;
                }
                Ok(())
            }
            SinkWriter::Memory(_) => Ok(()),
        }
    }

    fn finish(&mut self) -> std::io::Result<()> {
        match self {
            SinkWriter::Jsonl(f) => f.sync_all(),
            SinkWriter::JsonlZst(enc) => {
                if let Some(enc) = enc.take() {
                    let file = enc.finish()?;
                    file.sync_all()?;
                }
                Ok(())
            }
            SinkWriter::Memory(_) => Ok(()),
        }
    }
}

struct BusInner {
    next_step: u64,
    span_stack: Vec<u64>,
    call_counters: HashMap<(String, EdgeKind, String), u64>,
    writer: SinkWriter,
    history: Vec<Event>,
}

/// The per-run event bus. Create one per run; never share across runs.
pub struct TelemetryBus {
    run_id: RunId,
    framework: String,
    task_id: String,
    seed: u64,
    driver: LedgerDriver,
    events_path: Option<PathBuf>,
    redactor: Redactor,
    inner: Mutex<BusInner>,
    broadcast: broadcast::Sender<Event>,
}

impl std::fmt::Debug for TelemetryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryBus")
            .field("run_id", &self.run_id)
            .field("driver", &self.driver)
            .finish()
    }
}

impl TelemetryBus {
    /// Open the ledger file under `run_dir` and return a ready bus.
    pub fn open(
        run_id: RunId,
        framework: impl Into<String>,
        task_id: impl Into<String>,
        seed: u64,
        run_dir: &Path,
        driver: LedgerDriver,
        redactor: Redactor,
    ) -> Result<Self> {
        std::fs::create_dir_all(run_dir)?;
        let events_path = run_dir.join(driver.file_name());
        let file = File::create(&events_path)?;
        let writer = match driver {
            LedgerDriver::Jsonl => SinkWriter::Jsonl(file),
            LedgerDriver::JsonlZst => {
                let encoder = zstd::stream::write::Encoder::new(file, 0)
                    .map_err(|e| CoreError::Telemetry(format!("zstd init: {e}")))?;
                SinkWriter::JsonlZst(Some(encoder))
            }
        };
        Ok(Self::with_writer(
            run_id,
            framework,
            task_id,
            seed,
            driver,
            Some(events_path),
            writer,
            redactor,
        ))
    }

    /// In-memory bus for tests and dry runs.
    pub fn in_memory(
        run_id: RunId,
        framework: impl Into<String>,
        task_id: impl Into<String>,
        seed: u64,
    ) -> Self {
        Self::with_writer(
            run_id,
            framework,
            task_id,
            seed,
            LedgerDriver::Jsonl,
            None,
            SinkWriter::Memory(Vec::new()),
            Redactor::with_defaults(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn with_writer(
        run_id: RunId,
        framework: impl Into<String>,
        task_id: impl Into<String>,
        seed: u64,
        driver: LedgerDriver,
        events_path: Option<PathBuf>,
        writer: SinkWriter,
        redactor: Redactor,
    ) -> Self {
        let (broadcast, _) = broadcast::channel(256);
        Self {
            run_id,
            framework: framework.into(),
            task_id: task_id.into(),
            seed,
            driver,
            events_path,
            redactor,
            inner: Mutex::new(BusInner {
                next_step: 0,
                span_stack: Vec::new(),
                call_counters: HashMap::new(),
                writer,
                history: Vec::new(),
            }),
            broadcast,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn driver(&self) -> LedgerDriver {
        self.driver
    }

    pub fn events_path(&self) -> Option<&Path> {
        self.events_path.as_deref()
    }

    /// Register an exact secret value with the redactor.
    pub fn register_secret(&mut self, name: &str, value: &str) {
        self.redactor.add_exact(name, value);
    }

    /// Emit one event: assign `step`, stamp identity and wall-clock time,
    /// redact the payload, append to the sink, fan out to subscribers.
    ///
    /// A sink write failure is fatal to the run.
    pub fn emit(&self, draft: EventDraft) -> Result<Event> {
        let mut inner = self.inner.lock().expect("telemetry bus lock poisoned");

        let step = match draft.step_override {
            Some(step) => step,
            None => {
                let step = inner.next_step;
                inner.next_step += 1;
                step
            }
        };
        let parent_step = match draft.step_override {
            // A chunk shares its call's step; its parent is that same call.
            Some(step) => Some(step),
            None => inner.span_stack.last().copied(),
        };

        let event = Event {
            run_id: self.run_id,
            framework: self.framework.clone(),
            agent_id: draft.agent_id,
            task_id: self.task_id.clone(),
            step,
            parent_step,
            call_index: draft.call_index,
            ts: Utc::now(),
            event_type: draft.event_type,
            edge_kind: draft.edge_kind,
            model: draft.model,
            seed: Some(self.seed),
            inputs_fingerprint: draft.inputs_fingerprint,
            result_ref: draft.result_ref,
            duration_ms: draft.duration_ms,
            token_in: draft.token_in,
            token_out: draft.token_out,
            cost_estimate: draft.cost_estimate,
            payload: self.redactor.redact(&draft.payload),
        };

        let line = serde_json::to_vec(&event)?;
        inner
            .writer
            .write_line(&line)
            .map_err(|e| CoreError::Telemetry(format!("sink write failed: {e}")))?;

        if event.event_type == EventType::Checkpoint {
            inner
                .writer
                .sync()
                .map_err(|e| CoreError::Telemetry(format!("sink sync failed: {e}")))?;
        }

        inner.history.push(event.clone());
        drop(inner);

        crate::obs::emit_event_appended(&self.run_id.to_string(), &event);
        let _ = self.broadcast.send(event.clone());
        Ok(event)
    }

    /// Enter a span: subsequent events get `parent_step = step`.
    pub fn push_span(&self, step: u64) {
        self.inner
            .lock()
            .expect("telemetry bus lock poisoned")
            .span_stack
            .push(step);
    }

    /// Leave the innermost span.
    pub fn pop_span(&self) {
        self.inner
            .lock()
            .expect("telemetry bus lock poisoned")
            .span_stack
            .pop();
    }

    /// The `call_index` the next `next_call_index` call would return,
    /// without advancing the counter.
    pub fn peek_call_index(&self, agent_id: &str, edge: EdgeKind, name: &str) -> u64 {
        self.inner
            .lock()
            .expect("telemetry bus lock poisoned")
            .call_counters
            .get(&(agent_id.to_string(), edge, name.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Next `call_index` for `(agent_id, edge_kind, name)`.
    pub fn next_call_index(&self, agent_id: &str, edge: EdgeKind, name: &str) -> u64 {
        let mut inner = self.inner.lock().expect("telemetry bus lock poisoned");
        let counter = inner
            .call_counters
            .entry((agent_id.to_string(), edge, name.to_string()))
            .or_insert(0);
        let idx = *counter;
        *counter += 1;
        idx
    }

    /// Emit a `checkpoint` event (forces an fsync).
    pub fn checkpoint(&self, agent_id: &str, label: &str) -> Result<Event> {
        self.emit(
            EventDraft::new(agent_id, EventType::Checkpoint)
                .payload(serde_json::json!({"label": label})),
        )
    }

    /// Best-effort live copy of the stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast.subscribe()
    }

    /// Snapshot of everything emitted so far, in step order.
    pub fn events_snapshot(&self) -> Vec<Event> {
        self.inner
            .lock()
            .expect("telemetry bus lock poisoned")
            .history
            .clone()
    }

    /// Run the redactor over a value destined for an artifact. Payloads
    /// emitted through `emit` are scrubbed automatically; anything written
    /// to disk by other paths (blob spills) must go through this first.
    pub fn redact_value(&self, value: &serde_json::Value) -> serde_json::Value {
        self.redactor.redact(value)
    }

    /// Redaction pattern hit counts for the manifest.
    pub fn redaction_log(&self) -> Vec<RedactionLogEntry> {
        self.redactor.log()
    }

    /// Flush, fsync, and close the ledger. Must be called at run end.
    pub fn finalize(&self) -> Result<()> {
        self.inner
            .lock()
            .expect("telemetry bus lock poisoned")
            .writer
            .finish()
            .map_err(|e| CoreError::Telemetry(format!("sink finalize failed: {e}")))
    }
}

/// Read a ledger back, transparently decompressing `.zst` files.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let raw = std::fs::read(path)?;
    let text = if path.extension().is_some_and(|e| e == "zst") {
        let decoded = zstd::stream::decode_all(raw.as_slice())
            .map_err(|e| CoreError::Telemetry(format!("zstd decode: {e}")))?;
        String::from_utf8(decoded)
            .map_err(|e| CoreError::Telemetry(format!("ledger not utf-8: {e}")))?
    } else {
        String::from_utf8(raw).map_err(|e| CoreError::Telemetry(format!("ledger not utf-8: {e}")))?
    };

    let mut events = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(line)
            .map_err(|e| CoreError::Telemetry(format!("ledger line {}: {e}", i + 1)))?;
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn draft(agent: &str, et: EventType) -> EventDraft {
        EventDraft::new(agent, et)
    }

    #[test]
    fn test_steps_are_gapless_from_zero() {
        let bus = TelemetryBus::in_memory(RunId::new(), "fw", "task", 1);
        for _ in 0..5 {
            bus.emit(draft("a", EventType::RecordingNote)).unwrap();
        }
        let steps: Vec<u64> = bus.events_snapshot().iter().map(|e| e.step).collect();
        assert_eq!(steps, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_span_stack_sets_parent_step() {
        let bus = TelemetryBus::in_memory(RunId::new(), "fw", "task", 1);
        let root = bus.emit(draft("a", EventType::AgentStart)).unwrap();
        assert_eq!(root.parent_step, None);
        bus.push_span(root.step);
        let child = bus.emit(draft("a", EventType::ToolCallStarted)).unwrap();
        assert_eq!(child.parent_step, Some(root.step));
        bus.pop_span();
        let sibling = bus.emit(draft("a", EventType::AgentStop)).unwrap();
        assert_eq!(sibling.parent_step, None);
    }

    #[test]
    fn test_chunk_step_override_does_not_consume_steps() {
        let bus = TelemetryBus::in_memory(RunId::new(), "fw", "task", 1);
        let started = bus.emit(draft("a", EventType::LlmCallStarted)).unwrap();
        let chunk = bus
            .emit(
                draft("a", EventType::LlmCallChunk)
                    .at_step(started.step)
                    .payload(json!({"ordinal": 0, "text": "h"})),
            )
            .unwrap();
        assert_eq!(chunk.step, started.step);
        let finished = bus.emit(draft("a", EventType::LlmCallFinished)).unwrap();
        assert_eq!(finished.step, started.step + 1);
    }

    #[test]
    fn test_call_index_increments_per_name() {
        let bus = TelemetryBus::in_memory(RunId::new(), "fw", "task", 1);
        assert_eq!(bus.next_call_index("a", EdgeKind::Llm, "gpt"), 0);
        assert_eq!(bus.next_call_index("a", EdgeKind::Llm, "gpt"), 1);
        assert_eq!(bus.next_call_index("a", EdgeKind::Tool, "gpt"), 0);
        assert_eq!(bus.next_call_index("b", EdgeKind::Llm, "gpt"), 0);
    }

    #[test]
    fn test_payload_redacted_before_persist() {
        let bus = TelemetryBus::in_memory(RunId::new(), "fw", "task", 1);
        let event = bus
            .emit(draft("a", EventType::RecordingNote).payload(json!({
                "token": "sk-abcdef1234567890abcdef"
            })))
            .unwrap();
        assert_eq!(event.payload["token"]["redacted"], true);
        assert_eq!(bus.redaction_log()[0].pattern, "api_key");
    }

    #[test]
    fn test_jsonl_sink_roundtrip() {
        let dir = tempdir().unwrap();
        let run_id = RunId::new();
        let bus = TelemetryBus::open(
            run_id,
            "fw",
            "task",
            7,
            dir.path(),
            LedgerDriver::Jsonl,
            Redactor::with_defaults(),
        )
        .unwrap();
        bus.emit(draft("a", EventType::AgentStart)).unwrap();
        bus.emit(draft("a", EventType::AgentStop)).unwrap();
        bus.finalize().unwrap();

        let events = read_events(&dir.path().join("events.jsonl")).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].run_id, run_id);
        assert_eq!(events[0].seed, Some(7));
    }

    #[test]
    fn test_zst_sink_roundtrip() {
        let dir = tempdir().unwrap();
        let bus = TelemetryBus::open(
            RunId::new(),
            "fw",
            "task",
            7,
            dir.path(),
            LedgerDriver::JsonlZst,
            Redactor::with_defaults(),
        )
        .unwrap();
        for _ in 0..10 {
            bus.emit(draft("a", EventType::RecordingNote).payload(json!({"n": 1})))
                .unwrap();
        }
        bus.finalize().unwrap();

        let events = read_events(&dir.path().join("events.jsonl.zst")).unwrap();
        assert_eq!(events.len(), 10);
    }

    #[tokio::test]
    async fn test_subscribers_receive_best_effort_copy() {
        let bus = TelemetryBus::in_memory(RunId::new(), "fw", "task", 1);
        let mut rx = bus.subscribe();
        bus.emit(draft("a", EventType::AgentStart)).unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_type, EventType::AgentStart);
    }

    #[test]
    fn test_checkpoint_survives_without_finalize() {
        let dir = tempdir().unwrap();
        let bus = TelemetryBus::open(
            RunId::new(),
            "fw",
            "task",
            7,
            dir.path(),
            LedgerDriver::Jsonl,
            Redactor::with_defaults(),
        )
        .unwrap();
        bus.emit(draft("a", EventType::AgentStart)).unwrap();
        bus.checkpoint("a", "mid").unwrap();
        // No finalize: the checkpoint fsync must have flushed both lines.
        let events = read_events(&dir.path().join("events.jsonl")).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, EventType::Checkpoint);
    }
}
