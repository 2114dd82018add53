//! The recorder: wraps live I/O edges and persists their outputs.
//!
//! Contract per edge:
//! 1. canonicalize the input and compute its fingerprint
//! 2. take the next `call_index` for `(agent_id, edge_kind, name)`
//! 3. emit `*.started` with fingerprint, call index, and provenance
//! 4. execute live (the closure runs through the relevant enforcer)
//! 5. stream chunks as `llm_call.chunk` events at the call's step
//! 6. spill large outputs to the write-once blob store, reference them
//!    via `result_ref`
//! 7. emit the terminal `*.finished` (or `adapter_error`) at the call's step

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use detrace_core::canonical::{blob_ref, hash_bytes};
use detrace_core::{
    canonicalize, fingerprint, EdgeKind, EventDraft, EventType, ReplayLookupKey, TelemetryBus,
};
use detrace_core::error::CoreError;
use detrace_safety::{
    InjectionScreener, PolicyManager, PolicyViolation, SafetyDomain, SafetyError, ScreenAction,
};

use crate::adapter::{EdgeCall, EdgeFn, EdgeRunner};
use crate::error::{EngineError, Result};

/// Payloads at or above this many canonical bytes go to the blob store.
pub const INLINE_PAYLOAD_LIMIT: usize = 4096;

/// Write-once, content-addressed payload store under
/// `artifacts/<run_id>/blobs/`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    run_dir: PathBuf,
}

impl BlobStore {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
        }
    }

    /// Store bytes, returning `(hash, relative path)`. Re-storing identical
    /// bytes is an idempotent no-op; a hash collision with different
    /// content is rejected.
    pub fn put(&self, bytes: &[u8]) -> Result<(String, String)> {
        let hash = hash_bytes(bytes);
        let rel = format!("blobs/{hash}.bin");
        let path = self.run_dir.join(&rel);
        if path.exists() {
            let existing = std::fs::read(&path)?;
            if existing != bytes {
                return Err(EngineError::Core(CoreError::ArtifactRewrite {
                    path: rel,
                }));
            }
            return Ok((hash, rel));
        }
        std::fs::create_dir_all(path.parent().unwrap_or(self.run_dir.as_path()))?;
        std::fs::write(&path, bytes)?;
        Ok((hash, rel))
    }

    /// Read a blob back by its relative path.
    pub fn read(&self, rel: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.run_dir.join(rel))?)
    }
}

/// Live edge runner: executes and records.
pub struct Recorder {
    bus: Arc<TelemetryBus>,
    blobs: BlobStore,
    screener: Arc<InjectionScreener>,
    policies: Arc<PolicyManager>,
    seen_keys: Mutex<HashSet<ReplayLookupKey>>,
}

impl Recorder {
    pub fn new(
        bus: Arc<TelemetryBus>,
        run_dir: &Path,
        screener: Arc<InjectionScreener>,
        policies: Arc<PolicyManager>,
    ) -> Self {
        Self {
            bus,
            blobs: BlobStore::new(run_dir),
            screener,
            policies,
            seen_keys: Mutex::new(HashSet::new()),
        }
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    /// Screen a value flowing through an LLM edge. Returns the severity
    /// and matched rules when the policy blocks it, `None` otherwise.
    fn screen_block(&self, value: &Value) -> Option<(detrace_safety::Severity, Vec<String>)> {
        let mut text = String::new();
        Self::collect_text(value, &mut text);
        let verdict = self.screener.screen(&text);
        if verdict.action != ScreenAction::Block {
            return None;
        }
        let severity = verdict.severity.unwrap_or(detrace_safety::Severity::High);
        Some((severity, verdict.matched))
    }

    /// Record a blocking screener verdict: append it to the violation ring,
    /// emit the `policy_violation` event, and build the error that fails
    /// the edge. A sink failure takes precedence over the violation.
    fn injection_block_error(
        &self,
        direction: &str,
        severity: detrace_safety::Severity,
        matched: Vec<String>,
    ) -> EngineError {
        let policy = self.policies.active_policy();
        self.policies.record_violation(
            PolicyViolation::new(
                SafetyDomain::Injection,
                &policy.name,
                "injection_blocked",
                severity,
                format!("{direction} matched {matched:?}"),
            )
            .with_session(self.bus.run_id().to_string()),
        );
        let emitted = self.bus.emit(
            EventDraft::new("screener", EventType::PolicyViolation).payload(serde_json::json!({
                "domain": "injection",
                "direction": direction,
                "matched": matched,
                "severity": severity.to_string(),
            })),
        );
        match emitted {
            Ok(_) => EngineError::Safety(SafetyError::denied(
                SafetyDomain::Injection,
                severity,
                format!("{direction} blocked by injection screener"),
            )),
            Err(e) => EngineError::Core(e),
        }
    }

    fn collect_text(value: &Value, out: &mut String) {
        match value {
            Value::String(s) => {
                out.push_str(s);
                out.push('\n');
            }
            Value::Array(items) => items.iter().for_each(|v| Self::collect_text(v, out)),
            Value::Object(map) => map.values().for_each(|v| Self::collect_text(v, out)),
            _ => {}
        }
    }
}

#[async_trait]
impl EdgeRunner for Recorder {
    async fn run_edge(&self, call: EdgeCall, run: EdgeFn) -> Result<Value> {
        let inputs_fingerprint = fingerprint(&call.input)?;
        let call_index = self
            .bus
            .next_call_index(&call.agent_id, call.edge_kind, &call.name);

        let key = ReplayLookupKey {
            edge_kind: call.edge_kind,
            agent_id: call.agent_id.clone(),
            name: call.name.clone(),
            call_index,
            inputs_fingerprint: inputs_fingerprint.clone(),
        };
        {
            let mut seen = self.seen_keys.lock().expect("recorder key set poisoned");
            if !seen.insert(key.clone()) {
                self.bus.emit(
                    EventDraft::new(&call.agent_id, EventType::RecordingNote).payload(
                        serde_json::json!({
                            "kind": "duplicate_lookup_key",
                            "key": key.to_string(),
                        }),
                    ),
                )?;
                return Err(EngineError::DuplicateLookupKey(key.to_string()));
            }
        }

        if call.edge_kind == EdgeKind::Llm {
            if let Some((severity, matched)) = self.screen_block(&call.input) {
                return Err(self.injection_block_error("llm_input", severity, matched));
            }
        }

        let mut started = EventDraft::new(&call.agent_id, EventType::started(call.edge_kind))
            .edge(call.edge_kind)
            .call_index(call_index)
            .fingerprint(&inputs_fingerprint)
            .payload(serde_json::json!({
                "name": call.name,
                "input": call.input,
            }));
        if call.edge_kind == EdgeKind::Llm {
            started = started.model(&call.name);
        }
        let started = self.bus.emit(started)?;
        self.bus.push_span(started.step);

        let begun = Instant::now();
        let outcome = run().await;
        let duration_ms = begun.elapsed().as_millis() as u64;

        self.bus.pop_span();

        let output = match outcome {
            Ok(output) => output,
            Err(edge_err) => {
                let message = match &edge_err {
                    crate::adapter::EdgeError::Policy(v) => v.to_string(),
                    crate::adapter::EdgeError::Failed(m) => m.clone(),
                };
                self.bus.emit(
                    EventDraft::new(&call.agent_id, EventType::AdapterError)
                        .at_step(started.step)
                        .edge(call.edge_kind)
                        .call_index(call_index)
                        .duration_ms(duration_ms)
                        .payload(serde_json::json!({
                            "name": call.name,
                            "message": message,
                        })),
                )?;
                return match edge_err {
                    crate::adapter::EdgeError::Policy(violation) => {
                        if let SafetyError::Violation {
                            domain, severity, reason,
                        } = &violation
                        {
                            let policy = self.policies.active_policy();
                            self.policies.record_violation(
                                PolicyViolation::new(
                                    *domain,
                                    &policy.name,
                                    "edge_denied",
                                    *severity,
                                    reason.clone(),
                                )
                                .with_session(self.bus.run_id().to_string()),
                            );
                            self.bus.emit(
                                EventDraft::new(&call.agent_id, EventType::PolicyViolation)
                                    .payload(serde_json::json!({
                                        "domain": domain.to_string(),
                                        "severity": severity.to_string(),
                                        "reason": reason,
                                    })),
                            )?;
                        }
                        Err(EngineError::Safety(violation))
                    }
                    crate::adapter::EdgeError::Failed(message) => {
                        Err(EngineError::Edge { message })
                    }
                };
            }
        };

        if call.edge_kind == EdgeKind::Llm {
            if let Some((severity, matched)) = self.screen_block(&output.value) {
                // The call already has its `*.started`: terminate it before
                // the violation surfaces so the pair stays complete.
                self.bus.emit(
                    EventDraft::new(&call.agent_id, EventType::AdapterError)
                        .at_step(started.step)
                        .edge(call.edge_kind)
                        .call_index(call_index)
                        .duration_ms(duration_ms)
                        .payload(serde_json::json!({
                            "name": call.name,
                            "message": "llm_output blocked by injection screener",
                        })),
                )?;
                return Err(self.injection_block_error("llm_output", severity, matched));
            }
        }

        if let Some(chunks) = &output.chunks {
            for (ordinal, chunk) in chunks.iter().enumerate() {
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
        }

        // Redact before anything touches disk: the blob store bypasses the
        // bus's automatic payload scrubbing.
        let persisted = self.bus.redact_value(&output.value);
        let canonical_bytes = canonicalize(&persisted)?;
        let (payload, result_ref) = if canonical_bytes.len() >= INLINE_PAYLOAD_LIMIT {
            let (hash, rel) = self.blobs.put(&canonical_bytes)?;
            (blob_ref(&hash), Some(rel))
        } else {
            (persisted, None)
        };

        let mut finished = EventDraft::new(&call.agent_id, EventType::finished(call.edge_kind))
            .at_step(started.step)
            .edge(call.edge_kind)
            .call_index(call_index)
            .duration_ms(duration_ms)
            .payload(payload);
        if call.edge_kind == EdgeKind::Llm {
            finished = finished.model(&call.name);
        }
        if let Some(rel) = result_ref {
            finished = finished.result_ref(rel);
        }
        if let (Some(token_in), Some(token_out)) = (output.token_in, output.token_out) {
            finished = finished.tokens(token_in, token_out);
        }
        if let Some(cost) = output.cost_estimate {
            finished.cost_estimate = Some(cost);
        }
        self.bus.emit(finished)?;

        Ok(output.value)
    }
}
