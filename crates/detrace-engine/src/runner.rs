//! Single-run orchestration: wires the bus, providers, enforcers, and an
//! edge runner around one adapter invocation, and finalizes the manifest
//! whatever happens.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::Instrument;

use detrace_core::{
    obs, EventDraft, EventType, LedgerDriver, Providers, Redactor, RunId, RunManifest, RunStatus,
    StorageClass, TelemetryBus,
};
use detrace_safety::{
    FilesystemController, InjectionScreener, NetworkController, PolicyManager, SandboxExecutor,
};

use crate::adapter::{
    streams_equal, Adapter, ParityMode, RunContext, RunResult, TaskSpec,
};
use crate::error::{EngineError, Result};
use crate::recorder::Recorder;
use crate::replay::{Recording, ReplayEngine, ReplayMode, ReplayOptions};

/// Options shared by record and replay runs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub framework: String,
    pub out_dir: PathBuf,
    pub seed: u64,
    pub parity: ParityMode,
    pub driver: LedgerDriver,
    pub storage_class: StorageClass,
    /// Repository root for the filesystem allowlist.
    pub repo_root: PathBuf,
    /// Digest of the system under evaluation, recorded in the manifest.
    pub source_digest: String,
}

impl RunOptions {
    pub fn new(framework: impl Into<String>, out_dir: impl Into<PathBuf>, seed: u64) -> Self {
        Self {
            framework: framework.into(),
            out_dir: out_dir.into(),
            seed,
            parity: ParityMode::Autonomous,
            driver: LedgerDriver::Jsonl,
            storage_class: StorageClass::Dev,
            repo_root: PathBuf::from("."),
            source_digest: String::new(),
        }
    }
}

struct RunScaffold {
    run_id: RunId,
    run_dir: PathBuf,
    bus: Arc<TelemetryBus>,
    manifest: RunManifest,
    sandbox: Arc<SandboxExecutor>,
    fs: Arc<FilesystemController>,
    screener: Arc<InjectionScreener>,
}

fn scaffold(
    adapter: &dyn Adapter,
    task: &TaskSpec,
    opts: &RunOptions,
    policies: &Arc<PolicyManager>,
    seed: u64,
    clock_reads_hint: Option<&Recording>,
) -> Result<RunScaffold> {
    let policy = policies.active_policy();
    policy
        .validate()
        .map_err(|e| EngineError::Configuration(format!("active policy invalid: {e}")))?;

    let run_id = RunId::new();
    let run_dir = opts.out_dir.join(run_id.to_string());
    std::fs::create_dir_all(&run_dir)?;

    let bus = Arc::new(TelemetryBus::open(
        run_id,
        &opts.framework,
        &task.id,
        seed,
        &run_dir,
        opts.driver,
        Redactor::with_defaults(),
    )?);

    let mut manifest = RunManifest::begin(
        run_id,
        format!("{}@{}", adapter.name(), adapter.version()),
        &opts.source_digest,
        seed,
        &policy.name,
        policy.digest(),
        opts.storage_class,
        opts.driver,
    );
    if let Some(recording) = clock_reads_hint {
        manifest.set_model("recording", &recording.manifest.run_id.to_string());
    }
    manifest.write(&run_dir)?;

    let run_temp = std::env::temp_dir().join(run_id.to_string());
    Ok(RunScaffold {
        run_id,
        run_dir,
        bus,
        manifest,
        sandbox: Arc::new(SandboxExecutor::new(Arc::clone(&policy))),
        fs: Arc::new(FilesystemController::new(
            Arc::clone(&policy),
            &opts.repo_root,
            &run_temp,
        )?),
        screener: Arc::new(InjectionScreener::new(Arc::clone(&policy))),
    })
}

fn status_for(error: &EngineError) -> RunStatus {
    match error.exit_code() {
        2 => RunStatus::PolicyViolation,
        3 => RunStatus::ReplayMismatch,
        4 => RunStatus::AdapterError,
        _ => RunStatus::Incomplete,
    }
}

/// Record one live run of `adapter` on `task`.
///
/// Returns a [`RunResult`] for every run that reached the adapter: a
/// policy violation or adapter error is a completed (non-ok) run, not an
/// `Err`. Only scaffolding failures (invalid config, unwritable artifact
/// dir) surface as errors.
pub async fn record_run(
    adapter: &dyn Adapter,
    task: &TaskSpec,
    opts: &RunOptions,
    policies: &Arc<PolicyManager>,
) -> Result<RunResult> {
    let sc = scaffold(adapter, task, opts, policies, opts.seed, None)?;
    let run_span = tracing::info_span!("detrace.run", run_id = %sc.run_id.to_string());
    let _enter = run_span.enter();
    obs::emit_run_started(&sc.run_id.to_string(), &opts.framework, &task.id, opts.seed);

    let policy = policies.active_policy();
    let providers = Arc::new(Providers::live(sc.run_id, opts.seed));
    let recorder = Arc::new(Recorder::new(
        Arc::clone(&sc.bus),
        &sc.run_dir,
        Arc::clone(&sc.screener),
        Arc::clone(policies),
    ));
    let ctx = RunContext {
        run_id: sc.run_id,
        bus: Arc::clone(&sc.bus),
        edges: recorder,
        providers: Arc::clone(&providers),
        policy: Arc::clone(&policy),
        parity: opts.parity,
        sandbox: sc.sandbox,
        fs: sc.fs,
        net: Arc::new(NetworkController::new(Arc::clone(&policy))),
        screener: Arc::clone(&sc.screener),
    };
    drop(_enter);

    drive(adapter, task, opts, sc.bus, sc.manifest, &sc.run_dir, ctx, &providers)
        .instrument(run_span)
        .await
}

/// Extra inputs for a replayed run.
#[derive(Debug, Clone)]
pub struct ReplayRunOptions {
    pub recording_dir: PathBuf,
    pub replay: ReplayOptions,
}

/// Replay a recorded run against `adapter`.
///
/// Network is disabled regardless of policy; providers are fed from the
/// recording; under strict mode the replayed stream must equal the
/// recording up to timestamps and durations.
pub async fn replay_run(
    adapter: &dyn Adapter,
    task: &TaskSpec,
    opts: &RunOptions,
    policies: &Arc<PolicyManager>,
    replay_opts: &ReplayRunOptions,
) -> Result<RunResult> {
    let recording = Recording::load(&replay_opts.recording_dir)?;
    let seed = recording.manifest.seed;
    let sc = scaffold(adapter, task, opts, policies, seed, Some(&recording))?;
    let run_span = tracing::info_span!("detrace.run", run_id = %sc.run_id.to_string());
    let _enter = run_span.enter();
    obs::emit_run_started(&sc.run_id.to_string(), &opts.framework, &task.id, seed);

    let policy = policies.active_policy();
    let providers = Arc::new(Providers::replayed(
        sc.run_id,
        seed,
        recording.clock_reads.clone(),
        &sc.run_dir,
    ));

    let strict_everywhere = replay_opts.replay.mode == ReplayMode::Strict;
    let recorded_events = recording.events.clone();

    // Warn-mode misses fall through to live execution under current policy.
    let fallback = match replay_opts.replay.mode {
        ReplayMode::Strict => None,
        _ => Some(Arc::new(Recorder::new(
            Arc::clone(&sc.bus),
            &sc.run_dir,
            Arc::clone(&sc.screener),
            Arc::clone(policies),
        ))),
    };
    let engine = Arc::new(ReplayEngine::new(
        Arc::clone(&sc.bus),
        recording,
        replay_opts.replay.clone(),
        fallback,
    ));

    let ctx = RunContext {
        run_id: sc.run_id,
        bus: Arc::clone(&sc.bus),
        edges: engine,
        providers: Arc::clone(&providers),
        policy: Arc::clone(&policy),
        parity: opts.parity,
        sandbox: sc.sandbox,
        fs: sc.fs,
        net: Arc::new(NetworkController::replay_locked(Arc::clone(&policy))),
        screener: Arc::clone(&sc.screener),
    };
    drop(_enter);

    let mut result = drive(
        adapter, task, opts, Arc::clone(&sc.bus), sc.manifest, &sc.run_dir, ctx, &providers,
    )
    .instrument(run_span)
    .await?;

    // Strict determinism check: the replayed stream must equal the
    // recording up to the allow-listed fields. Partial replays are
    // intentionally shorter and skip the check.
    let partial =
        replay_opts.replay.from_checkpoint.is_some() || replay_opts.replay.until_step.is_some();
    if strict_everywhere && !partial && result.status == RunStatus::Ok {
        let replayed = sc.bus.events_snapshot();
        if let Err(reason) = streams_equal(&recorded_events, &replayed) {
            obs::emit_replay_assert(&result.trace_id, &reason, true);
            let mut manifest = RunManifest::read(&sc.run_dir)?;
            manifest.finalize(&sc.run_dir, RunStatus::ReplayMismatch, sc.bus.redaction_log())?;
            result.status = RunStatus::ReplayMismatch;
        }
    }
    Ok(result)
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    adapter: &dyn Adapter,
    task: &TaskSpec,
    opts: &RunOptions,
    bus: Arc<TelemetryBus>,
    mut manifest: RunManifest,
    run_dir: &Path,
    ctx: RunContext,
    providers: &Providers,
) -> Result<RunResult> {
    let begun = Instant::now();
    match drive_inner(adapter, task, opts, &bus, ctx, providers).await {
        Ok((status, verified_pass, verification_score)) => {
            let events = bus.events_snapshot();
            let token_total: u64 = events
                .iter()
                .map(|e| e.token_in.unwrap_or(0) + e.token_out.unwrap_or(0))
                .sum();
            let duration_ms = begun.elapsed().as_millis() as u64;

            manifest.finalize(run_dir, status, bus.redaction_log())?;
            obs::emit_run_finished(
                &bus.run_id().to_string(),
                &status.to_string(),
                duration_ms,
                events.len() as u64,
            );

            Ok(RunResult {
                run_id: bus.run_id(),
                status,
                verified_pass,
                verification_score,
                duration_ms,
                token_total,
                trace_id: bus.run_id().to_string(),
                seed: bus.seed(),
            })
        }
        Err(e) => {
            // Telemetry or manifest machinery failed mid-run: the partial
            // event file stays on disk, marked incomplete.
            let _ = manifest.finalize(run_dir, RunStatus::Incomplete, bus.redaction_log());
            Err(e)
        }
    }
}

async fn drive_inner(
    adapter: &dyn Adapter,
    task: &TaskSpec,
    opts: &RunOptions,
    bus: &Arc<TelemetryBus>,
    ctx: RunContext,
    providers: &Providers,
) -> Result<(RunStatus, bool, Option<f64>)> {
    bus.emit(
        EventDraft::new("runner", EventType::AgentStart).payload(serde_json::json!({
            "framework": opts.framework,
            "task_id": task.id,
            "parity": ctx.parity,
        })),
    )?;

    let outcome = adapter.run_task(task, &ctx).await;

    // Persist the clock reads so replays can serve them at the same steps.
    bus.emit(
        EventDraft::new("runner", EventType::RecordingNote).payload(serde_json::json!({
            "kind": "clock_reads",
            "values": providers.clock.reads(),
        })),
    )?;

    let (status, verified_pass, verification_score) = match &outcome {
        Ok(result) => (RunStatus::Ok, result.verified_pass, result.verification_score),
        Err(EngineError::ReplayHalt { at_step }) => {
            bus.emit(
                EventDraft::new("runner", EventType::RecordingNote).payload(serde_json::json!({
                    "kind": "replay_halted",
                    "at_step": at_step,
                })),
            )?;
            (RunStatus::Ok, false, None)
        }
        Err(e) => {
            let status = status_for(e);
            if status == RunStatus::AdapterError {
                bus.emit(
                    EventDraft::new("runner", EventType::AdapterError).payload(
                        serde_json::json!({
                            "message": e.to_string(),
                            "trace_id": bus.run_id().to_string(),
                        }),
                    ),
                )?;
            }
            (status, false, None)
        }
    };

    bus.emit(
        EventDraft::new("runner", EventType::AgentStop).payload(serde_json::json!({
            "status": status.to_string(),
        })),
    )?;
    bus.finalize()?;

    Ok((status, verified_pass, verification_score))
}
