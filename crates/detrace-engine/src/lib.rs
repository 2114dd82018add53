//! detrace-engine: the recorder, replay engine, and consistency machinery.
//!
//! - [`adapter`]: the contract orchestrator integrations implement, plus
//!   conformance checks and the scripted test adapter
//! - [`recorder`]: wraps live I/O edges, persists payloads, reports
//!   lookup-key collisions
//! - [`replay`]: serves recorded outputs by stable key under
//!   strict/warn/hybrid modes with network disabled
//! - [`runner`]: single-run orchestration and manifest finalization
//! - [`multi_run`]: N seeded executions with a group manifest
//! - [`consensus`]: consensus strategies, variance, reliability scoring

pub mod adapter;
pub mod consensus;
pub mod error;
pub mod multi_run;
pub mod recorder;
pub mod replay;
pub mod runner;

pub use adapter::{
    Adapter, AdapterOutcome, EdgeCall, EdgeError, EdgeFn, EdgeOutput, EdgeRunner, ParityMode,
    RunContext, RunResult, ScriptedAdapter, ScriptedCall, TaskSpec,
};
pub use consensus::{
    analyze, ConsensusDecision, ConsensusStrategy, ConsistencyReport, RunSample, StabilityRating,
};
pub use error::{EngineError, Result};
pub use multi_run::{run_group, ExecutionMode, GroupManifest, MultiRunConfig, SeedStrategy};
pub use recorder::{BlobStore, Recorder, INLINE_PAYLOAD_LIMIT};
pub use replay::{
    EdgeReplayMode, Recording, ReplayEngine, ReplayMode, ReplayOptions,
};
pub use runner::{record_run, replay_run, ReplayRunOptions, RunOptions};
