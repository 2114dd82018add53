//! detrace-core: the determinism substrate shared by every adapter.
//!
//! This crate owns the pieces that must agree byte-for-byte across a
//! recording and its replay:
//!
//! - [`canonical`]: deterministic serialization and BLAKE3 fingerprints
//! - [`providers`]: seeded clock / RNG / UUID / temp-path sources
//! - [`events`]: the append-only run event schema
//! - [`telemetry`]: the per-run serialized event bus and JSONL sink
//! - [`redaction`]: secret scrubbing applied before anything is persisted
//! - [`manifest`]: the per-run integrity root
//! - [`retention`]: storage-class garbage collection
//! - [`obs`]: structured tracing hooks for the run lifecycle

pub mod canonical;
pub mod error;
pub mod events;
pub mod manifest;
pub mod obs;
pub mod providers;
pub mod redaction;
pub mod retention;
pub mod telemetry;

pub use canonical::{canonicalize, fingerprint};
pub use error::{CoreError, Result};
pub use events::{EdgeKind, Event, EventDraft, EventType, ReplayLookupKey, RunId};
pub use manifest::{ArtifactEntry, RunManifest, RunStatus};
pub use providers::{
    DeterministicClock, DeterministicRng, DeterministicUuid, Providers, SeedBus, TempPathProvider,
};
pub use redaction::{RedactionLogEntry, Redactor};
pub use retention::{RetentionClass, RetentionSweep, StorageClass};
pub use telemetry::{LedgerDriver, TelemetryBus};
