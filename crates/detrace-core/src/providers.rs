//! Deterministic providers: clock, RNG, UUID, and temp paths.
//!
//! All four are seeded from a single [`SeedBus`] derived from the run seed.
//! In record mode the clock wraps the OS clock and logs every read; in
//! replay mode it hands back the recorded values in order. The RNG is
//! ChaCha20 with an explicit seed expansion so the stream is stable across
//! platforms and builds; sub-streams are derived by label so independent
//! consumers never interleave.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::events::RunId;

/// Derives per-provider seeds from the 64-bit run seed.
///
/// Each label gets an independent 32-byte seed via BLAKE3's derive-key mode,
/// so adding a new provider never shifts the streams of existing ones.
#[derive(Debug, Clone, Copy)]
pub struct SeedBus {
    run_seed: u64,
}

impl SeedBus {
    pub fn new(run_seed: u64) -> Self {
        Self { run_seed }
    }

    pub fn run_seed(&self) -> u64 {
        self.run_seed
    }

    /// 32-byte seed for the named sub-stream.
    pub fn derive(&self, label: &str) -> [u8; 32] {
        let context = format!("detrace seed-bus v1 {label}");
        blake3::derive_key(&context, &self.run_seed.to_le_bytes())
    }
}

/// Integer-nanosecond clock.
///
/// Live reads come from the OS and are logged so the recorder can persist
/// them; replayed reads are served from the recorded sequence in order.
#[derive(Debug)]
pub struct DeterministicClock {
    mode: ClockMode,
    log: Mutex<Vec<u64>>,
}

#[derive(Debug)]
enum ClockMode {
    Live,
    Replay(Mutex<VecDeque<u64>>),
}

impl DeterministicClock {
    pub fn live() -> Self {
        Self {
            mode: ClockMode::Live,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn replayed(recorded: Vec<u64>) -> Self {
        Self {
            mode: ClockMode::Replay(Mutex::new(recorded.into())),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Nanoseconds since the Unix epoch.
    pub fn now_ns(&self) -> Result<u64> {
        let value = match &self.mode {
            ClockMode::Live => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map_err(|e| CoreError::Configuration(format!("system clock: {e}")))?;
                now.as_nanos() as u64
            }
            ClockMode::Replay(queue) => queue
                .lock()
                .expect("clock queue lock poisoned")
                .pop_front()
                .ok_or_else(|| {
                    CoreError::ReplaySourceExhausted("clock reads exhausted".to_string())
                })?,
        };
        self.log.lock().expect("clock log lock poisoned").push(value);
        Ok(value)
    }

    /// Every value this clock has handed out, in order. Recorded per step.
    pub fn reads(&self) -> Vec<u64> {
        self.log.lock().expect("clock log lock poisoned").clone()
    }
}

/// Deterministic uniform-u64 stream, splittable by sub-stream name.
///
/// ChaCha20 seeded with the 32-byte key the [`SeedBus`] derives for this
/// stream's label: BLAKE3 derive-key over the run seed's little-endian
/// bytes, contextualized by the label. The expansion is a fixed part of
/// the recording format; changing it invalidates every existing
/// recording's RNG stream.
pub struct DeterministicRng {
    rng: Mutex<ChaCha20Rng>,
    bus: SeedBus,
    label: String,
}

impl std::fmt::Debug for DeterministicRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeterministicRng")
            .field("label", &self.label)
            .finish()
    }
}

impl DeterministicRng {
    pub fn from_seed_bus(bus: SeedBus) -> Self {
        Self::with_label(bus, "rng/root")
    }

    fn with_label(bus: SeedBus, label: &str) -> Self {
        let seed32 = bus.derive(label);
        Self {
            rng: Mutex::new(ChaCha20Rng::from_seed(seed32)),
            bus,
            label: label.to_string(),
        }
    }

    /// Next uniform 64-bit integer from this stream.
    pub fn next_u64(&self) -> u64 {
        self.rng.lock().expect("rng lock poisoned").next_u64()
    }

    /// Unbiased integer in `[0, n)` via rejection sampling. `None` if n == 0.
    pub fn gen_range(&self, n: u64) -> Option<u64> {
        if n == 0 {
            return None;
        }
        let threshold = n.wrapping_neg() % n;
        loop {
            let x = self.next_u64();
            if x >= threshold {
                return Some(x % n);
            }
        }
    }

    /// Derive an independent stream keyed by `name`. Streams with distinct
    /// names never correlate regardless of draw order.
    pub fn substream(&self, name: &str) -> DeterministicRng {
        DeterministicRng::with_label(self.bus, &format!("{}/{}", self.label, name))
    }

    /// Fill `dest` from the stream.
    pub fn fill_bytes(&self, dest: &mut [u8]) {
        self.rng.lock().expect("rng lock poisoned").fill_bytes(dest)
    }
}

/// UUID source derived from the deterministic RNG stream.
///
/// Output is shaped like a v4 UUID (version and variant bits forced) so it
/// is accepted anywhere a random UUID is, but the sequence is a pure
/// function of the run seed.
#[derive(Debug)]
pub struct DeterministicUuid {
    rng: DeterministicRng,
}

impl DeterministicUuid {
    pub fn from_seed_bus(bus: SeedBus) -> Self {
        Self {
            rng: DeterministicRng::with_label(bus, "uuid"),
        }
    }

    pub fn next(&self) -> Uuid {
        let mut bytes = [0u8; 16];
        self.rng.fill_bytes(&mut bytes);
        bytes[6] = (bytes[6] & 0x0f) | 0x40; // version 4
        bytes[8] = (bytes[8] & 0x3f) | 0x80; // RFC 4122 variant
        Uuid::from_bytes(bytes)
    }
}

/// Temp path source of the form `<root>/<run_id>/<step>/<purpose>`.
///
/// Replay reuses the recorded relative layout rebased onto the replay
/// workspace so recorded paths stay valid without touching `/tmp`.
#[derive(Debug, Clone)]
pub struct TempPathProvider {
    root: PathBuf,
    run_id: RunId,
}

impl TempPathProvider {
    pub fn new(run_id: RunId) -> Self {
        Self {
            root: std::env::temp_dir(),
            run_id,
        }
    }

    pub fn with_root(run_id: RunId, root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            run_id,
        }
    }

    pub fn path_for(&self, step: u64, purpose: &str) -> PathBuf {
        self.root
            .join(self.run_id.to_string())
            .join(step.to_string())
            .join(purpose)
    }

    /// Rebase a recorded temp path onto this provider's workspace root.
    /// Falls back to the tail components when the recorded root differs.
    pub fn rebind(&self, recorded: &Path) -> PathBuf {
        let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
        for component in recorded.components().rev() {
            tail.push(component.as_os_str());
            if tail.len() == 3 {
                break;
            }
        }
        let mut out = self.root.clone();
        for part in tail.into_iter().rev() {
            out.push(part);
        }
        out
    }
}

/// The full provider set handed to adapters through the run context.
#[derive(Debug)]
pub struct Providers {
    pub clock: DeterministicClock,
    pub rng: DeterministicRng,
    pub uuid: DeterministicUuid,
    pub temp: TempPathProvider,
}

impl Providers {
    /// Providers for a live (recording) run.
    pub fn live(run_id: RunId, seed: u64) -> Self {
        let bus = SeedBus::new(seed);
        Self {
            clock: DeterministicClock::live(),
            rng: DeterministicRng::from_seed_bus(bus),
            uuid: DeterministicUuid::from_seed_bus(bus),
            temp: TempPathProvider::new(run_id),
        }
    }

    /// Providers for a replayed run: same seed streams, recorded clock.
    pub fn replayed(run_id: RunId, seed: u64, clock_reads: Vec<u64>, workspace: &Path) -> Self {
        let bus = SeedBus::new(seed);
        Self {
            clock: DeterministicClock::replayed(clock_reads),
            rng: DeterministicRng::from_seed_bus(bus),
            uuid: DeterministicUuid::from_seed_bus(bus),
            temp: TempPathProvider::with_root(run_id, workspace),
        }
    }
}
