//! Engine error taxonomy and exit-code mapping.

use detrace_core::CoreError;
use detrace_safety::SafetyError;

/// Errors raised by the recorder, replay engine, and executors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("replay mismatch: {reason}")]
    ReplayMismatch { reason: String },

    #[error("replay out of order: recorded step {got} consumed after cursor {expected}")]
    ReplayOutOfOrder { expected: u64, got: u64 },

    #[error("replay halted at step {at_step} (until-step reached)")]
    ReplayHalt { at_step: u64 },

    #[error("duplicate replay lookup key: {0}")]
    DuplicateLookupKey(String),

    #[error("edge failed: {message}")]
    Edge { message: String },

    #[error("adapter error in run {run_id}: {message}")]
    Adapter { run_id: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Safety(#[from] SafetyError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Process exit code for this error class.
    ///
    /// 0 success, 2 policy violation, 3 replay mismatch, 4 adapter error,
    /// 5 configuration error, 1 anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Safety(SafetyError::Violation { .. }) => 2,
            EngineError::ReplayMismatch { .. }
            | EngineError::ReplayOutOfOrder { .. }
            | EngineError::DuplicateLookupKey(_) => 3,
            EngineError::Adapter { .. } | EngineError::Edge { .. } => 4,
            EngineError::Configuration(_) => 5,
            EngineError::Core(CoreError::Configuration(_)) => 5,
            EngineError::Safety(SafetyError::InvalidPolicy { .. })
            | EngineError::Safety(SafetyError::UnknownPolicy(_)) => 5,
            _ => 1,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
