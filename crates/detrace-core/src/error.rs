//! Core error taxonomy.

/// Errors raised by the determinism substrate.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("canonicalization failed at {path}: {reason}")]
    Canonicalization { path: String, reason: String },

    #[error("telemetry sink failure: {0}")]
    Telemetry(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("digest mismatch for {subject}: expected {expected}, got {actual}")]
    DigestMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("artifact rewrite rejected: {path} already exists with different content")]
    ArtifactRewrite { path: String },

    #[error("replay source exhausted: {0}")]
    ReplaySourceExhausted(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::Canonicalization {
            path: "$.metrics.score".to_string(),
            reason: "non-finite number".to_string(),
        };
        assert!(err.to_string().contains("$.metrics.score"));
        assert!(err.to_string().contains("non-finite"));
    }

    #[test]
    fn test_digest_mismatch_carries_both_digests() {
        let err = CoreError::DigestMismatch {
            subject: "blobs/abc.bin".to_string(),
            expected: "aa11".to_string(),
            actual: "bb22".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("aa11"));
        assert!(msg.contains("bb22"));
    }
}
