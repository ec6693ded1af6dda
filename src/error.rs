//! Error types for stagecraft.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for stagecraft operations.
pub type Result<T> = std::result::Result<T, StagecraftError>;

/// Main error type for stagecraft.
#[derive(Error, Debug)]
pub enum StagecraftError {
    // Configuration errors
    #[error("unresolved stage reference {reference:?} in stage {stage}")]
    UnresolvedStageReference { stage: String, reference: String },

    #[error("{name:?} is not a valid build target")]
    InvalidTarget { name: String },

    #[error("instruction {kind} is not supported by the {backend} backend")]
    UnsupportedInstruction { backend: String, kind: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Build errors
    #[error("stage {stage} ({kind}) failed: {source}")]
    StageFailed {
        stage: String,
        kind: String,
        #[source]
        source: Box<StagecraftError>,
    },

    #[error("build command failed in container {container}: {details}")]
    BuildCommandFailed { container: String, details: String },

    // Build context errors
    #[error("build context path not found: {path:?}")]
    ContextPathNotFound { path: PathBuf },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Storage errors
    #[error("stage storage error: {reason}")]
    Storage { reason: String },

    #[error("invalid digest: {value}")]
    InvalidDigest { value: String },

    // Locking errors
    #[error("timed out acquiring lock {key:?} after {timeout:?}")]
    LockTimeout { key: String, timeout: Duration },

    #[error("lock {key:?} failure: {reason}")]
    LockFailed { key: String, reason: String },

    // Backend errors
    #[error("{backend} backend error: {reason}")]
    Backend { backend: String, reason: String },

    #[error("image not found: {reference}")]
    ImageNotFound { reference: String },

    // Generic errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StagecraftError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Wrap an error with the stage name and instruction kind it occurred in.
    /// Already-wrapped errors pass through unchanged so a failure is attributed
    /// to the innermost failing stage.
    pub fn for_stage(self, stage: &str, kind: &str) -> Self {
        match self {
            err @ StagecraftError::StageFailed { .. } => err,
            err => StagecraftError::StageFailed {
                stage: stage.to_string(),
                kind: kind.to_string(),
                source: Box::new(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_wrapping_names_the_stage() {
        let err = StagecraftError::Backend {
            backend: "docker".into(),
            reason: "daemon unreachable".into(),
        };
        let wrapped = err.for_stage("RUN3", "RUN");
        let msg = wrapped.to_string();
        assert!(msg.contains("RUN3"));
        assert!(msg.contains("RUN"));
    }

    #[test]
    fn stage_wrapping_does_not_stack() {
        let err = StagecraftError::Internal("boom".into())
            .for_stage("COPY1", "COPY")
            .for_stage("RUN2", "RUN");
        match err {
            StagecraftError::StageFailed { stage, .. } => assert_eq!(stage, "COPY1"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
