use thiserror::Error;

use super::types::ArtifactKind;

/// Request-level failures. Per-submission failures never become one of these; they are
/// recorded as [`super::types::FailureReason`] inside the batch result instead.
#[derive(Debug, Error)]
pub(crate) enum PipelineError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("input is {size} bytes, limit is {limit} bytes")]
    OversizeInput { size: u64, limit: u64 },
    #[error("batch contains no submissions")]
    EmptyBatch,
    #[error("invalid rubric: {0}")]
    InvalidRubric(String),
    #[error("session not found")]
    SessionNotFound,
    #[error("{0} report is not ready")]
    ArtifactNotReady(&'static str),
    #[error("workspace error: {0:#}")]
    Workspace(anyhow::Error),
}

impl PipelineError {
    pub(crate) fn artifact_not_ready(kind: ArtifactKind) -> Self {
        Self::ArtifactNotReady(kind.as_str())
    }
}
