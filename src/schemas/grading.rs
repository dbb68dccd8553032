use serde::Serialize;

use crate::domain::types::{ArtifactKind, FailureReason};
use crate::domain::{BatchResult, GradingResult};

#[derive(Debug, Serialize)]
pub(crate) struct GradeResultResponse {
    pub(crate) student_identifier: String,
    pub(crate) source_filename: String,
    pub(crate) score: Option<f64>,
    pub(crate) feedback: String,
    pub(crate) status: &'static str,
    pub(crate) failure: Option<FailureReason>,
    pub(crate) attempts: u32,
}

impl From<&GradingResult> for GradeResultResponse {
    fn from(result: &GradingResult) -> Self {
        Self {
            student_identifier: result.student_identifier.clone(),
            source_filename: result.source_filename.clone(),
            score: result.score,
            feedback: result.feedback.clone(),
            status: result.status.flag(),
            failure: result.failure_reason().cloned(),
            attempts: result.attempts,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct GradeResponse {
    pub(crate) session_id: String,
    pub(crate) total: usize,
    pub(crate) graded_count: usize,
    pub(crate) error_count: usize,
    pub(crate) elapsed_ms: u64,
    pub(crate) max_score: f64,
    pub(crate) results: Vec<GradeResultResponse>,
    pub(crate) pdf_report_url: String,
    pub(crate) csv_report_url: String,
}

impl GradeResponse {
    pub(crate) fn new(session_id: String, batch: &BatchResult, api_prefix: &str) -> Self {
        let report_url = |kind: ArtifactKind| format!("{api_prefix}/download/{session_id}/{}", kind.as_str());
        Self {
            pdf_report_url: report_url(ArtifactKind::Pdf),
            csv_report_url: report_url(ArtifactKind::Csv),
            total: batch.total,
            graded_count: batch.succeeded,
            error_count: batch.failed,
            elapsed_ms: batch.elapsed.as_millis() as u64,
            max_score: batch.max_score,
            results: batch.results.iter().map(GradeResultResponse::from).collect(),
            session_id,
        }
    }
}
