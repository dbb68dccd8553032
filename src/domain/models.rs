use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;

use super::errors::PipelineError;
use super::types::{FailureReason, GradingStatus};
use crate::core::config::Settings;

#[derive(Debug, Clone, Copy)]
pub(crate) struct RubricLimits {
    pub(crate) min_chars: usize,
    pub(crate) max_chars: usize,
    pub(crate) default_max_score: f64,
}

impl RubricLimits {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        Self {
            min_chars: settings.grading().min_rubric_chars,
            max_chars: settings.grading().max_rubric_chars,
            default_max_score: settings.grading().default_max_score,
        }
    }
}

/// Instructor criteria. The text is forwarded to the grading engine verbatim.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Rubric {
    text: String,
    max_score: f64,
    declared_max: bool,
}

impl Rubric {
    pub(crate) fn parse(raw: &str, limits: &RubricLimits) -> Result<Self, PipelineError> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(PipelineError::InvalidRubric("rubric text is required".to_string()));
        }

        let length = text.chars().count();
        if length < limits.min_chars {
            return Err(PipelineError::InvalidRubric(format!(
                "rubric is too short ({length} characters, minimum {})",
                limits.min_chars
            )));
        }
        if length > limits.max_chars {
            return Err(PipelineError::InvalidRubric(format!(
                "rubric is too long ({length} characters, maximum {})",
                limits.max_chars
            )));
        }

        let declared = infer_max_score(text);
        Ok(Self {
            text: text.to_string(),
            max_score: declared.unwrap_or(limits.default_max_score),
            declared_max: declared.is_some(),
        })
    }

    pub(crate) fn text(&self) -> &str {
        &self.text
    }

    pub(crate) fn max_score(&self) -> f64 {
        self.max_score
    }

    pub(crate) fn declares_max(&self) -> bool {
        self.declared_max
    }
}

fn max_score_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\bout\s+of\s+(\d+(?:\.\d+)?)",
            r"(?i)\btotal(?:\s+(?:points?|score|marks?))?\s*[:=]\s*(\d+(?:\.\d+)?)",
            r"(?i)\bmax(?:imum)?\s+(?:score|points?|marks?)\s*[:=]\s*(\d+(?:\.\d+)?)",
            r"(?i)(\d+(?:\.\d+)?)\s*(?:points?|pts|marks?)\s+total",
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("valid rubric max pattern"))
        .collect()
    })
}

/// First declared maximum in the rubric text, by pattern priority.
pub(crate) fn infer_max_score(text: &str) -> Option<f64> {
    max_score_patterns().iter().find_map(|pattern| {
        pattern
            .captures(text)
            .and_then(|captures| captures.get(1))
            .and_then(|value| value.as_str().parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value > 0.0)
    })
}

/// Scores print without a trailing `.0` when whole.
pub(crate) fn format_score(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}

/// One student document. Immutable once normalized.
#[derive(Debug, Clone)]
pub(crate) struct Submission {
    pub(crate) student_identifier: String,
    pub(crate) source_filename: String,
    pub(crate) raw_content: Arc<[u8]>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GradingResult {
    pub(crate) student_identifier: String,
    pub(crate) source_filename: String,
    pub(crate) score: Option<f64>,
    pub(crate) feedback: String,
    pub(crate) status: GradingStatus,
    pub(crate) attempts: u32,
}

impl GradingResult {
    pub(crate) fn ok(submission: &Submission, score: f64, feedback: String, attempts: u32) -> Self {
        Self {
            student_identifier: submission.student_identifier.clone(),
            source_filename: submission.source_filename.clone(),
            score: Some(score),
            feedback,
            status: GradingStatus::Ok,
            attempts,
        }
    }

    pub(crate) fn failed(submission: &Submission, reason: FailureReason, attempts: u32) -> Self {
        Self {
            student_identifier: submission.student_identifier.clone(),
            source_filename: submission.source_filename.clone(),
            score: None,
            feedback: String::new(),
            status: GradingStatus::Failed(reason),
            attempts,
        }
    }

    pub(crate) fn failure_reason(&self) -> Option<&FailureReason> {
        match &self.status {
            GradingStatus::Ok => None,
            GradingStatus::Failed(reason) => Some(reason),
        }
    }
}

/// Results in submission discovery order, with batch totals.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BatchResult {
    pub(crate) results: Vec<GradingResult>,
    pub(crate) total: usize,
    pub(crate) succeeded: usize,
    pub(crate) failed: usize,
    pub(crate) elapsed: Duration,
    pub(crate) max_score: f64,
}

impl BatchResult {
    pub(crate) fn new(results: Vec<GradingResult>, elapsed: Duration, max_score: f64) -> Self {
        let succeeded = results.iter().filter(|result| result.status.is_ok()).count();
        Self {
            total: results.len(),
            failed: results.len() - succeeded,
            succeeded,
            results,
            elapsed,
            max_score,
        }
    }
}
