use std::fmt;

use serde::Serialize;

/// Why a single submission could not be graded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub(crate) enum FailureReason {
    TransportError(String),
    QuotaExceeded(String),
    ParseError(String),
    Cancelled,
}

impl FailureReason {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::TransportError(_) => "TransportError",
            Self::QuotaExceeded(_) => "QuotaExceeded",
            Self::ParseError(_) => "ParseError",
            Self::Cancelled => "Cancelled",
        }
    }

    pub(crate) fn as_metric_label(&self) -> &'static str {
        match self {
            Self::TransportError(_) => "transport_error",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::ParseError(_) => "parse_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportError(detail)
            | Self::QuotaExceeded(detail)
            | Self::ParseError(detail) => write!(f, "{}: {}", self.label(), detail),
            Self::Cancelled => f.write_str("Cancelled: grading was cancelled before this submission ran"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum GradingStatus {
    Ok,
    Failed(FailureReason),
}

impl GradingStatus {
    pub(crate) fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub(crate) fn flag(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Failed(_) => "FAILED",
        }
    }
}

/// Rendered artifacts a session can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ArtifactKind {
    Pdf,
    Csv,
}

impl ArtifactKind {
    pub(crate) const ALL: [ArtifactKind; 2] = [ArtifactKind::Pdf, ArtifactKind::Csv];

    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Csv => "csv",
        }
    }

    pub(crate) fn file_name(self) -> &'static str {
        match self {
            Self::Pdf => "grading_reports.pdf",
            Self::Csv => "grading_report.csv",
        }
    }

    pub(crate) fn content_type(self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Csv => "text/csv; charset=utf-8",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ExpiryPolicy {
    /// Kept until the retention window elapses.
    RetentionWindow,
    /// Released once every artifact has been downloaded, or when the window elapses.
    AfterDownload,
}
