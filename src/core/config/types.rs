use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::domain::types::ExpiryPolicy;

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(super) server: ServerSettings,
    pub(super) runtime: RuntimeSettings,
    pub(super) api: ApiSettings,
    pub(super) cors: CorsSettings,
    pub(super) ai: AiSettings,
    pub(super) grading: GradingSettings,
    pub(super) upload: UploadSettings,
    pub(super) workspace: WorkspaceSettings,
    pub(super) telemetry: TelemetrySettings,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerSettings {
    pub(super) host: ServerHost,
    pub(super) port: ServerPort,
}

#[derive(Debug, Clone)]
pub(crate) struct ApiSettings {
    pub(crate) project_name: String,
    pub(crate) version: String,
    pub(crate) prefix: String,
}

#[derive(Debug, Clone)]
pub(crate) struct CorsSettings {
    pub(crate) origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct AiSettings {
    pub(crate) openai_api_key: String,
    pub(crate) openai_base_url: String,
    pub(crate) ai_model: String,
    pub(crate) ai_max_tokens: u32,
    pub(crate) ai_temperature: f64,
    pub(crate) ai_request_timeout: u64,
    pub(crate) max_retries: u32,
    pub(crate) backoff_base_ms: u64,
    pub(crate) backoff_max_ms: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct GradingSettings {
    pub(crate) max_concurrency: usize,
    pub(crate) batch_timeout_seconds: u64,
    pub(crate) default_max_score: f64,
    pub(crate) min_rubric_chars: usize,
    pub(crate) max_rubric_chars: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct UploadSettings {
    pub(crate) max_upload_size_mb: u64,
    pub(crate) max_file_size_mb: u64,
    pub(crate) max_archive_entries: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct WorkspaceSettings {
    pub(crate) root: PathBuf,
    pub(crate) retention_seconds: u64,
    pub(crate) sweep_interval_seconds: u64,
    pub(crate) expiry_policy: ExpiryPolicy,
}

#[derive(Debug, Clone)]
pub(crate) struct TelemetrySettings {
    pub(crate) log_level: String,
    pub(crate) json: bool,
    pub(crate) prometheus_enabled: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeSettings {
    pub(crate) environment: Environment,
    pub(crate) strict_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Environment {
    Development,
    Production,
    Staging,
    Test,
}

impl Environment {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Test => "test",
        }
    }

    pub(super) fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ServerHost(pub(super) String);

#[derive(Debug, Clone, Copy)]
pub(crate) struct ServerPort(pub(super) u16);

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("invalid server host: {0}")]
    InvalidHost(String),
    #[error("invalid server port: {0}")]
    InvalidPort(String),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("invalid cors origins: {0}")]
    InvalidCors(String),
    #[error("missing required secret for {0}")]
    MissingSecret(&'static str),
}

impl AiSettings {
    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_request_timeout)
    }

    pub(crate) fn is_configured(&self) -> bool {
        !self.openai_api_key.is_empty()
    }
}

impl GradingSettings {
    /// `None` when the wall-clock cap is disabled.
    pub(crate) fn batch_timeout(&self) -> Option<Duration> {
        (self.batch_timeout_seconds > 0).then(|| Duration::from_secs(self.batch_timeout_seconds))
    }
}

impl UploadSettings {
    pub(crate) fn max_upload_bytes(&self) -> u64 {
        self.max_upload_size_mb * 1024 * 1024
    }

    pub(crate) fn max_file_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

impl WorkspaceSettings {
    pub(crate) fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }

    pub(crate) fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

impl ServerHost {
    pub(super) fn parse(value: String) -> Result<Self, ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::InvalidHost(value));
        }

        Ok(Self(value))
    }
}

impl ServerPort {
    pub(super) fn parse(value: String) -> Result<Self, ConfigError> {
        let parsed: u16 = value.parse().map_err(|_| ConfigError::InvalidPort(value.clone()))?;
        if parsed == 0 {
            return Err(ConfigError::InvalidPort(value));
        }

        Ok(Self(parsed))
    }
}
