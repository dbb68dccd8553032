use std::path::PathBuf;

use super::parsing::{
    default_workspace_root, env_optional, env_or_default, parse_bool, parse_cors_origins,
    parse_environment, parse_expiry_policy, parse_f64, parse_u32, parse_u64, parse_usize,
};
use super::types::{
    AiSettings, ApiSettings, ConfigError, CorsSettings, GradingSettings, RuntimeSettings,
    ServerHost, ServerPort, ServerSettings, Settings, TelemetrySettings, UploadSettings,
    WorkspaceSettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("GRADER_HOST", "0.0.0.0");
        let port = env_or_default("GRADER_PORT", "8080");

        let environment =
            parse_environment(env_optional("GRADER_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let strict_config =
            env_optional("GRADER_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "Rubric Grader");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));
        let prefix = env_or_default("API_PREFIX", "/api");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let openai_api_key = env_or_default("OPENAI_API_KEY", "");
        let openai_base_url = env_or_default("OPENAI_BASE_URL", "https://api.openai.com/v1");
        let ai_model = env_or_default("AI_MODEL", "gpt-4o-mini");
        let ai_max_tokens = parse_u32("AI_MAX_TOKENS", env_or_default("AI_MAX_TOKENS", "2000"))?;
        let ai_temperature =
            parse_f64("AI_TEMPERATURE", env_or_default("AI_TEMPERATURE", "0.2"))?;
        let ai_request_timeout =
            parse_u64("AI_REQUEST_TIMEOUT", env_or_default("AI_REQUEST_TIMEOUT", "120"))?;
        let max_retries = parse_u32("AI_MAX_RETRIES", env_or_default("AI_MAX_RETRIES", "3"))?;
        let backoff_base_ms =
            parse_u64("AI_BACKOFF_BASE_MS", env_or_default("AI_BACKOFF_BASE_MS", "1000"))?;
        let backoff_max_ms =
            parse_u64("AI_BACKOFF_MAX_MS", env_or_default("AI_BACKOFF_MAX_MS", "30000"))?;

        let max_concurrency = parse_usize(
            "GRADING_MAX_CONCURRENCY",
            env_or_default("GRADING_MAX_CONCURRENCY", "4"),
        )?;
        let batch_timeout_seconds = parse_u64(
            "GRADING_BATCH_TIMEOUT_SECONDS",
            env_or_default("GRADING_BATCH_TIMEOUT_SECONDS", "1800"),
        )?;
        let default_max_score = parse_f64(
            "GRADING_DEFAULT_MAX_SCORE",
            env_or_default("GRADING_DEFAULT_MAX_SCORE", "100"),
        )?;
        let min_rubric_chars =
            parse_usize("MIN_RUBRIC_CHARS", env_or_default("MIN_RUBRIC_CHARS", "10"))?;
        let max_rubric_chars =
            parse_usize("MAX_RUBRIC_CHARS", env_or_default("MAX_RUBRIC_CHARS", "50000"))?;

        let max_upload_size_mb =
            parse_u64("MAX_UPLOAD_SIZE_MB", env_or_default("MAX_UPLOAD_SIZE_MB", "100"))?;
        let max_file_size_mb =
            parse_u64("MAX_FILE_SIZE_MB", env_or_default("MAX_FILE_SIZE_MB", "50"))?;
        let max_archive_entries =
            parse_usize("MAX_ARCHIVE_ENTRIES", env_or_default("MAX_ARCHIVE_ENTRIES", "100"))?;

        let workspace_root =
            env_optional("WORKSPACE_ROOT").map(PathBuf::from).unwrap_or_else(default_workspace_root);
        let retention_seconds = parse_u64(
            "SESSION_RETENTION_SECONDS",
            env_or_default("SESSION_RETENTION_SECONDS", "3600"),
        )?;
        let sweep_interval_seconds = parse_u64(
            "SESSION_SWEEP_INTERVAL_SECONDS",
            env_or_default("SESSION_SWEEP_INTERVAL_SECONDS", "300"),
        )?;
        let expiry_policy = parse_expiry_policy(env_optional("SESSION_EXPIRY_POLICY"))?;

        let log_level = env_or_default("GRADER_LOG_LEVEL", "info");
        let json = env_optional("GRADER_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings { host: ServerHost::parse(host)?, port: ServerPort::parse(port)? },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings { project_name, version, prefix },
            cors: CorsSettings { origins: cors_origins },
            ai: AiSettings {
                openai_api_key,
                openai_base_url,
                ai_model,
                ai_max_tokens,
                ai_temperature,
                ai_request_timeout,
                max_retries,
                backoff_base_ms,
                backoff_max_ms,
            },
            grading: GradingSettings {
                max_concurrency,
                batch_timeout_seconds,
                default_max_score,
                min_rubric_chars,
                max_rubric_chars,
            },
            upload: UploadSettings { max_upload_size_mb, max_file_size_mb, max_archive_entries },
            workspace: WorkspaceSettings {
                root: workspace_root,
                retention_seconds,
                sweep_interval_seconds,
                expiry_policy,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;

        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn ai(&self) -> &AiSettings {
        &self.ai
    }

    pub(crate) fn grading(&self) -> &GradingSettings {
        &self.grading
    }

    pub(crate) fn upload(&self) -> &UploadSettings {
        &self.upload
    }

    pub(crate) fn workspace(&self) -> &WorkspaceSettings {
        &self.workspace
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.grading.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_MAX_CONCURRENCY",
                value: "0".to_string(),
            });
        }

        if self.grading.default_max_score <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_DEFAULT_MAX_SCORE",
                value: self.grading.default_max_score.to_string(),
            });
        }

        if self.grading.min_rubric_chars == 0
            || self.grading.min_rubric_chars > self.grading.max_rubric_chars
        {
            return Err(ConfigError::InvalidValue {
                field: "MIN_RUBRIC_CHARS",
                value: self.grading.min_rubric_chars.to_string(),
            });
        }

        if self.upload.max_upload_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "MAX_UPLOAD_SIZE_MB",
                value: "0".to_string(),
            });
        }

        if self.upload.max_file_size_mb == 0
            || self.upload.max_file_size_mb > self.upload.max_upload_size_mb
        {
            return Err(ConfigError::InvalidValue {
                field: "MAX_FILE_SIZE_MB",
                value: self.upload.max_file_size_mb.to_string(),
            });
        }

        if self.upload.max_archive_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "MAX_ARCHIVE_ENTRIES",
                value: "0".to_string(),
            });
        }

        if self.ai.ai_request_timeout == 0 {
            return Err(ConfigError::InvalidValue {
                field: "AI_REQUEST_TIMEOUT",
                value: "0".to_string(),
            });
        }

        if self.ai.backoff_base_ms > self.ai.backoff_max_ms {
            return Err(ConfigError::InvalidValue {
                field: "AI_BACKOFF_BASE_MS",
                value: self.ai.backoff_base_ms.to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.ai.openai_api_key.is_empty() {
            return Err(ConfigError::MissingSecret("OPENAI_API_KEY"));
        }

        if self.ai.openai_base_url.is_empty() {
            return Err(ConfigError::MissingSecret("OPENAI_BASE_URL"));
        }

        Ok(())
    }
}
