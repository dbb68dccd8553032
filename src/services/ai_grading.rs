use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use validator::Validate;

use crate::core::config::Settings;
use crate::domain::models::format_score;
use crate::domain::types::FailureReason;
use crate::domain::{GradingResult, Rubric, Submission};

const GRADING_SYSTEM_PROMPT: &str = r#"You are an experienced teacher grading one student's PDF submission against an instructor rubric.

Rules:
- Apply the rubric exactly as written. Do not invent criteria.
- Score on the rubric's own scale, from 0 to the stated maximum. Partial credit is allowed.
- Write student-facing feedback: key strengths first, then each deduction with the points lost.
- If the document is unreadable or empty, give 0 and say so in the feedback.

Reply with a single JSON object and nothing else:
{"score": <number>, "feedback": "<feedback text>"}
"#;

/// One grading call. `correction` is set on the re-prompt after an invalid reply.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EngineRequest<'a> {
    pub(crate) rubric: &'a Rubric,
    pub(crate) submission: &'a Submission,
    pub(crate) correction: Option<Correction<'a>>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Correction<'a> {
    pub(crate) previous_reply: &'a str,
    pub(crate) problem: &'a str,
}

#[derive(Debug, Error)]
pub(crate) enum EngineError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("grading call timed out")]
    Timeout,
    #[error("quota exceeded: {detail}")]
    Quota { retry_after: Option<Duration>, detail: String },
    #[error("engine returned HTTP {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("malformed engine response: {0}")]
    InvalidResponse(String),
}

impl EngineError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::Quota { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            Self::InvalidResponse(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Quota { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    fn metric_kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout => "timeout",
            Self::Quota { .. } => "quota",
            Self::Status { .. } => "status",
            Self::InvalidResponse(_) => "invalid_response",
        }
    }

    fn into_failure(self) -> FailureReason {
        match self {
            Self::Quota { detail, .. } => FailureReason::QuotaExceeded(detail),
            Self::InvalidResponse(detail) => FailureReason::ParseError(detail),
            other => FailureReason::TransportError(other.to_string()),
        }
    }
}

/// The external model behind grading. Returns the raw reply text.
#[async_trait]
pub(crate) trait GradingEngine: Send + Sync {
    async fn complete(&self, request: &EngineRequest<'_>) -> Result<String, EngineError>;
}

#[derive(Debug, Clone)]
pub(crate) struct OpenAiGradingEngine {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

impl OpenAiGradingEngine {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(settings.ai().request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key: settings.ai().openai_api_key.clone(),
            base_url: settings.ai().openai_base_url.trim_end_matches('/').to_string(),
            model: settings.ai().ai_model.clone(),
            max_tokens: settings.ai().ai_max_tokens,
            temperature: settings.ai().ai_temperature,
        })
    }

    fn payload(&self, request: &EngineRequest<'_>) -> Value {
        let submission = request.submission;
        let rubric = request.rubric;
        let user_prompt = format!(
            "Submission file: {}\nMaximum score: {}\n\nRUBRIC:\n{}\n\nGrade the attached PDF. Reply with JSON only.",
            submission.source_filename,
            format_score(rubric.max_score()),
            rubric.text(),
        );
        let file_data = format!("data:application/pdf;base64,{}", BASE64.encode(&submission.raw_content));

        let mut messages = vec![
            json!({"role": "system", "content": GRADING_SYSTEM_PROMPT}),
            json!({
                "role": "user",
                "content": [
                    {"type": "text", "text": user_prompt},
                    {"type": "file", "file": {"filename": submission.source_filename, "file_data": file_data}}
                ]
            }),
        ];

        if let Some(correction) = request.correction {
            if !correction.previous_reply.is_empty() {
                messages.push(json!({"role": "assistant", "content": correction.previous_reply}));
            }
            messages.push(json!({"role": "user", "content": correction_prompt(correction.problem, rubric)}));
        }

        json!({
            "model": self.model,
            "messages": messages,
            "max_completion_tokens": self.max_tokens,
            "temperature": self.temperature,
            "response_format": {"type": "json_object"}
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: Option<u64>,
}

#[async_trait]
impl GradingEngine for OpenAiGradingEngine {
    async fn complete(&self, request: &EngineRequest<'_>) -> Result<String, EngineError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.payload(request))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let detail = response.text().await.unwrap_or_default();
            let detail = truncate(&detail, 300);
            return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                EngineError::Quota { retry_after, detail }
            } else {
                EngineError::Status { status: status.as_u16(), detail }
            });
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| EngineError::InvalidResponse(err.to_string()))?;

        if let Some(tokens) = body.usage.as_ref().and_then(|usage| usage.total_tokens) {
            tracing::debug!(submission = %request.submission.student_identifier, tokens_used = tokens, "Engine usage");
        }

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| EngineError::InvalidResponse("missing message content".to_string()))
    }
}

fn map_transport_error(err: reqwest::Error) -> EngineError {
    if err.is_timeout() {
        EngineError::Timeout
    } else {
        EngineError::Transport(err.to_string())
    }
}

fn correction_prompt(problem: &str, rubric: &Rubric) -> String {
    format!(
        "Your previous reply could not be used: {problem}. Reply again with only a JSON object \
         {{\"score\": <number between 0 and {}>, \"feedback\": \"<non-empty text>\"}}.",
        format_score(rubric.max_score())
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RetryPolicy {
    pub(crate) max_retries: u32,
    pub(crate) base_delay: Duration,
    pub(crate) max_delay: Duration,
}

impl RetryPolicy {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.ai().max_retries,
            base_delay: Duration::from_millis(settings.ai().backoff_base_ms),
            max_delay: Duration::from_millis(settings.ai().backoff_max_ms),
        }
    }

    /// Delay before retry number `attempt + 1`. A server hint wins but is still capped.
    pub(crate) fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_delay);
        }
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Deserialize, Validate)]
struct GradeReply {
    #[validate(range(min = 0.0, message = "score must be non-negative"))]
    score: f64,
    #[validate(length(min = 1, message = "feedback must not be empty"))]
    feedback: String,
}

/// Turns a raw reply into `(score, feedback)`, or a description of what is wrong with it.
pub(crate) fn parse_reply(raw: &str, max_score: f64) -> Result<(f64, String), String> {
    let candidate = repair_reply(raw).ok_or_else(|| "reply contains no JSON object".to_string())?;
    let reply: GradeReply =
        serde_json::from_str(candidate).map_err(|err| format!("reply does not match schema: {err}"))?;
    reply.validate().map_err(|err| format!("reply failed validation: {err}"))?;

    if !reply.score.is_finite() || reply.score > max_score {
        return Err(format!(
            "score {} is outside 0..={}",
            reply.score,
            format_score(max_score)
        ));
    }

    let feedback = reply.feedback.trim();
    if feedback.is_empty() {
        return Err("feedback must not be empty".to_string());
    }

    Ok((reply.score, feedback.to_string()))
}

/// Strips Markdown fences and keeps the outermost `{...}`.
fn repair_reply(raw: &str) -> Option<&str> {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
        text = text.trim_end().trim_end_matches("```");
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

#[derive(Clone)]
pub(crate) struct GradingClient {
    engine: Arc<dyn GradingEngine>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl GradingClient {
    pub(crate) fn new(engine: Arc<dyn GradingEngine>, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self { engine, retry, call_timeout }
    }

    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let engine = OpenAiGradingEngine::from_settings(settings)?;
        Ok(Self::new(
            Arc::new(engine),
            RetryPolicy::from_settings(settings),
            settings.ai().request_timeout(),
        ))
    }

    /// Grades one submission. Never fails: terminal problems become a FAILED result.
    pub(crate) async fn grade(&self, rubric: &Rubric, submission: &Submission) -> GradingResult {
        let timer = Instant::now();
        let mut attempts = 0_u32;
        let mut previous_reply = String::new();
        let mut problem = String::new();

        let result = loop {
            let reprompt = attempts > 0;
            let request = EngineRequest {
                rubric,
                submission,
                correction: reprompt.then(|| Correction {
                    previous_reply: &previous_reply,
                    problem: &problem,
                }),
            };

            let reply = match self.call_with_retry(&request, &mut attempts).await {
                Ok(reply) => reply,
                Err(EngineError::InvalidResponse(detail)) if !reprompt => {
                    tracing::info!(
                        submission = %submission.student_identifier,
                        reason = %detail,
                        "Malformed engine response, re-requesting"
                    );
                    metrics::counter!("grading_reprompts_total").increment(1);
                    previous_reply.clear();
                    problem = detail;
                    continue;
                }
                Err(err) => {
                    tracing::warn!(
                        submission = %submission.student_identifier,
                        attempts,
                        error = %err,
                        "Grading call failed"
                    );
                    break GradingResult::failed(submission, err.into_failure(), attempts);
                }
            };

            match parse_reply(&reply, rubric.max_score()) {
                Ok((score, feedback)) => break GradingResult::ok(submission, score, feedback, attempts),
                Err(reason) if !reprompt => {
                    tracing::info!(
                        submission = %submission.student_identifier,
                        reason = %reason,
                        "Invalid grading reply, re-prompting"
                    );
                    metrics::counter!("grading_reprompts_total").increment(1);
                    previous_reply = reply;
                    problem = reason;
                }
                Err(reason) => {
                    tracing::warn!(
                        submission = %submission.student_identifier,
                        reason = %reason,
                        "Grading reply still invalid after re-prompt"
                    );
                    break GradingResult::failed(submission, FailureReason::ParseError(reason), attempts);
                }
            }
        };

        let elapsed = timer.elapsed().as_secs_f64();
        metrics::histogram!("grading_call_duration_seconds").record(elapsed);
        metrics::counter!("grading_submissions_total", "status" => result.status.flag()).increment(1);
        tracing::info!(
            submission = %submission.student_identifier,
            status = result.status.flag(),
            attempts = result.attempts,
            duration_seconds = elapsed,
            "Submission graded"
        );

        result
    }

    async fn call_with_retry(
        &self,
        request: &EngineRequest<'_>,
        attempts: &mut u32,
    ) -> Result<String, EngineError> {
        let mut retry = 0_u32;
        loop {
            *attempts += 1;
            let outcome = match tokio::time::timeout(self.call_timeout, self.engine.complete(request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(EngineError::Timeout),
            };

            match outcome {
                Ok(reply) => return Ok(reply),
                Err(err) if err.is_retryable() && retry < self.retry.max_retries => {
                    let delay = self.retry.delay(retry, err.retry_after());
                    metrics::counter!("grading_engine_retries_total", "kind" => err.metric_kind()).increment(1);
                    tracing::warn!(
                        submission = %request.submission.student_identifier,
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying grading call"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn truncate(value: &str, limit: usize) -> String {
    value.chars().take(limit).collect()
}
