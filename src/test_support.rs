use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
    Router,
};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use tempfile::TempDir;
use tokio::sync::{Mutex, OwnedMutexGuard};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::api;
use crate::core::{config::Settings, state::AppState};
use crate::domain::Submission;
use crate::services::ai_grading::{EngineError, EngineRequest, GradingClient, GradingEngine, RetryPolicy};
use crate::services::workspace::WorkspaceManager;
use crate::tasks::grading::GradingOrchestrator;

const TEST_API_KEY: &str = "test-key";
const MULTIPART_BOUNDARY: &str = "rubric-grader-test-boundary";

const RESET_VARS: &[&str] = &[
    "GRADER_HOST",
    "GRADER_PORT",
    "API_PREFIX",
    "BACKEND_CORS_ORIGINS",
    "OPENAI_BASE_URL",
    "AI_MODEL",
    "AI_MAX_TOKENS",
    "AI_TEMPERATURE",
    "AI_REQUEST_TIMEOUT",
    "AI_MAX_RETRIES",
    "AI_BACKOFF_BASE_MS",
    "AI_BACKOFF_MAX_MS",
    "GRADING_MAX_CONCURRENCY",
    "GRADING_BATCH_TIMEOUT_SECONDS",
    "GRADING_DEFAULT_MAX_SCORE",
    "MIN_RUBRIC_CHARS",
    "MAX_RUBRIC_CHARS",
    "MAX_UPLOAD_SIZE_MB",
    "MAX_FILE_SIZE_MB",
    "MAX_ARCHIVE_ENTRIES",
    "WORKSPACE_ROOT",
    "SESSION_RETENTION_SECONDS",
    "SESSION_SWEEP_INTERVAL_SECONDS",
    "SESSION_EXPIRY_POLICY",
    "GRADER_LOG_LEVEL",
    "GRADER_LOG_JSON",
    "ENVIRONMENT",
];

pub(crate) struct TestContext {
    pub(crate) state: AppState,
    pub(crate) app: Router,
    pub(crate) engine: Arc<ScriptedEngine>,
    _workspace: TempDir,
    _guard: OwnedMutexGuard<()>,
}

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

pub(crate) fn set_test_env() {
    for var in RESET_VARS {
        std::env::remove_var(var);
    }
    std::env::set_var("GRADER_ENV", "test");
    std::env::set_var("GRADER_STRICT_CONFIG", "0");
    std::env::set_var("OPENAI_API_KEY", TEST_API_KEY);
    std::env::set_var("PROMETHEUS_ENABLED", "0");
}

pub(crate) async fn setup_test_context(engine: ScriptedEngine) -> TestContext {
    let guard = env_lock().await;
    set_test_env();
    let settings = Settings::load().expect("settings");
    build_context(settings, engine, guard)
}

/// Like [`setup_test_context`], with extra env vars applied before settings load.
pub(crate) async fn setup_test_context_with_env(engine: ScriptedEngine, vars: &[(&str, &str)]) -> TestContext {
    let guard = env_lock().await;
    set_test_env();
    for (key, value) in vars {
        std::env::set_var(key, value);
    }
    let settings = Settings::load().expect("settings");
    for (key, _) in vars {
        std::env::remove_var(key);
    }
    build_context(settings, engine, guard)
}

fn build_context(settings: Settings, engine: ScriptedEngine, guard: OwnedMutexGuard<()>) -> TestContext {
    let workspace_dir = tempfile::tempdir().expect("workspace tempdir");
    let workspace = WorkspaceManager::new(
        workspace_dir.path().join("sessions"),
        settings.workspace().retention(),
        settings.workspace().expiry_policy,
    )
    .expect("workspace");

    let engine = Arc::new(engine);
    let orchestrator = GradingOrchestrator::new(
        test_client(engine.clone()),
        settings.grading().max_concurrency,
        settings.grading().batch_timeout(),
    );

    let state = AppState::new(settings, Arc::new(workspace), Arc::new(orchestrator));
    let app = api::router::router(state.clone());

    TestContext { state, app, engine, _workspace: workspace_dir, _guard: guard }
}

/// Client with two retries and no backoff.
pub(crate) fn test_client(engine: Arc<ScriptedEngine>) -> GradingClient {
    GradingClient::new(
        engine,
        RetryPolicy { max_retries: 2, base_delay: Duration::ZERO, max_delay: Duration::ZERO },
        Duration::from_secs(5),
    )
}

type Responder = dyn Fn(&EngineRequest<'_>, usize) -> Result<String, EngineError> + Send + Sync;

/// Engine double. The responder sees the request and how many calls that submission
/// has already made.
pub(crate) struct ScriptedEngine {
    respond: Box<Responder>,
    delay: Duration,
    calls: std::sync::Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedEngine {
    pub(crate) fn new(
        respond: impl Fn(&EngineRequest<'_>, usize) -> Result<String, EngineError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            delay: Duration::ZERO,
            calls: std::sync::Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Replies with a fixed score and feedback to every call.
    pub(crate) fn scoring(score: f64) -> Self {
        Self::new(move |_, _| Ok(grade_reply(score, "Solid work.")))
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls_for(&self, identifier: &str) -> usize {
        self.calls.lock().expect("calls lock").get(identifier).copied().unwrap_or_default()
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls.lock().expect("calls lock").values().sum()
    }

    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GradingEngine for ScriptedEngine {
    async fn complete(&self, request: &EngineRequest<'_>) -> Result<String, EngineError> {
        let previous_calls = {
            let mut calls = self.calls.lock().expect("calls lock");
            let counter = calls.entry(request.submission.student_identifier.clone()).or_default();
            *counter += 1;
            *counter - 1
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        (self.respond)(request, previous_calls)
    }
}

pub(crate) fn grade_reply(score: f64, feedback: &str) -> String {
    serde_json::json!({ "score": score, "feedback": feedback }).to_string()
}

pub(crate) fn submission(identifier: &str) -> Submission {
    Submission {
        student_identifier: identifier.to_string(),
        source_filename: format!("{identifier}.pdf"),
        raw_content: Arc::from(sample_pdf(identifier)),
    }
}

/// Minimal one-page PDF with a single line of text.
pub(crate) fn sample_pdf(text: &str) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });
    let content = Content {
        operations: vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 12.into()]),
            Operation::new("Td", vec![72.into(), 720.into()]),
            Operation::new("Tj", vec![Object::string_literal(text)]),
            Operation::new("ET", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().expect("encode")));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("save pdf");
    bytes
}

pub(crate) fn zip_archive(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, bytes) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).expect("start zip entry");
        writer.write_all(bytes).expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

pub(crate) fn multipart_request(
    uri: &str,
    token: Option<&str>,
    rubric: Option<&str>,
    file: Option<(&str, &str, &[u8])>,
) -> Request<Body> {
    let mut body = Vec::new();
    if let Some(rubric) = rubric {
        body.extend_from_slice(
            format!(
                "--{MULTIPART_BOUNDARY}\r\nContent-Disposition: form-data; name=\"rubric\"\r\n\r\n{rubric}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some((filename, content_type, bytes)) = file {
        body.extend_from_slice(
            format!(
                "--{MULTIPART_BOUNDARY}\r\nContent-Disposition: form-data; name=\"submissions\"; \
                 filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{MULTIPART_BOUNDARY}--\r\n").as_bytes());

    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"));
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body)).expect("request body")
}

pub(crate) fn empty_request(method: Method, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).expect("request body")
}

pub(crate) async fn read_bytes(response: axum::response::Response<Body>) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.expect("response body").to_vec()
}

pub(crate) async fn read_json(response: axum::response::Response<Body>) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("response body");
    serde_json::from_slice(&body).unwrap_or_else(|err| {
        let body_text = String::from_utf8_lossy(&body);
        panic!("json parse: {err}; body: {body_text}");
    })
}
