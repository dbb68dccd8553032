use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use tokio::sync::watch;

use crate::api::errors::ApiError;
use crate::api::guards::SessionOwner;
use crate::api::validation::{parse_artifact_kind, validate_session_id};
use crate::core::state::AppState;
use crate::schemas::grading::GradeResponse;
use crate::tasks::grading::{run_pipeline, GradingRequest};

/// Multipart framing on top of the upload itself.
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

pub(crate) fn router(state: &AppState) -> Router<AppState> {
    let body_limit = state.settings().upload().max_upload_bytes() as usize
        + state.settings().grading().max_rubric_chars * 4
        + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .route("/grade", post(grade).layer(DefaultBodyLimit::max(body_limit)))
        .route("/download/:session_id/:kind", get(download))
        .route("/sessions/:session_id", delete(release_session))
}

/// Flips the request's cancel signal if the handler is dropped before the batch ends.
struct CancelOnDrop(watch::Sender<bool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

pub(crate) async fn grade(
    State(state): State<AppState>,
    owner: SessionOwner,
    mut multipart: Multipart,
) -> Result<Json<GradeResponse>, ApiError> {
    let max_bytes = state.settings().upload().max_upload_bytes();
    let mut rubric: Option<String> = None;
    let mut upload: Option<(Vec<u8>, Option<String>, String)> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::BadRequest("Invalid multipart data".to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name == "rubric" {
            let text = field
                .text()
                .await
                .map_err(|_| ApiError::BadRequest("Rubric must be UTF-8 text".to_string()))?;
            rubric = Some(text);
        } else if name == "submissions" || name == "file" {
            let filename = field.file_name().unwrap_or("upload").to_string();
            let content_type = field.content_type().map(|s| s.to_string());
            let mut bytes = Vec::new();
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|_| ApiError::BadRequest("Failed to read file".to_string()))?
            {
                let next_size = bytes.len() as u64 + chunk.len() as u64;
                if next_size > max_bytes {
                    return Err(ApiError::PayloadTooLarge(format!(
                        "File size exceeds {}MB limit",
                        state.settings().upload().max_upload_size_mb
                    )));
                }
                bytes.extend_from_slice(&chunk);
            }
            upload = Some((bytes, content_type, filename));
        }
    }

    let rubric_text =
        rubric.ok_or_else(|| ApiError::BadRequest("Rubric text is required".to_string()))?;
    let (bytes, content_type, filename) =
        upload.ok_or_else(|| ApiError::BadRequest("A PDF or ZIP file is required".to_string()))?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    forward_shutdown(&state, cancel_tx.clone());
    let _cancel_on_drop = CancelOnDrop(cancel_tx);

    let request = GradingRequest {
        rubric_text,
        upload: bytes,
        content_type,
        filename,
        owner: owner.0,
    };

    // Detached so a client disconnect still leaves the partial reports stored.
    let outcome = tokio::spawn(run_pipeline(state.clone(), request, cancel_rx))
        .await
        .map_err(|err| ApiError::internal(err, "Grading pipeline task failed"))??;

    tracing::info!(
        session_id = %outcome.session_id,
        total = outcome.batch.total,
        failed = outcome.batch.failed,
        "Grading request completed"
    );

    Ok(Json(GradeResponse::new(outcome.session_id, &outcome.batch, &state.settings().api().prefix)))
}

/// Cancels the request when the server begins shutting down.
fn forward_shutdown(state: &AppState, cancel: watch::Sender<bool>) {
    let mut shutdown = state.shutdown_receiver();
    tokio::spawn(async move {
        tokio::select! {
            result = shutdown.wait_for(|stopping| *stopping) => {
                if result.is_ok() {
                    cancel.send_replace(true);
                }
            }
            _ = cancel.closed() => {}
        }
    });
}

pub(crate) async fn download(
    State(state): State<AppState>,
    owner: SessionOwner,
    Path((session_id, kind)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    validate_session_id(&session_id)?;
    let kind = parse_artifact_kind(&kind)?;

    let artifact = state.workspace().read_artifact(&session_id, owner.fingerprint(), kind).await?;

    let disposition = format!("attachment; filename=\"{}\"", kind.file_name());
    let etag = format!("\"{}\"", artifact.sha256);
    let headers = [
        (header::CONTENT_TYPE, HeaderValue::from_static(kind.content_type())),
        (
            header::CONTENT_DISPOSITION,
            HeaderValue::from_str(&disposition)
                .map_err(|e| ApiError::internal(e, "Invalid content disposition"))?,
        ),
        (header::ETAG, HeaderValue::from_str(&etag).map_err(|e| ApiError::internal(e, "Invalid ETag"))?),
    ];

    Ok((headers, artifact.bytes).into_response())
}

pub(crate) async fn release_session(
    State(state): State<AppState>,
    owner: SessionOwner,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    validate_session_id(&session_id)?;
    state.workspace().release(&session_id, owner.fingerprint())?;
    Ok(StatusCode::NO_CONTENT)
}
