use std::sync::Arc;

use tokio::sync::watch;

use crate::core::state::AppState;
use crate::domain::types::ArtifactKind;
use crate::domain::{BatchResult, PipelineError, Rubric};
use crate::services::identity::assign_identifiers;
use crate::services::normalizer::normalize;
use crate::services::reports::{render_csv, render_pdf};

#[derive(Debug)]
pub(crate) struct GradingRequest {
    pub(crate) rubric_text: String,
    pub(crate) upload: Vec<u8>,
    pub(crate) content_type: Option<String>,
    pub(crate) filename: String,
    pub(crate) owner: Option<String>,
}

#[derive(Debug)]
pub(crate) struct GradingOutcome {
    pub(crate) session_id: String,
    pub(crate) batch: BatchResult,
}

/// Upload to stored reports. Anything that fails before `commit` releases the session.
pub(crate) async fn run_pipeline(
    state: AppState,
    request: GradingRequest,
    cancel: watch::Receiver<bool>,
) -> Result<GradingOutcome, PipelineError> {
    let GradingRequest { rubric_text, upload, content_type, filename, owner } = request;
    let rubric = Arc::new(Rubric::parse(&rubric_text, state.rubric_limits())?);

    let workspace = Arc::clone(state.workspace());
    let mut session = workspace.open_session(owner)?;
    let session_id = session.session_id().to_string();
    session.write_upload(&filename, &upload).await?;

    let limits = *state.normalizer_limits();
    let submissions = tokio::task::spawn_blocking(move || {
        let documents = normalize(&upload, content_type.as_deref(), &filename, &limits)?;
        Ok::<_, PipelineError>(assign_identifiers(documents))
    })
    .await
    .map_err(|err| PipelineError::Workspace(anyhow::anyhow!("normalization task failed: {err}")))??;

    tracing::info!(
        session_id = %session_id,
        submissions = submissions.len(),
        max_score = rubric.max_score(),
        declared_max = rubric.declares_max(),
        "Submissions normalized"
    );

    let batch = state.orchestrator().grade_batch(Arc::clone(&rubric), submissions, cancel).await?;

    let csv = render_csv(&batch).map_err(PipelineError::Workspace)?;
    let pdf = render_pdf(&batch).map_err(PipelineError::Workspace)?;
    session.write_artifact(ArtifactKind::Csv, &csv).await?;
    session.write_artifact(ArtifactKind::Pdf, &pdf).await?;
    session.discard_uploads().await?;

    let session_id = session.commit();
    Ok(GradingOutcome { session_id, batch })
}
