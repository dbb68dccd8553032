pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod domain;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use crate::core::{config::Settings, state::AppState, telemetry};
use crate::services::workspace::WorkspaceManager;
use crate::tasks::grading::GradingOrchestrator;

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    if !settings.ai().is_configured() {
        tracing::warn!("OPENAI_API_KEY is not set; every submission will fail to grade");
    }

    let workspace = Arc::new(WorkspaceManager::from_settings(&settings)?);
    let orchestrator = Arc::new(GradingOrchestrator::from_settings(&settings)?);
    let state = AppState::new(settings, workspace, orchestrator);

    let sweeper = tasks::scheduler::spawn(&state);
    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        workspace = %state.workspace().root().display(),
        max_concurrency = state.settings().grading().max_concurrency,
        "Rubric grader listening"
    );

    let shutdown_state = state.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            core::shutdown::shutdown_signal().await;
            shutdown_state.begin_shutdown();
        })
        .await;

    state.begin_shutdown();
    if let Err(err) = sweeper.await {
        tracing::error!(error = %err, "Session sweeper task failed");
    }

    let released = state.workspace().release_all();
    tracing::info!(released, "Session workspaces released");

    result?;

    Ok(())
}
