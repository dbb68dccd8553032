use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::collections::HashMap;

use crate::core::metrics;
use crate::core::state::AppState;
use crate::schemas::{HealthResponse, RootResponse};

pub(crate) async fn root(State(state): State<AppState>) -> Json<RootResponse> {
    let api = state.settings().api();
    let response = RootResponse {
        message: api.project_name.clone(),
        version: api.version.clone(),
        grade_url: format!("{}/grade", api.prefix),
    };

    Json(response)
}

pub(crate) async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut status = "healthy".to_string();
    let mut components = HashMap::new();

    if state.settings().ai().is_configured() {
        components.insert("grading_engine".to_string(), "configured".to_string());
    } else {
        components.insert("grading_engine".to_string(), "unconfigured".to_string());
        status = "degraded".to_string();
    }

    let workspace = state.workspace();
    if workspace.is_writable() {
        components.insert("workspace".to_string(), "healthy".to_string());
    } else {
        components.insert(
            "workspace".to_string(),
            format!("unhealthy: {} is not writable", workspace.root().display()),
        );
        status = "degraded".to_string();
    }

    components.insert("active_sessions".to_string(), workspace.active_sessions().to_string());

    Json(HealthResponse { service: "rubric-grader".to_string(), status, components })
}

pub(crate) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    if !state.settings().telemetry().prometheus_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    match metrics::render() {
        Some(body) => ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
            .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
