//! HTTP route handlers

mod ingest;
mod sessions;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::{ws, AppState};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Create the router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/events", post(ingest::ingest_event))
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/sessions/:session_id", get(sessions::get_session))
        .route("/api/sessions/:session_id/spans", get(sessions::get_spans))
        .route("/api/sessions/:session_id/report", get(sessions::get_report))
        .route(
            "/api/sessions/:session_id/transcript",
            get(sessions::get_session_transcript),
        )
        .route(
            "/api/sessions/:session_id/agents/:agent_id/transcript",
            get(sessions::get_agent_transcript),
        )
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}
