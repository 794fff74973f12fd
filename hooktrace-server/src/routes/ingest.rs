//! Event ingest route
//!
//! Hooks must never be blocked: this endpoint accepts the raw body, feeds
//! whatever normalizes into the ingest funnel, and acknowledges with 202
//! regardless. A malformed payload or a full queue is the server's problem,
//! not the producer's.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{json, Value};

use hooktrace_core::normalize;

use crate::AppState;

/// Accept one event envelope, fail open.
pub async fn ingest_event(
    State(state): State<Arc<AppState>>,
    body: String,
) -> (StatusCode, Json<Value>) {
    match serde_json::from_str::<Value>(&body) {
        Ok(payload) => match normalize::normalize(&payload) {
            Some(event) => state.enqueue(event),
            None => {
                tracing::debug!("Payload did not normalize, dropped");
            }
        },
        Err(e) => {
            tracing::debug!(error = %e, "Unparseable ingest body, dropped");
        }
    }

    (StatusCode::ACCEPTED, Json(json!({"ok": true})))
}
