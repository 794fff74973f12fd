//! Session query routes
//!
//! Read-only views over the in-memory trace store. The one place a
//! user-visible failure is appropriate: an unknown session id is a 404.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use hooktrace_core::tree;
use hooktrace_core::types::{Run, Span};

use crate::AppState;

/// Hard cap on the session list, whatever the caller asks for.
const MAX_SESSIONS: usize = 200;

/// Transcript reads are size-capped; the caller learns the original size.
const MAX_TRANSCRIPT_BYTES: usize = 1024 * 1024;

fn not_found(session_id: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("session not found: {}", session_id)})),
    )
}

// ----- list -----

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub sessions: Vec<Run>,
}

/// Recent sessions, newest first, bounded.
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Json<SessionList> {
    let limit = params.limit.unwrap_or(50).min(MAX_SESSIONS);
    let store = state.store.read().await;
    Json(SessionList {
        sessions: store.recent_runs(limit),
    })
}

// ----- detail -----

/// One session's full details: run, agents, summary counts.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let store = state.store.read().await;
    let detail = store.run_detail(&session_id).ok_or_else(|| not_found(&session_id))?;
    Ok(Json(serde_json::to_value(detail).unwrap_or_default()))
}

// ----- spans -----

#[derive(Debug, Deserialize)]
pub struct SpanParams {
    /// RFC3339 lower bound on span start time
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct SpanList {
    pub spans: Vec<Span>,
}

pub async fn get_spans(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(params): Query<SpanParams>,
) -> Result<Json<SpanList>, (StatusCode, Json<Value>)> {
    let store = state.store.read().await;
    let spans = store
        .spans(&session_id, params.since)
        .ok_or_else(|| not_found(&session_id))?;
    Ok(Json(SpanList { spans }))
}

// ----- report -----

/// Rendered tree/stats/validation report for one session.
pub async fn get_report(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<String, (StatusCode, Json<Value>)> {
    let store = state.store.read().await;
    let (run, agents, spans) = store
        .snapshot(&session_id)
        .ok_or_else(|| not_found(&session_id))?;
    Ok(tree::render_report(&run, &agents, &spans))
}

// ----- transcripts -----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptResponse {
    pub content: String,
    pub truncated: bool,
    /// Original file size in bytes, before the cap
    pub size: u64,
}

pub async fn get_session_transcript(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<TranscriptResponse>, (StatusCode, Json<Value>)> {
    let path = {
        let store = state.store.read().await;
        let run = store.run(&session_id).ok_or_else(|| not_found(&session_id))?;
        run.transcript_path
    };
    read_transcript(path.as_deref()).await
}

pub async fn get_agent_transcript(
    State(state): State<Arc<AppState>>,
    Path((session_id, agent_id)): Path<(String, String)>,
) -> Result<Json<TranscriptResponse>, (StatusCode, Json<Value>)> {
    let path = {
        let store = state.store.read().await;
        let agent = store
            .agent(&session_id, &agent_id)
            .ok_or_else(|| not_found(&session_id))?;
        agent.transcript_path
    };
    read_transcript(path.as_deref()).await
}

/// Read a transcript file, size-capped at [`MAX_TRANSCRIPT_BYTES`].
async fn read_transcript(
    path: Option<&str>,
) -> Result<Json<TranscriptResponse>, (StatusCode, Json<Value>)> {
    let path = path.ok_or((
        StatusCode::NOT_FOUND,
        Json(json!({"error": "no transcript recorded for this entity"})),
    ))?;

    let bytes = tokio::fs::read(path).await.map_err(|e| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("transcript unreadable: {}", e)})),
        )
    })?;

    let size = bytes.len() as u64;
    let truncated = bytes.len() > MAX_TRANSCRIPT_BYTES;
    let capped = if truncated {
        &bytes[..MAX_TRANSCRIPT_BYTES]
    } else {
        &bytes[..]
    };

    Ok(Json(TranscriptResponse {
        content: String::from_utf8_lossy(capped).into_owned(),
        truncated,
        size,
    }))
}
