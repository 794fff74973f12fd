//! Event normalization
//!
//! Maps an arbitrary producer payload into one canonical [`HookEvent`].
//! Producers disagree on field names, on whether they send an event kind at
//! all, and on id hygiene, so everything here is table-driven:
//!
//! - each canonical field has an ordered list of accepted source-field names;
//!   the first non-null value wins
//! - a missing event kind is inferred from the hook name via an ordered rule
//!   table, then from which other fields are present
//! - a missing tool name is inferred from the hook name; hooks that do not
//!   represent a user-visible tool call map to no tool name at all
//!
//! Normalization never panics and never returns an error: a payload that
//! cannot be made sense of yields `None` and is dropped. Dropping is not
//! fatal to ingestion.

pub mod sanitize;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::event::{EventKind, HookEvent};
use crate::types::Source;

// ============================================
// Field alias tables
// ============================================

/// Explicit field first, then conversation-id style, then session-id style.
const SESSION_ID_FIELDS: &[&str] = &["sessionId", "conversationID", "conversationId", "session_id"];
const AGENT_ID_FIELDS: &[&str] = &["agentId", "agent_id", "subagentId", "subagent_id"];
const PARENT_AGENT_ID_FIELDS: &[&str] = &["parentAgentId", "parent_agent_id"];
const SPAN_ID_FIELDS: &[&str] = &["spanId", "span_id", "toolUseId", "tool_use_id", "callID", "call_id"];
const PARENT_SPAN_ID_FIELDS: &[&str] = &["parentSpanId", "parent_span_id", "parentToolUseId"];
const KIND_FIELDS: &[&str] = &["kind", "event", "eventType", "event_type", "type"];
const TIMESTAMP_FIELDS: &[&str] = &["timestamp", "ts", "time", "emittedAt", "emitted_at"];
const TOOL_FIELDS: &[&str] = &["tool", "toolName", "tool_name"];
const TOOL_INPUT_FIELDS: &[&str] = &["toolInput", "tool_input", "input", "arguments", "params"];
const TOOL_OUTPUT_FIELDS: &[&str] =
    &["toolOutput", "tool_output", "output", "result", "toolResponse", "tool_response"];
const HOOK_NAME_FIELDS: &[&str] =
    &["hookEventName", "hook_event_name", "hookName", "hook_name", "hook"];
const TURN_ID_FIELDS: &[&str] = &["turnId", "turn_id", "turn"];
const MODEL_FIELDS: &[&str] = &["model", "modelName", "model_name"];
const AGENT_TYPE_FIELDS: &[&str] = &["agentType", "agent_type", "subagentType", "subagent_type"];
const AGENT_NAME_FIELDS: &[&str] = &["agentName", "agent_name", "name"];
const SOURCE_FIELDS: &[&str] = &["source", "producer"];
const DURATION_FIELDS: &[&str] = &["durationMs", "duration_ms", "duration"];
const ERROR_FIELDS: &[&str] = &["error", "errorMessage", "error_message"];
const ERROR_KIND_FIELDS: &[&str] = &["errorKind", "error_kind", "failureKind", "failure_kind"];
const STATUS_FIELDS: &[&str] = &["status", "reason", "exitReason"];
const PROJECT_ROOT_FIELDS: &[&str] = &["projectRoot", "project_root", "cwd", "workspaceRoot"];
const TRANSCRIPT_PATH_FIELDS: &[&str] = &["transcriptPath", "transcript_path"];
const AGENT_TRANSCRIPT_PATH_FIELDS: &[&str] =
    &["agentTranscriptPath", "agent_transcript_path"];
const ATTACHMENT_FIELDS: &[&str] = &["attachments", "files"];
const PROMPT_FIELDS: &[&str] = &["prompt", "userPrompt", "user_prompt"];
const RESPONSE_FIELDS: &[&str] = &["response", "assistantResponse", "assistant_response"];
const THINKING_FIELDS: &[&str] = &["thinking", "thought"];

/// Input field names scanned for referenced file paths.
const FILE_PATH_FIELDS: &[&str] =
    &["file_path", "filePath", "path", "notebook_path", "notebookPath", "paths", "filePaths"];

// ============================================
// Hook-name rule tables
// ============================================

struct KindRule {
    needle: &'static str,
    kind: EventKind,
}

/// Ordered event-kind rules matched against the canonicalized hook name.
/// Subagent rules must precede the bare "stop" rule: a subagent-stop hook
/// name contains "stop".
const KIND_RULES: &[KindRule] = &[
    KindRule { needle: "sessionstart", kind: EventKind::SessionStart },
    KindRule { needle: "sessionend", kind: EventKind::SessionEnd },
    KindRule { needle: "subagentstart", kind: EventKind::SubagentStart },
    KindRule { needle: "subagentstop", kind: EventKind::SubagentStop },
    KindRule { needle: "stop", kind: EventKind::Stop },
    KindRule { needle: "pre", kind: EventKind::ToolStart },
    KindRule { needle: "before", kind: EventKind::ToolStart },
    KindRule { needle: "post", kind: EventKind::ToolEnd },
    KindRule { needle: "after", kind: EventKind::ToolEnd },
    KindRule { needle: "fail", kind: EventKind::ToolFailure },
    KindRule { needle: "error", kind: EventKind::ToolFailure },
];

struct ToolNameRule {
    needle: &'static str,
    tool: Option<&'static str>,
}

/// Ordered tool-name rules matched against the canonicalized hook name when
/// the payload carries no tool field. `tool: None` means the hook does not
/// represent a user-visible tool call and must not produce a span.
const TOOL_NAME_RULES: &[ToolNameRule] = &[
    // Context-file-visibility, prompt-submission, thought-capture,
    // response-capture and compaction hooks produce no span.
    ToolNameRule { needle: "context", tool: None },
    ToolNameRule { needle: "visibility", tool: None },
    ToolNameRule { needle: "prompt", tool: None },
    ToolNameRule { needle: "submit", tool: None },
    ToolNameRule { needle: "thinking", tool: None },
    ToolNameRule { needle: "thought", tool: None },
    ToolNameRule { needle: "response", tool: None },
    ToolNameRule { needle: "compact", tool: None },
    // Execution hooks map to a synthetic tool name.
    ToolNameRule { needle: "bash", tool: Some("Bash") },
    ToolNameRule { needle: "shell", tool: Some("Bash") },
    ToolNameRule { needle: "mcp", tool: Some("MCP") },
];

// ============================================
// Normalization
// ============================================

/// Normalize an arbitrary producer payload into a canonical event.
///
/// Returns `None` when the payload is not an object, carries no session id,
/// or yields no event kind; `None` is the drop signal.
pub fn normalize(payload: &Value) -> Option<HookEvent> {
    let obj = payload.as_object()?;

    let (session_id, session_field) = first_string_with_field(obj, SESSION_ID_FIELDS)?;
    let session_id = scrub_id(&session_id);
    if session_id.is_empty() {
        return None;
    }

    let hook_name = first_string(obj, HOOK_NAME_FIELDS);
    let canonical_hook = hook_name.as_deref().map(canonicalize_hook);

    let tool = first_string(obj, TOOL_FIELDS);
    let tool_input = first_value(obj, TOOL_INPUT_FIELDS);
    let tool_output = first_value(obj, TOOL_OUTPUT_FIELDS);
    let duration_ms = first_i64(obj, DURATION_FIELDS);
    let error = first_string(obj, ERROR_FIELDS);

    let kind = first_string(obj, KIND_FIELDS)
        .and_then(|s| s.parse::<EventKind>().ok())
        .or_else(|| canonical_hook.as_deref().and_then(infer_kind_from_hook))
        .or_else(|| {
            infer_kind_from_fields(
                error.is_some(),
                tool_output.is_some() || duration_ms.is_some(),
                tool.is_some(),
            )
        })?;

    // Tool-name inference applies only when the producer omitted the field.
    let tool = tool.or_else(|| {
        canonical_hook
            .as_deref()
            .and_then(infer_tool_from_hook)
            .map(str::to_string)
    });

    let source = first_string(obj, SOURCE_FIELDS)
        .and_then(|s| s.parse::<Source>().ok())
        .unwrap_or_else(|| infer_source(session_field));

    Some(HookEvent {
        kind,
        ts: first_value(obj, TIMESTAMP_FIELDS)
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now),
        session_id,
        agent_id: first_string(obj, AGENT_ID_FIELDS).map(|s| scrub_id(&s)),
        parent_agent_id: first_string(obj, PARENT_AGENT_ID_FIELDS).map(|s| scrub_id(&s)),
        span_id: first_string(obj, SPAN_ID_FIELDS).map(|s| scrub_id(&s)),
        parent_span_id: first_string(obj, PARENT_SPAN_ID_FIELDS).map(|s| scrub_id(&s)),
        tool,
        tool_input: tool_input.cloned(),
        tool_output: tool_output.cloned(),
        hook_name,
        turn_id: first_string(obj, TURN_ID_FIELDS),
        model: first_string(obj, MODEL_FIELDS),
        agent_type: first_string(obj, AGENT_TYPE_FIELDS),
        agent_name: first_string(obj, AGENT_NAME_FIELDS),
        source,
        duration_ms,
        error,
        error_kind: first_string(obj, ERROR_KIND_FIELDS),
        status: first_string(obj, STATUS_FIELDS),
        project_root: first_string(obj, PROJECT_ROOT_FIELDS),
        transcript_path: first_string(obj, TRANSCRIPT_PATH_FIELDS),
        agent_transcript_path: first_string(obj, AGENT_TRANSCRIPT_PATH_FIELDS),
        attachments: first_string_list(obj, ATTACHMENT_FIELDS),
        prompt: first_string(obj, PROMPT_FIELDS),
        response: first_string(obj, RESPONSE_FIELDS),
        thinking: first_string(obj, THINKING_FIELDS),
    })
}

/// Strip embedded line-break characters from an identifier.
///
/// A known producer defect emits ids containing `\n`/`\r`; scrubbing at the
/// normalization boundary keeps both variants of the "same" id correlating.
pub fn scrub_id(id: &str) -> String {
    id.chars().filter(|c| *c != '\n' && *c != '\r').collect::<String>().trim().to_string()
}

/// Extract candidate file paths from a tool input payload.
///
/// Only a small set of known field names is consulted; values may be a single
/// string or an array of strings.
pub fn extract_file_paths(input: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    let Some(obj) = input.as_object() else {
        return paths;
    };
    for field in FILE_PATH_FIELDS {
        match obj.get(*field) {
            Some(Value::String(s)) if !s.is_empty() => {
                if !paths.contains(s) {
                    paths.push(s.clone());
                }
            }
            Some(Value::Array(items)) => {
                for item in items {
                    if let Value::String(s) = item {
                        if !s.is_empty() && !paths.contains(s) {
                            paths.push(s.clone());
                        }
                    }
                }
            }
            _ => {}
        }
    }
    paths
}

/// Lowercase a hook name and drop separators, so `SessionStart`,
/// `session-start` and `session_start` all compare equal.
fn canonicalize_hook(hook: &str) -> String {
    hook.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn infer_kind_from_hook(canonical: &str) -> Option<EventKind> {
    KIND_RULES
        .iter()
        .find(|rule| canonical.contains(rule.needle))
        .map(|rule| rule.kind)
}

fn infer_kind_from_fields(has_error: bool, has_result: bool, has_tool: bool) -> Option<EventKind> {
    if has_error {
        Some(EventKind::ToolFailure)
    } else if has_result {
        Some(EventKind::ToolEnd)
    } else if has_tool {
        Some(EventKind::ToolStart)
    } else {
        None
    }
}

fn infer_tool_from_hook(canonical: &str) -> Option<&'static str> {
    TOOL_NAME_RULES
        .iter()
        .find(|rule| canonical.contains(rule.needle))
        .and_then(|rule| rule.tool)
}

/// When the payload carries no explicit source tag, infer one from which
/// id-style field was present.
fn infer_source(session_field: &str) -> Source {
    match session_field {
        "sessionId" => Source::ClaudeCode,
        "conversationID" | "conversationId" => Source::OpenCode,
        _ => Source::Unknown,
    }
}

// ============================================
// Field access helpers
// ============================================

fn first_value<'a>(obj: &'a Map<String, Value>, fields: &[&str]) -> Option<&'a Value> {
    fields
        .iter()
        .filter_map(|f| obj.get(*f))
        .find(|v| !v.is_null())
}

fn first_string(obj: &Map<String, Value>, fields: &[&str]) -> Option<String> {
    first_string_with_field(obj, fields).map(|(s, _)| s)
}

/// Like [`first_string`] but also reports which alias matched, for source
/// inference.
fn first_string_with_field<'f>(
    obj: &Map<String, Value>,
    fields: &'f [&'f str],
) -> Option<(String, &'f str)> {
    for &field in fields {
        match obj.get(field) {
            Some(Value::String(s)) if !s.is_empty() => return Some((s.clone(), field)),
            Some(Value::Number(n)) => return Some((n.to_string(), field)),
            _ => {}
        }
    }
    None
}

fn first_i64(obj: &Map<String, Value>, fields: &[&str]) -> Option<i64> {
    first_value(obj, fields).and_then(|v| match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

fn first_string_list(obj: &Map<String, Value>, fields: &[&str]) -> Vec<String> {
    match first_value(obj, fields) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let n = n.as_i64()?;
            // Heuristic: epoch milliseconds are 13 digits, seconds 10.
            if n >= 1_000_000_000_000 {
                Utc.timestamp_millis_opt(n).single()
            } else {
                Utc.timestamp_opt(n, 0).single()
            }
        }
        _ => None,
    }
}
