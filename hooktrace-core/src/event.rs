//! Canonical hook event
//!
//! Every producer payload is normalized into one [`HookEvent`] with a fixed
//! field set before it touches the trace store. The [`EventKind`] string table
//! is the contract surface shared with the hook adapters and the dashboard;
//! the camelCase names must not change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Source;

// ============================================
// Event kinds
// ============================================

/// Canonical event kinds.
///
/// The execution-specific start/end pairs (shell, MCP, file-edit, tab-file)
/// all route through the same toolStart/toolEnd/toolFailure transitions in the
/// trace store; they exist so producers can report them distinctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    SessionStart,
    SessionEnd,
    ToolStart,
    ToolEnd,
    ToolFailure,
    SubagentStart,
    SubagentStop,
    Stop,
    ThinkingStart,
    ThinkingEnd,
    ContextCompact,
    AgentResponse,
    BeforeSubmitPrompt,
    BashStart,
    BashEnd,
    McpToolStart,
    McpToolEnd,
    FileEditStart,
    FileEditEnd,
    TabFileStart,
    TabFileEnd,
}

impl EventKind {
    /// Returns the wire identifier for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionStart => "sessionStart",
            EventKind::SessionEnd => "sessionEnd",
            EventKind::ToolStart => "toolStart",
            EventKind::ToolEnd => "toolEnd",
            EventKind::ToolFailure => "toolFailure",
            EventKind::SubagentStart => "subagentStart",
            EventKind::SubagentStop => "subagentStop",
            EventKind::Stop => "stop",
            EventKind::ThinkingStart => "thinkingStart",
            EventKind::ThinkingEnd => "thinkingEnd",
            EventKind::ContextCompact => "contextCompact",
            EventKind::AgentResponse => "agentResponse",
            EventKind::BeforeSubmitPrompt => "beforeSubmitPrompt",
            EventKind::BashStart => "bashStart",
            EventKind::BashEnd => "bashEnd",
            EventKind::McpToolStart => "mcpToolStart",
            EventKind::McpToolEnd => "mcpToolEnd",
            EventKind::FileEditStart => "fileEditStart",
            EventKind::FileEditEnd => "fileEditEnd",
            EventKind::TabFileStart => "tabFileStart",
            EventKind::TabFileEnd => "tabFileEnd",
        }
    }

    /// Whether this kind creates a span via the tool-start transition
    pub fn is_tool_start(&self) -> bool {
        matches!(
            self,
            EventKind::ToolStart
                | EventKind::BashStart
                | EventKind::McpToolStart
                | EventKind::FileEditStart
                | EventKind::TabFileStart
        )
    }

    /// Whether this kind resolves a span via the tool-end transition
    pub fn is_tool_end(&self) -> bool {
        matches!(
            self,
            EventKind::ToolEnd
                | EventKind::BashEnd
                | EventKind::McpToolEnd
                | EventKind::FileEditEnd
                | EventKind::TabFileEnd
        )
    }

    /// Whether this kind terminates the run
    pub fn is_run_end(&self) -> bool {
        matches!(self, EventKind::SessionEnd | EventKind::Stop)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown event kind: {}", s))
    }
}

// ============================================
// Canonical event
// ============================================

/// One normalized producer event.
///
/// Field aliasing, kind inference, identifier scrubbing and source detection
/// all happen in [`crate::normalize`]; the trace store only ever sees this
/// shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookEvent {
    pub kind: EventKind,
    pub ts: DateTime<Utc>,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    /// Caller-supplied display name for subagent starts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Producer-reported status string (mapped onto enums by the store)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_transcript_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

impl HookEvent {
    /// A minimal event of the given kind, for tests and the store's internal
    /// synthesized transitions.
    pub fn bare(kind: EventKind, session_id: impl Into<String>) -> Self {
        Self {
            kind,
            ts: Utc::now(),
            session_id: session_id.into(),
            agent_id: None,
            parent_agent_id: None,
            span_id: None,
            parent_span_id: None,
            tool: None,
            tool_input: None,
            tool_output: None,
            hook_name: None,
            turn_id: None,
            model: None,
            agent_type: None,
            agent_name: None,
            source: Source::Unknown,
            duration_ms: None,
            error: None,
            error_kind: None,
            status: None,
            project_root: None,
            transcript_path: None,
            agent_transcript_path: None,
            attachments: Vec::new(),
            prompt: None,
            response: None,
            thinking: None,
        }
    }
}
