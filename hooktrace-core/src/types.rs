//! Core domain types for hooktrace
//!
//! These types form the canonical trace model that normalizes activity from
//! all supported hook producers.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Run** | A single agent conversation; the root of the ownership tree |
//! | **Agent** | A participant within a run: the main agent or a subagent spawned via a Task-style tool |
//! | **Span** | One tool execution with a start/end lifecycle |
//! | **TraceUpdate** | An immutable delta describing one state change, broadcast to observers |
//!
//! A Run exclusively owns its Agents and, transitively, their Spans. A Span is
//! owned by exactly one Agent and belongs to exactly one Run, never shared.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tool name of the task-spawning tool. Spans with this tool are attributed to
/// the calling agent, never to a currently active subagent.
pub const TASK_TOOL: &str = "Task";

/// Sentinel tool name for synthetic thinking spans.
pub const THINKING_TOOL: &str = "Thinking";

/// Sentinel tool name for synthetic context-compaction spans.
pub const COMPACT_TOOL: &str = "Compact";

// ============================================
// Source
// ============================================

/// Hook producers whose payloads we normalize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    ClaudeCode,
    OpenCode,
    Demo,
    Unknown,
}

impl Source {
    /// Returns the display name for this producer
    pub fn display_name(&self) -> &'static str {
        match self {
            Source::ClaudeCode => "Claude Code",
            Source::OpenCode => "OpenCode",
            Source::Demo => "Demo",
            Source::Unknown => "Unknown",
        }
    }

    /// Returns the identifier used on the wire and in the trace log
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::ClaudeCode => "claude_code",
            Source::OpenCode => "open_code",
            Source::Demo => "demo",
            Source::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude_code" | "claude-code" | "claude" => Ok(Source::ClaudeCode),
            "open_code" | "opencode" => Ok(Source::OpenCode),
            "demo" => Ok(Source::Demo),
            "unknown" => Ok(Source::Unknown),
            _ => Err(format!("unknown source: {}", s)),
        }
    }
}

// ============================================
// Runs
// ============================================

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
            RunStatus::Error => "error",
        }
    }

    /// Map a producer-reported status string onto the enum.
    ///
    /// Unrecognized strings fall back to `Completed` so a malformed status can
    /// never leave a run stuck in `Running`.
    pub fn from_reported(s: Option<&str>) -> Self {
        match s.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("aborted") | Some("abort") | Some("cancelled") | Some("canceled") => {
                RunStatus::Aborted
            }
            Some("error") | Some("failed") | Some("failure") => RunStatus::Error,
            _ => RunStatus::Completed,
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "aborted" => Ok(RunStatus::Aborted),
            "error" => Ok(RunStatus::Error),
            _ => Err(format!("unknown run status: {}", s)),
        }
    }
}

/// A run is a single agent conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// Unique identifier for this run
    pub id: String,
    /// Which producer this run came from
    pub source: Source,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run ended (if it has)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Current status
    pub status: RunStatus,
    /// Project root directory, if the producer reported one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_root: Option<String>,
    /// Path to the run's transcript file, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
    /// First prompt submitted in this run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,
}

impl Run {
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }
}

// ============================================
// Agents
// ============================================

/// A participant within a run: the main agent or a spawned subagent.
///
/// The main agent's id equals the run id by convention. Subagents carry a
/// `parent_agent_id`, forming a tree among the agents of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// Unique within the run
    pub id: String,
    /// Back-reference to the owning run
    pub run_id: String,
    /// Display name
    pub name: String,
    /// Parent agent id (None for the main agent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_agent_id: Option<String>,
    /// Model powering this agent, if reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Agent-type tag (e.g. "explore", "code-reviewer")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    /// Path to this agent's transcript file, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
    /// When the agent started
    pub started_at: DateTime<Utc>,
    /// When the agent ended (if it has)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Agent {
    /// Whether this is the run's main agent
    pub fn is_main(&self) -> bool {
        self.id == self.run_id
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

// ============================================
// Spans
// ============================================

/// Status of a span.
///
/// `Running` transitions to exactly one terminal state. Once terminal,
/// `ended_at` and `duration_ms` are always set on the span; this is a hard
/// invariant maintained by the trace store, not a convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Running,
    Ok,
    Error,
    Timeout,
    PermissionDenied,
    Aborted,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Running => "running",
            SpanStatus::Ok => "ok",
            SpanStatus::Error => "error",
            SpanStatus::Timeout => "timeout",
            SpanStatus::PermissionDenied => "permission_denied",
            SpanStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SpanStatus::Running)
    }

    /// Map a producer-reported failure kind onto a terminal status.
    pub fn from_failure_kind(kind: Option<&str>) -> Self {
        match kind.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("timeout") | Some("timed_out") => SpanStatus::Timeout,
            Some("permission_denied") | Some("permission") | Some("denied") => {
                SpanStatus::PermissionDenied
            }
            _ => SpanStatus::Error,
        }
    }
}

impl std::str::FromStr for SpanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SpanStatus::Running),
            "ok" => Ok(SpanStatus::Ok),
            "error" => Ok(SpanStatus::Error),
            "timeout" => Ok(SpanStatus::Timeout),
            "permission_denied" => Ok(SpanStatus::PermissionDenied),
            "aborted" => Ok(SpanStatus::Aborted),
            _ => Err(format!("unknown span status: {}", s)),
        }
    }
}

/// One tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    /// Unique within the run
    pub id: String,
    /// Agent this span is attributed to
    pub agent_id: String,
    /// Parent span id, typically a Task span owning its subagent's spans
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    /// Tool name
    pub tool: String,
    /// Producer hook that emitted the start event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_name: Option<String>,
    /// Turn id, if the producer tracks turns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    /// When the span started
    pub started_at: DateTime<Utc>,
    /// When the span ended (always set once status is terminal)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Duration in milliseconds (always set once status is terminal)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Current status
    pub status: SpanStatus,
    /// Sanitized, truncated preview of the tool input
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_preview: Option<String>,
    /// Sanitized, truncated preview of the tool output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
    /// Error message for failed spans
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// File paths referenced by the tool input
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_paths: Vec<String>,
}

impl Span {
    pub fn is_running(&self) -> bool {
        self.status == SpanStatus::Running
    }
}

// ============================================
// Trace updates (deltas)
// ============================================

/// An immutable delta describing one state change, carrying the affected run
/// id and the full updated entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TraceUpdate {
    RunStart { run: Run },
    RunEnd { run: Run },
    RunUpdate { run: Run },
    #[serde(rename_all = "camelCase")]
    AgentStart { run_id: String, agent: Agent },
    #[serde(rename_all = "camelCase")]
    AgentEnd { run_id: String, agent: Agent },
    #[serde(rename_all = "camelCase")]
    SpanStart { run_id: String, span: Span },
    #[serde(rename_all = "camelCase")]
    SpanEnd { run_id: String, span: Span },
}

impl TraceUpdate {
    /// The run this delta belongs to
    pub fn run_id(&self) -> &str {
        match self {
            TraceUpdate::RunStart { run }
            | TraceUpdate::RunEnd { run }
            | TraceUpdate::RunUpdate { run } => &run.id,
            TraceUpdate::AgentStart { run_id, .. }
            | TraceUpdate::AgentEnd { run_id, .. }
            | TraceUpdate::SpanStart { run_id, .. }
            | TraceUpdate::SpanEnd { run_id, .. } => run_id,
        }
    }
}
