//! Trace store: the stateful correlation engine
//!
//! Owns the live runs → agents → spans hierarchy and applies each normalized
//! [`HookEvent`] as one state transition. Every transition returns an
//! [`Applied`]: the [`TraceUpdate`] deltas to broadcast and the
//! [`TraceRecord`] snapshots to append to the trace log. The caller persists
//! the records before handing the deltas to the broadcaster, which keeps the
//! append inside the mutation path and the fan-out strictly after it.
//!
//! ## Correlation
//!
//! A terminating event resolves its span by exact id lookup in the global
//! pending index first. The pending index maps span id → owning run id and is
//! purely an index into per-run state, never a second source of truth. When
//! the id is missing (producers that omit it on the terminating event), the
//! canonical fallback applies within the event's run: the most recently
//! started still-running span with a matching tool name, else the most
//! recently started running span regardless of tool. An event that resolves
//! nothing is logged and changes no state.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::event::{EventKind, HookEvent};
use crate::persist::{ReplayedRun, TraceRecord};
use crate::normalize::{extract_file_paths, sanitize};
use crate::types::{
    Agent, Run, RunStatus, Span, SpanStatus, TraceUpdate, COMPACT_TOOL, TASK_TOOL, THINKING_TOOL,
};

// ============================================
// Transition output
// ============================================

/// Result of applying one event: deltas to broadcast and records to persist.
#[derive(Debug, Default)]
pub struct Applied {
    pub updates: Vec<TraceUpdate>,
    pub records: Vec<TraceRecord>,
}

impl Applied {
    fn push_span(&mut self, run_id: &str, span: &Span, start: bool) {
        let update = if start {
            TraceUpdate::SpanStart {
                run_id: run_id.to_string(),
                span: span.clone(),
            }
        } else {
            TraceUpdate::SpanEnd {
                run_id: run_id.to_string(),
                span: span.clone(),
            }
        };
        self.updates.push(update);
        self.records.push(TraceRecord::span(run_id, span));
    }

    fn push_agent(&mut self, run_id: &str, agent: &Agent, start: bool) {
        let update = if start {
            TraceUpdate::AgentStart {
                run_id: run_id.to_string(),
                agent: agent.clone(),
            }
        } else {
            TraceUpdate::AgentEnd {
                run_id: run_id.to_string(),
                agent: agent.clone(),
            }
        };
        self.updates.push(update);
        self.records.push(TraceRecord::agent(agent));
    }
}

// ============================================
// Query views
// ============================================

/// Summary counts for one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub agents: usize,
    pub spans: usize,
    pub running_spans: usize,
    pub errors: usize,
}

/// Full detail view of one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetail {
    pub run: Run,
    pub agents: Vec<Agent>,
    pub summary: RunSummary,
}

// ============================================
// Per-run state
// ============================================

/// All mutable state for one run.
///
/// The `active` map indexes currently-running spans by id; it exists for
/// force-close and fallback correlation and always points into `spans`.
struct RunState {
    run: Run,
    agents: Vec<Agent>,
    spans: Vec<Span>,
    active: HashMap<String, usize>,
    /// Subagent id → Task span that spawned it; used to default the parent
    /// span of the subagent's own spans.
    spawn_spans: HashMap<String, String>,
    touched_at: DateTime<Utc>,
}

impl RunState {
    fn new(run: Run) -> Self {
        let touched_at = run.started_at;
        Self {
            run,
            agents: Vec::new(),
            spans: Vec::new(),
            active: HashMap::new(),
            spawn_spans: HashMap::new(),
            touched_at,
        }
    }

    fn agent(&self, id: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == id)
    }

    fn agent_mut(&mut self, id: &str) -> Option<&mut Agent> {
        self.agents.iter_mut().find(|a| a.id == id)
    }

    /// The most recently started subagent that has not ended.
    fn most_recent_open_subagent(&self) -> Option<&Agent> {
        self.agents
            .iter()
            .filter(|a| !a.is_main() && a.is_open())
            .max_by_key(|a| a.started_at)
    }

    /// Canonical fallback for a terminating event that carries no usable span
    /// id: the most recently started still-running span with a matching tool
    /// name, else the most recently started running span regardless of tool.
    fn resolve_open_span(&self, tool: Option<&str>) -> Option<usize> {
        if let Some(tool) = tool {
            let matching = self
                .active
                .values()
                .copied()
                .filter(|&idx| self.spans[idx].tool == tool)
                .max_by_key(|&idx| (self.spans[idx].started_at, idx));
            if matching.is_some() {
                return matching;
            }
        }
        self.active
            .values()
            .copied()
            .max_by_key(|&idx| (self.spans[idx].started_at, idx))
    }

    /// Running span indexes owned by one agent, for scoped force-close.
    fn active_spans_of_agent(&self, agent_id: &str) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .active
            .values()
            .copied()
            .filter(|&idx| self.spans[idx].agent_id == agent_id)
            .collect();
        indices.sort_unstable();
        indices
    }
}

// ============================================
// Trace store
// ============================================

/// Where a pending span lives, for cross-run end correlation.
struct PendingSpan {
    run_id: String,
    registered_at: DateTime<Utc>,
}

/// The correlation engine. One instance owns all live runs.
///
/// Transitions are synchronous; callers serialize mutation (single ingest
/// worker or an exclusive lock) and may read concurrently between events.
pub struct TraceStore {
    runs: HashMap<String, RunState>,
    /// Global span id → run id index for end/failure correlation across runs
    pending: HashMap<String, PendingSpan>,
    run_ttl: Duration,
}

impl TraceStore {
    pub fn new(run_ttl: Duration) -> Self {
        Self {
            runs: HashMap::new(),
            pending: HashMap::new(),
            run_ttl,
        }
    }

    /// Apply one normalized event as a state transition.
    pub fn apply(&mut self, event: &HookEvent) -> Applied {
        let mut applied = Applied::default();

        match event.kind {
            EventKind::SessionStart => self.on_session_start(event, &mut applied),
            kind if kind.is_run_end() => self.on_run_end(event, &mut applied),
            kind if kind.is_tool_start() => self.on_tool_start(event, event.tool.clone(), &mut applied),
            kind if kind.is_tool_end() => self.on_tool_end(event, false, &mut applied),
            EventKind::ToolFailure => self.on_tool_end(event, true, &mut applied),
            EventKind::SubagentStart => self.on_subagent_start(event, &mut applied),
            EventKind::SubagentStop => self.on_subagent_stop(event, &mut applied),
            EventKind::ThinkingStart => {
                self.on_tool_start(event, Some(THINKING_TOOL.to_string()), &mut applied)
            }
            EventKind::ThinkingEnd => self.on_thinking_end(event, &mut applied),
            EventKind::ContextCompact => self.on_context_compact(event, &mut applied),
            EventKind::AgentResponse => {
                // Informational only; no state mutation
                tracing::debug!(session_id = %event.session_id, "Agent response event");
            }
            EventKind::BeforeSubmitPrompt => self.on_prompt(event, &mut applied),
            _ => {
                tracing::debug!(kind = %event.kind, "Unhandled event kind");
            }
        }

        if let Some(state) = self.runs.get_mut(&event.session_id) {
            state.touched_at = Utc::now();
        }
        applied
    }

    // ----- session lifecycle -----

    fn on_session_start(&mut self, event: &HookEvent, applied: &mut Applied) {
        if !self.runs.contains_key(&event.session_id) {
            self.create_run(event, applied);
        }
        // The ensure above registered the main agent; an explicit agent id not
        // yet known announces an agent joining an existing run.
        if let Some(agent_id) = &event.agent_id {
            let state = match self.runs.get_mut(&event.session_id) {
                Some(state) => state,
                None => return,
            };
            if state.agent(agent_id).is_none() {
                let main_id = state.run.id.clone();
                let agent = new_agent(event, agent_id.clone(), Some(main_id));
                state.agents.push(agent.clone());
                applied.push_agent(&event.session_id, &agent, true);
            }
            // Replaying the same session-start for a known agent is a no-op
        }

        // Fill run metadata the first start event may not have carried
        let state = match self.runs.get_mut(&event.session_id) {
            Some(state) => state,
            None => return,
        };
        let mut changed = false;
        if state.run.project_root.is_none() && event.project_root.is_some() {
            state.run.project_root = event.project_root.clone();
            changed = true;
        }
        if state.run.transcript_path.is_none() && event.transcript_path.is_some() {
            state.run.transcript_path = event.transcript_path.clone();
            changed = true;
        }
        if changed {
            applied.updates.push(TraceUpdate::RunUpdate {
                run: state.run.clone(),
            });
            applied.records.push(TraceRecord::run(&state.run));
        }
    }

    fn on_run_end(&mut self, event: &HookEvent, applied: &mut Applied) {
        let state = match self.runs.get_mut(&event.session_id) {
            Some(state) => state,
            None => {
                tracing::warn!(session_id = %event.session_id, "Run end for unknown run");
                return;
            }
        };

        let status = RunStatus::from_reported(event.status.as_deref());
        state.run.status = status;
        state.run.ended_at = Some(event.ts);

        // Force-close every span still running, then every agent still open
        let forced_status = match status {
            RunStatus::Error | RunStatus::Aborted => SpanStatus::Aborted,
            _ => SpanStatus::Ok,
        };
        let mut indices: Vec<usize> = state.active.values().copied().collect();
        indices.sort_unstable();
        for idx in indices {
            let span = &mut state.spans[idx];
            close_span(span, event.ts, forced_status, None, None, None);
            self.pending.remove(&span.id);
            let span = state.spans[idx].clone();
            applied.push_span(&event.session_id, &span, false);
        }
        state.active.clear();

        for i in 0..state.agents.len() {
            if state.agents[i].is_open() {
                state.agents[i].ended_at = Some(event.ts);
                let agent = state.agents[i].clone();
                applied.push_agent(&event.session_id, &agent, false);
            }
        }

        // Final run snapshot last, so replay converges on the terminal state
        applied.records.push(TraceRecord::run(&state.run));
        applied.updates.push(TraceUpdate::RunEnd {
            run: state.run.clone(),
        });
    }

    // ----- spans -----

    fn on_tool_start(&mut self, event: &HookEvent, tool: Option<String>, applied: &mut Applied) {
        // Hooks that resolve to no tool name do not represent a user-visible
        // tool call and must not produce a span.
        let tool = match tool {
            Some(tool) => tool,
            None => {
                tracing::debug!(
                    session_id = %event.session_id,
                    hook = ?event.hook_name,
                    "Tool start without tool name, no span"
                );
                return;
            }
        };

        self.ensure_run(event, applied);

        let span_id = event
            .span_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // A duplicate start must never silently reclassify an in-flight span
        if self.pending.contains_key(&span_id)
            || self
                .runs
                .get(&event.session_id)
                .is_some_and(|s| s.active.contains_key(&span_id))
        {
            tracing::warn!(span_id = %span_id, tool = %tool, "Duplicate tool start ignored");
            return;
        }

        let agent_id = self.attribute_agent(event, &tool, applied);
        let state = match self.runs.get_mut(&event.session_id) {
            Some(state) => state,
            None => return,
        };

        // Subagent spans default their parent to the Task span that spawned
        // the subagent, forming the trace tree.
        let parent_span_id = event
            .parent_span_id
            .clone()
            .or_else(|| state.spawn_spans.get(&agent_id).cloned());

        let span = Span {
            id: span_id.clone(),
            agent_id,
            parent_span_id,
            tool,
            hook_name: event.hook_name.clone(),
            turn_id: event.turn_id.clone(),
            started_at: event.ts,
            ended_at: None,
            duration_ms: None,
            status: SpanStatus::Running,
            input_preview: sanitize::preview_opt(event.tool_input.as_ref()),
            output_preview: None,
            error: None,
            file_paths: event
                .tool_input
                .as_ref()
                .map(extract_file_paths)
                .unwrap_or_default(),
        };

        let idx = state.spans.len();
        state.spans.push(span.clone());
        state.active.insert(span_id.clone(), idx);
        self.pending.insert(
            span_id,
            PendingSpan {
                run_id: event.session_id.clone(),
                registered_at: Utc::now(),
            },
        );

        applied.push_span(&event.session_id, &span, true);
    }

    fn on_tool_end(&mut self, event: &HookEvent, failure: bool, applied: &mut Applied) {
        // Exact id lookup in the pending index wins, regardless of which run
        // the event claims to belong to.
        let resolved = event
            .span_id
            .as_ref()
            .and_then(|id| self.pending.get(id).map(|p| (p.run_id.clone(), id.clone())))
            .and_then(|(run_id, span_id)| {
                let state = self.runs.get(&run_id)?;
                let idx = *state.active.get(&span_id)?;
                Some((run_id, idx))
            })
            .or_else(|| {
                let state = self.runs.get(&event.session_id)?;
                let idx = state.resolve_open_span(event.tool.as_deref())?;
                Some((event.session_id.clone(), idx))
            });

        let (run_id, idx) = match resolved {
            Some(found) => found,
            None => {
                tracing::warn!(
                    session_id = %event.session_id,
                    span_id = ?event.span_id,
                    tool = ?event.tool,
                    "Unresolvable tool end, no state change"
                );
                return;
            }
        };

        let state = match self.runs.get_mut(&run_id) {
            Some(state) => state,
            None => return,
        };

        let status = if failure {
            SpanStatus::from_failure_kind(
                event.error_kind.as_deref().or(event.status.as_deref()),
            )
        } else {
            SpanStatus::Ok
        };

        let span = &mut state.spans[idx];
        close_span(
            span,
            event.ts,
            status,
            event.duration_ms,
            sanitize::preview_opt(event.tool_output.as_ref()),
            if failure { event.error.clone() } else { None },
        );
        state.active.remove(&span.id);
        self.pending.remove(&span.id);

        let span = state.spans[idx].clone();
        applied.push_span(&run_id, &span, false);
    }

    fn on_thinking_end(&mut self, event: &HookEvent, applied: &mut Applied) {
        let state = match self.runs.get(&event.session_id) {
            Some(state) => state,
            None => {
                tracing::warn!(session_id = %event.session_id, "Thinking end for unknown run");
                return;
            }
        };

        // Matched by agent, not by span id: one running sentinel span per agent
        let agent_id = match &event.agent_id {
            Some(id) => id.clone(),
            None => state
                .most_recent_open_subagent()
                .map(|a| a.id.clone())
                .unwrap_or_else(|| state.run.id.clone()),
        };
        let idx = state
            .active
            .values()
            .copied()
            .filter(|&idx| {
                state.spans[idx].tool == THINKING_TOOL && state.spans[idx].agent_id == agent_id
            })
            .max_by_key(|&idx| (state.spans[idx].started_at, idx));

        let idx = match idx {
            Some(idx) => idx,
            None => {
                tracing::warn!(
                    session_id = %event.session_id,
                    agent_id = %agent_id,
                    "Thinking end with no running thinking span"
                );
                return;
            }
        };

        let state = match self.runs.get_mut(&event.session_id) {
            Some(state) => state,
            None => return,
        };
        let span = &mut state.spans[idx];
        let preview = event
            .thinking
            .as_deref()
            .map(|t| sanitize::truncate(&sanitize::redact(t)));
        close_span(span, event.ts, SpanStatus::Ok, event.duration_ms, preview, None);
        state.active.remove(&span.id);
        self.pending.remove(&span.id);

        let span = state.spans[idx].clone();
        applied.push_span(&event.session_id, &span, false);
    }

    fn on_context_compact(&mut self, event: &HookEvent, applied: &mut Applied) {
        self.ensure_run(event, applied);

        let agent_id = self.attribute_agent(event, COMPACT_TOOL, applied);
        let state = match self.runs.get_mut(&event.session_id) {
            Some(state) => state,
            None => return,
        };

        // Instantaneous: no asynchronous window, both deltas at once
        let span = Span {
            id: event
                .span_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            agent_id,
            parent_span_id: None,
            tool: COMPACT_TOOL.to_string(),
            hook_name: event.hook_name.clone(),
            turn_id: event.turn_id.clone(),
            started_at: event.ts,
            ended_at: Some(event.ts),
            duration_ms: Some(0),
            status: SpanStatus::Ok,
            input_preview: event
                .tool_input
                .as_ref()
                .and_then(compact_preview)
                .or_else(|| sanitize::preview_opt(event.tool_input.as_ref())),
            output_preview: None,
            error: None,
            file_paths: Vec::new(),
        };
        state.spans.push(span.clone());

        applied.push_span(&event.session_id, &span, true);
        applied.updates.push(TraceUpdate::SpanEnd {
            run_id: event.session_id.clone(),
            span,
        });
    }

    fn on_prompt(&mut self, event: &HookEvent, applied: &mut Applied) {
        self.ensure_run(event, applied);
        let state = match self.runs.get_mut(&event.session_id) {
            Some(state) => state,
            None => return,
        };

        // First prompt wins
        if state.run.initial_prompt.is_none() {
            if let Some(prompt) = &event.prompt {
                state.run.initial_prompt = Some(sanitize::truncate(&sanitize::redact(prompt)));
                applied.updates.push(TraceUpdate::RunUpdate {
                    run: state.run.clone(),
                });
                applied.records.push(TraceRecord::run(&state.run));
            }
        }
    }

    // ----- agents -----

    fn on_subagent_start(&mut self, event: &HookEvent, applied: &mut Applied) {
        self.ensure_run(event, applied);
        let state = match self.runs.get_mut(&event.session_id) {
            Some(state) => state,
            None => return,
        };

        let agent_id = event
            .agent_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(existing) = state.agent_mut(&agent_id) {
            // Merge: a repeated start never creates a second agent
            if let Some(name) = &event.agent_name {
                existing.name = name.clone();
            }
            if existing.model.is_none() {
                existing.model = event.model.clone();
            }
            if existing.agent_type.is_none() {
                existing.agent_type = event.agent_type.clone();
            }
            return;
        }

        let main_id = state.run.id.clone();
        let parent = event.parent_agent_id.clone().unwrap_or(main_id);
        let agent = new_agent(event, agent_id.clone(), Some(parent.clone()));

        // Remember the Task span that spawned this subagent so its own spans
        // hang off it in the trace tree.
        let spawn = state
            .active
            .values()
            .copied()
            .filter(|&idx| {
                state.spans[idx].tool == TASK_TOOL && state.spans[idx].agent_id == parent
            })
            .max_by_key(|&idx| (state.spans[idx].started_at, idx))
            .map(|idx| state.spans[idx].id.clone());
        if let Some(span_id) = spawn {
            state.spawn_spans.insert(agent_id, span_id);
        }

        state.agents.push(agent.clone());
        applied.push_agent(&event.session_id, &agent, true);
    }

    fn on_subagent_stop(&mut self, event: &HookEvent, applied: &mut Applied) {
        let state = match self.runs.get_mut(&event.session_id) {
            Some(state) => state,
            None => {
                tracing::warn!(session_id = %event.session_id, "Subagent stop for unknown run");
                return;
            }
        };

        let agent_id = match &event.agent_id {
            Some(id) => id.clone(),
            None => match state.most_recent_open_subagent() {
                Some(agent) => agent.id.clone(),
                None => {
                    tracing::warn!(
                        session_id = %event.session_id,
                        "Subagent stop with no open subagent"
                    );
                    return;
                }
            },
        };

        // Scoped force-close: only this agent's running spans, nobody else's
        for idx in state.active_spans_of_agent(&agent_id) {
            let span = &mut state.spans[idx];
            close_span(span, event.ts, SpanStatus::Ok, None, None, None);
            state.active.remove(&span.id);
            self.pending.remove(&span.id);
            let span = state.spans[idx].clone();
            applied.push_span(&event.session_id, &span, false);
        }

        match state.agent_mut(&agent_id) {
            Some(agent) => {
                agent.ended_at = Some(event.ts);
                let agent = agent.clone();
                applied.push_agent(&event.session_id, &agent, false);
            }
            None => {
                tracing::warn!(
                    session_id = %event.session_id,
                    agent_id = %agent_id,
                    "Subagent stop for unknown agent"
                );
            }
        }
    }

    // ----- shared transitions -----

    /// Create the run and its main agent if this id has not been seen.
    ///
    /// A tool start may arrive before its session start under reordering, so
    /// every span-producing transition creates lazily.
    fn ensure_run(&mut self, event: &HookEvent, applied: &mut Applied) {
        if !self.runs.contains_key(&event.session_id) {
            self.create_run(event, applied);
        }
    }

    fn create_run(&mut self, event: &HookEvent, applied: &mut Applied) {
        let run = Run {
            id: event.session_id.clone(),
            source: event.source,
            started_at: event.ts,
            ended_at: None,
            status: RunStatus::Running,
            project_root: event.project_root.clone(),
            transcript_path: event.transcript_path.clone(),
            initial_prompt: None,
        };

        // Main agent id equals the run id by convention
        let main = Agent {
            id: run.id.clone(),
            run_id: run.id.clone(),
            name: "main".to_string(),
            parent_agent_id: None,
            model: event.model.clone(),
            agent_type: None,
            transcript_path: event.transcript_path.clone(),
            started_at: event.ts,
            ended_at: None,
        };

        let mut state = RunState::new(run.clone());
        state.agents.push(main.clone());
        self.runs.insert(run.id.clone(), state);

        applied.updates.push(TraceUpdate::RunStart { run: run.clone() });
        applied.records.push(TraceRecord::run(&run));
        applied.push_agent(&run.id, &main, true);
    }

    /// Decide which agent a new span belongs to.
    ///
    /// An explicit agent id wins (registering the agent if unseen). The Task
    /// tool is always attributed to the calling agent, never to a currently
    /// active subagent. Anything else without an explicit id goes to the most
    /// recently started still-open subagent, else the main agent.
    fn attribute_agent(&mut self, event: &HookEvent, tool: &str, applied: &mut Applied) -> String {
        let state = match self.runs.get_mut(&event.session_id) {
            Some(state) => state,
            None => return event.session_id.clone(),
        };
        let main_id = state.run.id.clone();

        if let Some(agent_id) = &event.agent_id {
            if state.agent(agent_id).is_none() {
                let agent = new_agent(event, agent_id.clone(), Some(main_id));
                state.agents.push(agent.clone());
                applied.push_agent(&event.session_id, &agent, true);
            }
            return agent_id.clone();
        }

        if tool == TASK_TOOL {
            return main_id;
        }

        state
            .most_recent_open_subagent()
            .map(|a| a.id.clone())
            .unwrap_or(main_id)
    }

    // ----- eviction -----

    /// Drop non-running runs past the TTL from memory (they remain on disk)
    /// and stale pending entries past the same age. Returns the evicted run
    /// ids so the caller can release log handles.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now - self.run_ttl;

        let evicted: Vec<String> = self
            .runs
            .iter()
            .filter(|(_, state)| !state.run.is_running() && state.touched_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &evicted {
            self.runs.remove(id);
            tracing::info!(run_id = %id, "Run evicted from memory");
        }

        self.pending.retain(|span_id, pending| {
            if evicted.contains(&pending.run_id) {
                return false;
            }
            let stale = pending.registered_at < cutoff;
            if stale {
                tracing::warn!(span_id = %span_id, "Stale pending span dropped");
            }
            !stale
        });

        evicted
    }

    // ----- replay -----

    /// Rebuild one run's registries from a replayed log.
    ///
    /// Running spans re-enter the active and pending indexes so a correlation
    /// that straddles a restart still resolves.
    pub fn restore(&mut self, replayed: ReplayedRun) {
        let run = match replayed.run {
            Some(run) => run,
            None => return,
        };
        for warning in &replayed.warnings {
            tracing::warn!(run_id = %run.id, warning = %warning, "Replay warning");
        }

        let run_id = run.id.clone();
        let mut state = RunState::new(run);
        state.agents = replayed.agents;
        state.spans = replayed.spans;
        state.touched_at = Utc::now();

        for (idx, span) in state.spans.iter().enumerate() {
            if span.is_running() {
                state.active.insert(span.id.clone(), idx);
                self.pending.insert(
                    span.id.clone(),
                    PendingSpan {
                        run_id: run_id.clone(),
                        registered_at: Utc::now(),
                    },
                );
            }
        }

        self.runs.insert(run_id, state);
    }

    // ----- queries -----

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Recent runs, newest first, bounded.
    pub fn recent_runs(&self, limit: usize) -> Vec<Run> {
        let mut runs: Vec<Run> = self.runs.values().map(|s| s.run.clone()).collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        runs
    }

    pub fn run(&self, run_id: &str) -> Option<Run> {
        self.runs.get(run_id).map(|s| s.run.clone())
    }

    pub fn run_detail(&self, run_id: &str) -> Option<RunDetail> {
        let state = self.runs.get(run_id)?;
        let errors = state
            .spans
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    SpanStatus::Error | SpanStatus::Timeout | SpanStatus::PermissionDenied
                )
            })
            .count();
        Some(RunDetail {
            run: state.run.clone(),
            agents: state.agents.clone(),
            summary: RunSummary {
                agents: state.agents.len(),
                spans: state.spans.len(),
                running_spans: state.active.len(),
                errors,
            },
        })
    }

    pub fn agents(&self, run_id: &str) -> Option<Vec<Agent>> {
        self.runs.get(run_id).map(|s| s.agents.clone())
    }

    pub fn agent(&self, run_id: &str, agent_id: &str) -> Option<Agent> {
        self.runs.get(run_id)?.agent(agent_id).cloned()
    }

    /// A run's span list, optionally only spans starting at or after `since`.
    pub fn spans(&self, run_id: &str, since: Option<DateTime<Utc>>) -> Option<Vec<Span>> {
        let state = self.runs.get(run_id)?;
        let spans = match since {
            Some(since) => state
                .spans
                .iter()
                .filter(|s| s.started_at >= since)
                .cloned()
                .collect(),
            None => state.spans.clone(),
        };
        Some(spans)
    }

    /// Everything the tree builder needs, in one clone.
    pub fn snapshot(&self, run_id: &str) -> Option<(Run, Vec<Agent>, Vec<Span>)> {
        let state = self.runs.get(run_id)?;
        Some((state.run.clone(), state.agents.clone(), state.spans.clone()))
    }
}

// ============================================
// Helpers
// ============================================

fn new_agent(event: &HookEvent, id: String, parent: Option<String>) -> Agent {
    let name = event
        .agent_name
        .clone()
        .or_else(|| event.agent_type.clone())
        .unwrap_or_else(|| format!("agent-{}", short_id(&id)));
    Agent {
        id,
        run_id: event.session_id.clone(),
        name,
        parent_agent_id: parent,
        model: event.model.clone(),
        agent_type: event.agent_type.clone(),
        transcript_path: event.agent_transcript_path.clone(),
        started_at: event.ts,
        ended_at: None,
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Preview for a compaction span: usage percentage, token count and message
/// count, whichever of them the producer reported.
fn compact_preview(input: &serde_json::Value) -> Option<String> {
    let obj = input.as_object()?;
    let field = |names: &[&str]| names.iter().find_map(|n| obj.get(*n)?.as_i64());

    let mut parts = Vec::new();
    if let Some(pct) = field(&["usagePct", "usage_pct", "usagePercent", "usage"]) {
        parts.push(format!("{}% usage", pct));
    }
    if let Some(tokens) = field(&["tokens", "tokenCount", "token_count"]) {
        parts.push(format!("{} tokens", tokens));
    }
    if let Some(messages) = field(&["messages", "messageCount", "message_count"]) {
        parts.push(format!("{} messages", messages));
    }

    (!parts.is_empty()).then(|| format!("compacted at {}", parts.join(", ")))
}

/// Terminate a span, upholding the invariant that a terminal status always
/// comes with `ended_at` and `duration_ms`.
fn close_span(
    span: &mut Span,
    ended_at: DateTime<Utc>,
    status: SpanStatus,
    explicit_duration: Option<i64>,
    output_preview: Option<String>,
    error: Option<String>,
) {
    span.ended_at = Some(ended_at);
    span.status = status;
    span.duration_ms = Some(explicit_duration.unwrap_or_else(|| {
        (ended_at - span.started_at).num_milliseconds().max(0)
    }));
    if output_preview.is_some() {
        span.output_preview = output_preview;
    }
    if error.is_some() {
        span.error = error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, HookEvent};
    use serde_json::json;

    fn store() -> TraceStore {
        TraceStore::new(Duration::minutes(60))
    }

    fn ev(kind: EventKind, session: &str) -> HookEvent {
        HookEvent::bare(kind, session)
    }

    fn tool_start(session: &str, span: &str, tool: &str) -> HookEvent {
        let mut e = ev(EventKind::ToolStart, session);
        e.span_id = Some(span.to_string());
        e.tool = Some(tool.to_string());
        e
    }

    fn tool_end(session: &str, span: &str) -> HookEvent {
        let mut e = ev(EventKind::ToolEnd, session);
        e.span_id = Some(span.to_string());
        e
    }

    fn kinds(applied: &Applied) -> Vec<&'static str> {
        applied
            .updates
            .iter()
            .map(|u| match u {
                TraceUpdate::RunStart { .. } => "runStart",
                TraceUpdate::RunEnd { .. } => "runEnd",
                TraceUpdate::RunUpdate { .. } => "runUpdate",
                TraceUpdate::AgentStart { .. } => "agentStart",
                TraceUpdate::AgentEnd { .. } => "agentEnd",
                TraceUpdate::SpanStart { .. } => "spanStart",
                TraceUpdate::SpanEnd { .. } => "spanEnd",
            })
            .collect()
    }

    #[test]
    fn test_session_start_creates_run_and_main_agent() {
        let mut store = store();
        let applied = store.apply(&ev(EventKind::SessionStart, "r1"));

        assert_eq!(kinds(&applied), vec!["runStart", "agentStart"]);
        let run = store.run("r1").unwrap();
        assert_eq!(run.status, RunStatus::Running);
        let agents = store.agents("r1").unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, "r1");
        assert!(agents[0].is_main());
    }

    #[test]
    fn test_duplicate_session_start_is_noop() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));
        let applied = store.apply(&ev(EventKind::SessionStart, "r1"));

        assert!(applied.updates.is_empty());
        assert_eq!(store.agents("r1").unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_session_start_same_agent_never_creates_second_agent() {
        let mut store = store();
        let mut e = ev(EventKind::SessionStart, "r1");
        e.agent_id = Some("a1".to_string());
        store.apply(&e);
        store.apply(&e);

        assert_eq!(store.agents("r1").unwrap().len(), 2); // main + a1
    }

    #[test]
    fn test_late_agent_joins_existing_run() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));

        let mut e = ev(EventKind::SessionStart, "r1");
        e.agent_id = Some("a1".to_string());
        let applied = store.apply(&e);

        assert_eq!(kinds(&applied), vec!["agentStart"]);
    }

    #[test]
    fn test_tool_start_end_pairing() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));
        store.apply(&tool_start("r1", "s1", "Read"));

        let mut end = tool_end("r1", "s1");
        end.duration_ms = Some(100);
        let applied = store.apply(&end);

        assert_eq!(kinds(&applied), vec!["spanEnd"]);
        let spans = store.spans("r1", None).unwrap();
        assert_eq!(spans[0].status, SpanStatus::Ok);
        assert_eq!(spans[0].duration_ms, Some(100));
        assert!(spans[0].ended_at.unwrap() >= spans[0].started_at);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_duration_computed_from_timestamps() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));

        let mut start = tool_start("r1", "s1", "Read");
        start.ts = Utc::now() - Duration::milliseconds(250);
        store.apply(&start);
        store.apply(&tool_end("r1", "s1"));

        let spans = store.spans("r1", None).unwrap();
        assert!(spans[0].duration_ms.unwrap() >= 250);
    }

    #[test]
    fn test_tool_end_fallback_by_tool_name() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));
        store.apply(&tool_start("r1", "s1", "Read"));
        store.apply(&tool_start("r1", "s2", "Grep"));

        // Producer omitted the id on the terminating event
        let mut end = ev(EventKind::ToolEnd, "r1");
        end.tool = Some("Read".to_string());
        store.apply(&end);

        let spans = store.spans("r1", None).unwrap();
        let read = spans.iter().find(|s| s.id == "s1").unwrap();
        let grep = spans.iter().find(|s| s.id == "s2").unwrap();
        assert_eq!(read.status, SpanStatus::Ok);
        assert_eq!(grep.status, SpanStatus::Running);
    }

    #[test]
    fn test_tool_end_fallback_most_recent_any_tool() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));
        let mut first = tool_start("r1", "s1", "Read");
        first.ts = Utc::now() - Duration::seconds(5);
        store.apply(&first);
        store.apply(&tool_start("r1", "s2", "Grep"));

        // No id, no tool: most recently started running span wins
        store.apply(&ev(EventKind::ToolEnd, "r1"));

        let spans = store.spans("r1", None).unwrap();
        assert_eq!(spans.iter().find(|s| s.id == "s2").unwrap().status, SpanStatus::Ok);
        assert_eq!(
            spans.iter().find(|s| s.id == "s1").unwrap().status,
            SpanStatus::Running
        );
    }

    #[test]
    fn test_unresolvable_end_is_noop() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));
        let applied = store.apply(&tool_end("r1", "nope"));

        assert!(applied.updates.is_empty());
        assert!(applied.records.is_empty());
    }

    #[test]
    fn test_duplicate_tool_start_never_reclassifies() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));
        store.apply(&tool_start("r1", "s1", "Read"));
        let applied = store.apply(&tool_start("r1", "s1", "Bash"));

        assert!(applied.updates.is_empty());
        let spans = store.spans("r1", None).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].tool, "Read");
    }

    #[test]
    fn test_tool_failure_status_mapping() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));

        store.apply(&tool_start("r1", "s1", "Bash"));
        let mut fail = ev(EventKind::ToolFailure, "r1");
        fail.span_id = Some("s1".to_string());
        fail.error_kind = Some("timeout".to_string());
        fail.error = Some("timed out after 30s".to_string());
        store.apply(&fail);

        store.apply(&tool_start("r1", "s2", "Edit"));
        let mut fail = ev(EventKind::ToolFailure, "r1");
        fail.span_id = Some("s2".to_string());
        fail.error_kind = Some("permission_denied".to_string());
        store.apply(&fail);

        store.apply(&tool_start("r1", "s3", "Read"));
        let mut fail = ev(EventKind::ToolFailure, "r1");
        fail.span_id = Some("s3".to_string());
        fail.error = Some("boom".to_string());
        store.apply(&fail);

        let spans = store.spans("r1", None).unwrap();
        assert_eq!(spans[0].status, SpanStatus::Timeout);
        assert_eq!(spans[0].error.as_deref(), Some("timed out after 30s"));
        assert_eq!(spans[1].status, SpanStatus::PermissionDenied);
        assert_eq!(spans[2].status, SpanStatus::Error);
    }

    #[test]
    fn test_session_end_force_closes_all() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));
        store.apply(&tool_start("r1", "s1", "Grep"));

        let mut end = ev(EventKind::SessionEnd, "r1");
        end.status = Some("completed".to_string());
        let end_ts = end.ts;
        let applied = store.apply(&end);

        let run = store.run("r1").unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.ended_at, Some(end_ts));

        let spans = store.spans("r1", None).unwrap();
        assert!(spans.iter().all(|s| !s.is_running()));
        assert!(spans.iter().all(|s| s.ended_at.is_some()));
        assert_eq!(spans[0].status, SpanStatus::Ok);
        assert_eq!(spans[0].ended_at, Some(end_ts));

        let agents = store.agents("r1").unwrap();
        assert!(agents.iter().all(|a| !a.is_open()));

        assert!(kinds(&applied).contains(&"spanEnd"));
        assert!(kinds(&applied).contains(&"agentEnd"));
        assert_eq!(*kinds(&applied).last().unwrap(), "runEnd");
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_session_error_aborts_open_spans() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));
        store.apply(&tool_start("r1", "s1", "Bash"));

        let mut end = ev(EventKind::Stop, "r1");
        end.status = Some("error".to_string());
        store.apply(&end);

        let run = store.run("r1").unwrap();
        assert_eq!(run.status, RunStatus::Error);
        let spans = store.spans("r1", None).unwrap();
        assert_eq!(spans[0].status, SpanStatus::Aborted);
    }

    #[test]
    fn test_tool_start_before_session_start() {
        let mut store = store();
        let applied = store.apply(&tool_start("r1", "s1", "Read"));

        // Run and main agent created lazily, then the span
        assert_eq!(kinds(&applied), vec!["runStart", "agentStart", "spanStart"]);
        assert!(store.run("r1").is_some());
    }

    #[test]
    fn test_tool_start_without_tool_produces_no_span() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));
        let applied = store.apply(&ev(EventKind::ToolStart, "r1"));

        assert!(applied.updates.is_empty());
        assert!(store.spans("r1", None).unwrap().is_empty());
    }

    #[test]
    fn test_task_attributed_to_calling_agent() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));

        let mut sub = ev(EventKind::SubagentStart, "r1");
        sub.agent_id = Some("a1".to_string());
        store.apply(&sub);

        // Subagent is mid-execution; Task still goes to the caller
        let applied = store.apply(&tool_start("r1", "t1", TASK_TOOL));
        let span = match &applied.updates[0] {
            TraceUpdate::SpanStart { span, .. } => span,
            other => panic!("expected spanStart, got {:?}", other),
        };
        assert_eq!(span.agent_id, "r1");
    }

    #[test]
    fn test_implicit_attribution_to_recent_subagent() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));

        let mut sub = ev(EventKind::SubagentStart, "r1");
        sub.agent_id = Some("a1".to_string());
        store.apply(&sub);

        let applied = store.apply(&tool_start("r1", "s1", "Read"));
        let span = match &applied.updates[0] {
            TraceUpdate::SpanStart { span, .. } => span,
            other => panic!("expected spanStart, got {:?}", other),
        };
        assert_eq!(span.agent_id, "a1");
    }

    #[test]
    fn test_explicit_agent_id_wins_attribution() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));

        let mut start = tool_start("r1", "s1", "Read");
        start.agent_id = Some("a9".to_string());
        store.apply(&start);

        let spans = store.spans("r1", None).unwrap();
        assert_eq!(spans[0].agent_id, "a9");
        // Unknown agent was registered on the fly
        assert!(store.agent("r1", "a9").is_some());
    }

    #[test]
    fn test_subagent_spans_parented_to_task_span() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));
        store.apply(&tool_start("r1", "t1", TASK_TOOL));

        let mut sub = ev(EventKind::SubagentStart, "r1");
        sub.agent_id = Some("a1".to_string());
        store.apply(&sub);

        let mut start = tool_start("r1", "s1", "Read");
        start.agent_id = Some("a1".to_string());
        store.apply(&start);

        let spans = store.spans("r1", None).unwrap();
        let read = spans.iter().find(|s| s.id == "s1").unwrap();
        assert_eq!(read.parent_span_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_subagent_stop_scoped_force_close() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));

        // Main agent's own open span
        let mut main_span = tool_start("r1", "m1", "Bash");
        main_span.agent_id = Some("r1".to_string());
        store.apply(&main_span);

        let mut sub = ev(EventKind::SubagentStart, "r1");
        sub.agent_id = Some("a1".to_string());
        store.apply(&sub);

        let mut sub_span = tool_start("r1", "s3", "Read");
        sub_span.agent_id = Some("a1".to_string());
        store.apply(&sub_span);

        let mut stop = ev(EventKind::SubagentStop, "r1");
        stop.agent_id = Some("a1".to_string());
        store.apply(&stop);

        let spans = store.spans("r1", None).unwrap();
        let sub_span = spans.iter().find(|s| s.id == "s3").unwrap();
        assert_eq!(sub_span.status, SpanStatus::Ok);
        assert!(sub_span.ended_at.is_some());

        // Other agents' open spans are untouched
        let main_span = spans.iter().find(|s| s.id == "m1").unwrap();
        assert_eq!(main_span.status, SpanStatus::Running);

        let agent = store.agent("r1", "a1").unwrap();
        assert!(!agent.is_open());
    }

    #[test]
    fn test_subagent_start_merge_is_idempotent() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));

        let mut sub = ev(EventKind::SubagentStart, "r1");
        sub.agent_id = Some("a1".to_string());
        sub.agent_type = Some("explore".to_string());
        store.apply(&sub);

        let mut again = ev(EventKind::SubagentStart, "r1");
        again.agent_id = Some("a1".to_string());
        again.agent_name = Some("explorer".to_string());
        let applied = store.apply(&again);

        assert!(applied.updates.is_empty());
        let agents = store.agents("r1").unwrap();
        assert_eq!(agents.len(), 2);
        let a1 = agents.iter().find(|a| a.id == "a1").unwrap();
        assert_eq!(a1.name, "explorer");
        assert_eq!(a1.agent_type.as_deref(), Some("explore"));
    }

    #[test]
    fn test_thinking_span_lifecycle() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));
        store.apply(&ev(EventKind::ThinkingStart, "r1"));

        let mut end = ev(EventKind::ThinkingEnd, "r1");
        end.duration_ms = Some(900);
        end.thinking = Some("pondering".to_string());
        let applied = store.apply(&end);

        assert_eq!(kinds(&applied), vec!["spanEnd"]);
        let spans = store.spans("r1", None).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].tool, THINKING_TOOL);
        assert_eq!(spans[0].status, SpanStatus::Ok);
        assert_eq!(spans[0].duration_ms, Some(900));
        assert_eq!(spans[0].output_preview.as_deref(), Some("pondering"));
    }

    #[test]
    fn test_thinking_end_matched_by_agent() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));

        let mut sub = ev(EventKind::SubagentStart, "r1");
        sub.agent_id = Some("a1".to_string());
        store.apply(&sub);

        // Main agent thinking, then subagent thinking
        let mut main_think = ev(EventKind::ThinkingStart, "r1");
        main_think.agent_id = Some("r1".to_string());
        store.apply(&main_think);
        let mut sub_think = ev(EventKind::ThinkingStart, "r1");
        sub_think.agent_id = Some("a1".to_string());
        store.apply(&sub_think);

        let mut end = ev(EventKind::ThinkingEnd, "r1");
        end.agent_id = Some("r1".to_string());
        store.apply(&end);

        let spans = store.spans("r1", None).unwrap();
        let main_span = spans.iter().find(|s| s.agent_id == "r1").unwrap();
        let sub_span = spans.iter().find(|s| s.agent_id == "a1").unwrap();
        assert_eq!(main_span.status, SpanStatus::Ok);
        assert_eq!(sub_span.status, SpanStatus::Running);
    }

    #[test]
    fn test_context_compact_instantaneous() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));

        let mut compact = ev(EventKind::ContextCompact, "r1");
        compact.tool_input = Some(json!({"usagePct": 92, "tokens": 180000, "messages": 412}));
        let applied = store.apply(&compact);

        assert_eq!(kinds(&applied), vec!["spanStart", "spanEnd"]);
        let spans = store.spans("r1", None).unwrap();
        assert_eq!(spans[0].tool, COMPACT_TOOL);
        assert_eq!(spans[0].duration_ms, Some(0));
        assert_eq!(spans[0].started_at, spans[0].ended_at.unwrap());
        assert_eq!(
            spans[0].input_preview.as_deref(),
            Some("compacted at 92% usage, 180000 tokens, 412 messages")
        );
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_context_compact_preview_falls_back_to_raw_input() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));

        let mut compact = ev(EventKind::ContextCompact, "r1");
        compact.tool_input = Some(json!({"trigger": "manual"}));
        store.apply(&compact);

        let spans = store.spans("r1", None).unwrap();
        assert!(spans[0].input_preview.as_ref().unwrap().contains("manual"));
    }

    #[test]
    fn test_agent_response_no_mutation() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));
        let applied = store.apply(&ev(EventKind::AgentResponse, "r1"));

        assert!(applied.updates.is_empty());
        assert!(applied.records.is_empty());
        assert!(store.spans("r1", None).unwrap().is_empty());
    }

    #[test]
    fn test_initial_prompt_first_wins() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));

        let mut prompt = ev(EventKind::BeforeSubmitPrompt, "r1");
        prompt.prompt = Some("fix the bug".to_string());
        let applied = store.apply(&prompt);
        assert_eq!(kinds(&applied), vec!["runUpdate"]);

        let mut second = ev(EventKind::BeforeSubmitPrompt, "r1");
        second.prompt = Some("now do something else".to_string());
        let applied = store.apply(&second);
        assert!(applied.updates.is_empty());

        assert_eq!(store.run("r1").unwrap().initial_prompt.as_deref(), Some("fix the bug"));
    }

    #[test]
    fn test_input_preview_sanitized() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));

        let mut start = tool_start("r1", "s1", "Bash");
        start.tool_input = Some(json!({"command": "curl -H 'Authorization: Bearer abc123def'"}));
        store.apply(&start);

        let spans = store.spans("r1", None).unwrap();
        let preview = spans[0].input_preview.as_ref().unwrap();
        assert!(!preview.contains("abc123def"));
        assert!(preview.contains(sanitize::REDACTED));
    }

    #[test]
    fn test_file_paths_extracted() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));

        let mut start = tool_start("r1", "s1", "Edit");
        start.tool_input = Some(json!({"file_path": "/src/main.rs", "old_string": "a"}));
        store.apply(&start);

        let spans = store.spans("r1", None).unwrap();
        assert_eq!(spans[0].file_paths, vec!["/src/main.rs"]);
    }

    #[test]
    fn test_eviction_of_non_running_runs() {
        let mut store = TraceStore::new(Duration::minutes(10));

        store.apply(&ev(EventKind::SessionStart, "old"));
        store.apply(&ev(EventKind::SessionEnd, "old"));
        store.apply(&ev(EventKind::SessionStart, "live"));

        // Age the finished run past the TTL
        store.runs.get_mut("old").unwrap().touched_at = Utc::now() - Duration::minutes(20);

        let evicted = store.evict_expired(Utc::now());
        assert_eq!(evicted, vec!["old".to_string()]);
        assert!(store.run("old").is_none());
        assert!(store.run("live").is_some());
    }

    #[test]
    fn test_running_run_never_evicted() {
        let mut store = TraceStore::new(Duration::minutes(10));
        store.apply(&ev(EventKind::SessionStart, "r1"));
        store.runs.get_mut("r1").unwrap().touched_at = Utc::now() - Duration::hours(5);

        let evicted = store.evict_expired(Utc::now());
        assert!(evicted.is_empty());
    }

    #[test]
    fn test_stale_pending_dropped() {
        let mut store = TraceStore::new(Duration::minutes(10));
        store.apply(&ev(EventKind::SessionStart, "r1"));
        store.apply(&tool_start("r1", "s1", "Read"));

        store.pending.get_mut("s1").unwrap().registered_at = Utc::now() - Duration::minutes(30);
        store.evict_expired(Utc::now());

        assert_eq!(store.pending_count(), 0);
        // The span itself is untouched; only the correlation index aged out
        assert_eq!(store.spans("r1", None).unwrap()[0].status, SpanStatus::Running);
    }

    #[test]
    fn test_restore_rebuilds_indexes() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));
        store.apply(&tool_start("r1", "s1", "Read"));
        let (run, agents, spans) = store.snapshot("r1").unwrap();

        let mut rebuilt = TraceStore::new(Duration::minutes(60));
        rebuilt.restore(ReplayedRun {
            run: Some(run),
            agents,
            spans,
            warnings: Vec::new(),
        });

        assert_eq!(rebuilt.pending_count(), 1);
        // A correlation that straddles the restart still resolves
        rebuilt.apply(&tool_end("r1", "s1"));
        assert_eq!(rebuilt.spans("r1", None).unwrap()[0].status, SpanStatus::Ok);
    }

    #[test]
    fn test_cross_run_end_resolution() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));
        store.apply(&tool_start("r1", "s1", "Read"));

        // End event claims a different session but carries the exact span id
        let end = tool_end("r2", "s1");
        store.apply(&end);

        assert_eq!(store.spans("r1", None).unwrap()[0].status, SpanStatus::Ok);
    }

    #[test]
    fn test_run_detail_summary() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));
        store.apply(&tool_start("r1", "s1", "Read"));
        store.apply(&tool_start("r1", "s2", "Bash"));
        let mut fail = ev(EventKind::ToolFailure, "r1");
        fail.span_id = Some("s2".to_string());
        fail.error = Some("boom".to_string());
        store.apply(&fail);

        let detail = store.run_detail("r1").unwrap();
        assert_eq!(detail.summary.agents, 1);
        assert_eq!(detail.summary.spans, 2);
        assert_eq!(detail.summary.running_spans, 1);
        assert_eq!(detail.summary.errors, 1);
    }

    #[test]
    fn test_spans_since_filter() {
        let mut store = store();
        store.apply(&ev(EventKind::SessionStart, "r1"));

        let mut early = tool_start("r1", "s1", "Read");
        early.ts = Utc::now() - Duration::minutes(10);
        store.apply(&early);

        let cutoff = Utc::now() - Duration::minutes(5);
        store.apply(&tool_start("r1", "s2", "Grep"));

        let spans = store.spans("r1", Some(cutoff)).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].id, "s2");
    }

    #[test]
    fn test_recent_runs_newest_first() {
        let mut store = store();
        let mut first = ev(EventKind::SessionStart, "r1");
        first.ts = Utc::now() - Duration::minutes(10);
        store.apply(&first);
        store.apply(&ev(EventKind::SessionStart, "r2"));

        let runs = store.recent_runs(10);
        assert_eq!(runs[0].id, "r2");
        assert_eq!(runs[1].id, "r1");

        assert_eq!(store.recent_runs(1).len(), 1);
    }
}
