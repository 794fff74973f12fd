//! Trace tree builder and validator
//!
//! Pure functions over a run's span list: build the parent-child forest,
//! compute statistics, check structural invariants and optional caller
//! expectations, and render everything as one textual report. Used by the
//! report endpoint and as a verification harness in tests.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::format::{format_duration_opt, format_relative_time};
use crate::types::{Agent, Run, RunStatus, Span, SpanStatus, TASK_TOOL};

// ============================================
// Tree
// ============================================

/// One node of the span forest.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub span: Span,
    pub children: Vec<TreeNode>,
}

/// The built forest plus the orphan set.
///
/// A span whose declared parent id does not exist among the given spans is an
/// orphan: it is never silently attached as a root and never dropped.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceTree {
    pub roots: Vec<TreeNode>,
    pub orphans: Vec<Span>,
}

/// Group spans by declared parent span id into a forest.
pub fn build_tree(spans: &[Span]) -> TraceTree {
    let ids: HashSet<&str> = spans.iter().map(|s| s.id.as_str()).collect();

    let mut orphans = Vec::new();
    let mut children_of: HashMap<&str, Vec<&Span>> = HashMap::new();
    let mut roots_src: Vec<&Span> = Vec::new();

    for span in spans {
        match span.parent_span_id.as_deref() {
            None => roots_src.push(span),
            Some(parent) if ids.contains(parent) => {
                children_of.entry(parent).or_default().push(span);
            }
            Some(_) => orphans.push(span.clone()),
        }
    }

    let mut visited = HashSet::new();
    let roots = roots_src
        .into_iter()
        .map(|span| build_node(span, &children_of, &mut visited))
        .collect();

    // Spans in a parent cycle are reachable from no root; surface them as
    // orphans rather than dropping them.
    for span in spans {
        if !visited.contains(span.id.as_str())
            && span.parent_span_id.is_some()
            && !orphans.iter().any(|o| o.id == span.id)
        {
            orphans.push(span.clone());
        }
    }

    TraceTree { roots, orphans }
}

fn build_node<'a>(
    span: &'a Span,
    children_of: &HashMap<&str, Vec<&'a Span>>,
    visited: &mut HashSet<&'a str>,
) -> TreeNode {
    visited.insert(span.id.as_str());
    let children = children_of
        .get(span.id.as_str())
        .map(|kids| {
            kids.iter()
                .filter(|k| !visited.contains(k.id.as_str()))
                .map(|k| build_node(k, children_of, visited))
                .collect()
        })
        .unwrap_or_default();
    TreeNode {
        span: span.clone(),
        children,
    }
}

// ============================================
// Stats
// ============================================

/// Aggregate statistics over a run's spans.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStats {
    pub total_spans: usize,
    pub by_tool: BTreeMap<String, usize>,
    pub by_agent: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub max_depth: usize,
    /// Over spans carrying a known duration
    pub total_duration_ms: i64,
    pub avg_duration_ms: Option<i64>,
}

/// Compute counts, depth and duration aggregates.
pub fn stats(spans: &[Span]) -> TraceStats {
    let mut by_tool: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_agent: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();

    let mut total_duration_ms = 0i64;
    let mut with_duration = 0usize;

    for span in spans {
        *by_tool.entry(span.tool.clone()).or_default() += 1;
        *by_agent.entry(span.agent_id.clone()).or_default() += 1;
        *by_status.entry(span.status.as_str().to_string()).or_default() += 1;
        if let Some(ms) = span.duration_ms {
            total_duration_ms += ms;
            with_duration += 1;
        }
    }

    let tree = build_tree(spans);
    let max_depth = tree.roots.iter().map(depth).max().unwrap_or(0);

    TraceStats {
        total_spans: spans.len(),
        by_tool,
        by_agent,
        by_status,
        max_depth,
        total_duration_ms,
        avg_duration_ms: (with_duration > 0)
            .then(|| total_duration_ms / with_duration as i64),
    }
}

fn depth(node: &TreeNode) -> usize {
    1 + node.children.iter().map(depth).max().unwrap_or(0)
}

// ============================================
// Validation
// ============================================

/// Caller-supplied expectations, checked in addition to the structural
/// invariants. Used as an automated verification harness.
#[derive(Debug, Clone, Default)]
pub struct Expectations {
    /// Tool names expected to appear in this order (as a subsequence of the
    /// span list in start order)
    pub tool_order: Vec<String>,
    /// Exact expected count per tool name
    pub tool_counts: HashMap<String, usize>,
    /// Inclusive bounds on the total span count
    pub min_spans: Option<usize>,
    pub max_spans: Option<usize>,
    /// Subagent types that must appear among the run's agents
    pub required_agent_types: Vec<String>,
    /// No span may have a failure status
    pub no_errors: bool,
    /// Every span terminal and the run itself non-running
    pub all_completed: bool,
}

/// Accumulated validation outcome; human-readable issue strings, never a
/// fail-fast error.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Validation {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Check structural invariants and optional expectations.
pub fn validate(
    run: &Run,
    agents: &[Agent],
    spans: &[Span],
    expectations: Option<&Expectations>,
) -> Validation {
    let mut v = Validation::default();
    let agent_ids: HashSet<&str> = agents.iter().map(|a| a.id.as_str()).collect();

    for span in spans {
        if run.status != RunStatus::Running && span.is_running() {
            v.errors.push(format!(
                "span {} ({}) still running after run ended",
                span.id, span.tool
            ));
        }
        if !agent_ids.contains(span.agent_id.as_str()) {
            v.errors.push(format!(
                "span {} ({}) references unknown agent {}",
                span.id, span.tool, span.agent_id
            ));
        }
        if !span.is_running() && span.ended_at.is_none() {
            v.errors.push(format!(
                "span {} ({}) is {} but has no end timestamp",
                span.id,
                span.tool,
                span.status.as_str()
            ));
        }
        // A completed Task span should have spawned a subagent
        if span.tool == TASK_TOOL && span.status == SpanStatus::Ok {
            let spawned = agents.iter().any(|a| {
                a.parent_agent_id.as_deref() == Some(span.agent_id.as_str())
                    && a.started_at >= span.started_at
            });
            if !spawned {
                v.warnings.push(format!(
                    "task span {} completed without a corresponding child agent",
                    span.id
                ));
            }
        }
    }

    if let Some(exp) = expectations {
        check_expectations(run, agents, spans, exp, &mut v);
    }

    v
}

fn check_expectations(
    run: &Run,
    agents: &[Agent],
    spans: &[Span],
    exp: &Expectations,
    v: &mut Validation,
) {
    // Tool ordering: expected names must appear as a subsequence
    let mut expected = exp.tool_order.iter().peekable();
    for span in spans {
        if let Some(next) = expected.peek() {
            if span.tool == **next {
                expected.next();
            }
        }
    }
    if let Some(missing) = expected.peek() {
        v.errors.push(format!(
            "expected tool order not satisfied: {} never seen in sequence",
            missing
        ));
    }

    for (tool, expected_count) in &exp.tool_counts {
        let actual = spans.iter().filter(|s| s.tool == **tool).count();
        if actual != *expected_count {
            v.errors.push(format!(
                "expected {} {} span(s), found {}",
                expected_count, tool, actual
            ));
        }
    }

    if let Some(min) = exp.min_spans {
        if spans.len() < min {
            v.errors
                .push(format!("expected at least {} spans, found {}", min, spans.len()));
        }
    }
    if let Some(max) = exp.max_spans {
        if spans.len() > max {
            v.errors
                .push(format!("expected at most {} spans, found {}", max, spans.len()));
        }
    }

    for required in &exp.required_agent_types {
        if !agents
            .iter()
            .any(|a| a.agent_type.as_deref() == Some(required.as_str()))
        {
            v.errors
                .push(format!("required subagent type {} never started", required));
        }
    }

    if exp.no_errors {
        for span in spans {
            if matches!(
                span.status,
                SpanStatus::Error | SpanStatus::Timeout | SpanStatus::PermissionDenied
            ) {
                v.errors.push(format!(
                    "expected no errors, but span {} ({}) ended {}",
                    span.id,
                    span.tool,
                    span.status.as_str()
                ));
            }
        }
    }

    if exp.all_completed {
        if run.status == RunStatus::Running {
            v.errors.push("expected run to be completed, still running".to_string());
        }
        for span in spans {
            if span.is_running() {
                v.errors.push(format!(
                    "expected all spans completed, span {} ({}) still running",
                    span.id, span.tool
                ));
            }
        }
    }
}

// ============================================
// Report
// ============================================

/// Render tree, stats and validation into one structured text document.
pub fn render_report(run: &Run, agents: &[Agent], spans: &[Span]) -> String {
    let tree = build_tree(spans);
    let stats = stats(spans);
    let validation = validate(run, agents, spans, None);

    let mut out = String::new();

    out.push_str(&format!("# Trace report: {}\n", run.id));
    out.push_str(&format!(
        "source: {}  status: {}  started: {}\n",
        run.source,
        run.status.as_str(),
        format_relative_time(run.started_at)
    ));
    if let Some(prompt) = &run.initial_prompt {
        out.push_str(&format!("prompt: {}\n", prompt));
    }
    out.push_str(&format!("agents: {}  spans: {}\n", agents.len(), spans.len()));

    out.push_str("\n## Tree\n");
    for root in &tree.roots {
        render_node(root, 0, &mut out);
    }
    if !tree.orphans.is_empty() {
        out.push_str("\norphans:\n");
        for orphan in &tree.orphans {
            out.push_str(&format!(
                "  {} ({}) parent {} not found\n",
                orphan.id,
                orphan.tool,
                orphan.parent_span_id.as_deref().unwrap_or("?")
            ));
        }
    }

    out.push_str("\n## Stats\n");
    out.push_str(&format!("max depth: {}\n", stats.max_depth));
    out.push_str(&format!(
        "duration: total {} avg {}\n",
        format_duration_opt(Some(stats.total_duration_ms)),
        format_duration_opt(stats.avg_duration_ms)
    ));
    out.push_str("by tool:\n");
    for (tool, count) in &stats.by_tool {
        out.push_str(&format!("  {}: {}\n", tool, count));
    }
    out.push_str("by status:\n");
    for (status, count) in &stats.by_status {
        out.push_str(&format!("  {}: {}\n", status, count));
    }

    out.push_str("\n## Validation\n");
    if validation.is_ok() && validation.warnings.is_empty() {
        out.push_str("ok\n");
    }
    for error in &validation.errors {
        out.push_str(&format!("error: {}\n", error));
    }
    for warning in &validation.warnings {
        out.push_str(&format!("warning: {}\n", warning));
    }

    out
}

fn render_node(node: &TreeNode, indent: usize, out: &mut String) {
    out.push_str(&format!(
        "{}{} [{}] {}\n",
        "  ".repeat(indent),
        node.span.tool,
        node.span.status.as_str(),
        format_duration_opt(node.span.duration_ms)
    ));
    for child in &node.children {
        render_node(child, indent + 1, out);
    }
}
