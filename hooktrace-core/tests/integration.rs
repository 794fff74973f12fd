//! Integration tests for the hooktrace ingestion and correlation pipeline
//!
//! These tests drive raw producer payloads through the normalizer, the trace
//! store, the trace log and the broadcaster, end to end, the way the server's
//! ingest worker does.

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;

use hooktrace_core::broadcast::Broadcaster;
use hooktrace_core::normalize::normalize;
use hooktrace_core::persist::TraceLog;
use hooktrace_core::store::TraceStore;
use hooktrace_core::tree::{build_tree, validate};
use hooktrace_core::types::{RunStatus, SpanStatus, TraceUpdate};

fn store() -> TraceStore {
    TraceStore::new(Duration::minutes(60))
}

/// Normalize a raw payload and apply it, as the ingest worker would.
fn ingest(store: &mut TraceStore, payload: Value) -> Vec<TraceUpdate> {
    let event = normalize(&payload).expect("payload should normalize");
    store.apply(&event).updates
}

// ============================================
// End-to-end scenarios
// ============================================

#[test]
fn test_start_end_pairing_with_explicit_duration() {
    let mut store = store();

    ingest(&mut store, json!({"kind": "sessionStart", "sessionId": "R"}));
    ingest(
        &mut store,
        json!({"kind": "toolStart", "sessionId": "R", "spanId": "S1", "tool": "Read"}),
    );
    ingest(
        &mut store,
        json!({"kind": "toolEnd", "sessionId": "R", "spanId": "S1", "durationMs": 100}),
    );

    let spans = store.spans("R", None).unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].status, SpanStatus::Ok);
    assert_eq!(spans[0].duration_ms, Some(100));
    assert!(spans[0].ended_at.unwrap() >= spans[0].started_at);
}

#[test]
fn test_session_end_force_closes_unmatched_span() {
    let mut store = store();

    ingest(&mut store, json!({"kind": "sessionStart", "sessionId": "R"}));
    ingest(
        &mut store,
        json!({"kind": "toolStart", "sessionId": "R", "spanId": "S2", "tool": "Grep"}),
    );
    ingest(
        &mut store,
        json!({"kind": "sessionEnd", "sessionId": "R", "status": "completed"}),
    );

    let run = store.run("R").unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let spans = store.spans("R", None).unwrap();
    assert_eq!(spans[0].status, SpanStatus::Ok);
    assert_eq!(spans[0].ended_at, run.ended_at);
    assert!(spans.iter().all(|s| s.ended_at.is_some()));
}

#[test]
fn test_subagent_stop_scoped_force_close() {
    let mut store = store();

    ingest(&mut store, json!({"kind": "sessionStart", "sessionId": "R"}));
    ingest(
        &mut store,
        json!({"kind": "toolStart", "sessionId": "R", "spanId": "M1", "tool": "Bash", "agentId": "R"}),
    );
    ingest(
        &mut store,
        json!({"kind": "subagentStart", "sessionId": "R", "agentId": "A1"}),
    );
    ingest(
        &mut store,
        json!({"kind": "toolStart", "sessionId": "R", "spanId": "S3", "agentId": "A1", "tool": "Read"}),
    );
    // No toolEnd for S3
    ingest(
        &mut store,
        json!({"kind": "subagentStop", "sessionId": "R", "agentId": "A1"}),
    );

    let spans = store.spans("R", None).unwrap();
    let sub = spans.iter().find(|s| s.id == "S3").unwrap();
    assert_eq!(sub.status, SpanStatus::Ok);
    assert!(sub.ended_at.is_some());

    // The main agent's open span is untouched
    let main = spans.iter().find(|s| s.id == "M1").unwrap();
    assert_eq!(main.status, SpanStatus::Running);
}

#[test]
fn test_task_attribution_with_active_subagent() {
    let mut store = store();

    ingest(&mut store, json!({"kind": "sessionStart", "sessionId": "R"}));
    ingest(
        &mut store,
        json!({"kind": "subagentStart", "sessionId": "R", "agentId": "A1"}),
    );
    ingest(
        &mut store,
        json!({"kind": "toolStart", "sessionId": "R", "spanId": "T1", "tool": "Task"}),
    );

    let spans = store.spans("R", None).unwrap();
    let task = spans.iter().find(|s| s.id == "T1").unwrap();
    assert_eq!(task.agent_id, "R");
}

// ============================================
// Normalization boundary
// ============================================

#[test]
fn test_line_break_ids_correlate() {
    let mut store = store();

    // Known producer defect: the start event carries an embedded line break
    ingest(
        &mut store,
        json!({"kind": "sessionStart", "sessionId": "run\n-42"}),
    );
    ingest(
        &mut store,
        json!({"kind": "toolStart", "sessionId": "run-42", "spanId": "S\r\n1", "tool": "Read"}),
    );
    ingest(
        &mut store,
        json!({"kind": "toolEnd", "sessionId": "run\n-42", "spanId": "S1"}),
    );

    assert_eq!(store.run_count(), 1);
    let spans = store.spans("run-42", None).unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].status, SpanStatus::Ok);
}

#[test]
fn test_kind_inferred_from_hook_name_end_to_end() {
    let mut store = store();

    ingest(&mut store, json!({"sessionId": "R", "hookName": "SessionStart"}));
    ingest(
        &mut store,
        json!({"sessionId": "R", "hookName": "PreToolUse", "tool": "Read", "toolUseId": "S1"}),
    );
    ingest(
        &mut store,
        json!({"sessionId": "R", "hookName": "PostToolUse", "toolUseId": "S1", "output": "done"}),
    );

    let spans = store.spans("R", None).unwrap();
    assert_eq!(spans[0].status, SpanStatus::Ok);
    assert_eq!(spans[0].output_preview.as_deref(), Some("done"));
}

#[test]
fn test_non_tool_hooks_never_produce_spans() {
    let mut store = store();
    ingest(&mut store, json!({"kind": "sessionStart", "sessionId": "R"}));

    // Compaction and prompt hooks infer a start kind but no tool name
    for hook in ["PreCompact", "ContextFileVisibility"] {
        let payload = json!({"sessionId": "R", "hookName": hook});
        if let Some(event) = normalize(&payload) {
            store.apply(&event);
        }
    }

    assert!(store.spans("R", None).unwrap().is_empty());
}

#[test]
fn test_undecipherable_payload_dropped_not_fatal() {
    assert!(normalize(&json!({"unrelated": true})).is_none());
    assert!(normalize(&json!(42)).is_none());

    // Ingestion continues fine afterwards
    let mut store = store();
    ingest(&mut store, json!({"kind": "sessionStart", "sessionId": "R"}));
    assert!(store.run("R").is_some());
}

// ============================================
// Persistence replay
// ============================================

#[test]
fn test_crash_replay_converges() {
    let dir = TempDir::new().unwrap();
    let mut log = TraceLog::open(dir.path()).unwrap();
    let mut store = store();

    for payload in [
        json!({"kind": "sessionStart", "sessionId": "R"}),
        json!({"kind": "toolStart", "sessionId": "R", "spanId": "S1", "tool": "Read"}),
        json!({"kind": "toolEnd", "sessionId": "R", "spanId": "S1", "durationMs": 80}),
        json!({"kind": "toolStart", "sessionId": "R", "spanId": "S2", "tool": "Bash"}),
    ] {
        let event = normalize(&payload).unwrap();
        let applied = store.apply(&event);
        log.append_batch(&applied.records).unwrap();
    }

    // Simulated restart: fold the log back through a fresh store
    let mut rebuilt = TraceStore::new(Duration::minutes(60));
    for replayed in log.replay_recent(10).unwrap() {
        rebuilt.restore(replayed);
    }

    let spans = rebuilt.spans("R", None).unwrap();
    assert_eq!(spans.len(), 2);
    assert_eq!(spans.iter().find(|s| s.id == "S1").unwrap().status, SpanStatus::Ok);
    assert_eq!(
        spans.iter().find(|s| s.id == "S2").unwrap().status,
        SpanStatus::Running
    );

    // The in-flight span is still correlatable after the restart
    let event = normalize(&json!({"kind": "toolEnd", "sessionId": "R", "spanId": "S2"})).unwrap();
    rebuilt.apply(&event);
    assert_eq!(
        rebuilt.spans("R", None).unwrap().iter().find(|s| s.id == "S2").unwrap().status,
        SpanStatus::Ok
    );
}

// ============================================
// Broadcast integration
// ============================================

#[test]
fn test_default_open_subscriber_sees_initial_burst() {
    let broadcaster = Broadcaster::new();
    let (_id, mut rx) = broadcaster.subscribe();

    let mut store = store();
    let updates = ingest(&mut store, json!({"kind": "sessionStart", "sessionId": "R"}));
    for update in &updates {
        broadcaster.publish(update);
    }

    // No subscription message was ever sent, the burst still arrived
    let got = rx.try_recv().unwrap();
    assert_eq!(got.run_id(), "R");
    assert!(matches!(got, TraceUpdate::RunStart { .. }));
}

#[test]
fn test_deltas_filtered_by_run_interest() {
    let broadcaster = Broadcaster::new();
    let (id, mut rx) = broadcaster.subscribe();
    broadcaster.subscribe_run(id, "R2");

    let mut store = store();
    for updates in [
        ingest(&mut store, json!({"kind": "sessionStart", "sessionId": "R1"})),
        ingest(&mut store, json!({"kind": "sessionStart", "sessionId": "R2"})),
    ] {
        for update in &updates {
            broadcaster.publish(update);
        }
    }

    let mut received = Vec::new();
    while let Ok(update) = rx.try_recv() {
        received.push(update);
    }
    // runStart + agentStart for R2 only
    assert_eq!(received.len(), 2);
    assert!(received.iter().all(|u| u.run_id() == "R2"));
}

// ============================================
// Tree over live store output
// ============================================

#[test]
fn test_tree_and_validation_over_store_snapshot() {
    let mut store = store();

    ingest(&mut store, json!({"kind": "sessionStart", "sessionId": "R"}));
    ingest(
        &mut store,
        json!({"kind": "toolStart", "sessionId": "R", "spanId": "T1", "tool": "Task"}),
    );
    ingest(
        &mut store,
        json!({"kind": "subagentStart", "sessionId": "R", "agentId": "A1", "agentType": "explore"}),
    );
    ingest(
        &mut store,
        json!({"kind": "toolStart", "sessionId": "R", "spanId": "S1", "agentId": "A1", "tool": "Read"}),
    );
    ingest(&mut store, json!({"kind": "toolEnd", "sessionId": "R", "spanId": "S1"}));
    ingest(&mut store, json!({"kind": "toolEnd", "sessionId": "R", "spanId": "T1"}));
    ingest(
        &mut store,
        json!({"kind": "sessionEnd", "sessionId": "R", "status": "completed"}),
    );

    let (run, agents, spans) = store.snapshot("R").unwrap();

    // The subagent's span hangs off the Task span in the forest
    let tree = build_tree(&spans);
    assert_eq!(tree.roots.len(), 1);
    assert_eq!(tree.roots[0].span.id, "T1");
    assert_eq!(tree.roots[0].children.len(), 1);
    assert_eq!(tree.roots[0].children[0].span.id, "S1");
    assert!(tree.orphans.is_empty());

    let v = validate(&run, &agents, &spans, None);
    assert!(v.is_ok(), "unexpected validation errors: {:?}", v.errors);
    assert!(v.warnings.is_empty());
}

#[test]
fn test_orphan_detection_from_producer_parent_ids() {
    let mut store = store();

    ingest(&mut store, json!({"kind": "sessionStart", "sessionId": "R"}));
    ingest(
        &mut store,
        json!({
            "kind": "toolStart", "sessionId": "R", "spanId": "S1",
            "tool": "Read", "parentSpanId": "never-started"
        }),
    );

    let (_, _, spans) = store.snapshot("R").unwrap();
    let tree = build_tree(&spans);
    assert!(tree.roots.is_empty());
    assert_eq!(tree.orphans.len(), 1);
    assert_eq!(tree.orphans[0].id, "S1");
}

// ============================================
// Eviction
// ============================================

#[test]
fn test_eviction_keeps_disk_recoverable() {
    let dir = TempDir::new().unwrap();
    let mut log = TraceLog::open(dir.path()).unwrap();
    let mut store = TraceStore::new(Duration::minutes(0));

    for payload in [
        json!({"kind": "sessionStart", "sessionId": "R"}),
        json!({"kind": "sessionEnd", "sessionId": "R", "status": "completed"}),
    ] {
        let event = normalize(&payload).unwrap();
        let applied = store.apply(&event);
        log.append_batch(&applied.records).unwrap();
    }

    let evicted = store.evict_expired(Utc::now() + Duration::seconds(1));
    assert_eq!(evicted, vec!["R".to_string()]);
    assert!(store.run("R").is_none());

    // Still recoverable from disk
    let mut rebuilt = TraceStore::new(Duration::minutes(60));
    for replayed in log.replay_recent(10).unwrap() {
        rebuilt.restore(replayed);
    }
    assert_eq!(rebuilt.run("R").unwrap().status, RunStatus::Completed);
}
