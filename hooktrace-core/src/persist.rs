//! Append-only trace log
//!
//! One JSONL record stream per run, under `<data_dir>/runs/<run id>.jsonl`.
//! Each record is self-describing: it carries a record kind (run, agent or
//! span snapshot) and a write timestamp. On replay, later records of the same
//! kind and id supersede earlier ones (last-write-wins by file order), so the
//! reconstructed state converges to what live mutation produced.
//!
//! Replay is deliberately lossy-tolerant: a partially-written or malformed
//! trailing line is skipped individually and recorded as a warning; the rest
//! of the file and subsequent files still replay.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Agent, Run, Span};

// ============================================
// Records
// ============================================

/// The entity snapshot carried by one log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RecordData {
    Run(Run),
    Agent(Agent),
    Span(Span),
}

/// One self-describing trace log record.
///
/// `run_id` names the stream this record belongs to; a terminating event can
/// resolve into a different run than the one it claimed, so the owning run is
/// part of the record rather than implied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub run_id: String,
    pub written_at: DateTime<Utc>,
    #[serde(flatten)]
    pub data: RecordData,
}

impl TraceRecord {
    pub fn run(run: &Run) -> Self {
        Self {
            run_id: run.id.clone(),
            written_at: Utc::now(),
            data: RecordData::Run(run.clone()),
        }
    }

    pub fn agent(agent: &Agent) -> Self {
        Self {
            run_id: agent.run_id.clone(),
            written_at: Utc::now(),
            data: RecordData::Agent(agent.clone()),
        }
    }

    pub fn span(run_id: &str, span: &Span) -> Self {
        Self {
            run_id: run_id.to_string(),
            written_at: Utc::now(),
            data: RecordData::Span(span.clone()),
        }
    }

    /// Id of the entity this record snapshots, for last-write-wins replay.
    pub fn entity_id(&self) -> &str {
        match &self.data {
            RecordData::Run(run) => &run.id,
            RecordData::Agent(agent) => &agent.id,
            RecordData::Span(span) => &span.id,
        }
    }
}

// ============================================
// Replay
// ============================================

/// State reconstructed from one run's log file.
#[derive(Debug, Default)]
pub struct ReplayedRun {
    pub run: Option<Run>,
    /// Agents in first-seen order, last snapshot wins
    pub agents: Vec<Agent>,
    /// Spans in first-seen order, last snapshot wins
    pub spans: Vec<Span>,
    /// Per-line parse problems, accumulated rather than fatal
    pub warnings: Vec<String>,
}

// ============================================
// Trace log
// ============================================

/// Append-only trace log with one lazily-opened stream per run.
pub struct TraceLog {
    runs_dir: PathBuf,
    handles: HashMap<String, File>,
}

impl TraceLog {
    /// Open a trace log rooted at `data_dir`, creating `<data_dir>/runs`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let runs_dir = data_dir.join("runs");
        std::fs::create_dir_all(&runs_dir)?;
        Ok(Self {
            runs_dir,
            handles: HashMap::new(),
        })
    }

    /// Path of the log file for a run.
    pub fn log_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{}.jsonl", safe_file_stem(run_id)))
    }

    /// Append one record to its run's stream, opening it lazily.
    ///
    /// The write is flushed before returning; this is the durability point of
    /// an ingest mutation.
    pub fn append(&mut self, record: &TraceRecord) -> Result<()> {
        let run_id = record.run_id.as_str();
        let line = serde_json::to_string(record)?;

        if !self.handles.contains_key(run_id) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.log_path(run_id))?;
            self.handles.insert(run_id.to_string(), file);
        }
        // Just inserted above when absent
        let file = self
            .handles
            .get_mut(run_id)
            .ok_or_else(|| Error::TraceLog(format!("no handle for run {}", run_id)))?;

        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    /// Append a batch of records, stopping at the first failure.
    pub fn append_batch(&mut self, records: &[TraceRecord]) -> Result<()> {
        for record in records {
            self.append(record)?;
        }
        Ok(())
    }

    /// Release the open handle for a run (on eviction or shutdown).
    pub fn close(&mut self, run_id: &str) {
        self.handles.remove(run_id);
    }

    /// Release all open handles.
    pub fn close_all(&mut self) {
        self.handles.clear();
    }

    /// Replay the most recent `limit` run logs, newest first by modification
    /// time.
    pub fn replay_recent(&self, limit: usize) -> Result<Vec<ReplayedRun>> {
        let mut files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();

        for entry in std::fs::read_dir(&self.runs_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            files.push((path, modified));
        }

        files.sort_by(|a, b| b.1.cmp(&a.1));
        files.truncate(limit);

        let mut replayed = Vec::new();
        for (path, _) in files {
            match replay_file(&path) {
                Ok(run) => replayed.push(run),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to replay run log");
                }
            }
        }
        Ok(replayed)
    }
}

/// Replay one run log file, folding records last-write-wins by file order.
pub fn replay_file(path: &Path) -> Result<ReplayedRun> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut replayed = ReplayedRun::default();
    let mut agent_index: HashMap<String, usize> = HashMap::new();
    let mut span_index: HashMap<String, usize> = HashMap::new();

    for (line_no, line_result) in reader.lines().enumerate() {
        let line = match line_result {
            Ok(line) => line,
            Err(e) => {
                replayed
                    .warnings
                    .push(format!("{}:{}: unreadable line: {}", path.display(), line_no + 1, e));
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let record: TraceRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                replayed
                    .warnings
                    .push(format!("{}:{}: malformed record: {}", path.display(), line_no + 1, e));
                continue;
            }
        };

        match record.data {
            RecordData::Run(run) => replayed.run = Some(run),
            RecordData::Agent(agent) => match agent_index.get(&agent.id) {
                Some(&idx) => replayed.agents[idx] = agent,
                None => {
                    agent_index.insert(agent.id.clone(), replayed.agents.len());
                    replayed.agents.push(agent);
                }
            },
            RecordData::Span(span) => match span_index.get(&span.id) {
                Some(&idx) => replayed.spans[idx] = span,
                None => {
                    span_index.insert(span.id.clone(), replayed.spans.len());
                    replayed.spans.push(span);
                }
            },
        }
    }

    Ok(replayed)
}

/// Sanitize a run id for use as a file stem.
///
/// Ids are scrubbed of line breaks at the normalization boundary, but may
/// still carry path separators or other characters unsafe in file names.
fn safe_file_stem(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
