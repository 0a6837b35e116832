use std::collections::{BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::observer::ResponseObserver;
use crate::state::{ResponseEvent, RunReport, unix_ms_now};

pub const RESPONSE_EVENT: &str = "agent.response";
pub const RUN_COMPLETED_EVENT: &str = "run.completed";
pub const RUN_FAILED_EVENT: &str = "run.failed";

/// Appends one JSON line per agent response, plus run outcome lines, to a
/// transcript file. Write failures are logged and never abort a run.
#[derive(Debug, Clone)]
pub struct TranscriptSink {
    pub path: PathBuf,
    pub topology: String,
    pub file_lock: Arc<std::sync::Mutex<()>>,
}

impl TranscriptSink {
    pub fn new(path: impl Into<PathBuf>, topology: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            topology: topology.into(),
            file_lock: Arc::new(std::sync::Mutex::new(())),
        }
    }

    pub fn emit(&self, event: &str, run_id: &str, payload: Value) {
        let mut record = serde_json::Map::new();
        record.insert("ts_unix_ms".to_string(), json!(unix_ms_now()));
        record.insert("event".to_string(), json!(event));
        record.insert("run_id".to_string(), json!(run_id));
        record.insert("topology".to_string(), json!(self.topology));

        if let Some(map) = payload.as_object() {
            for (key, value) in map {
                record.insert(key.clone(), value.clone());
            }
        }

        let value = Value::Object(record);
        if let Err(err) = self.append_event_line(&value) {
            tracing::warn!(
                event = event,
                path = %self.path.display(),
                error = %err,
                "transcript write failed"
            );
        }
    }

    /// Records the outcome of a finished run.
    pub fn record_run(&self, report: &RunReport) {
        let event = if report.status == crate::state::RunStatus::Failed {
            RUN_FAILED_EVENT
        } else {
            RUN_COMPLETED_EVENT
        };
        self.emit(
            event,
            &report.run_id,
            json!({
                "status": report.status.label(),
                "iterations": report.iterations,
                "responses": report.responses,
                "invoked": report.invoked,
                "unused": report.unused,
                "artifact_chars": report.artifact.chars().count(),
            }),
        );
    }

    fn append_event_line(&self, value: &Value) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create transcript directory '{}'",
                    parent.display()
                )
            })?;
        }

        let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| {
                format!("failed to open transcript path '{}'", self.path.display())
            })?;

        serde_json::to_writer(&mut file, value).context("failed to serialize transcript event")?;
        writeln!(file).context("failed to write transcript newline")
    }
}

impl ResponseObserver for TranscriptSink {
    fn on_response(&self, event: &ResponseEvent) {
        self.emit(
            RESPONSE_EVENT,
            &event.run_id,
            json!({
                "agent": event.agent,
                "iteration": event.iteration,
                "sequence": event.sequence,
                "content": event.content,
            }),
        );
    }
}

#[derive(Debug, Default)]
pub struct TranscriptSummary {
    pub total_lines: usize,
    pub parsed_events: usize,
    pub parse_errors: usize,
    pub unique_runs: BTreeSet<String>,
    pub agent_counts: HashMap<String, usize>,
    pub status_counts: HashMap<String, usize>,
    pub responses: usize,
    pub runs_completed: usize,
    pub runs_failed: usize,
    pub last_event_ts_unix_ms: Option<u128>,
}

/// Summarizes the newest `limit` lines of a transcript.
pub fn summarize_transcript_lines(lines: Vec<String>, limit: usize) -> TranscriptSummary {
    let mut summary = TranscriptSummary::default();
    let max_events = limit.max(1);
    summary.total_lines = lines.len();

    for line in lines.into_iter().rev().take(max_events) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parsed = match serde_json::from_str::<Value>(line) {
            Ok(value) => value,
            Err(_) => {
                summary.parse_errors += 1;
                continue;
            }
        };
        summary.parsed_events += 1;

        if let Some(run_id) = parsed.get("run_id").and_then(Value::as_str)
            && !run_id.is_empty()
        {
            summary.unique_runs.insert(run_id.to_string());
        }

        if let Some(ts) = parsed.get("ts_unix_ms").and_then(Value::as_u64) {
            let ts = ts as u128;
            summary.last_event_ts_unix_ms = Some(
                summary
                    .last_event_ts_unix_ms
                    .map_or(ts, |existing| existing.max(ts)),
            );
        }

        match parsed
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default()
        {
            RESPONSE_EVENT => {
                summary.responses += 1;
                if let Some(agent) = parsed.get("agent").and_then(Value::as_str) {
                    *summary.agent_counts.entry(agent.to_string()).or_insert(0) += 1;
                }
            }
            RUN_COMPLETED_EVENT | RUN_FAILED_EVENT => {
                if parsed.get("event").and_then(Value::as_str) == Some(RUN_FAILED_EVENT) {
                    summary.runs_failed += 1;
                } else {
                    summary.runs_completed += 1;
                }
                if let Some(status) = parsed.get("status").and_then(Value::as_str) {
                    *summary.status_counts.entry(status.to_string()).or_insert(0) += 1;
                }
            }
            _ => {}
        }
    }

    summary
}

pub fn read_transcript_lines(path: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open transcript file '{}'", path.display()))?;
    io::BufReader::new(file)
        .lines()
        .collect::<std::result::Result<Vec<String>, io::Error>>()
        .with_context(|| format!("failed to read transcript file '{}'", path.display()))
}

pub fn run_transcript_report(path: &Path, limit: usize) -> Result<()> {
    if !path.exists() {
        println!("No transcript file found at '{}'.", path.display());
        return Ok(());
    }

    let summary = summarize_transcript_lines(read_transcript_lines(path)?, limit);
    let mut agents = summary.agent_counts.iter().collect::<Vec<_>>();
    agents.sort_by_key(|(name, count)| (std::cmp::Reverse(**count), (*name).clone()));
    let mut statuses = summary.status_counts.iter().collect::<Vec<_>>();
    statuses.sort();

    println!("Transcript report");
    println!("Path: {}", path.display());
    println!("Lines in file: {}", summary.total_lines);
    println!(
        "Events analyzed: {} (parse_errors={})",
        summary.parsed_events, summary.parse_errors
    );
    println!("Unique runs: {}", summary.unique_runs.len());
    println!("Agent responses: {}", summary.responses);
    println!(
        "Run outcomes: completed={} failed={}",
        summary.runs_completed, summary.runs_failed
    );

    if !statuses.is_empty() {
        let line = statuses
            .iter()
            .map(|(status, count)| format!("{status}={count}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!("Statuses: {line}");
    }

    if !agents.is_empty() {
        println!("Most active agents:");
        for (name, count) in agents.into_iter().take(5) {
            println!("- {}: {}", name, count);
        }
    }

    if let Some(last_ts) = summary.last_event_ts_unix_ms {
        println!("Last event ts_unix_ms: {last_ts}");
    }

    Ok(())
}
