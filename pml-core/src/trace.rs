//! Trace collector: records one [`ExecutionTrace`] per capability
//! invocation, with secrets stripped from both the free-text error
//! message and every tool call's structured args/result before the
//! trace is persisted or handed to the learning loop.

use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use pml_commons::sanitize::{default_secret_key_patterns, redact_secrets, sanitize_json};
use tracing::warn;

use crate::model::{BranchDecision, ExecutionTrace, TraceTaskResult};

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("failed to append trace to {path}: {source}")]
    Append {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Builds one trace for a single capability execution, collecting task
/// results and branch decisions as they occur.
pub struct TraceBuilder {
    capability_id: Option<String>,
    user_id: Option<String>,
    task_results: Vec<TraceTaskResult>,
    decisions: Vec<BranchDecision>,
    started_at: std::time::Instant,
}

impl TraceBuilder {
    pub fn new(capability_id: Option<String>, user_id: Option<String>) -> Self {
        Self {
            capability_id,
            user_id,
            task_results: Vec::new(),
            decisions: Vec::new(),
            started_at: std::time::Instant::now(),
        }
    }

    pub fn record_task(&mut self, mut result: TraceTaskResult) {
        let key_patterns = default_secret_key_patterns();
        result.args = sanitize_json(result.args, &key_patterns);
        result.result = sanitize_json(result.result, &key_patterns);
        self.task_results.push(result);
    }

    pub fn record_decision(&mut self, decision: BranchDecision) {
        self.decisions.push(decision);
    }

    pub fn finish(self, success: bool, error: Option<String>) -> ExecutionTrace {
        ExecutionTrace {
            capability_id: self.capability_id,
            success,
            error: error.map(|e| redact_secrets(&e)),
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            task_results: self.task_results,
            decisions: self.decisions,
            timestamp: Utc::now(),
            user_id: self.user_id,
        }
    }
}

/// Append-only JSON-lines trace store.
pub struct TraceCollector {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TraceCollector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    pub fn record(&self, trace: &ExecutionTrace) -> Result<(), TraceError> {
        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let line = serde_json::to_string(trace).expect("ExecutionTrace is always serializable");
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| TraceError::Append { path: self.path.clone(), source })?;
        writeln!(file, "{line}").map_err(|source| TraceError::Append { path: self.path.clone(), source })?;
        Ok(())
    }

    /// Read every trace from the store, skipping and logging lines that
    /// fail to parse rather than aborting the whole read.
    pub fn read_all(&self) -> Vec<ExecutionTrace> {
        let _guard = self.lock.lock();
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        raw.lines()
            .filter_map(|line| {
                if line.trim().is_empty() {
                    return None;
                }
                match serde_json::from_str::<ExecutionTrace>(line) {
                    Ok(trace) => Some(trace),
                    Err(err) => {
                        warn!(error = %err, "skipping malformed trace line");
                        None
                    }
                }
            })
            .collect()
    }
}

pub fn default_path(workspace: &Path) -> PathBuf {
    pml_commons::paths::pml_state_dir(workspace).join("traces.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn task_results_have_secrets_stripped_before_storage() {
        let mut builder = TraceBuilder::new(Some("cap-1".to_string()), None);
        builder.record_task(TraceTaskResult {
            task_id: "t1".to_string(),
            tool_id: crate::model::ToolId::parse("github:create_issue").unwrap(),
            args: json!({"api_key": "sk-super-secret", "title": "bug report"}),
            result: json!({"status": "ok"}),
            success: true,
            duration_ms: 5,
            timestamp: Utc::now(),
        });
        let trace = builder.finish(true, None);
        let args_str = trace.task_results[0].args.to_string();
        assert!(!args_str.contains("sk-super-secret"));
    }

    #[test]
    fn error_message_is_redacted_on_finish() {
        let builder = TraceBuilder::new(None, None);
        let trace = builder.finish(false, Some("request failed: token=abcd1234efgh5678".to_string()));
        assert!(!trace.error.unwrap().contains("abcd1234efgh5678"));
    }

    #[test]
    fn collector_round_trips_through_jsonl_append() {
        let dir = tempdir().unwrap();
        let collector = TraceCollector::new(dir.path().join("traces.jsonl"));
        let builder = TraceBuilder::new(Some("cap-1".to_string()), None);
        let trace = builder.finish(true, None);
        collector.record(&trace).unwrap();

        let all = collector.read_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].capability_id.as_deref(), Some("cap-1"));
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("traces.jsonl");
        std::fs::write(&path, "not json\n{\"bad\": true}\n").unwrap();
        let collector = TraceCollector::new(path);
        assert_eq!(collector.read_all().len(), 0);
    }
}
