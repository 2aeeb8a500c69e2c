//! Append-only failure log: one JSON object per line.
//!
//! The retry path rewrites the log atomically, keeping every entry it did
//! not retry.  Corrupt lines are skipped with a warning rather than
//! poisoning the whole log.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use omg_graph::fsio::{atomic_write_creating, read_optional};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::BootstrapError;

pub const FAILURES_FILE: &str = ".bootstrap-failures.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureErrorType {
    LlmError,
    ParseEmpty,
    ZeroOperations,
    RateLimitAborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureLogEntry {
    #[serde(rename = "batchIndex")]
    pub batch_index: usize,
    pub labels: Vec<String>,
    #[serde(rename = "errorType")]
    pub error_type: FailureErrorType,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub diagnostics: Vec<String>,
    #[serde(rename = "chunkCount")]
    pub chunk_count: usize,
}

#[derive(Debug, Clone)]
pub struct FailureLog {
    path: PathBuf,
}

impl FailureLog {
    pub fn new(graph_root: &Path) -> Self {
        Self {
            path: graph_root.join(FAILURES_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &FailureLogEntry) -> Result<(), BootstrapError> {
        let line = serde_json::to_string(entry)
            .map_err(|e| BootstrapError::State(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| BootstrapError::io(&self.path, e))?;
        writeln!(file, "{line}").map_err(|e| BootstrapError::io(&self.path, e))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<FailureLogEntry>, BootstrapError> {
        let Some(raw) = read_optional(&self.path)? else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(
                    line = line_no + 1,
                    error = %err,
                    "corrupt failure-log line skipped"
                ),
            }
        }
        Ok(entries)
    }

    /// Replace the log wholesale (temp file + rename).
    pub fn rewrite(&self, entries: &[FailureLogEntry]) -> Result<(), BootstrapError> {
        let mut content = String::new();
        for entry in entries {
            let line = serde_json::to_string(entry)
                .map_err(|e| BootstrapError::State(e.to_string()))?;
            content.push_str(&line);
            content.push('\n');
        }
        atomic_write_creating(&self.path, &content)?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn scratch() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("omg-flog-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn entry(index: usize, error_type: FailureErrorType) -> FailureLogEntry {
        FailureLogEntry {
            batch_index: index,
            labels: vec![format!("memory:file-{index}.md#0")],
            error_type,
            error: "boom".to_string(),
            timestamp: Utc::now(),
            diagnostics: vec![],
            chunk_count: 1,
        }
    }

    #[test]
    fn append_then_load_round_trips() {
        let root = scratch();
        let log = FailureLog::new(&root);
        log.append(&entry(0, FailureErrorType::LlmError)).unwrap();
        log.append(&entry(1, FailureErrorType::ZeroOperations)).unwrap();

        let loaded = log.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].batch_index, 0);
        assert_eq!(loaded[1].error_type, FailureErrorType::ZeroOperations);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let root = scratch();
        let log = FailureLog::new(&root);
        log.append(&entry(0, FailureErrorType::LlmError)).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
            writeln!(file, "{{ broken json").unwrap();
        }
        log.append(&entry(2, FailureErrorType::ParseEmpty)).unwrap();

        let loaded = log.load().unwrap();
        assert_eq!(loaded.len(), 2);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn rewrite_replaces_contents() {
        let root = scratch();
        let log = FailureLog::new(&root);
        log.append(&entry(0, FailureErrorType::LlmError)).unwrap();
        log.append(&entry(1, FailureErrorType::LlmError)).unwrap();

        log.rewrite(&[entry(1, FailureErrorType::LlmError)]).unwrap();
        let loaded = log.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].batch_index, 1);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn missing_log_is_empty() {
        let root = scratch();
        assert!(FailureLog::new(&root).load().unwrap().is_empty());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn error_type_serialises_kebab_case() {
        let json = serde_json::to_string(&FailureErrorType::RateLimitAborted).unwrap();
        assert_eq!(json, "\"rate-limit-aborted\"");
        let json = serde_json::to_string(&FailureErrorType::ParseEmpty).unwrap();
        assert_eq!(json, "\"parse-empty\"");
    }
}
