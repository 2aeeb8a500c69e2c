//! Pipeline metrics through an explicit sink argument.
//!
//! No global registry: every pipeline takes a `&dyn MetricsSink` and emits
//! named events with JSON field bags.  The JSONL sink appends one object per
//! line to `.metrics.jsonl` under the graph root.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

pub const METRICS_FILE: &str = ".metrics.jsonl";

#[derive(Debug, Clone, Serialize)]
pub struct MetricEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub fields: Value,
}

impl MetricEvent {
    pub fn new(name: impl Into<String>, fields: Value) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now(),
            fields,
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn emit(&self, event: MetricEvent);
}

/// Discards everything.  The default when `metrics.file_output` is off.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn emit(&self, _event: MetricEvent) {}
}

/// Appends events to `.metrics.jsonl` under the graph root.  Emission
/// failures are logged and swallowed — metrics must never break a pipeline.
#[derive(Debug, Clone)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(graph_root: &Path) -> Self {
        Self {
            path: graph_root.join(METRICS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Sink selection for a graph root: the JSONL file when file output is
/// enabled, the null sink otherwise.
pub fn sink_for(graph_root: &Path, file_output: bool) -> Box<dyn MetricsSink> {
    if file_output {
        Box::new(JsonlSink::new(graph_root))
    } else {
        Box::new(NullSink)
    }
}

impl MetricsSink for JsonlSink {
    fn emit(&self, event: MetricEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "metric event unserialisable — dropped");
                return;
            }
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(err) = result {
            warn!(error = %err, path = %self.path.display(), "metric append failed");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn jsonl_sink_appends_one_line_per_event() {
        let dir = std::env::temp_dir().join(format!("omg-metrics-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let sink = JsonlSink::new(&dir);

        sink.emit(MetricEvent::new("observation.complete", json!({"nodes": 3})));
        sink.emit(MetricEvent::new("dedup.complete", json!({"merges": 1})));

        let raw = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<_> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["name"], "observation.complete");
        assert_eq!(first["fields"]["nodes"], 3);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn null_sink_is_silent() {
        NullSink.emit(MetricEvent::new("anything", json!({})));
    }

    #[test]
    fn sink_selection_follows_the_flag() {
        let dir = std::env::temp_dir().join(format!("omg-metrics-sel-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        sink_for(&dir, false).emit(MetricEvent::new("dropped", json!({})));
        assert!(!dir.join(METRICS_FILE).exists());

        sink_for(&dir, true).emit(MetricEvent::new("kept", json!({})));
        assert!(dir.join(METRICS_FILE).exists());

        let _ = std::fs::remove_dir_all(dir);
    }
}
