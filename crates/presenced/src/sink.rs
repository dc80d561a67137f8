//! Where confirmed attendance goes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use presence_core::{MatchSource, Metadata};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("attendance log I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("attendance event encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// One confirmed presence.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceEvent {
    pub session: String,
    pub identity: String,
    /// Mean confidence of the window that confirmed it.
    pub confidence: f32,
    pub source: MatchSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    pub marked_at: DateTime<Utc>,
}

pub trait AttendanceSink: Send + Sync {
    fn record(&self, event: &AttendanceEvent) -> Result<(), SinkError>;
}

/// Appends one JSON object per line.
pub struct JsonlSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AttendanceSink for JsonlSink {
    fn record(&self, event: &AttendanceEvent) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;

        tracing::info!(
            session = %event.session,
            identity = %event.identity,
            confidence = event.confidence,
            source = %event.source,
            "attendance marked"
        );
        Ok(())
    }
}

/// Keeps events in memory.
#[cfg(test)]
#[derive(Default)]
pub struct MemorySink {
    pub events: Mutex<Vec<AttendanceEvent>>,
}

#[cfg(test)]
impl AttendanceSink for MemorySink {
    fn record(&self, event: &AttendanceEvent) -> Result<(), SinkError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(identity: &str) -> AttendanceEvent {
        AttendanceEvent {
            session: "cs101".into(),
            identity: identity.into(),
            confidence: 0.71,
            source: MatchSource::Cache,
            metadata: None,
            marked_at: Utc::now(),
        }
    }

    #[test]
    fn test_jsonl_appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::new(dir.path().join("logs/attendance.jsonl"));
        sink.record(&event("42")).unwrap();
        sink.record(&event("7")).unwrap();

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["identity"], "42");
        assert_eq!(lines[0]["source"], "cache");
        assert_eq!(lines[1]["session"], "cs101");
        assert!(lines[1].get("metadata").is_none());
    }

    #[test]
    fn test_unwritable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blocker"), b"file").unwrap();
        let sink = JsonlSink::new(dir.path().join("blocker/attendance.jsonl"));
        assert!(sink.record(&event("42")).is_err());
    }
}
