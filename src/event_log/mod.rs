//! Event Log Store - append-only durable record log
//!
//! One JSON object per line, readable back in insertion order. The log is
//! the audit/replay record; the bus keeps the authoritative in-memory index,
//! so there is no compaction and no indexing here. Corrupt lines (partial
//! writes from a crash) are skipped on read, never fatal.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Append-only JSONL event log
#[derive(Debug)]
pub struct EventLog {
    file: File,
    path: PathBuf,
}

impl EventLog {
    /// Open (or create) the log at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed opening event log {}", path.display()))?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event as a single line. Fails loudly only on I/O error;
    /// the caller decides whether to retry or drop.
    pub fn append<T: Serialize>(&mut self, event: &T) -> Result<()> {
        let line = serde_json::to_string(event).context("Failed serializing event")?;
        self.file
            .write_all(line.as_bytes())
            .context("Failed writing event line")?;
        self.file.write_all(b"\n").context("Failed writing newline")?;
        // flush() pushes to the OS; fsync is deliberately not forced, so a
        // crash immediately after write may lose the last buffered line.
        self.file.flush().context("Failed flushing event log")?;
        Ok(())
    }

    /// Linear scan of all events in insertion order, optionally filtered by
    /// the record's `ts` field. Unparseable lines are skipped.
    pub fn read_all(&self, since_ts: Option<i64>) -> Result<Vec<Value>> {
        Self::read_path(&self.path, since_ts)
    }

    /// Read a log file without holding an open handle to it.
    pub fn read_path(path: impl AsRef<Path>, since_ts: Option<i64>) -> Result<Vec<Value>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path)
            .with_context(|| format!("Failed opening event log {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut events = Vec::new();
        let mut skipped = 0usize;
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&line) {
                Ok(value) => {
                    if let Some(since) = since_ts {
                        let ts = value.get("ts").and_then(|v| v.as_i64()).unwrap_or(0);
                        if ts < since {
                            continue;
                        }
                    }
                    events.push(value);
                }
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(
                path = %path.display(),
                skipped,
                "Skipped corrupt lines while reading event log"
            );
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_and_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        let mut log = EventLog::open(&path).unwrap();
        log.append(&json!({"ts": 100, "event_type": "a"})).unwrap();
        log.append(&json!({"ts": 200, "event_type": "b"})).unwrap();
        log.append(&json!({"ts": 300, "event_type": "c"})).unwrap();

        let events = log.read_all(None).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["event_type"], "a");
        assert_eq!(events[2]["event_type"], "c");
    }

    #[test]
    fn test_since_ts_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        let mut log = EventLog::open(&path).unwrap();
        log.append(&json!({"ts": 100})).unwrap();
        log.append(&json!({"ts": 200})).unwrap();

        let events = log.read_all(Some(150)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["ts"], 200);
    }

    #[test]
    fn test_corrupt_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        let mut log = EventLog::open(&path).unwrap();
        log.append(&json!({"ts": 100, "ok": true})).unwrap();
        // Simulate a partial write from a crash
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{\"ts\": 200, \"trunc")
            .unwrap();

        let events = log.read_all(None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["ok"], true);
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventLog::read_path(dir.path().join("nope.jsonl"), None).unwrap();
        assert!(events.is_empty());
    }
}
