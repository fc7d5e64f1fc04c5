// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! An append-only diagnostic sink, independent of the SQL journal and never
//! authoritative — grounded on `debug.py`'s `log_wait_event` / `log_task` /
//! `log_openclaw_event` free functions in the original source, generalized
//! into one method since all three write the same shape of line.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

pub struct EventLog {
  path: PathBuf,
  lock: Mutex<()>,
}

impl EventLog {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    EventLog { path: path.into(), lock: Mutex::new(()) }
  }

  /// Appends `[{rfc3339}] {scope} {tag}: {detail}` to the log file. Failures
  /// are logged and dropped — this is diagnostic tooling, never the
  /// authoritative record of what happened.
  pub fn record(&self, scope: &str, tag: &str, detail: &str) {
    let line = format!("[{}] {scope} {tag}: {detail}\n", Utc::now().to_rfc3339());
    let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
    if let Err(e) = self.append(&line) {
      log::warn!("failed to write event log entry to {}: {e}", self.path.display());
    }
  }

  fn append(&self, line: &str) -> std::io::Result<()> {
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
    file.write_all(line.as_bytes())
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn record_appends_a_single_line() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::new(dir.path().join("events.log"));
    log.record("wait", "created", "job abc123");
    log.record("task", "stuck", "task def456");
    let contents = std::fs::read_to_string(log.path()).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("wait created: job abc123"));
    assert!(lines[1].contains("task stuck: task def456"));
  }
}
