// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! The stuck-task detector (spec.md §4.9, C10): a background loop that
//! periodically inspects the task journal for `active` tasks that have
//! fallen silent with no wait job watching them, and emits a
//! `[task_stuck_resume]` wake event carrying a resume packet so the outer
//! agent can pick the task back up without rehydrating state itself.
//!
//! Reads only the journal (spec.md §2's dataflow note); it has no view
//! into the scheduler's in-memory job map, which is why it reconciles
//! `metadata.active_wait_ids` against the journal's own `wait_jobs` rows
//! rather than asking the scheduler directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use waitd_journal::{EventLog, Journal, TaskStatus};
use waitd_wake::{message, WakeSink};

#[derive(Debug, thiserror::Error)]
pub enum StuckDetectorError {
  #[error("journal error: {0}")]
  Journal(#[from] waitd_journal::JournalError),
}

pub type Result<T> = std::result::Result<T, StuckDetectorError>;

#[derive(Debug, Clone, Copy)]
pub struct StuckDetectorConfig {
  /// How often the loop wakes up to inspect tasks. Default 60s.
  pub check_interval_secs: f64,
  /// A task is only a stuck-detection candidate once this long has passed
  /// since its last update. Default 300s.
  pub silence_threshold_secs: f64,
  /// Minimum gap between two stuck alerts for the same task. Default 300s.
  pub alert_cooldown_secs: f64,
}

impl Default for StuckDetectorConfig {
  fn default() -> Self {
    StuckDetectorConfig { check_interval_secs: 60.0, silence_threshold_secs: 300.0, alert_cooldown_secs: 300.0 }
  }
}

/// Periodic loop over `journal`'s `active` tasks; grounded on
/// `examples/original_source/src/agentic_computer_use/daemon.py`'s
/// `stuck_detection_loop`.
pub struct StuckDetector {
  journal: Journal,
  wake: Arc<dyn WakeSink>,
  config: StuckDetectorConfig,
  event_log: Arc<EventLog>,
}

impl StuckDetector {
  pub fn new(journal: Journal, wake: Arc<dyn WakeSink>, config: StuckDetectorConfig, event_log: Arc<EventLog>) -> Self {
    StuckDetector { journal, wake, config, event_log }
  }

  /// Runs forever (intended to be spawned as its own task), ticking every
  /// `check_interval_secs` until `shutdown` triggers.
  pub async fn run(&self, shutdown: async_latch::AsyncLatch) {
    let interval = Duration::from_secs_f64(self.config.check_interval_secs.max(0.1));
    loop {
      tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        _ = shutdown.triggered() => return,
      }
      if let Err(e) = self.tick().await {
        log::warn!("stuck-detector tick failed: {e}");
      }
    }
  }

  /// Inspects every `active` task once and emits a wake event for each one
  /// found stuck. Exposed directly (not just via `run`) so callers and
  /// tests can drive one pass deterministically.
  pub async fn tick(&self) -> Result<()> {
    let tasks = self.journal.list_tasks(Some(TaskStatus::Active), None).await?;
    for task in tasks {
      if let Some(packet_json) = self.inspect_task(&task.id).await? {
        self.wake.emit(&message::stuck_resume(&packet_json)).await;
      }
    }
    Ok(())
  }

  /// Returns `Some(resume-packet-json)` if `task_id` is judged stuck, after
  /// recording the alert in the journal; `None` otherwise (including when
  /// the task isn't found, e.g. a race with deletion).
  async fn inspect_task(&self, task_id: &str) -> Result<Option<String>> {
    let still_watching = self.journal.reconcile_active_wait_ids(task_id).await?;
    if !still_watching.is_empty() {
      return Ok(None);
    }

    let task = self.journal.get_task(task_id).await?;
    let now = Utc::now();
    let silence = (now - task.updated_at).num_milliseconds() as f64 / 1000.0;
    if silence < self.config.silence_threshold_secs {
      return Ok(None);
    }

    if let Some(last_alert) = last_stuck_alert_at(&task.metadata) {
      let since_alert = (now - last_alert).num_milliseconds() as f64 / 1000.0;
      if since_alert < self.config.alert_cooldown_secs {
        return Ok(None);
      }
    }

    let minutes = (silence / 60.0).round() as i64;
    let reason = format!("no updates for {minutes} minutes and no active smart wait");
    let packet = self.journal.build_resume_packet(task_id, reason.clone()).await?;
    self.journal.mark_stuck_alert(task_id, &reason).await?;
    self.event_log.record("task", "stuck", &format!("task {task_id}: {reason}"));

    Ok(Some(serde_json::to_string(&packet).unwrap_or_else(|_| "{}".to_owned())))
  }
}

fn last_stuck_alert_at(metadata: &serde_json::Value) -> Option<chrono::DateTime<Utc>> {
  metadata
    .get(waitd_journal::metadata_keys::LAST_STUCK_ALERT_AT)
    .and_then(|v| v.as_str())
    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
    .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
  use super::*;
  use waitd_wake::RecordingWakeSink;

  fn fast_config() -> StuckDetectorConfig {
    StuckDetectorConfig { check_interval_secs: 60.0, silence_threshold_secs: 0.0, alert_cooldown_secs: 300.0 }
  }

  fn test_event_log() -> Arc<EventLog> {
    let dir = tempfile::tempdir().unwrap();
    Arc::new(EventLog::new(dir.path().join("events.log")))
  }

  #[tokio::test]
  async fn stuck_task_with_no_active_wait_emits_a_resume_packet() {
    let journal = Journal::open_in_memory().unwrap();
    let task = journal.register_task("demo".to_owned(), vec!["a".to_owned(), "b".to_owned()], None).await.unwrap();
    let wake = Arc::new(RecordingWakeSink::new());
    let detector = StuckDetector::new(journal, wake.clone(), fast_config(), test_event_log());

    detector.tick().await.unwrap();

    let messages = wake.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("[task_stuck_resume] "));
    let body = messages[0].strip_prefix("[task_stuck_resume] ").unwrap();
    let packet: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(packet["task_id"], serde_json::json!(task.id));
    assert_eq!(packet["progress"]["current"], serde_json::json!(0));
    assert_eq!(packet["progress"]["remaining"], serde_json::json!([1]));
    assert!(packet["reason"].as_str().unwrap().contains("no updates"));
  }

  #[tokio::test]
  async fn a_task_with_an_active_wait_is_skipped() {
    let journal = Journal::open_in_memory().unwrap();
    let task = journal.register_task("demo".to_owned(), vec!["a".to_owned()], None).await.unwrap();
    journal
      .insert_wait_job(waitd_journal::NewWaitJob {
        id: "w1".to_owned(),
        task_id: Some(task.id.clone()),
        target_kind: "screen".to_owned(),
        target_id: "full".to_owned(),
        criteria: "dialog closed".to_owned(),
        display: None,
      })
      .await
      .unwrap();
    journal.on_wait_created(&task.id, "w1".to_owned(), "screen:full".to_owned(), "dialog closed".to_owned(), Some(60.0)).await.unwrap();

    let wake = Arc::new(RecordingWakeSink::new());
    let detector = StuckDetector::new(journal, wake.clone(), fast_config(), test_event_log());
    detector.tick().await.unwrap();

    assert!(wake.messages().is_empty());
  }

  #[tokio::test]
  async fn second_tick_within_cooldown_emits_nothing() {
    let journal = Journal::open_in_memory().unwrap();
    journal.register_task("demo".to_owned(), vec!["a".to_owned()], None).await.unwrap();
    let wake = Arc::new(RecordingWakeSink::new());
    let detector = StuckDetector::new(journal, wake.clone(), fast_config(), test_event_log());

    detector.tick().await.unwrap();
    assert_eq!(wake.messages().len(), 1);

    detector.tick().await.unwrap();
    assert_eq!(wake.messages().len(), 1, "cooldown should suppress the second alert");
  }

  #[tokio::test]
  async fn a_fresh_task_below_the_silence_threshold_is_skipped() {
    let journal = Journal::open_in_memory().unwrap();
    journal.register_task("demo".to_owned(), vec!["a".to_owned()], None).await.unwrap();
    let wake = Arc::new(RecordingWakeSink::new());
    let config = StuckDetectorConfig { silence_threshold_secs: 300.0, ..fast_config() };
    let detector = StuckDetector::new(journal, wake.clone(), config, test_event_log());

    detector.tick().await.unwrap();
    assert!(wake.messages().is_empty());
  }
}
