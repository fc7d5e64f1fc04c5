// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use waitd_display::DisplayManager;
use waitd_frame::{Frame, FrameSource, TargetKind};
use waitd_journal::{EventLog, Journal};
use waitd_vision::{EvaluateOptions, Health, VisionBackend, VisionError};
use waitd_wake::RecordingWakeSink;

use super::*;

fn test_config() -> SchedulerConfig {
  SchedulerConfig {
    diff_max_width: 320,
    pixel_diff_threshold: 0.01,
    max_static_secs: 30.0,
    frame_max_dim: 640,
    frame_jpeg_quality: 70,
    thumbnail_max_dim: 160,
    thumbnail_jpeg_quality: 50,
    max_context_frames: 4,
    max_context_verdicts: 3,
    resolve_confidence_threshold: 0.75,
    partial_streak_resolve: 2,
    default_poll_interval_secs: 0.01,
    min_poll_interval_secs: 0.005,
    max_poll_interval_secs: 0.05,
    default_timeout_secs: 2.0,
    poll_profile: waitd_poller::PollProfile::Adaptive,
  }
}

fn solid_frame(value: u8) -> Frame {
  Frame { width: 4, height: 4, rgb: std::sync::Arc::from(vec![value; 4 * 4 * 3]) }
}

/// Captures an incrementing solid-color frame every call, so the diff gate
/// always sees a change.
struct ChangingFrameSource {
  counter: AtomicUsize,
}

#[async_trait]
impl FrameSource for ChangingFrameSource {
  async fn capture(&self, _display: &str, _target: &TargetKind) -> waitd_frame::Result<Option<Frame>> {
    let n = self.counter.fetch_add(1, Ordering::SeqCst);
    Ok(Some(solid_frame((n % 256) as u8)))
  }
}

struct ScriptedVisionBackend {
  replies: std::sync::Mutex<std::collections::VecDeque<String>>,
}

impl ScriptedVisionBackend {
  fn new(replies: Vec<&str>) -> Self {
    ScriptedVisionBackend { replies: std::sync::Mutex::new(replies.into_iter().map(str::to_owned).collect()) }
  }
}

#[async_trait]
impl VisionBackend for ScriptedVisionBackend {
  async fn evaluate_condition(&self, _prompt: &str, _images: &[Vec<u8>], _opts: &EvaluateOptions) -> waitd_vision::Result<String> {
    let mut replies = self.replies.lock().unwrap();
    Ok(replies.pop_front().unwrap_or_else(|| "FINAL_JSON: {\"decision\":\"watching\",\"confidence\":0.0,\"evidence\":[],\"summary\":\"still nothing\"}".to_owned()))
  }

  async fn check_health(&self) -> Health {
    Health { ok: true, backend: "scripted", detail: String::new() }
  }
}

struct FailingVisionBackend;

#[async_trait]
impl VisionBackend for FailingVisionBackend {
  async fn evaluate_condition(&self, _prompt: &str, _images: &[Vec<u8>], _opts: &EvaluateOptions) -> waitd_vision::Result<String> {
    Err(VisionError::UnexpectedResponse("boom".to_owned()))
  }

  async fn check_health(&self) -> Health {
    Health { ok: false, backend: "failing", detail: "always fails".to_owned() }
  }
}

fn harness(
  vision: Arc<dyn VisionBackend>,
) -> (Scheduler, WakeReceiver, Arc<RecordingWakeSink>, tempfile::TempDir) {
  let dir = tempfile::tempdir().unwrap();
  let display = Arc::new(DisplayManager::new(":99"));
  let frame_source: Arc<dyn FrameSource> = Arc::new(ChangingFrameSource { counter: AtomicUsize::new(0) });
  let journal = Journal::open_in_memory().unwrap();
  let wake = Arc::new(RecordingWakeSink::new());
  let event_log = Arc::new(EventLog::new(dir.path().join("events.log")));
  let (scheduler, receiver) =
    Scheduler::new(display, frame_source, vision, journal, wake.clone(), test_config(), dir.path().join("screenshots"), event_log);
  (scheduler, receiver, wake, dir)
}

#[tokio::test]
async fn add_job_then_single_tick_resolves_on_final_json() {
  let vision = Arc::new(ScriptedVisionBackend::new(vec![
    "FINAL_JSON: {\"decision\":\"resolved\",\"confidence\":0.95,\"evidence\":[\"done\"],\"summary\":\"dialog closed\"}",
  ]));
  let (scheduler, _receiver, wake, _dir) = harness(vision);

  let id = scheduler
    .add_job(AddJobRequest { target: "screen".to_owned(), criteria: "dialog closed".to_owned(), timeout_secs: None, poll_interval_secs: None, task_id: None })
    .await
    .unwrap();
  assert_eq!(scheduler.active_count().await, 1);

  scheduler.evaluate_and_finalize(id.clone(), scheduler.jobs.lock().await.get(&id).unwrap().clone()).await;

  assert_eq!(scheduler.active_count().await, 0);
  let messages = wake.messages();
  assert_eq!(messages.len(), 1);
  assert!(messages[0].contains("smart_wait resolved"));
}

#[tokio::test]
async fn partial_streak_promotes_to_resolved() {
  let vision = Arc::new(ScriptedVisionBackend::new(vec![
    "PARTIAL: halfway",
    "PARTIAL: almost there",
  ]));
  let (scheduler, _receiver, wake, _dir) = harness(vision);

  let id = scheduler
    .add_job(AddJobRequest { target: "screen".to_owned(), criteria: "progress bar full".to_owned(), timeout_secs: None, poll_interval_secs: None, task_id: None })
    .await
    .unwrap();

  for _ in 0..2 {
    let slot = scheduler.jobs.lock().await.get(&id).cloned();
    let Some(slot) = slot else { break };
    scheduler.evaluate_and_finalize(id.clone(), slot).await;
  }

  assert_eq!(scheduler.active_count().await, 0);
  let messages = wake.messages();
  assert_eq!(messages.len(), 1);
  assert!(messages[0].contains("promoted from 2x PARTIAL"));
}

#[tokio::test]
async fn job_times_out_when_timeout_already_elapsed() {
  let vision = Arc::new(ScriptedVisionBackend::new(vec![]));
  let (scheduler, _receiver, wake, _dir) = harness(vision);

  let id = scheduler
    .add_job(AddJobRequest { target: "screen".to_owned(), criteria: "never happens".to_owned(), timeout_secs: Some(0.0), poll_interval_secs: None, task_id: None })
    .await
    .unwrap();

  let slot = scheduler.jobs.lock().await.get(&id).cloned().unwrap();
  tokio::time::sleep(std::time::Duration::from_millis(5)).await;
  scheduler.evaluate_and_finalize(id.clone(), slot).await;

  assert_eq!(scheduler.active_count().await, 0);
  assert!(wake.messages()[0].contains("smart_wait timeout"));
}

#[tokio::test]
async fn cancel_job_is_idempotent_and_emits_no_wake_event() {
  let vision = Arc::new(ScriptedVisionBackend::new(vec![]));
  let (scheduler, _receiver, wake, _dir) = harness(vision);

  let id = scheduler
    .add_job(AddJobRequest { target: "screen".to_owned(), criteria: "anything".to_owned(), timeout_secs: None, poll_interval_secs: None, task_id: None })
    .await
    .unwrap();

  scheduler.cancel_job(&id, Some("operator cancelled".to_owned())).await.unwrap();
  assert_eq!(scheduler.active_count().await, 0);
  scheduler.cancel_job(&id, None).await.unwrap();
  scheduler.cancel_job("never-existed", None).await.unwrap();

  assert!(wake.messages().is_empty());
}

#[tokio::test]
async fn vision_backend_failure_reschedules_instead_of_resolving() {
  let vision: Arc<dyn VisionBackend> = Arc::new(FailingVisionBackend);
  let (scheduler, _receiver, wake, _dir) = harness(vision);

  let id = scheduler
    .add_job(AddJobRequest { target: "screen".to_owned(), criteria: "whatever".to_owned(), timeout_secs: None, poll_interval_secs: None, task_id: None })
    .await
    .unwrap();

  let slot = scheduler.jobs.lock().await.get(&id).cloned().unwrap();
  scheduler.evaluate_and_finalize(id.clone(), slot).await;

  assert_eq!(scheduler.active_count().await, 1);
  assert!(wake.messages().is_empty());
}

#[tokio::test]
async fn update_job_resets_gate_and_makes_it_due_immediately() {
  let vision = Arc::new(ScriptedVisionBackend::new(vec![
    "FINAL_JSON: {\"decision\":\"watching\",\"confidence\":0.1,\"evidence\":[],\"summary\":\"no change\"}",
  ]));
  let (scheduler, _receiver, _wake, _dir) = harness(vision);

  let id = scheduler
    .add_job(AddJobRequest { target: "screen".to_owned(), criteria: "old criteria".to_owned(), timeout_secs: None, poll_interval_secs: None, task_id: None })
    .await
    .unwrap();

  scheduler
    .update_job(&id, UpdateJobRequest { criteria: Some("new criteria".to_owned()), timeout_secs: None, message: None })
    .await
    .unwrap();

  let snapshot = scheduler.snapshot(&id).await.unwrap();
  assert_eq!(snapshot.criteria, "new criteria");
}
