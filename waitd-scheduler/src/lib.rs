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

//! The single cooperative scheduler that owns every active wait job
//! (spec.md §4.6, C8): decides which jobs are due, runs their
//! capture→gate→vision→parse→act cycle concurrently, and finalizes them
//! into the task journal and the wake sink.

mod job;
mod wake_signal;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use waitd_diffgate::PixelDiffGate;
use waitd_display::DisplayManager;
use waitd_frame::{Frame, FrameSource, TargetKind};
use waitd_jobcontext::{parse_verdict, Decision, JobContext};
use waitd_journal::{EventLog, Journal, NewWaitJob, WaitJobStatus};
use waitd_poller::{AdaptivePoller, PollProfile};
use waitd_vision::{EvaluateOptions, VisionBackend};
use waitd_wake::{message, WakeSink};

pub use job::{parse_target, target_kind_label, RunningJob, TargetParseError};
pub use wake_signal::{WakeReceiver, WakeSignal};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
  #[error("invalid target: {0}")]
  InvalidTarget(#[from] TargetParseError),
  #[error("journal error: {0}")]
  Journal(#[from] waitd_journal::JournalError),
  #[error("wait job {0} not found")]
  NotFound(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  pub diff_max_width: u32,
  pub pixel_diff_threshold: f64,
  pub max_static_secs: f64,
  pub frame_max_dim: u32,
  pub frame_jpeg_quality: u8,
  pub thumbnail_max_dim: u32,
  pub thumbnail_jpeg_quality: u8,
  pub max_context_frames: usize,
  pub max_context_verdicts: usize,
  pub resolve_confidence_threshold: f64,
  pub partial_streak_resolve: u32,
  pub default_poll_interval_secs: f64,
  pub min_poll_interval_secs: f64,
  pub max_poll_interval_secs: f64,
  pub default_timeout_secs: f64,
  pub poll_profile: PollProfile,
}

pub struct AddJobRequest {
  pub target: String,
  pub criteria: String,
  pub timeout_secs: Option<f64>,
  pub poll_interval_secs: Option<f64>,
  pub task_id: Option<String>,
}

pub struct UpdateJobRequest {
  pub criteria: Option<String>,
  pub timeout_secs: Option<f64>,
  pub message: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JobSnapshot {
  pub wait_id: String,
  pub status: &'static str,
  pub target: String,
  pub criteria: String,
  pub elapsed_seconds: f64,
  pub poll_interval: f64,
  pub frames_captured: u64,
  pub verdicts: u64,
}

struct JobSlot {
  state: Mutex<RunningJob>,
  cancelled: AtomicBool,
}

/// Owns the in-memory job map and every collaborator the evaluation loop
/// needs. Cheap to clone — everything inside is already an `Arc` or a
/// handle type that is itself cheaply cloneable (`Journal`, `DisplayManager`
/// reference, trait objects).
#[derive(Clone)]
pub struct Scheduler {
  jobs: Arc<Mutex<HashMap<String, Arc<JobSlot>>>>,
  display: Arc<DisplayManager>,
  frame_source: Arc<dyn FrameSource>,
  vision: Arc<dyn VisionBackend>,
  journal: Journal,
  wake: Arc<dyn WakeSink>,
  wake_signal: WakeSignal,
  config: SchedulerConfig,
  screenshots_dir: PathBuf,
  event_log: Arc<EventLog>,
}

impl Scheduler {
  pub fn new(
    display: Arc<DisplayManager>,
    frame_source: Arc<dyn FrameSource>,
    vision: Arc<dyn VisionBackend>,
    journal: Journal,
    wake: Arc<dyn WakeSink>,
    config: SchedulerConfig,
    screenshots_dir: PathBuf,
    event_log: Arc<EventLog>,
  ) -> (Scheduler, WakeReceiver) {
    let (wake_signal, wake_receiver) = WakeSignal::channel();
    let scheduler = Scheduler {
      jobs: Arc::new(Mutex::new(HashMap::new())),
      display,
      frame_source,
      vision,
      journal,
      wake,
      wake_signal,
      config,
      screenshots_dir,
      event_log,
    };
    (scheduler, wake_receiver)
  }

  // ---- public API -----------------------------------------------------

  pub async fn add_job(&self, req: AddJobRequest) -> Result<String> {
    let target_kind = parse_target(&req.target)?;
    let id = waitd_journal::new_id();
    let now = Utc::now();
    let timeout_secs = req.timeout_secs.unwrap_or(self.config.default_timeout_secs);
    let display = self.display.display_string(req.task_id.as_deref().unwrap_or("")).await;

    self
      .journal
      .insert_wait_job(NewWaitJob {
        id: id.clone(),
        task_id: req.task_id.clone(),
        target_kind: target_kind_label(&target_kind).to_owned(),
        target_id: req.target.clone(),
        criteria: req.criteria.clone(),
        display: Some(display.clone()),
      })
      .await?;
    if let Some(task_id) = &req.task_id {
      self
        .journal
        .on_wait_created(task_id, id.clone(), req.target.clone(), req.criteria.clone(), Some(timeout_secs))
        .await?;
    }

    let job = RunningJob {
      id: id.clone(),
      task_id: req.task_id,
      target_kind,
      target_raw: req.target,
      display,
      criteria: req.criteria,
      timeout: chrono::Duration::milliseconds((timeout_secs * 1000.0) as i64),
      started_at: now,
      next_check_at: now,
      last_vision_at: None,
      context: JobContext::new(self.config.max_context_frames, self.config.max_context_verdicts, now),
      gate: PixelDiffGate::new(self.config.diff_max_width, self.config.pixel_diff_threshold),
      poller: AdaptivePoller::new(
        req.poll_interval_secs,
        self.config.default_poll_interval_secs,
        self.config.min_poll_interval_secs,
        self.config.max_poll_interval_secs,
        self.config.poll_profile,
      ),
      resolved_window_id: None,
      partial_streak: 0,
      last_frame: None,
      frames_captured: 0,
      verdicts_recorded: 0,
    };

    self.jobs.lock().await.insert(id.clone(), Arc::new(JobSlot { state: Mutex::new(job), cancelled: AtomicBool::new(false) }));
    self.wake_signal.notify();
    self.event_log.record("wait", "created", &format!("job {id}"));
    Ok(id)
  }

  /// Idempotent on unknown ids: returns `Ok(())` either way, matching
  /// spec.md §4.6's "idempotent on unknown ids".
  pub async fn cancel_job(&self, wait_id: &str, reason: Option<String>) -> Result<()> {
    let slot = self.jobs.lock().await.remove(wait_id);
    let Some(slot) = slot else { return Ok(()) };
    slot.cancelled.store(true, Ordering::SeqCst);

    let reason = reason.unwrap_or_else(|| "cancelled".to_owned());
    self.event_log.record("wait", "cancelled", &format!("job {wait_id}: {reason}"));
    let job = slot.state.lock().await;
    self.journal.finalize_wait_job(wait_id, WaitJobStatus::Cancelled, Some(reason.clone())).await?;
    if let Some(task_id) = &job.task_id {
      let elapsed = job.elapsed(Utc::now()).num_milliseconds() as f64 / 1000.0;
      self
        .journal
        .on_wait_finished(task_id, wait_id.to_owned(), "cancelled".to_owned(), reason, Some(elapsed))
        .await?;
    }
    Ok(())
  }

  pub async fn update_job(&self, wait_id: &str, req: UpdateJobRequest) -> Result<()> {
    let slot = self.jobs.lock().await.get(wait_id).cloned().ok_or_else(|| SchedulerError::NotFound(wait_id.to_owned()))?;
    let mut job = slot.state.lock().await;
    if let Some(criteria) = req.criteria {
      job.criteria = criteria;
    }
    if let Some(timeout_secs) = req.timeout_secs {
      job.timeout = chrono::Duration::milliseconds((timeout_secs * 1000.0) as i64);
    }
    job.gate.reset();
    job.poller = AdaptivePoller::new(
      None,
      self.config.default_poll_interval_secs,
      self.config.min_poll_interval_secs,
      self.config.max_poll_interval_secs,
      self.config.poll_profile,
    );
    job.next_check_at = Utc::now();
    if let (Some(task_id), Some(message)) = (&job.task_id, &req.message) {
      self.journal.append_message(task_id, "wait".to_owned(), message.clone()).await?;
    }
    drop(job);
    self.wake_signal.notify();
    Ok(())
  }

  pub async fn snapshot(&self, wait_id: &str) -> Option<JobSnapshot> {
    let slot = self.jobs.lock().await.get(wait_id).cloned()?;
    let job = slot.state.lock().await;
    Some(self.snapshot_of(&job))
  }

  pub async fn list_snapshots(&self) -> Vec<JobSnapshot> {
    let slots: Vec<Arc<JobSlot>> = self.jobs.lock().await.values().cloned().collect();
    let mut out = Vec::with_capacity(slots.len());
    for slot in slots {
      let job = slot.state.lock().await;
      out.push(self.snapshot_of(&job));
    }
    out
  }

  fn snapshot_of(&self, job: &RunningJob) -> JobSnapshot {
    JobSnapshot {
      wait_id: job.id.clone(),
      status: "watching",
      target: job.target_raw.clone(),
      criteria: job.criteria.clone(),
      elapsed_seconds: job.elapsed(Utc::now()).num_milliseconds() as f64 / 1000.0,
      poll_interval: job.poller.interval(),
      frames_captured: job.frames_captured,
      verdicts: job.verdicts_recorded,
    }
  }

  pub async fn active_count(&self) -> usize {
    self.jobs.lock().await.len()
  }

  // ---- main loop --------------------------------------------------------

  /// Runs until `shutdown` triggers (intended to be spawned as its own
  /// task). Sleeps until the earliest job's `next_check_at`, or until woken
  /// by `AddJob` / `UpdateJob` / `CancelJob`, whichever comes first.
  pub async fn run(&self, mut wake_receiver: WakeReceiver, shutdown: async_latch::AsyncLatch) {
    loop {
      let now = Utc::now();
      let (overdue, earliest) = self.due_jobs(now).await;

      if overdue.is_empty() {
        match earliest {
          None => {
            tokio::select! {
              _ = wake_receiver.woken() => {}
              _ = shutdown.triggered() => return,
            }
          }
          Some(at) => {
            let remaining = (at - now).to_std().unwrap_or_default();
            tokio::select! {
              _ = tokio::time::sleep(remaining) => {}
              _ = wake_receiver.woken() => {}
              _ = shutdown.triggered() => return,
            }
          }
        }
        continue;
      }

      let evaluations = overdue.into_iter().map(|(id, slot)| self.evaluate_and_finalize(id, slot));
      tokio::select! {
        _ = futures::future::join_all(evaluations) => {}
        _ = shutdown.triggered() => return,
      }
    }
  }

  async fn due_jobs(&self, now: DateTime<Utc>) -> (Vec<(String, Arc<JobSlot>)>, Option<DateTime<Utc>>) {
    let jobs = self.jobs.lock().await;
    let mut overdue = Vec::new();
    let mut earliest = None;
    for (id, slot) in jobs.iter() {
      let due_at = slot.state.lock().await.next_check_at;
      if due_at <= now {
        overdue.push((id.clone(), slot.clone()));
      } else {
        earliest = Some(earliest.map_or(due_at, |e: DateTime<Utc>| e.min(due_at)));
      }
    }
    (overdue, earliest)
  }

  async fn evaluate_and_finalize(&self, id: String, slot: Arc<JobSlot>) {
    if slot.cancelled.load(Ordering::SeqCst) {
      return;
    }

    let outcome = {
      let mut job = slot.state.lock().await;
      self.evaluate_one(&mut job).await
    };

    match outcome {
      EvalOutcome::Rescheduled => {}
      EvalOutcome::Timeout => self.finalize(&id, &slot, WaitJobStatus::Timeout, "no visible change met the condition before timeout".to_owned()).await,
      EvalOutcome::Resolved { summary } => self.finalize(&id, &slot, WaitJobStatus::Resolved, summary).await,
    }
  }

  async fn finalize(&self, id: &str, slot: &Arc<JobSlot>, status: WaitJobStatus, summary: String) {
    if slot.cancelled.load(Ordering::SeqCst) {
      return;
    }
    self.jobs.lock().await.remove(id);

    let job = slot.state.lock().await;
    let elapsed = job.elapsed(Utc::now()).num_milliseconds() as f64 / 1000.0;

    if let Err(e) = self.journal.finalize_wait_job(id, status, Some(summary.clone())).await {
      log::error!("failed to persist terminal wait job {id}: {e}");
    }
    if let Some(frame) = &job.last_frame {
      self.save_terminal_frame(id, frame);
    }
    if let Some(task_id) = &job.task_id {
      let state = if status == WaitJobStatus::Resolved { "resolved" } else { "timeout" };
      if let Err(e) = self.journal.on_wait_finished(task_id, id.to_owned(), state.to_owned(), summary.clone(), Some(elapsed)).await {
        log::error!("failed to record wait-finished for task {task_id}: {e}");
      }
    }

    let text = if status == WaitJobStatus::Resolved {
      message::resolved(id, &job.criteria, &summary)
    } else {
      message::timeout(id, &job.criteria, &summary)
    };
    self.event_log.record("wait", status.as_str(), &format!("job {id}: {summary}"));
    self.wake.emit(&text).await;
  }

  fn save_terminal_frame(&self, id: &str, frame: &Frame) {
    let full = match frame.encode_jpeg(self.config.frame_max_dim, self.config.frame_jpeg_quality) {
      Ok(bytes) => bytes,
      Err(e) => {
        log::warn!("failed to encode terminal frame for wait job {id}: {e}");
        return;
      }
    };
    if let Err(e) = std::fs::create_dir_all(&self.screenshots_dir) {
      log::warn!("failed to create screenshots dir {}: {e}", self.screenshots_dir.display());
      return;
    }
    let path = self.screenshots_dir.join(format!("{id}_after.jpg"));
    if let Err(e) = std::fs::write(&path, &full) {
      log::warn!("failed to write {}: {e}", path.display());
    }
    if let Ok(thumb) = frame.encode_jpeg(self.config.thumbnail_max_dim, self.config.thumbnail_jpeg_quality) {
      let thumb_path = self.screenshots_dir.join(format!("{id}_after_thumb.jpg"));
      let _ = std::fs::write(&thumb_path, &thumb);
    }
  }

  /// The capture→gate→vision→parse→act sequence for one job (spec.md
  /// §4.6's "Single-job evaluation").
  async fn evaluate_one(&self, job: &mut RunningJob) -> EvalOutcome {
    let now = Utc::now();
    if job.is_timed_out(now) {
      return EvalOutcome::Timeout;
    }

    if let TargetKind::Window(waitd_frame::WindowRef::Name(name)) = &job.target_kind {
      if job.resolved_window_id.is_none() {
        if let Ok(Some(id)) = self.frame_source.resolve_window(&job.display, name).await {
          job.resolved_window_id = Some(id);
        }
      }
    }

    let frame = {
      let lock = self.display.capture_lock(&job.display).await;
      let _guard = lock.lock().await;
      self.frame_source.capture(&job.display, &job.effective_target()).await
    };
    let frame = match frame {
      Ok(Some(frame)) => frame,
      Ok(None) => {
        job.reschedule(now);
        return EvalOutcome::Rescheduled;
      }
      Err(e) => {
        log::warn!("capture failed for wait job {}: {e}", job.id);
        job.reschedule(now);
        return EvalOutcome::Rescheduled;
      }
    };

    let changed = job.gate.should_evaluate(&frame);
    let since_last_vision = job.last_vision_at.map(|t| (now - t).num_milliseconds() as f64 / 1000.0);
    if !changed && since_last_vision.map_or(true, |s| s < self.config.max_static_secs) {
      job.poller.on_no_change();
      job.reschedule(now);
      return EvalOutcome::Rescheduled;
    }

    let full = match frame.encode_jpeg(self.config.frame_max_dim, self.config.frame_jpeg_quality) {
      Ok(bytes) => bytes,
      Err(e) => {
        log::warn!("failed to encode frame for wait job {}: {e}", job.id);
        job.reschedule(now);
        return EvalOutcome::Rescheduled;
      }
    };
    let thumb = frame.encode_jpeg(self.config.thumbnail_max_dim, self.config.thumbnail_jpeg_quality).unwrap_or_else(|_| full.clone());
    job.context.add_frame(full, thumb, now);
    job.last_frame = Some(frame);
    job.frames_captured += 1;
    job.last_vision_at = Some(now);

    let (prompt, images) = job.context.build_prompt(&job.criteria, now);
    let opts = EvaluateOptions { model: None, job_id: Some(job.id.clone()) };
    let raw = match self.vision.evaluate_condition(&prompt, &images, &opts).await {
      Ok(raw) => raw,
      Err(e) => {
        log::warn!("vision backend call failed for wait job {}: {e}", job.id);
        job.reschedule(now);
        return EvalOutcome::Rescheduled;
      }
    };

    let verdict = parse_verdict(&raw, self.config.resolve_confidence_threshold, now);
    job.verdicts_recorded += 1;
    let decision = verdict.decision;
    let summary = verdict.description();
    job.context.add_verdict(verdict);

    if let Some(task_id) = job.task_id.clone() {
      let journal = self.journal.clone();
      let line = format!("verdict {decision} for wait {wait_id}: {summary}", decision = decision.as_str(), wait_id = job.id);
      tokio::spawn(async move {
        if let Err(e) = journal.append_message(&task_id, "wait".to_owned(), line).await {
          log::warn!("failed to append async verdict log line: {e}");
        }
      });
    }

    match decision {
      Decision::Resolved => EvalOutcome::Resolved { summary },
      Decision::Partial => {
        job.partial_streak += 1;
        if job.partial_streak >= self.config.partial_streak_resolve {
          EvalOutcome::Resolved { summary: format!("[promoted from {}x PARTIAL] {summary}", job.partial_streak) }
        } else {
          job.poller.on_partial();
          job.reschedule(now);
          EvalOutcome::Rescheduled
        }
      }
      Decision::Watching => {
        job.partial_streak = 0;
        job.poller.on_change_no_match();
        job.reschedule(now);
        EvalOutcome::Rescheduled
      }
    }
  }
}

enum EvalOutcome {
  Rescheduled,
  Timeout,
  Resolved { summary: String },
}

#[cfg(test)]
mod tests;
