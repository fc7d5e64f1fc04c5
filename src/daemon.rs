// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Wires together every collaborator spec.md §2 names into one
//! process-lifetime registry (SPEC_FULL.md §9's "process-wide mutable
//! caches" redesign note): a single `Daemon` value, constructed once at
//! startup and torn down once at shutdown, threaded through every HTTP
//! handler instead of any lazily-initialized global.

use std::path::PathBuf;
use std::sync::Arc;

use waitd_config::{Config, VisionBackendKind};
use waitd_display::DisplayManager;
use waitd_frame::{pty::PtyRegistry, CompositeFrameSource, FrameSource};
use waitd_journal::{EventLog, Journal};
use waitd_scheduler::{Scheduler, SchedulerConfig, WakeReceiver};
use waitd_stuck::{StuckDetector, StuckDetectorConfig};
use waitd_vision::{ClaudeBackend, OllamaBackend, PassthroughBackend, VisionBackend, VllmBackend};
use waitd_wake::{CommandWakeSink, WakeSink};

pub struct Daemon {
  pub config: Config,
  pub journal: Journal,
  pub event_log: Arc<EventLog>,
  pub display: Arc<DisplayManager>,
  pub pty_registry: Arc<PtyRegistry>,
  pub scheduler: Arc<Scheduler>,
  pub stuck_detector: Arc<StuckDetector>,
  pub shutdown: async_latch::AsyncLatch,
}

impl Daemon {
  /// Builds every collaborator from `config`, opening (and migrating) the
  /// journal's SQLite database on the way. Returns the scheduler's wake
  /// receiver alongside the daemon since it can only be taken once — the
  /// caller passes it to `scheduler.run`.
  pub fn build(config: Config) -> anyhow::Result<(Daemon, WakeReceiver)> {
    config.ensure_data_dir()?;

    let journal = Journal::open(&config.db_path())?;
    let event_log = Arc::new(EventLog::new(config.event_log_path()));
    let display = Arc::new(DisplayManager::new(config.default_display.clone()));
    let pty_registry = Arc::new(PtyRegistry::new());
    let frame_source: Arc<dyn FrameSource> = Arc::new(CompositeFrameSource::new(pty_registry.clone()));
    let vision = build_vision_backend(&config);
    let wake: Arc<dyn WakeSink> =
      Arc::new(CommandWakeSink::new(config.wake_command.clone(), std::time::Duration::from_secs_f64(config.wake_timeout_secs)));

    let scheduler_config = SchedulerConfig {
      diff_max_width: config.diff_max_width,
      pixel_diff_threshold: config.pixel_diff_threshold,
      max_static_secs: config.max_static_secs,
      frame_max_dim: config.frame_max_dim,
      frame_jpeg_quality: config.frame_jpeg_quality,
      thumbnail_max_dim: config.thumbnail_max_dim,
      thumbnail_jpeg_quality: config.thumbnail_jpeg_quality,
      max_context_frames: config.max_context_frames,
      max_context_verdicts: config.max_context_verdicts,
      resolve_confidence_threshold: config.resolve_confidence_threshold,
      partial_streak_resolve: config.partial_streak_resolve,
      default_poll_interval_secs: config.default_poll_interval_secs,
      min_poll_interval_secs: config.min_poll_interval_secs,
      max_poll_interval_secs: config.max_poll_interval_secs,
      default_timeout_secs: config.default_timeout_secs,
      poll_profile: match config.poll_profile {
        waitd_config::PollProfile::Adaptive => waitd_poller::PollProfile::Adaptive,
        waitd_config::PollProfile::Fixed => waitd_poller::PollProfile::Fixed,
      },
    };
    let (scheduler, wake_receiver) = Scheduler::new(
      display.clone(),
      frame_source,
      vision,
      journal.clone(),
      wake.clone(),
      scheduler_config,
      screenshots_dir(&config),
      event_log.clone(),
    );
    let scheduler = Arc::new(scheduler);

    let stuck_config = StuckDetectorConfig {
      check_interval_secs: config.stuck_check_interval_secs,
      silence_threshold_secs: config.stuck_threshold_secs,
      alert_cooldown_secs: config.stuck_alert_cooldown_secs,
    };
    let stuck_detector = Arc::new(StuckDetector::new(journal.clone(), wake, stuck_config, event_log.clone()));

    let daemon = Daemon {
      config,
      journal,
      event_log,
      display,
      pty_registry,
      scheduler,
      stuck_detector,
      shutdown: async_latch::AsyncLatch::new(),
    };
    Ok((daemon, wake_receiver))
  }

  /// Releases every allocated display and lets the journal's connection
  /// drop; called once on orderly shutdown (spec.md §6's "Exit").
  pub async fn shutdown(&self) {
    self.shutdown.trigger();
    self.display.cleanup_all().await;
  }
}

fn screenshots_dir(config: &Config) -> PathBuf {
  config.screenshots_dir()
}

fn build_vision_backend(config: &Config) -> Arc<dyn VisionBackend> {
  match config.vision_backend {
    VisionBackendKind::Passthrough => Arc::new(PassthroughBackend),
    VisionBackendKind::Ollama => {
      let base_url = config.vision_base_url.clone().unwrap_or_else(|| "http://localhost:11434".to_owned());
      let model = config.vision_model.clone().unwrap_or_else(|| "llava".to_owned());
      Arc::new(OllamaBackend::new(base_url, model))
    }
    VisionBackendKind::Vllm => {
      let base_url = config.vision_base_url.clone().unwrap_or_else(|| "http://localhost:8000".to_owned());
      let model = config.vision_model.clone().unwrap_or_else(|| "default".to_owned());
      Arc::new(VllmBackend::new(base_url, model))
    }
    VisionBackendKind::Claude => {
      let api_key = config.vision_api_key.clone().unwrap_or_default();
      let model = config.vision_model.clone().unwrap_or_else(|| "claude-sonnet-4-20250514".to_owned());
      Arc::new(ClaudeBackend::new(api_key, model))
    }
  }
}
