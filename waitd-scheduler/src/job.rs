// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! `WaitJob`'s durable and runtime fields (spec.md §3), split across the
//! journal row (durable) and [`RunningJob`] (runtime-only, scheduler-owned).

use chrono::{DateTime, Utc};
use waitd_diffgate::PixelDiffGate;
use waitd_frame::{Frame, TargetKind, WindowRef};
use waitd_jobcontext::JobContext;
use waitd_poller::AdaptivePoller;

#[derive(Debug, thiserror::Error)]
pub enum TargetParseError {
  #[error("target {0:?} has no kind:id separator")]
  MissingSeparator(String),
  #[error("unknown target kind {0:?}")]
  UnknownKind(String),
}

/// Parses a submit-wait request's `target` field (`"screen"`, `"screen:id"`,
/// or `"window:<numeric-id-or-name-substring>"`) into a target kind plus the
/// raw id string persisted alongside it.
pub fn parse_target(raw: &str) -> Result<TargetKind, TargetParseError> {
  let (kind, id) = match raw.split_once(':') {
    Some((kind, id)) => (kind, id),
    None => (raw, "full"),
  };
  match kind {
    "screen" => Ok(TargetKind::Screen),
    "window" => match id.parse::<u64>() {
      Ok(numeric) => Ok(TargetKind::Window(WindowRef::Id(numeric))),
      Err(_) => Ok(TargetKind::Window(WindowRef::Name(id.to_owned()))),
    },
    "pty" => Ok(TargetKind::Pty(id.to_owned())),
    _ => Err(TargetParseError::UnknownKind(raw.to_owned())),
  }
}

pub fn target_kind_label(kind: &TargetKind) -> &'static str {
  match kind {
    TargetKind::Screen => "screen",
    TargetKind::Window(_) => "window",
    TargetKind::Pty(_) => "pty",
  }
}

/// A wait job's scheduler-owned runtime state: everything spec.md §3 calls
/// "runtime-only" (job context, poller, gate, next-check time, resolved
/// window id, last frame), plus the handful of durable fields the
/// evaluation loop needs on every tick without round-tripping the journal.
pub struct RunningJob {
  pub id: String,
  pub task_id: Option<String>,
  pub target_kind: TargetKind,
  pub target_raw: String,
  pub display: String,
  pub criteria: String,
  pub timeout: chrono::Duration,
  pub started_at: DateTime<Utc>,
  pub next_check_at: DateTime<Utc>,
  pub last_vision_at: Option<DateTime<Utc>>,
  pub context: JobContext,
  pub gate: PixelDiffGate,
  pub poller: AdaptivePoller,
  pub resolved_window_id: Option<u64>,
  pub partial_streak: u32,
  pub last_frame: Option<Frame>,
  pub frames_captured: u64,
  pub verdicts_recorded: u64,
}

impl RunningJob {
  pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
    now - self.started_at
  }

  pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
    self.elapsed(now) >= self.timeout
  }

  /// Sets `next_check_at` to `now` plus the poller's current interval.
  pub fn reschedule(&mut self, now: DateTime<Utc>) {
    self.next_check_at = now + chrono::Duration::milliseconds((self.poller.interval() * 1000.0) as i64);
  }

  /// The target to actually capture with: a cached numeric window id takes
  /// priority over a still-unresolved name, so a resolved window is never
  /// re-looked-up by name every tick.
  pub fn effective_target(&self) -> TargetKind {
    match (&self.target_kind, self.resolved_window_id) {
      (TargetKind::Window(_), Some(id)) => TargetKind::Window(WindowRef::Id(id)),
      (other, _) => other.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_screen_target_with_default_id() {
    let kind = parse_target("screen").unwrap();
    assert!(matches!(kind, TargetKind::Screen));
  }

  #[test]
  fn parses_numeric_window_target() {
    let kind = parse_target("window:1234").unwrap();
    assert!(matches!(kind, TargetKind::Window(WindowRef::Id(1234))));
  }

  #[test]
  fn parses_named_window_target() {
    let kind = parse_target("window:Terminal").unwrap();
    assert!(matches!(kind, TargetKind::Window(WindowRef::Name(ref n)) if n == "Terminal"));
  }

  #[test]
  fn rejects_unknown_kind() {
    assert!(parse_target("video:1").is_err());
  }
}
