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

//! Owns the lifecycle of virtual X11 displays (Xvfb + a lightweight window
//! manager) that wait jobs capture frames from.

mod managed_child;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::sync::Mutex;

pub use managed_child::ManagedChild;

const FIRST_DISPLAY_NUMBER: u32 = 100;
const LAST_DISPLAY_NUMBER: u32 = 999;
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;

#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
  #[error("no free X display number found between {FIRST_DISPLAY_NUMBER} and {LAST_DISPLAY_NUMBER}")]
  NoFreeDisplay,
  #[error("failed to spawn Xvfb on display {display}: {detail}")]
  StartFailed { display: String, detail: String },
  #[error("Xvfb on display {display} exited immediately after starting")]
  XvfbDiedImmediately { display: String },
}

pub type Result<T> = std::result::Result<T, DisplayError>;

/// A single task's allocated virtual display, per spec.md §3's `DisplayInfo`.
#[derive(Debug, Clone)]
pub struct DisplayInfo {
  pub task_id: String,
  pub slot: u32,
  pub display: String,
  pub width: u32,
  pub height: u32,
  pub created_at: DateTime<Utc>,
}

struct Allocation {
  info: DisplayInfo,
  xvfb: ManagedChild,
  window_manager: Option<ManagedChild>,
}

/// Manages one virtual display per task: allocates/tears down Xvfb +
/// window-manager pairs, and serializes capture access to each display
/// string via a per-display mutex (the "connection" of spec.md §4.1 — a
/// real X11 connection handle isn't needed since capture shells out to
/// external tools, so the mutex itself stands in for "the cached
/// connection").
///
/// Grounded on the reference display manager's Xvfb + fluxbox spawn
/// sequence: allocate a free display number, start Xvfb, give it a moment
/// to create its socket, start the window manager, give that a moment to
/// map itself, then verify both are still alive.
pub struct DisplayManager {
  default_display: String,
  allocations: Mutex<HashMap<String, Allocation>>,
  capture_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DisplayManager {
  pub fn new(default_display: impl Into<String>) -> Self {
    DisplayManager {
      default_display: default_display.into(),
      allocations: Mutex::new(HashMap::new()),
      capture_locks: Mutex::new(HashMap::new()),
    }
  }

  /// Starts a new Xvfb + window manager pair for `task_id` and returns its
  /// `DisplayInfo`. Idempotent: a second call for the same `task_id` returns
  /// the existing allocation untouched.
  pub async fn allocate(&self, task_id: &str, width: Option<u32>, height: Option<u32>) -> Result<DisplayInfo> {
    let mut allocations = self.allocations.lock().await;
    if let Some(existing) = allocations.get(task_id) {
      return Ok(existing.info.clone());
    }

    let width = width.unwrap_or(DEFAULT_WIDTH);
    let height = height.unwrap_or(DEFAULT_HEIGHT);
    let slot = Self::find_free_slot(&allocations)?;
    let display = format!(":{slot}");

    let mut xvfb_command = Command::new("Xvfb");
    xvfb_command.arg(&display).arg("-screen").arg("0").arg(format!("{width}x{height}x24"));
    let mut xvfb = ManagedChild::spawn(xvfb_command, GRACEFUL_SHUTDOWN_TIMEOUT)
      .map_err(|detail| DisplayError::StartFailed { display: display.clone(), detail })?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    if !xvfb.poll_alive() {
      return Err(DisplayError::XvfbDiedImmediately { display });
    }

    let mut wm_command = Command::new("fluxbox");
    wm_command.env("DISPLAY", &display);
    let window_manager = match ManagedChild::spawn(wm_command, GRACEFUL_SHUTDOWN_TIMEOUT) {
      Ok(wm) => Some(wm),
      Err(detail) => {
        log::warn!("failed to start window manager on display {display}: {detail}");
        None
      }
    };

    tokio::time::sleep(Duration::from_millis(200)).await;

    let info = DisplayInfo {
      task_id: task_id.to_owned(),
      slot,
      display: display.clone(),
      width,
      height,
      created_at: Utc::now(),
    };
    allocations.insert(task_id.to_owned(), Allocation { info: info.clone(), xvfb, window_manager });
    Ok(info)
  }

  /// Gracefully terminates the task's display subprocesses (SIGTERM,
  /// bounded wait, SIGKILL fallback — see
  /// [`ManagedChild::graceful_shutdown_sync`]) and drops its cached capture
  /// lock. A no-op for unknown `task_id`s.
  pub async fn release(&self, task_id: &str) {
    let allocation = self.allocations.lock().await.remove(task_id);
    let Some(mut allocation) = allocation else { return };
    self.capture_locks.lock().await.remove(&allocation.info.display);
    let display = allocation.info.display.clone();
    let joined = tokio::task::spawn_blocking(move || {
      if let Some(mut wm) = allocation.window_manager.take() {
        let _ = wm.graceful_shutdown_sync();
      }
      let _ = allocation.xvfb.graceful_shutdown_sync();
    })
    .await;
    if let Err(e) = joined {
      log::warn!("error releasing display {display} for task {task_id}: {e}");
    }
  }

  /// Releases every currently allocated display. Called on daemon shutdown.
  pub async fn cleanup_all(&self) {
    let task_ids: Vec<String> = self.allocations.lock().await.keys().cloned().collect();
    for task_id in task_ids {
      self.release(&task_id).await;
    }
  }

  /// The display string recorded for `task_id`, or the globally configured
  /// default if the task has no allocation.
  pub async fn display_string(&self, task_id: &str) -> String {
    match self.allocations.lock().await.get(task_id) {
      Some(allocation) => allocation.info.display.clone(),
      None => self.default_display.clone(),
    }
  }

  /// Returns the shared capture mutex for a display string, creating it on
  /// first use. All callers that read pixels from the same display string
  /// must hold this lock for the duration of the capture.
  pub async fn capture_lock(&self, display: &str) -> Arc<Mutex<()>> {
    let mut locks = self.capture_locks.lock().await;
    locks.entry(display.to_owned()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
  }

  pub async fn is_allocated(&self, task_id: &str) -> bool {
    self.allocations.lock().await.contains_key(task_id)
  }

  fn find_free_slot(allocations: &HashMap<String, Allocation>) -> Result<u32> {
    let taken: std::collections::HashSet<u32> = allocations.values().map(|a| a.info.slot).collect();
    for number in FIRST_DISPLAY_NUMBER..=LAST_DISPLAY_NUMBER {
      if taken.contains(&number) {
        continue;
      }
      if Path::new(&format!("/tmp/.X{number}-lock")).exists() {
        continue;
      }
      return Ok(number);
    }
    Err(DisplayError::NoFreeDisplay)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn free_slot_skips_locked() {
    let allocations = HashMap::new();
    let slot = DisplayManager::find_free_slot(&allocations).unwrap();
    assert!(slot >= FIRST_DISPLAY_NUMBER);
  }

  #[tokio::test]
  async fn release_on_unknown_task_is_a_no_op() {
    let manager = DisplayManager::new(":99");
    manager.release("nonexistent").await;
  }

  #[tokio::test]
  async fn display_string_falls_back_to_default_for_unallocated_task() {
    let manager = DisplayManager::new(":99");
    assert_eq!(manager.display_string("nonexistent").await, ":99");
  }

  #[tokio::test]
  async fn capture_lock_is_shared_across_calls_for_the_same_display() {
    let manager = DisplayManager::new(":99");
    let a = manager.capture_lock(":101").await;
    let b = manager.capture_lock(":101").await;
    assert!(Arc::ptr_eq(&a, &b));
  }
}
