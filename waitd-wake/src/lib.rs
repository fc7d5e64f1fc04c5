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

//! The out-of-band channel that delivers resolution/timeout/stuck events to
//! the outer agent (spec.md §4.10, C11), grounded on
//! `examples/original_source/src/agentic_computer_use/daemon.py`'s
//! `stuck_detection_loop`, which shells out to `$ACU_OPENCLAW_CLI system
//! event --text <msg> --mode now` with a 10s timeout and swallows failures.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum WakeError {
  #[error("wake command is empty")]
  EmptyCommand,
  #[error("failed to spawn wake command {program}: {source}")]
  Spawn { program: String, #[source] source: std::io::Error },
  #[error("wake command timed out after {0:?}")]
  TimedOut(Duration),
  #[error("wake command exited with {0}")]
  NonZeroExit(std::process::ExitStatus),
}

pub type Result<T> = std::result::Result<T, WakeError>;

/// Delivers a short text message to the outer agent. Implementations must
/// never let a failed delivery propagate as a scheduler error — `emit` has
/// no `Result` in its signature for exactly that reason; use `try_emit` (on
/// `CommandWakeSink`) if the caller wants to know why a send failed.
#[async_trait]
pub trait WakeSink: Send + Sync {
  async fn emit(&self, message: &str);
}

/// Spawns an external command with `message` appended as its final
/// argument, bounded by a wait-then-kill timeout.
pub struct CommandWakeSink {
  argv: Vec<String>,
  timeout: Duration,
}

impl CommandWakeSink {
  pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
    CommandWakeSink { argv, timeout }
  }

  pub async fn try_emit(&self, message: &str) -> Result<()> {
    let (program, args) = self.argv.split_first().ok_or(WakeError::EmptyCommand)?;

    let mut command = tokio::process::Command::new(program);
    command.args(args).arg(message);
    command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    command.kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| WakeError::Spawn { program: program.clone(), source })?;

    match tokio::time::timeout(self.timeout, child.wait()).await {
      Ok(Ok(status)) if status.success() => Ok(()),
      Ok(Ok(status)) => Err(WakeError::NonZeroExit(status)),
      Ok(Err(source)) => Err(WakeError::Spawn { program: program.clone(), source }),
      Err(_) => {
        let _ = child.kill().await;
        Err(WakeError::TimedOut(self.timeout))
      }
    }
  }
}

#[async_trait]
impl WakeSink for CommandWakeSink {
  async fn emit(&self, message: &str) {
    if let Err(e) = self.try_emit(message).await {
      log::warn!("wake-sink emission failed, dropping: {e}");
    }
  }
}

/// Formats the three wake-event shapes from spec.md §6.
pub mod message {
  pub fn resolved(job_id: &str, criteria: &str, description: &str) -> String {
    format!("[smart_wait resolved] Job {job_id}: {criteria} → {description}")
  }

  pub fn timeout(job_id: &str, criteria: &str, description: &str) -> String {
    format!("[smart_wait timeout] Job {job_id}: {criteria} — {description}")
  }

  pub fn stuck_resume(resume_packet_json: &str) -> String {
    format!("[task_stuck_resume] {resume_packet_json}")
  }
}

/// Records every emission in order, for tests.
#[derive(Default)]
pub struct RecordingWakeSink {
  messages: Mutex<Vec<String>>,
}

impl RecordingWakeSink {
  pub fn new() -> Self {
    RecordingWakeSink::default()
  }

  pub fn messages(&self) -> Vec<String> {
    self.messages.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }
}

#[async_trait]
impl WakeSink for RecordingWakeSink {
  async fn emit(&self, message: &str) {
    self.messages.lock().unwrap_or_else(|e| e.into_inner()).push(message.to_owned());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn recording_sink_preserves_order() {
    let sink = RecordingWakeSink::new();
    sink.emit("first").await;
    sink.emit("second").await;
    assert_eq!(sink.messages(), vec!["first".to_owned(), "second".to_owned()]);
  }

  #[tokio::test]
  async fn command_sink_runs_true_successfully() {
    let sink = CommandWakeSink::new(vec!["true".to_owned()], Duration::from_secs(5));
    sink.try_emit("hello").await.unwrap();
  }

  #[tokio::test]
  async fn command_sink_reports_non_zero_exit() {
    let sink = CommandWakeSink::new(vec!["false".to_owned()], Duration::from_secs(5));
    let err = sink.try_emit("hello").await.unwrap_err();
    assert!(matches!(err, WakeError::NonZeroExit(_)));
  }

  #[tokio::test]
  async fn command_sink_times_out_and_kills() {
    let sink = CommandWakeSink::new(vec!["sleep".to_owned(), "5".to_owned()], Duration::from_millis(50));
    let err = sink.try_emit("hello").await.unwrap_err();
    assert!(matches!(err, WakeError::TimedOut(_)));
  }

  #[test]
  fn message_shapes_match_the_contract() {
    assert_eq!(message::resolved("j1", "dialog closed", "the dialog is gone"), "[smart_wait resolved] Job j1: dialog closed → the dialog is gone");
    assert_eq!(message::timeout("j1", "dialog closed", "no change observed"), "[smart_wait timeout] Job j1: dialog closed — no change observed");
    assert_eq!(message::stuck_resume("{}"), "[task_stuck_resume] {}");
  }
}
