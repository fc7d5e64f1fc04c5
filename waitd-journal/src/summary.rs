// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The shapes returned by `Journal::summary` and `Journal::resume_packet`,
//! taken from `task/manager.py`'s `get_task_summary` and
//! `build_resume_packet` in the original source (spec.md §4.8, §4.9).

use serde::Serialize;

use crate::models::{Action, ActionLog, PlanItem, Task, TaskMessage, WaitJobRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryDetail {
  /// Task plus its plan items only.
  Items,
  /// Items, plus the current item's actions/logs and the last five messages.
  Focused,
  /// Items plus every action (with logs) across all plan items.
  Actions,
  /// Everything: actions, all messages, and linked wait-job rows.
  Full,
}

impl SummaryDetail {
  pub fn parse(raw: &str) -> Option<SummaryDetail> {
    match raw {
      "items" => Some(SummaryDetail::Items),
      "focused" => Some(SummaryDetail::Focused),
      "actions" => Some(SummaryDetail::Actions),
      "full" => Some(SummaryDetail::Full),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionDetail {
  pub action: Action,
  pub logs: Vec<ActionLog>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Progress {
  pub completed: Vec<i64>,
  pub current: Option<i64>,
  pub current_title: Option<String>,
  pub remaining: Vec<i64>,
  pub percent: f64,
}

/// Computes the progress block from a task's plan items, ordered by
/// ordinal: completed/failed/skipped ordinals are "completed", the first
/// `pending` or `active` item is "current", everything after it is
/// "remaining".
pub fn progress_from_items(items: &[PlanItem]) -> Progress {
  let mut sorted = items.to_vec();
  sorted.sort_by_key(|i| i.ordinal);

  let mut completed = Vec::new();
  let mut remaining = Vec::new();
  let mut current = None;
  let mut current_title = None;

  for item in &sorted {
    if item.status.is_terminal() {
      completed.push(item.ordinal);
    } else if current.is_none() {
      current = Some(item.ordinal);
      current_title = Some(item.title.clone());
    } else {
      remaining.push(item.ordinal);
    }
  }

  let percent = if sorted.is_empty() { 0.0 } else { completed.len() as f64 / sorted.len() as f64 * 100.0 };

  Progress { completed, current, current_title, remaining, percent }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct WaitSummary {
  pub active_wait_ids: Vec<String>,
  pub rows: Vec<WaitJobRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
  pub task: Task,
  pub plan_items: Vec<PlanItem>,
  pub progress: Progress,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub actions: Option<Vec<ActionDetail>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub messages: Option<Vec<TaskMessage>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub wait_summary: Option<WaitSummary>,
}

/// `task_drill_down`'s reply: one plan item plus the full action/log
/// history attributed to it.
#[derive(Debug, Clone, Serialize)]
pub struct PlanItemDetail {
  pub item: PlanItem,
  pub actions: Vec<ActionDetail>,
}

/// A stuck task's snapshot, embedded verbatim in the `[task_stuck_resume]`
/// wake event (spec.md §6).
#[derive(Debug, Clone, Serialize)]
pub struct ResumePacket {
  pub task_id: String,
  pub name: String,
  pub status: String,
  pub progress: Progress,
  pub current_item_actions: Vec<ActionDetail>,
  pub last_messages: Vec<TaskMessage>,
  pub wait_summary: WaitSummary,
  pub reason: String,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::PlanItemStatus;

  fn item(ordinal: i64, status: PlanItemStatus, title: &str) -> PlanItem {
    PlanItem {
      id: format!("pi-{ordinal}"),
      task_id: "t".to_owned(),
      ordinal,
      title: title.to_owned(),
      status,
      started_at: None,
      completed_at: None,
      duration_seconds: None,
    }
  }

  #[test]
  fn progress_splits_completed_current_remaining() {
    let items = vec![
      item(0, PlanItemStatus::Completed, "a"),
      item(1, PlanItemStatus::Pending, "b"),
      item(2, PlanItemStatus::Pending, "c"),
    ];
    let progress = progress_from_items(&items);
    assert_eq!(progress.completed, vec![0]);
    assert_eq!(progress.current, Some(1));
    assert_eq!(progress.current_title.as_deref(), Some("b"));
    assert_eq!(progress.remaining, vec![2]);
    assert!((progress.percent - 33.333).abs() < 0.01);
  }

  #[test]
  fn progress_on_empty_plan_is_zero_percent_with_no_current() {
    let progress = progress_from_items(&[]);
    assert_eq!(progress.percent, 0.0);
    assert_eq!(progress.current, None);
  }
}
