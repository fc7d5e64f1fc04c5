// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Row types persisted by the journal, and the small enums whose string
//! forms are normalized on every ingress (spec.md §4.8, §9: `"canceled"` is
//! accepted everywhere as an alias of `"cancelled"`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Active,
  Paused,
  Completed,
  Failed,
  Cancelled,
}

impl TaskStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      TaskStatus::Active => "active",
      TaskStatus::Paused => "paused",
      TaskStatus::Completed => "completed",
      TaskStatus::Failed => "failed",
      TaskStatus::Cancelled => "cancelled",
    }
  }

  pub fn is_terminal(self) -> bool {
    matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
  }

  /// Parses a status string, normalizing the `"canceled"` alias.
  pub fn parse(raw: &str) -> Option<TaskStatus> {
    match normalize_cancelled(raw).as_str() {
      "active" => Some(TaskStatus::Active),
      "paused" => Some(TaskStatus::Paused),
      "completed" => Some(TaskStatus::Completed),
      "failed" => Some(TaskStatus::Failed),
      "cancelled" => Some(TaskStatus::Cancelled),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanItemStatus {
  Pending,
  Active,
  Completed,
  Failed,
  Skipped,
}

impl PlanItemStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      PlanItemStatus::Pending => "pending",
      PlanItemStatus::Active => "active",
      PlanItemStatus::Completed => "completed",
      PlanItemStatus::Failed => "failed",
      PlanItemStatus::Skipped => "skipped",
    }
  }

  pub fn is_terminal(self) -> bool {
    matches!(self, PlanItemStatus::Completed | PlanItemStatus::Failed | PlanItemStatus::Skipped)
  }

  pub fn parse(raw: &str) -> Option<PlanItemStatus> {
    match normalize_cancelled(raw).as_str() {
      "pending" => Some(PlanItemStatus::Pending),
      "active" => Some(PlanItemStatus::Active),
      "completed" => Some(PlanItemStatus::Completed),
      "failed" => Some(PlanItemStatus::Failed),
      "skipped" => Some(PlanItemStatus::Skipped),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
  Started,
  Completed,
  Failed,
}

impl ActionStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      ActionStatus::Started => "started",
      ActionStatus::Completed => "completed",
      ActionStatus::Failed => "failed",
    }
  }

  pub fn parse(raw: &str) -> Option<ActionStatus> {
    match raw {
      "started" => Some(ActionStatus::Started),
      "completed" => Some(ActionStatus::Completed),
      "failed" => Some(ActionStatus::Failed),
      _ => None,
    }
  }
}

/// The fixed set of action kinds, each with a stable payload shape — see
/// SPEC_FULL.md §9's "nested JSON blobs in the journal" redesign note.
/// Payload validation happens at construction (`Action::new_*`), not by
/// sniffing the stored JSON back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
  Wait,
  Gui,
  Cli,
  Reasoning,
  Recording,
}

impl ActionKind {
  pub fn as_str(self) -> &'static str {
    match self {
      ActionKind::Wait => "wait",
      ActionKind::Gui => "gui",
      ActionKind::Cli => "cli",
      ActionKind::Reasoning => "reasoning",
      ActionKind::Recording => "recording",
    }
  }

  pub fn parse(raw: &str) -> Option<ActionKind> {
    match raw {
      "wait" => Some(ActionKind::Wait),
      "gui" => Some(ActionKind::Gui),
      "cli" => Some(ActionKind::Cli),
      "reasoning" => Some(ActionKind::Reasoning),
      "recording" => Some(ActionKind::Recording),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitJobStatus {
  Watching,
  Resolved,
  Timeout,
  Cancelled,
  /// Defined for forward compatibility (spec.md §9's open question); no
  /// scheduler code path currently produces it.
  Error,
}

impl WaitJobStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      WaitJobStatus::Watching => "watching",
      WaitJobStatus::Resolved => "resolved",
      WaitJobStatus::Timeout => "timeout",
      WaitJobStatus::Cancelled => "cancelled",
      WaitJobStatus::Error => "error",
    }
  }

  pub fn is_terminal(self) -> bool {
    !matches!(self, WaitJobStatus::Watching)
  }

  pub fn parse(raw: &str) -> Option<WaitJobStatus> {
    match normalize_cancelled(raw).as_str() {
      "watching" => Some(WaitJobStatus::Watching),
      "resolved" => Some(WaitJobStatus::Resolved),
      "timeout" => Some(WaitJobStatus::Timeout),
      "cancelled" => Some(WaitJobStatus::Cancelled),
      "error" => Some(WaitJobStatus::Error),
      _ => None,
    }
  }
}

fn normalize_cancelled(raw: &str) -> String {
  let lower = raw.to_ascii_lowercase();
  if lower == "canceled" {
    "cancelled".to_owned()
  } else {
    lower
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
  pub id: String,
  pub name: String,
  pub status: TaskStatus,
  pub metadata: Value,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanItem {
  pub id: String,
  pub task_id: String,
  pub ordinal: i64,
  pub title: String,
  pub status: PlanItemStatus,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Action {
  pub id: String,
  pub task_id: String,
  pub plan_item_id: Option<String>,
  pub kind: ActionKind,
  pub summary: String,
  pub status: ActionStatus,
  pub input: Option<Value>,
  pub output: Option<Value>,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionLog {
  pub id: String,
  pub action_id: String,
  pub note: String,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskMessage {
  pub id: String,
  pub task_id: String,
  pub kind: String,
  pub body: String,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitJobRow {
  pub id: String,
  pub task_id: Option<String>,
  pub target_kind: String,
  pub target_id: String,
  pub criteria: String,
  pub status: WaitJobStatus,
  pub result: Option<String>,
  pub created_at: DateTime<Utc>,
  pub resolved_at: Option<DateTime<Utc>>,
  pub display: Option<String>,
}

/// Typed accessors for `Task.metadata`'s small fixed set of recognized keys
/// (spec.md §3). Stored as plain `serde_json::Value` fields so unrecognized
/// keys the caller set survive round-trips untouched.
pub mod metadata_keys {
  pub const DISPLAY: &str = "display";
  pub const DISPLAY_SLOT: &str = "display_slot";
  pub const RESOLUTION: &str = "resolution";
  pub const ACTIVE_WAIT_IDS: &str = "active_wait_ids";
  pub const LAST_WAIT_STATE: &str = "last_wait_state";
  pub const LAST_WAIT_EVENT_AT: &str = "last_wait_event_at";
  pub const LAST_STUCK_ALERT_AT: &str = "last_stuck_alert_at";
}

pub fn active_wait_ids(metadata: &Value) -> Vec<String> {
  metadata
    .get(metadata_keys::ACTIVE_WAIT_IDS)
    .and_then(|v| v.as_array())
    .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
    .unwrap_or_default()
}

pub fn set_active_wait_ids(metadata: &mut Value, ids: &[String]) {
  let obj = metadata.as_object_mut().expect("metadata is always a JSON object");
  obj.insert(metadata_keys::ACTIVE_WAIT_IDS.to_owned(), serde_json::json!(ids));
}
