// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Table definitions and row (de)serialization, grounded on
//! `examples/original_source/src/agentic_computer_use/db.py`'s six tables.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::models::{
  Action, ActionKind, ActionLog, ActionStatus, PlanItem, PlanItemStatus, Task, TaskMessage, TaskStatus, WaitJobRow,
  WaitJobStatus,
};
use crate::summary::{progress_from_items, ActionDetail, PlanItemDetail, ResumePacket, SummaryDetail, TaskSummary, WaitSummary};
use crate::{new_id, JournalError, Result};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS tasks (
  id          TEXT PRIMARY KEY,
  name        TEXT NOT NULL,
  status      TEXT NOT NULL,
  metadata    TEXT NOT NULL,
  created_at  TEXT NOT NULL,
  updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS plan_items (
  id               TEXT PRIMARY KEY,
  task_id          TEXT NOT NULL REFERENCES tasks(id),
  ordinal          INTEGER NOT NULL,
  title            TEXT NOT NULL,
  status           TEXT NOT NULL,
  started_at       TEXT,
  completed_at     TEXT,
  duration_seconds REAL
);
CREATE INDEX IF NOT EXISTS idx_plan_items_task_ordinal ON plan_items(task_id, ordinal);

CREATE TABLE IF NOT EXISTS actions (
  id            TEXT PRIMARY KEY,
  task_id       TEXT NOT NULL REFERENCES tasks(id),
  plan_item_id  TEXT REFERENCES plan_items(id),
  kind          TEXT NOT NULL,
  summary       TEXT NOT NULL,
  status        TEXT NOT NULL,
  input         TEXT,
  output        TEXT,
  created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_actions_plan_item ON actions(plan_item_id);
CREATE INDEX IF NOT EXISTS idx_actions_task ON actions(task_id);

CREATE TABLE IF NOT EXISTS action_logs (
  id          TEXT PRIMARY KEY,
  action_id   TEXT NOT NULL REFERENCES actions(id),
  note        TEXT NOT NULL,
  created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_action_logs_action ON action_logs(action_id);

CREATE TABLE IF NOT EXISTS task_messages (
  id          TEXT PRIMARY KEY,
  task_id     TEXT NOT NULL REFERENCES tasks(id),
  kind        TEXT NOT NULL,
  body        TEXT NOT NULL,
  created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_messages_task_created ON task_messages(task_id, created_at);

CREATE TABLE IF NOT EXISTS wait_jobs (
  id           TEXT PRIMARY KEY,
  task_id      TEXT REFERENCES tasks(id),
  target_kind  TEXT NOT NULL,
  target_id    TEXT NOT NULL,
  criteria     TEXT NOT NULL,
  status       TEXT NOT NULL,
  result       TEXT,
  created_at   TEXT NOT NULL,
  resolved_at  TEXT,
  display      TEXT
);
CREATE INDEX IF NOT EXISTS idx_wait_jobs_status ON wait_jobs(status);
";

pub fn initialize(conn: &Connection) -> Result<()> {
  conn.pragma_update(None, "journal_mode", "WAL")?;
  conn.pragma_update(None, "foreign_keys", true)?;
  conn.execute_batch(SCHEMA_SQL)?;
  Ok(())
}

// ---- row mapping -----------------------------------------------------------

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
  let status_raw: String = row.get("status")?;
  let metadata_raw: String = row.get("metadata")?;
  Ok(Task {
    id: row.get("id")?,
    name: row.get("name")?,
    status: TaskStatus::parse(&status_raw).unwrap_or(TaskStatus::Active),
    metadata: serde_json::from_str(&metadata_raw).unwrap_or_else(|_| serde_json::json!({})),
    created_at: row.get("created_at")?,
    updated_at: row.get("updated_at")?,
  })
}

fn plan_item_from_row(row: &Row) -> rusqlite::Result<PlanItem> {
  let status_raw: String = row.get("status")?;
  Ok(PlanItem {
    id: row.get("id")?,
    task_id: row.get("task_id")?,
    ordinal: row.get("ordinal")?,
    title: row.get("title")?,
    status: PlanItemStatus::parse(&status_raw).unwrap_or(PlanItemStatus::Pending),
    started_at: row.get("started_at")?,
    completed_at: row.get("completed_at")?,
    duration_seconds: row.get("duration_seconds")?,
  })
}

fn action_from_row(row: &Row) -> rusqlite::Result<Action> {
  let kind_raw: String = row.get("kind")?;
  let status_raw: String = row.get("status")?;
  let input_raw: Option<String> = row.get("input")?;
  let output_raw: Option<String> = row.get("output")?;
  Ok(Action {
    id: row.get("id")?,
    task_id: row.get("task_id")?,
    plan_item_id: row.get("plan_item_id")?,
    kind: ActionKind::parse(&kind_raw).unwrap_or(ActionKind::Reasoning),
    summary: row.get("summary")?,
    status: ActionStatus::parse(&status_raw).unwrap_or(ActionStatus::Started),
    input: input_raw.and_then(|s| serde_json::from_str(&s).ok()),
    output: output_raw.and_then(|s| serde_json::from_str(&s).ok()),
    created_at: row.get("created_at")?,
  })
}

fn action_log_from_row(row: &Row) -> rusqlite::Result<ActionLog> {
  Ok(ActionLog { id: row.get("id")?, action_id: row.get("action_id")?, note: row.get("note")?, created_at: row.get("created_at")? })
}

fn message_from_row(row: &Row) -> rusqlite::Result<TaskMessage> {
  Ok(TaskMessage {
    id: row.get("id")?,
    task_id: row.get("task_id")?,
    kind: row.get("kind")?,
    body: row.get("body")?,
    created_at: row.get("created_at")?,
  })
}

fn wait_job_from_row(row: &Row) -> rusqlite::Result<WaitJobRow> {
  let status_raw: String = row.get("status")?;
  Ok(WaitJobRow {
    id: row.get("id")?,
    task_id: row.get("task_id")?,
    target_kind: row.get("target_kind")?,
    target_id: row.get("target_id")?,
    criteria: row.get("criteria")?,
    status: WaitJobStatus::parse(&status_raw).unwrap_or(WaitJobStatus::Watching),
    result: row.get("result")?,
    created_at: row.get("created_at")?,
    resolved_at: row.get("resolved_at")?,
    display: row.get("display")?,
  })
}

// ---- queries ----------------------------------------------------------------

pub fn load_task(conn: &Connection, task_id: &str) -> Result<Task> {
  conn
    .query_row("SELECT * FROM tasks WHERE id = ?1", [task_id], task_from_row)
    .optional()?
    .ok_or_else(|| JournalError::TaskNotFound(task_id.to_owned()))
}

pub fn list_tasks(conn: &Connection, status: Option<TaskStatus>, limit: Option<i64>) -> Result<Vec<Task>> {
  let limit = limit.unwrap_or(i64::MAX);
  let mut stmt = match status {
    Some(_) => conn.prepare("SELECT * FROM tasks WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2")?,
    None => conn.prepare("SELECT * FROM tasks ORDER BY created_at DESC LIMIT ?1")?,
  };
  let rows = match status {
    Some(status) => stmt.query_map(rusqlite::params![status.as_str(), limit], task_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?,
    None => stmt.query_map([limit], task_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?,
  };
  Ok(rows)
}

pub fn load_plan_items(conn: &Connection, task_id: &str) -> Result<Vec<PlanItem>> {
  let mut stmt = conn.prepare("SELECT * FROM plan_items WHERE task_id = ?1 ORDER BY ordinal")?;
  Ok(stmt.query_map([task_id], plan_item_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn load_plan_item(conn: &Connection, task_id: &str, ordinal: i64) -> Result<PlanItem> {
  conn
    .query_row("SELECT * FROM plan_items WHERE task_id = ?1 AND ordinal = ?2", rusqlite::params![task_id, ordinal], plan_item_from_row)
    .optional()?
    .ok_or_else(|| JournalError::PlanItemNotFound { task_id: task_id.to_owned(), ordinal })
}

/// The plan item actions are attributed to when no explicit ordinal is
/// given: the first non-terminal item, or the last item if all are
/// terminal, or `None` if the task has no plan.
pub fn current_or_first_pending_plan_item(conn: &Connection, task_id: &str) -> Result<Option<String>> {
  let items = load_plan_items(conn, task_id)?;
  if items.is_empty() {
    return Ok(None);
  }
  let current = items.iter().find(|i| !i.status.is_terminal()).or_else(|| items.last());
  Ok(current.map(|i| i.id.clone()))
}

#[allow(clippy::too_many_arguments)]
pub fn insert_action(
  conn: &Connection,
  task_id: &str,
  plan_item_id: Option<&str>,
  kind: ActionKind,
  summary: &str,
  input: Option<Value>,
  output: Option<Value>,
  status: ActionStatus,
) -> Result<String> {
  let id = new_id();
  conn.execute(
    "INSERT INTO actions (id, task_id, plan_item_id, kind, summary, status, input, output, created_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    rusqlite::params![
      id,
      task_id,
      plan_item_id,
      kind.as_str(),
      summary,
      status.as_str(),
      input.map(|v| v.to_string()),
      output.map(|v| v.to_string()),
      Utc::now(),
    ],
  )?;
  Ok(id)
}

pub fn load_action(conn: &Connection, action_id: &str) -> Result<Action> {
  conn
    .query_row("SELECT * FROM actions WHERE id = ?1", [action_id], action_from_row)
    .optional()?
    .ok_or_else(|| JournalError::NotFound { what: "action", id: action_id.to_owned() })
}

pub fn load_action_log(conn: &Connection, id: &str) -> Result<ActionLog> {
  conn
    .query_row("SELECT * FROM action_logs WHERE id = ?1", [id], action_log_from_row)
    .optional()?
    .ok_or_else(|| JournalError::NotFound { what: "action_log", id: id.to_owned() })
}

pub fn load_action_logs(conn: &Connection, action_id: &str) -> Result<Vec<ActionLog>> {
  let mut stmt = conn.prepare("SELECT * FROM action_logs WHERE action_id = ?1 ORDER BY created_at")?;
  Ok(stmt.query_map([action_id], action_log_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn load_actions_for_plan_item(conn: &Connection, plan_item_id: &str) -> Result<Vec<Action>> {
  let mut stmt = conn.prepare("SELECT * FROM actions WHERE plan_item_id = ?1 ORDER BY created_at")?;
  Ok(stmt.query_map([plan_item_id], action_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn load_actions_for_task(conn: &Connection, task_id: &str) -> Result<Vec<Action>> {
  let mut stmt = conn.prepare("SELECT * FROM actions WHERE task_id = ?1 ORDER BY created_at")?;
  Ok(stmt.query_map([task_id], action_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Finds the most recent still-`started` wait action for this task and
/// updates its status/output in place — wait jobs aren't a foreign key on
/// `actions`, so the match is by recency rather than by id.
pub fn update_wait_action_outcome(conn: &Connection, task_id: &str, _wait_id: &str, status: ActionStatus, output: Value) -> Result<()> {
  let actions = load_actions_for_task(conn, task_id)?;
  let target = actions.iter().rev().find(|a| a.kind == ActionKind::Wait && a.status == ActionStatus::Started);
  if let Some(action) = target {
    conn.execute(
      "UPDATE actions SET status = ?1, output = ?2 WHERE id = ?3",
      rusqlite::params![status.as_str(), output.to_string(), action.id],
    )?;
  }
  Ok(())
}

pub fn insert_message(conn: &Connection, task_id: &str, kind: &str, body: &str) -> Result<String> {
  let id = new_id();
  conn.execute(
    "INSERT INTO task_messages (id, task_id, kind, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
    rusqlite::params![id, task_id, kind, body, Utc::now()],
  )?;
  Ok(id)
}

pub fn load_message(conn: &Connection, id: &str) -> Result<TaskMessage> {
  conn
    .query_row("SELECT * FROM task_messages WHERE id = ?1", [id], message_from_row)
    .optional()?
    .ok_or_else(|| JournalError::NotFound { what: "message", id: id.to_owned() })
}

pub fn load_messages(conn: &Connection, task_id: &str, limit: Option<i64>) -> Result<Vec<TaskMessage>> {
  let limit = limit.unwrap_or(i64::MAX);
  let mut stmt = conn.prepare("SELECT * FROM task_messages WHERE task_id = ?1 ORDER BY created_at DESC LIMIT ?2")?;
  let mut rows = stmt.query_map(rusqlite::params![task_id, limit], message_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
  rows.reverse();
  Ok(rows)
}

pub fn load_wait_job(conn: &Connection, wait_id: &str) -> Result<WaitJobRow> {
  conn
    .query_row("SELECT * FROM wait_jobs WHERE id = ?1", [wait_id], wait_job_from_row)
    .optional()?
    .ok_or_else(|| JournalError::WaitJobNotFound(wait_id.to_owned()))
}

pub fn list_wait_jobs(conn: &Connection, status: Option<WaitJobStatus>) -> Result<Vec<WaitJobRow>> {
  let mut stmt = match status {
    Some(_) => conn.prepare("SELECT * FROM wait_jobs WHERE status = ?1 ORDER BY created_at DESC")?,
    None => conn.prepare("SELECT * FROM wait_jobs ORDER BY created_at DESC")?,
  };
  let rows = match status {
    Some(status) => stmt.query_map([status.as_str()], wait_job_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?,
    None => stmt.query_map([], wait_job_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?,
  };
  Ok(rows)
}

pub fn load_wait_jobs_for_task(conn: &Connection, task_id: &str) -> Result<Vec<WaitJobRow>> {
  let mut stmt = conn.prepare("SELECT * FROM wait_jobs WHERE task_id = ?1 ORDER BY created_at DESC")?;
  Ok(stmt.query_map([task_id], wait_job_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn build_summary(conn: &Connection, task_id: &str, detail: SummaryDetail) -> Result<TaskSummary> {
  let task = load_task(conn, task_id)?;
  let plan_items = load_plan_items(conn, task_id)?;
  let progress = progress_from_items(&plan_items);

  let mut actions = None;
  let mut messages = None;
  let mut wait_summary = None;

  match detail {
    SummaryDetail::Items => {}
    SummaryDetail::Focused => {
      if let Some(ordinal) = progress.current {
        let item = plan_items.iter().find(|i| i.ordinal == ordinal);
        if let Some(item) = item {
          actions = Some(actions_with_logs(conn, &load_actions_for_plan_item(conn, &item.id)?)?);
        }
      }
      messages = Some(load_messages(conn, task_id, Some(5))?);
    }
    SummaryDetail::Actions => {
      actions = Some(actions_with_logs(conn, &load_actions_for_task(conn, task_id)?)?);
    }
    SummaryDetail::Full => {
      actions = Some(actions_with_logs(conn, &load_actions_for_task(conn, task_id)?)?);
      messages = Some(load_messages(conn, task_id, None)?);
      wait_summary = Some(WaitSummary {
        active_wait_ids: crate::models::active_wait_ids(&task.metadata),
        rows: load_wait_jobs_for_task(conn, task_id)?,
      });
    }
  }

  Ok(TaskSummary { task, plan_items, progress, actions, messages, wait_summary })
}

pub fn build_plan_item_detail(conn: &Connection, task_id: &str, ordinal: i64) -> Result<PlanItemDetail> {
  let item = load_plan_item(conn, task_id, ordinal)?;
  let actions = actions_with_logs(conn, &load_actions_for_plan_item(conn, &item.id)?)?;
  Ok(PlanItemDetail { item, actions })
}

fn actions_with_logs(conn: &Connection, actions: &[Action]) -> Result<Vec<ActionDetail>> {
  actions
    .iter()
    .map(|action| Ok(ActionDetail { action: action.clone(), logs: load_action_logs(conn, &action.id)? }))
    .collect()
}

pub fn build_resume_packet(conn: &Connection, task_id: &str, reason: String) -> Result<ResumePacket> {
  let task = load_task(conn, task_id)?;
  let plan_items = load_plan_items(conn, task_id)?;
  let progress = progress_from_items(&plan_items);

  let current_item_actions = match progress.current.and_then(|ordinal| plan_items.iter().find(|i| i.ordinal == ordinal)) {
    Some(item) => actions_with_logs(conn, &load_actions_for_plan_item(conn, &item.id)?)?,
    None => Vec::new(),
  };
  let last_messages = load_messages(conn, task_id, Some(5))?;
  let wait_summary =
    WaitSummary { active_wait_ids: crate::models::active_wait_ids(&task.metadata), rows: load_wait_jobs_for_task(conn, task_id)? };

  Ok(ResumePacket {
    task_id: task.id.clone(),
    name: task.name.clone(),
    status: task.status.as_str().to_owned(),
    progress,
    current_item_actions,
    last_messages,
    wait_summary,
    reason,
  })
}
