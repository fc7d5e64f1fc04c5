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

//! The persistent hierarchical task journal (spec.md §4.8, C9): tasks, plan
//! items, actions, action logs, messages, and wait-job rows, backed by a
//! single SQLite database (`rusqlite`, bundled, WAL mode), matching
//! `examples/original_source/src/agentic_computer_use/db.py`'s schema.
//!
//! Every public operation is `async` but performs its SQL on a blocking
//! thread (`tokio::task::spawn_blocking`) rather than holding the
//! connection's mutex across an await point — matching the blocking-pool
//! offload pattern `sharded_lmdb` uses for its own synchronous storage
//! engine (LMDB there, SQLite here).

mod event_log;
mod models;
mod schema;
mod summary;

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{json, Value};

pub use event_log::EventLog;
pub use models::{
  active_wait_ids, metadata_keys, set_active_wait_ids, Action, ActionKind, ActionLog, ActionStatus, PlanItem,
  PlanItemStatus, Task, TaskMessage, TaskStatus, WaitJobRow, WaitJobStatus,
};
pub use summary::{progress_from_items, ActionDetail, PlanItemDetail, Progress, ResumePacket, SummaryDetail, TaskSummary, WaitSummary};

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("journal worker thread panicked: {0}")]
  Worker(String),
  #[error("task {0} not found")]
  TaskNotFound(String),
  #[error("plan item {task_id}/{ordinal} not found")]
  PlanItemNotFound { task_id: String, ordinal: i64 },
  #[error("wait job {0} not found")]
  WaitJobNotFound(String),
  #[error("{what} {id} not found")]
  NotFound { what: &'static str, id: String },
  #[error("invalid status {status:?} for {field}")]
  InvalidStatus { field: &'static str, status: String },
}

pub type Result<T> = std::result::Result<T, JournalError>;

/// Generates an 8 hex-character opaque id, matching `db.new_id()` in the
/// original source.
pub fn new_id() -> String {
  uuid::Uuid::new_v4().simple().to_string()[..8].to_owned()
}

fn now() -> DateTime<Utc> {
  Utc::now()
}

pub struct NewWaitJob {
  pub id: String,
  pub task_id: Option<String>,
  pub target_kind: String,
  pub target_id: String,
  pub criteria: String,
  pub display: Option<String>,
}

#[derive(Clone)]
pub struct Journal {
  conn: Arc<Mutex<Connection>>,
}

impl Journal {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| JournalError::Worker(e.to_string()))?;
    }
    let conn = Connection::open(path)?;
    schema::initialize(&conn)?;
    Ok(Journal { conn: Arc::new(Mutex::new(conn)) })
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()?;
    schema::initialize(&conn)?;
    Ok(Journal { conn: Arc::new(Mutex::new(conn)) })
  }

  async fn with_conn<F, R>(&self, f: F) -> Result<R>
  where
    F: FnOnce(&Connection) -> Result<R> + Send + 'static,
    R: Send + 'static,
  {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || {
      let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
      f(&guard)
    })
    .await
    .map_err(|e| JournalError::Worker(e.to_string()))?
  }

  // ---- Tasks -----------------------------------------------------------

  pub async fn register_task(&self, name: String, plan: Vec<String>, metadata: Option<Value>) -> Result<Task> {
    self
      .with_conn(move |conn| {
        let id = new_id();
        let when = now();
        let metadata = metadata.unwrap_or_else(|| json!({}));
        conn.execute(
          "INSERT INTO tasks (id, name, status, metadata, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
          rusqlite::params![id, name, TaskStatus::Active.as_str(), metadata.to_string(), when],
        )?;
        for (ordinal, title) in plan.into_iter().enumerate() {
          conn.execute(
            "INSERT INTO plan_items (id, task_id, ordinal, title, status) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![new_id(), id, ordinal as i64, title, PlanItemStatus::Pending.as_str()],
          )?;
        }
        schema::load_task(conn, &id)
      })
      .await
  }

  pub async fn get_task(&self, task_id: &str) -> Result<Task> {
    let task_id = task_id.to_owned();
    self.with_conn(move |conn| schema::load_task(conn, &task_id)).await
  }

  pub async fn list_tasks(&self, status: Option<TaskStatus>, limit: Option<i64>) -> Result<Vec<Task>> {
    self.with_conn(move |conn| schema::list_tasks(conn, status, limit)).await
  }

  /// `UpdateTask(id, {message?, status?, query?})`: terminal status
  /// transitions are recorded (display release is the caller's
  /// responsibility — the journal only persists state); a `message` is
  /// written as a `reasoning` Action under the current (or first pending)
  /// plan item; `query` is appended as a task message for visibility.
  pub async fn update_task(
    &self,
    task_id: &str,
    message: Option<String>,
    status: Option<String>,
    query: Option<String>,
  ) -> Result<Task> {
    let task_id = task_id.to_owned();
    self
      .with_conn(move |conn| {
        let when = now();
        if let Some(raw_status) = &status {
          let parsed = TaskStatus::parse(raw_status)
            .ok_or_else(|| JournalError::InvalidStatus { field: "task.status", status: raw_status.clone() })?;
          conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![parsed.as_str(), when, task_id],
          )?;
        } else {
          conn.execute("UPDATE tasks SET updated_at = ?1 WHERE id = ?2", rusqlite::params![when, task_id])?;
        }
        if conn.changes() == 0 && status.is_some() {
          return Err(JournalError::TaskNotFound(task_id.clone()));
        }

        if let Some(message) = &message {
          let plan_item_id = schema::current_or_first_pending_plan_item(conn, &task_id)?;
          schema::insert_action(
            conn,
            &task_id,
            plan_item_id.as_deref(),
            ActionKind::Reasoning,
            message,
            None,
            None,
            ActionStatus::Completed,
          )?;
        }
        if let Some(query) = &query {
          schema::insert_message(conn, &task_id, "query", query)?;
        }

        schema::load_task(conn, &task_id)
      })
      .await
  }

  pub async fn set_task_metadata(&self, task_id: &str, metadata: Value) -> Result<()> {
    let task_id = task_id.to_owned();
    self
      .with_conn(move |conn| {
        let changed = conn.execute(
          "UPDATE tasks SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
          rusqlite::params![metadata.to_string(), now(), task_id],
        )?;
        if changed == 0 {
          return Err(JournalError::TaskNotFound(task_id.clone()));
        }
        Ok(())
      })
      .await
  }

  // ---- Plan items --------------------------------------------------------

  /// `UpdatePlanItem(id, ordinal, status, note?)`: computes
  /// `duration_seconds` when the item transitions into a terminal status,
  /// appends a progress message, and records `note` (if present) as an
  /// Action under the item.
  pub async fn update_plan_item(
    &self,
    task_id: &str,
    ordinal: i64,
    status: String,
    note: Option<String>,
  ) -> Result<PlanItem> {
    let task_id = task_id.to_owned();
    self
      .with_conn(move |conn| {
        let parsed = PlanItemStatus::parse(&status)
          .ok_or_else(|| JournalError::InvalidStatus { field: "plan_item.status", status: status.clone() })?;
        let mut item = schema::load_plan_item(conn, &task_id, ordinal)?;
        let when = now();

        if item.started_at.is_none() && matches!(parsed, PlanItemStatus::Active) {
          item.started_at = Some(when);
        }
        let mut duration = item.duration_seconds;
        let mut completed_at = item.completed_at;
        if parsed.is_terminal() && completed_at.is_none() {
          completed_at = Some(when);
          if let Some(started) = item.started_at {
            duration = Some((when - started).num_milliseconds() as f64 / 1000.0);
          }
        }

        conn.execute(
          "UPDATE plan_items SET status = ?1, started_at = ?2, completed_at = ?3, duration_seconds = ?4 \
           WHERE task_id = ?5 AND ordinal = ?6",
          rusqlite::params![parsed.as_str(), item.started_at, completed_at, duration, task_id, ordinal],
        )?;

        schema::insert_message(
          conn,
          &task_id,
          "progress",
          &format!("item {ordinal} ({title}) -> {status}", title = item.title, status = parsed.as_str()),
        )?;
        if let Some(note) = &note {
          schema::insert_action(
            conn,
            &task_id,
            Some(&item.id),
            ActionKind::Reasoning,
            note,
            None,
            None,
            ActionStatus::Completed,
          )?;
        }

        schema::load_plan_item(conn, &task_id, ordinal)
      })
      .await
  }

  // ---- Actions ------------------------------------------------------------

  pub async fn log_action(
    &self,
    task_id: &str,
    kind: ActionKind,
    summary: String,
    input: Option<Value>,
    output: Option<Value>,
    status: ActionStatus,
    ordinal: Option<i64>,
  ) -> Result<Action> {
    let task_id = task_id.to_owned();
    self
      .with_conn(move |conn| {
        let plan_item_id = match ordinal {
          Some(ordinal) => Some(schema::load_plan_item(conn, &task_id, ordinal)?.id),
          None => schema::current_or_first_pending_plan_item(conn, &task_id)?,
        };
        let id = schema::insert_action(conn, &task_id, plan_item_id.as_deref(), kind, &summary, input, output, status)?;
        schema::load_action(conn, &id)
      })
      .await
  }

  pub async fn append_action_log(&self, action_id: &str, note: String) -> Result<ActionLog> {
    let action_id = action_id.to_owned();
    self
      .with_conn(move |conn| {
        let id = new_id();
        conn.execute(
          "INSERT INTO action_logs (id, action_id, note, created_at) VALUES (?1, ?2, ?3, ?4)",
          rusqlite::params![id, action_id, note, now()],
        )?;
        schema::load_action_log(conn, &id)
      })
      .await
  }

  // ---- Messages -------------------------------------------------------

  pub async fn append_message(&self, task_id: &str, kind: String, body: String) -> Result<TaskMessage> {
    let task_id = task_id.to_owned();
    self
      .with_conn(move |conn| {
        let id = schema::insert_message(conn, &task_id, &kind, &body)?;
        schema::load_message(conn, &id)
      })
      .await
  }

  // ---- Summaries --------------------------------------------------------

  pub async fn get_summary(&self, task_id: &str, detail: SummaryDetail) -> Result<TaskSummary> {
    let task_id = task_id.to_owned();
    self.with_conn(move |conn| schema::build_summary(conn, &task_id, detail)).await
  }

  /// `task_drill_down`: one plan item plus its full action/log history.
  pub async fn drill_down_plan_item(&self, task_id: &str, ordinal: i64) -> Result<PlanItemDetail> {
    let task_id = task_id.to_owned();
    self.with_conn(move |conn| schema::build_plan_item_detail(conn, &task_id, ordinal)).await
  }

  // ---- Wait jobs ----------------------------------------------------------

  pub async fn insert_wait_job(&self, job: NewWaitJob) -> Result<WaitJobRow> {
    self
      .with_conn(move |conn| {
        conn.execute(
          "INSERT INTO wait_jobs (id, task_id, target_kind, target_id, criteria, status, created_at, display) \
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
          rusqlite::params![
            job.id,
            job.task_id,
            job.target_kind,
            job.target_id,
            job.criteria,
            WaitJobStatus::Watching.as_str(),
            now(),
            job.display,
          ],
        )?;
        schema::load_wait_job(conn, &job.id)
      })
      .await
  }

  pub async fn get_wait_job(&self, wait_id: &str) -> Result<WaitJobRow> {
    let wait_id = wait_id.to_owned();
    self.with_conn(move |conn| schema::load_wait_job(conn, &wait_id)).await
  }

  pub async fn list_wait_jobs(&self, status: Option<WaitJobStatus>) -> Result<Vec<WaitJobRow>> {
    self.with_conn(move |conn| schema::list_wait_jobs(conn, status)).await
  }

  pub async fn finalize_wait_job(&self, wait_id: &str, status: WaitJobStatus, result: Option<String>) -> Result<()> {
    let wait_id = wait_id.to_owned();
    self
      .with_conn(move |conn| {
        let changed = conn.execute(
          "UPDATE wait_jobs SET status = ?1, result = ?2, resolved_at = ?3 WHERE id = ?4",
          rusqlite::params![status.as_str(), result, now(), wait_id],
        )?;
        if changed == 0 {
          return Err(JournalError::WaitJobNotFound(wait_id.clone()));
        }
        Ok(())
      })
      .await
  }

  /// `OnWaitCreated`: appends `waitId` to `metadata.active_wait_ids`,
  /// records a `started` wait Action, and posts a `wait` message.
  pub async fn on_wait_created(
    &self,
    task_id: &str,
    wait_id: String,
    target: String,
    criteria: String,
    timeout_secs: Option<f64>,
  ) -> Result<()> {
    let task_id = task_id.to_owned();
    self
      .with_conn(move |conn| {
        let mut task = schema::load_task(conn, &task_id)?;
        let mut ids = active_wait_ids(&task.metadata);
        ids.push(wait_id.clone());
        set_active_wait_ids(&mut task.metadata, &ids);
        conn.execute(
          "UPDATE tasks SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
          rusqlite::params![task.metadata.to_string(), now(), task_id],
        )?;

        let input = json!({"target": target, "criteria": criteria, "timeout_secs": timeout_secs});
        let plan_item_id = schema::current_or_first_pending_plan_item(conn, &task_id)?;
        schema::insert_action(
          conn,
          &task_id,
          plan_item_id.as_deref(),
          ActionKind::Wait,
          &format!("wait started: {criteria}"),
          Some(input),
          None,
          ActionStatus::Started,
        )?;
        schema::insert_message(conn, &task_id, "wait", &format!("watching for: {criteria} (job {wait_id})"))?;
        Ok(())
      })
      .await
  }

  /// `OnWaitFinished`: removes `waitId` from `metadata.active_wait_ids`,
  /// updates the matching wait Action's status/output, posts a `wait`
  /// message, and stamps `last_wait_state` / `last_wait_event_at`.
  pub async fn on_wait_finished(
    &self,
    task_id: &str,
    wait_id: String,
    state: String,
    detail: String,
    elapsed_seconds: Option<f64>,
  ) -> Result<()> {
    let task_id = task_id.to_owned();
    self
      .with_conn(move |conn| {
        let mut task = schema::load_task(conn, &task_id)?;
        let mut ids = active_wait_ids(&task.metadata);
        ids.retain(|id| id != &wait_id);
        set_active_wait_ids(&mut task.metadata, &ids);
        let obj = task.metadata.as_object_mut().expect("metadata is always an object");
        obj.insert(metadata_keys::LAST_WAIT_STATE.to_owned(), json!(state));
        obj.insert(metadata_keys::LAST_WAIT_EVENT_AT.to_owned(), json!(now().to_rfc3339()));
        conn.execute(
          "UPDATE tasks SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
          rusqlite::params![task.metadata.to_string(), now(), task_id],
        )?;

        let action_status = if state == "resolved" { ActionStatus::Completed } else { ActionStatus::Failed };
        let output = json!({"state": state, "detail": detail, "elapsed_seconds": elapsed_seconds});
        schema::update_wait_action_outcome(conn, &task_id, &wait_id, action_status, output)?;
        schema::insert_message(conn, &task_id, "wait", &format!("wait {wait_id} finished: {state} — {detail}"))?;
        Ok(())
      })
      .await
  }

  // ---- Stuck detector support ---------------------------------------------

  /// Reconciles `metadata.active_wait_ids` against rows still in
  /// `watching` status, persisting the trimmed list if it changed, and
  /// returns the reconciled list.
  pub async fn reconcile_active_wait_ids(&self, task_id: &str) -> Result<Vec<String>> {
    let task_id = task_id.to_owned();
    self
      .with_conn(move |conn| {
        let mut task = schema::load_task(conn, &task_id)?;
        let recorded = active_wait_ids(&task.metadata);
        let mut still_watching = Vec::new();
        for id in &recorded {
          if let Ok(row) = schema::load_wait_job(conn, id) {
            if row.status == WaitJobStatus::Watching {
              still_watching.push(id.clone());
            }
          }
        }
        if still_watching != recorded {
          set_active_wait_ids(&mut task.metadata, &still_watching);
          conn.execute(
            "UPDATE tasks SET metadata = ?1 WHERE id = ?2",
            rusqlite::params![task.metadata.to_string(), task_id],
          )?;
        }
        Ok(still_watching)
      })
      .await
  }

  pub async fn mark_stuck_alert(&self, task_id: &str, reason: &str) -> Result<()> {
    let task_id = task_id.to_owned();
    let reason = reason.to_owned();
    self
      .with_conn(move |conn| {
        let mut task = schema::load_task(conn, &task_id)?;
        let obj = task.metadata.as_object_mut().expect("metadata is always an object");
        obj.insert(metadata_keys::LAST_STUCK_ALERT_AT.to_owned(), json!(now().to_rfc3339()));
        conn.execute(
          "UPDATE tasks SET metadata = ?1 WHERE id = ?2",
          rusqlite::params![task.metadata.to_string(), task_id],
        )?;
        schema::insert_message(conn, &task_id, "stuck", &reason)?;
        Ok(())
      })
      .await
  }

  pub async fn build_resume_packet(&self, task_id: &str, reason: String) -> Result<ResumePacket> {
    let task_id = task_id.to_owned();
    self.with_conn(move |conn| schema::build_resume_packet(conn, &task_id, reason)).await
  }
}

#[cfg(test)]
mod tests;
