// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The thin HTTP proxy spec.md §6 describes: every handler just validates
//! its request shape and forwards to the scheduler or the journal — no
//! business logic lives here, matching the handler style of
//! `knhk-workflow-engine`'s `api/rest/handlers.rs`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, patch, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use waitd_journal::{ActionKind, ActionStatus, SummaryDetail, TaskStatus};
use waitd_scheduler::{AddJobRequest, UpdateJobRequest};

use crate::daemon::Daemon;
use crate::error::ApiError;

pub fn router(daemon: Arc<Daemon>) -> Router {
  Router::new()
    .route("/wait", post(submit_wait).get(list_waits))
    .route("/wait/:id", get(wait_status).patch(update_wait).delete(cancel_wait))
    .route("/task", post(register_task).get(list_tasks))
    .route("/task/:id", patch(update_task))
    .route("/task/:id/item/:ordinal", get(drill_down_item).patch(update_item))
    .route("/task/:id/action", post(log_action))
    .route("/task/:id/summary", get(task_summary))
    .with_state(daemon)
}

// ---- /wait --------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SubmitWaitRequest {
  target: String,
  wake_when: String,
  timeout: Option<f64>,
  poll_interval: Option<f64>,
  task_id: Option<String>,
}

async fn submit_wait(State(daemon): State<Arc<Daemon>>, Json(req): Json<SubmitWaitRequest>) -> Result<impl IntoResponse, ApiError> {
  let target = req.target.clone();
  let wait_id = daemon
    .scheduler
    .add_job(AddJobRequest {
      target: req.target,
      criteria: req.wake_when,
      timeout_secs: req.timeout,
      poll_interval_secs: req.poll_interval,
      task_id: req.task_id,
    })
    .await?;
  Ok(Json(json!({
    "wait_id": wait_id,
    "status": "watching",
    "target": target,
    "message": "watching for the requested condition",
  })))
}

async fn list_waits(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
  let snapshots = daemon.scheduler.list_snapshots().await;
  let count = snapshots.len();
  Json(json!({"active_jobs": snapshots, "count": count}))
}

async fn wait_status(State(daemon): State<Arc<Daemon>>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
  if let Some(snapshot) = daemon.scheduler.snapshot(&id).await {
    return Ok(Json(json!({
      "wait_id": snapshot.wait_id,
      "status": snapshot.status,
      "target": snapshot.target,
      "criteria": snapshot.criteria,
      "elapsed_seconds": snapshot.elapsed_seconds,
      "poll_interval": snapshot.poll_interval,
      "frames_captured": snapshot.frames_captured,
      "verdicts": snapshot.verdicts,
    })));
  }

  let row = daemon.journal.get_wait_job(&id).await?;
  let elapsed_seconds = row.resolved_at.map(|resolved| (resolved - row.created_at).num_milliseconds() as f64 / 1000.0);
  Ok(Json(json!({
    "wait_id": row.id,
    "status": row.status.as_str(),
    "target": row.target_id,
    "criteria": row.criteria,
    "elapsed_seconds": elapsed_seconds,
    "poll_interval": null,
    "frames_captured": null,
    "verdicts": null,
  })))
}

#[derive(Debug, Deserialize)]
struct UpdateWaitRequest {
  wake_when: Option<String>,
  timeout: Option<f64>,
  message: Option<String>,
}

async fn update_wait(
  State(daemon): State<Arc<Daemon>>,
  Path(id): Path<String>,
  Json(req): Json<UpdateWaitRequest>,
) -> Result<impl IntoResponse, ApiError> {
  daemon
    .scheduler
    .update_job(&id, UpdateJobRequest { criteria: req.wake_when, timeout_secs: req.timeout, message: req.message })
    .await?;
  Ok(Json(json!({"wait_id": id, "status": "watching"})))
}

#[derive(Debug, Default, Deserialize)]
struct CancelWaitRequest {
  #[serde(default)]
  reason: Option<String>,
}

async fn cancel_wait(
  State(daemon): State<Arc<Daemon>>,
  Path(id): Path<String>,
  body: Option<Json<CancelWaitRequest>>,
) -> Result<impl IntoResponse, ApiError> {
  let reason = body.and_then(|Json(req)| req.reason);
  daemon.scheduler.cancel_job(&id, reason).await?;
  Ok(Json(json!({"wait_id": id, "status": "cancelled"})))
}

// ---- /task ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegisterTaskRequest {
  name: String,
  plan: Vec<String>,
  metadata: Option<serde_json::Value>,
}

async fn register_task(State(daemon): State<Arc<Daemon>>, Json(req): Json<RegisterTaskRequest>) -> Result<impl IntoResponse, ApiError> {
  let task = daemon.journal.register_task(req.name, req.plan, req.metadata).await?;
  Ok(Json(task))
}

#[derive(Debug, Deserialize)]
struct TaskListQuery {
  status: Option<String>,
  limit: Option<i64>,
}

async fn list_tasks(State(daemon): State<Arc<Daemon>>, Query(query): Query<TaskListQuery>) -> Result<impl IntoResponse, ApiError> {
  let status = match query.status {
    Some(raw) => Some(TaskStatus::parse(&raw).ok_or_else(|| ApiError::bad_request(format!("invalid task status {raw:?}")))?),
    None => None,
  };
  let tasks = daemon.journal.list_tasks(status, query.limit).await?;
  let count = tasks.len();
  Ok(Json(json!({"tasks": tasks, "count": count})))
}

#[derive(Debug, Deserialize)]
struct UpdateTaskRequest {
  message: Option<String>,
  query: Option<String>,
  status: Option<String>,
}

async fn update_task(
  State(daemon): State<Arc<Daemon>>,
  Path(id): Path<String>,
  Json(req): Json<UpdateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
  let task = daemon.journal.update_task(&id, req.message, req.status, req.query).await?;
  if task.status.is_terminal() {
    daemon.display.release(&task.id).await;
  }
  Ok(Json(task))
}

#[derive(Debug, Deserialize)]
struct UpdateItemRequest {
  status: String,
  note: Option<String>,
}

async fn update_item(
  State(daemon): State<Arc<Daemon>>,
  Path((task_id, ordinal)): Path<(String, i64)>,
  Json(req): Json<UpdateItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
  let item = daemon.journal.update_plan_item(&task_id, ordinal, req.status, req.note).await?;
  Ok(Json(item))
}

async fn drill_down_item(State(daemon): State<Arc<Daemon>>, Path((task_id, ordinal)): Path<(String, i64)>) -> Result<impl IntoResponse, ApiError> {
  let detail = daemon.journal.drill_down_plan_item(&task_id, ordinal).await?;
  Ok(Json(detail))
}

#[derive(Debug, Deserialize)]
struct LogActionRequest {
  action_type: String,
  summary: String,
  input_data: Option<serde_json::Value>,
  output_data: Option<serde_json::Value>,
  status: Option<String>,
  ordinal: Option<i64>,
}

async fn log_action(
  State(daemon): State<Arc<Daemon>>,
  Path(task_id): Path<String>,
  Json(req): Json<LogActionRequest>,
) -> Result<impl IntoResponse, ApiError> {
  let kind = ActionKind::parse(&req.action_type).ok_or_else(|| ApiError::bad_request(format!("invalid action_type {:?}", req.action_type)))?;
  let status = match req.status {
    Some(raw) => ActionStatus::parse(&raw).ok_or_else(|| ApiError::bad_request(format!("invalid action status {raw:?}")))?,
    None => ActionStatus::Completed,
  };
  let action = daemon
    .journal
    .log_action(&task_id, kind, req.summary, req.input_data, req.output_data, status, req.ordinal)
    .await?;
  Ok(Json(action))
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
  detail_level: Option<String>,
}

async fn task_summary(State(daemon): State<Arc<Daemon>>, Path(id): Path<String>, Query(query): Query<SummaryQuery>) -> Result<impl IntoResponse, ApiError> {
  let detail = match query.detail_level.as_deref() {
    Some(raw) => SummaryDetail::parse(raw).ok_or_else(|| ApiError::bad_request(format!("invalid detail_level {raw:?}")))?,
    None => SummaryDetail::Items,
  };
  let summary = daemon.journal.get_summary(&id, detail).await?;
  Ok(Json(summary))
}
