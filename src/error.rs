// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Maps crate errors onto the HTTP status codes spec.md §7 assigns them:
//! journal write failures are 5xx, invalid requests are 4xx, and display
//! allocation failures surface as a 200 with a `display_error` field
//! (handled inline at the call site, not here, since that path still
//! returns a success body).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

pub struct ApiError {
  status: StatusCode,
  message: String,
}

impl ApiError {
  pub fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError { status: StatusCode::BAD_REQUEST, message: message.into() }
  }

  pub fn not_found(message: impl Into<String>) -> ApiError {
    ApiError { status: StatusCode::NOT_FOUND, message: message.into() }
  }

  fn internal(message: impl Into<String>) -> ApiError {
    ApiError { status: StatusCode::INTERNAL_SERVER_ERROR, message: message.into() }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    (self.status, Json(json!({"error": self.message}))).into_response()
  }
}

impl From<waitd_journal::JournalError> for ApiError {
  /// Journal writes failing is the one journal-facing case spec.md §7
  /// calls a hard error rather than something locally absorbed (a missing
  /// row, on the other hand, is a 404 — the caller asked about something
  /// that genuinely isn't there).
  fn from(e: waitd_journal::JournalError) -> ApiError {
    use waitd_journal::JournalError::*;
    match &e {
      TaskNotFound(_) | PlanItemNotFound { .. } | WaitJobNotFound(_) | NotFound { .. } => ApiError::not_found(e.to_string()),
      InvalidStatus { .. } => ApiError::bad_request(e.to_string()),
      Sqlite(_) | Worker(_) => ApiError::internal(e.to_string()),
    }
  }
}

impl From<waitd_scheduler::SchedulerError> for ApiError {
  fn from(e: waitd_scheduler::SchedulerError) -> ApiError {
    use waitd_scheduler::SchedulerError::*;
    match e {
      InvalidTarget(inner) => ApiError::bad_request(inner.to_string()),
      NotFound(id) => ApiError::not_found(format!("wait job {id} not found")),
      Journal(inner) => inner.into(),
    }
  }
}
