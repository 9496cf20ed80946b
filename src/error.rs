//! Error taxonomy for the engine and its HTTP mapping.
//!
//! Only `NotFound`, `Forbidden`, `Validation` and `Conflict` reach clients
//! verbatim. `RateLimited` carries machine-readable retry timing. Upstream and
//! storage failures are logged with context and answered with a generic message.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::cache::CacheError;
use crate::rate_limit::RateLimitDecision;
use crate::repository::RepositoryError;

#[derive(Debug, Clone, Error)]
pub enum AppError {
  #[error("{entity} not found: {id}")]
  NotFound { entity: &'static str, id: String },

  #[error("program {program_id} belongs to another user")]
  Forbidden { program_id: String },

  #[error("rate limit exceeded, retry after {retry_after_secs}s")]
  RateLimited { retry_after_secs: u64, reset_time: DateTime<Utc> },

  #[error("upstream call failed: {0}")]
  Upstream(String),

  #[error("invalid request: {0}")]
  Validation(String),

  #[error("conflict: {0}")]
  Conflict(String),

  #[error(transparent)]
  Repository(RepositoryError),
}

impl AppError {
  pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
    Self::NotFound { entity, id: id.into() }
  }

  pub fn validation(message: impl Into<String>) -> Self {
    Self::Validation(message.into())
  }

  pub fn conflict(message: impl Into<String>) -> Self {
    Self::Conflict(message.into())
  }

  pub fn rate_limited(decision: &RateLimitDecision) -> Self {
    Self::RateLimited {
      retry_after_secs: decision.retry_after.unwrap_or(1),
      reset_time: decision.reset_time,
    }
  }

  pub fn status_code(&self) -> StatusCode {
    match self {
      Self::NotFound { .. } => StatusCode::NOT_FOUND,
      Self::Forbidden { .. } => StatusCode::FORBIDDEN,
      Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
      Self::Upstream(_) => StatusCode::BAD_GATEWAY,
      Self::Validation(_) => StatusCode::BAD_REQUEST,
      Self::Conflict(_) => StatusCode::CONFLICT,
      Self::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  pub fn code(&self) -> &'static str {
    match self {
      Self::NotFound { .. } => "NOT_FOUND",
      Self::Forbidden { .. } => "FORBIDDEN",
      Self::RateLimited { .. } => "RATE_LIMITED",
      Self::Upstream(_) => "UPSTREAM_FAILURE",
      Self::Validation(_) => "VALIDATION_FAILED",
      Self::Conflict(_) => "CONFLICT",
      Self::Repository(_) => "INTERNAL",
    }
  }
}

impl From<RepositoryError> for AppError {
  fn from(e: RepositoryError) -> Self {
    match e {
      RepositoryError::Missing { entity, id } => Self::NotFound { entity, id },
      other => Self::Repository(other),
    }
  }
}

impl From<CacheError<AppError>> for AppError {
  fn from(e: CacheError<AppError>) -> Self {
    match e {
      CacheError::Fetch(inner) => inner,
      other => Self::Upstream(other.to_string()),
    }
  }
}

impl IntoResponse for AppError {
  fn into_response(self) -> Response {
    let status = self.status_code();
    let body = match &self {
      Self::RateLimited { retry_after_secs, reset_time } => json!({
        "success": false,
        "code": self.code(),
        "error": "Too many requests",
        "retryAfter": retry_after_secs,
        "resetTime": reset_time,
      }),
      Self::Upstream(detail) => {
        error!(target: "progress_engine", %detail, "upstream failure surfaced to client");
        json!({ "success": false, "code": self.code(), "error": "Upstream service failed, please try again later" })
      }
      Self::Repository(e) => {
        error!(target: "progress_engine", error = %e, "storage failure surfaced to client");
        json!({ "success": false, "code": self.code(), "error": "Internal error" })
      }
      other => json!({ "success": false, "code": other.code(), "error": other.to_string() }),
    };

    let mut response = (status, Json(body)).into_response();
    if let Self::RateLimited { retry_after_secs, .. } = &self {
      if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, v);
      }
    }
    response
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_rows_map_to_not_found() {
    let e: AppError = RepositoryError::Missing { entity: "task", id: "t9".into() }.into();
    assert!(matches!(e, AppError::NotFound { entity: "task", .. }));
    assert_eq!(e.status_code(), StatusCode::NOT_FOUND);
  }

  #[test]
  fn forbidden_is_distinct_from_not_found() {
    let e = AppError::Forbidden { program_id: "p1".into() };
    assert_eq!(e.status_code(), StatusCode::FORBIDDEN);
    assert_eq!(e.code(), "FORBIDDEN");
  }

  #[test]
  fn fetch_errors_unwrap_to_their_source() {
    let e: AppError = CacheError::Fetch(AppError::not_found("program", "p1")).into();
    assert!(matches!(e, AppError::NotFound { .. }));

    let e: AppError = CacheError::<AppError>::Timeout { key: "k".into(), timeout_ms: 10 }.into();
    assert!(matches!(e, AppError::Upstream(_)));
  }

  #[test]
  fn rate_limited_response_carries_retry_after() {
    let response = AppError::RateLimited { retry_after_secs: 7, reset_time: Utc::now() }.into_response();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "7");
  }
}
