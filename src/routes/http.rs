//! HTTP endpoint handlers. These are thin wrappers that forward to `AppState`.
//! Each handler is instrumented; failures are rendered by `AppError`.

use std::sync::Arc;

use axum::{
  async_trait,
  extract::{rejection::JsonRejection, FromRequestParts, Path, Query, State},
  http::{request::Parts, HeaderValue, StatusCode},
  response::{IntoResponse, Response},
  Json,
};
use tracing::{debug, info, instrument};

use crate::cache::CacheStatus;
use crate::error::AppError;
use crate::feedback::FeedbackRequest;
use crate::orchestrator::CompleteTask;
use crate::protocol::*;
use crate::state::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const CACHE_HEADER: &str = "x-cache";

/// Caller identity, set by the upstream gateway.
#[derive(Debug, Clone)]
pub struct Caller(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
  S: Send + Sync,
{
  type Rejection = AppError;

  async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
    let user_id = parts
      .headers
      .get(USER_ID_HEADER)
      .and_then(|v| v.to_str().ok())
      .map(str::trim)
      .filter(|v| !v.is_empty())
      .ok_or_else(|| AppError::validation(format!("missing {USER_ID_HEADER} header")))?;
    debug!(target: "progress_engine", %user_id, "caller extracted");
    Ok(Self(user_id.to_string()))
  }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
  payload.map(|Json(v)| v).map_err(|e| AppError::validation(e.body_text()))
}

fn with_cache_status(status: CacheStatus, body: impl IntoResponse) -> Response {
  let mut response = body.into_response();
  response.headers_mut().insert(CACHE_HEADER, HeaderValue::from_static(status.as_str()));
  response
}

#[instrument(level = "info")]
pub async fn http_health() -> impl IntoResponse {
  Json(HealthOut { ok: true, version: env!("CARGO_PKG_VERSION") })
}

#[instrument(level = "debug", skip(state))]
pub async fn http_monitoring_cache(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  Json(state.monitoring_snapshot())
}

#[instrument(level = "info", skip(state), fields(%scenario_id))]
pub async fn http_get_scenario(
  State(state): State<Arc<AppState>>,
  Path(scenario_id): Path<String>,
) -> Result<Response, AppError> {
  let cached = state.scenario(&scenario_id).await?;
  Ok(with_cache_status(cached.status, Json(cached.value)))
}

#[instrument(level = "info", skip(state, payload), fields(user_id = %caller.0))]
pub async fn http_start_program(
  State(state): State<Arc<AppState>>,
  caller: Caller,
  payload: Result<Json<StartProgramIn>, JsonRejection>,
) -> Result<Response, AppError> {
  let input = body(payload)?;
  input.validate()?;
  let view = state.start_program(&caller.0, input.scenario_id.trim()).await?;
  info!(target: "progress", program_id = %view.program.id, "HTTP program started");
  Ok((StatusCode::CREATED, Json(view)).into_response())
}

#[instrument(level = "info", skip(state), fields(%program_id, user_id = %caller.0, lang = ?q.lang))]
pub async fn http_get_program(
  State(state): State<Arc<AppState>>,
  Path(program_id): Path<String>,
  caller: Caller,
  Query(q): Query<ProgramQuery>,
) -> Result<Response, AppError> {
  let (out, status) = state.program_status(&program_id, &caller.0, q.lang.as_deref()).await?;
  Ok(with_cache_status(status, Json(out)))
}

#[instrument(level = "info", skip(state), fields(%program_id, user_id = %caller.0))]
pub async fn http_complete_program(
  State(state): State<Arc<AppState>>,
  Path(program_id): Path<String>,
  caller: Caller,
) -> Result<impl IntoResponse, AppError> {
  Ok(Json(state.complete_program(&program_id, &caller.0).await?))
}

#[instrument(level = "info", skip(state), fields(%program_id, user_id = %caller.0))]
pub async fn http_abandon_program(
  State(state): State<Arc<AppState>>,
  Path(program_id): Path<String>,
  caller: Caller,
) -> Result<impl IntoResponse, AppError> {
  Ok(Json(state.abandon_program(&program_id, &caller.0).await?))
}

#[instrument(level = "info", skip(state, payload), fields(%program_id, user_id = %caller.0))]
pub async fn http_program_feedback(
  State(state): State<Arc<AppState>>,
  Path(program_id): Path<String>,
  caller: Caller,
  payload: Result<Json<FeedbackIn>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
  let input = body(payload)?;
  if input.program_id.as_deref().is_some_and(|id| id != program_id) {
    return Err(AppError::validation("programId in body does not match the path"));
  }
  let req = FeedbackRequest {
    program_id,
    scenario_id: input.scenario_id,
    language: input.language,
    force_regenerate: input.force_regenerate,
  };
  let outcome = state.generate_feedback(&req, &caller.0).await?;
  info!(target: "feedback", program_id = %req.program_id, language = %req.language, status = outcome.status(), "HTTP feedback served");
  Ok(Json(FeedbackOut::from(outcome)))
}

#[instrument(level = "info", skip(state), fields(%task_id, user_id = %caller.0))]
pub async fn http_start_task(
  State(state): State<Arc<AppState>>,
  Path(task_id): Path<String>,
  caller: Caller,
) -> Result<impl IntoResponse, AppError> {
  Ok(Json(state.start_task(&task_id, &caller.0).await?))
}

#[instrument(level = "info", skip(state, payload), fields(%task_id, user_id = %caller.0))]
pub async fn http_complete_task(
  State(state): State<Arc<AppState>>,
  Path(task_id): Path<String>,
  caller: Caller,
  payload: Result<Json<CompleteTaskIn>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
  let input = body(payload)?;
  let completion = state
    .complete_task(CompleteTask {
      task_id,
      user_id: caller.0,
      response: input.response,
      evaluation: input.evaluation_data,
    })
    .await?;
  Ok(Json(completion))
}

#[instrument(level = "info", skip(state, payload), fields(%task_id, user_id = %caller.0))]
pub async fn http_reevaluate_task(
  State(state): State<Arc<AppState>>,
  Path(task_id): Path<String>,
  caller: Caller,
  payload: Result<Json<ReevaluateIn>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
  let input = body(payload)?;
  Ok(Json(state.reevaluate_task(&task_id, &caller.0, input.evaluation_data).await?))
}

#[instrument(level = "info", skip(state), fields(%program_id))]
pub async fn http_admin_reconcile(
  State(state): State<Arc<AppState>>,
  Path(program_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
  Ok(Json(state.reconcile_program(&program_id).await?))
}

#[instrument(level = "info", skip(state))]
pub async fn http_admin_clear_cache(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  Json(ClearCacheOut { cleared: state.clear_caches() })
}
