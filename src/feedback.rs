//! Qualitative feedback for completed programs, one entry per language.
//!
//! Generation is expensive, so every request goes through three gates before
//! the backend is called: an existing valid entry short-circuits, a
//! process-local in-flight guard keyed by `(program, language)` turns
//! concurrent duplicates into `InProgress`, and the `ai_generation` rate limit
//! is charged against the caller. Results are merged under their language key;
//! a failed generation writes nothing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::domain::{FeedbackEntry, LearningMode, Program, ProgramPatch, ProgramStatus, TaskType};
use crate::error::AppError;
use crate::inflight::InFlightSet;
use crate::orchestrator::{completion_rate, mean_score};
use crate::rate_limit::{RateLimitCategory, RateLimitDecision, RateLimiter};
use crate::repository::Repositories;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequest {
  pub program_id: String,
  pub scenario_id: String,
  pub language: String,
  #[serde(default)]
  pub force_regenerate: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FeedbackOutcome {
  Generated(FeedbackEntry),
  /// A valid entry already existed; nothing was generated.
  Existing(FeedbackEntry),
  /// Another caller is generating this language right now.
  InProgress,
}

impl FeedbackOutcome {
  pub fn status(&self) -> &'static str {
    match self {
      Self::Generated(_) => "generated",
      Self::Existing(_) => "existing",
      Self::InProgress => "in_progress",
    }
  }

  pub fn feedback(&self) -> Option<&FeedbackEntry> {
    match self {
      Self::Generated(f) | Self::Existing(f) => Some(f),
      Self::InProgress => None,
    }
  }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
  pub index: usize,
  pub title: String,
  pub kind: TaskType,
  pub score: Option<f64>,
  pub evaluator_notes: Option<String>,
}

/// Everything a backend needs to write feedback for one program.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackContext {
  pub program_id: String,
  pub language: String,
  pub language_name: String,
  pub scenario_title: String,
  pub mode: LearningMode,
  pub total_score: f64,
  pub completion_rate: f64,
  pub tasks: Vec<TaskSummary>,
}

impl FeedbackContext {
  /// One line per task, used as prompt input.
  pub fn task_summaries(&self) -> String {
    self
      .tasks
      .iter()
      .map(|t| {
        let score = t.score.map_or_else(|| "not scored".to_string(), |s| format!("{s:.0}"));
        match &t.evaluator_notes {
          Some(notes) if !notes.is_empty() => format!("{}. {} ({score}): {notes}", t.index + 1, t.title),
          _ => format!("{}. {} ({score})", t.index + 1, t.title),
        }
      })
      .collect::<Vec<_>>()
      .join("\n")
  }
}

#[derive(Debug, Error)]
pub enum GenerationError {
  #[error("generation request failed: {0}")]
  Request(String),

  #[error("generation returned no content")]
  Empty,

  #[error("generation timed out after {0:?}")]
  Timeout(Duration),
}

#[async_trait]
pub trait FeedbackBackend: Send + Sync {
  fn name(&self) -> &'static str;

  async fn generate(&self, ctx: &FeedbackContext) -> Result<String, GenerationError>;
}

/// Local deterministic summary built from task scores. Used when no model is
/// configured.
#[derive(Clone, Debug, Default)]
pub struct TemplateFeedback;

#[async_trait]
impl FeedbackBackend for TemplateFeedback {
  fn name(&self) -> &'static str {
    "template"
  }

  async fn generate(&self, ctx: &FeedbackContext) -> Result<String, GenerationError> {
    let scored: Vec<&TaskSummary> = ctx.tasks.iter().filter(|t| t.score.is_some()).collect();
    let best = scored.iter().max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
    let worst = scored.iter().min_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut out = format!(
      "[{}] You completed \"{}\" ({}) with an average score of {:.0}.",
      ctx.language_name,
      ctx.scenario_title,
      ctx.mode.as_str(),
      ctx.total_score
    );
    if let Some(best) = best {
      out.push_str(&format!(" Strongest task: {} ({:.0}).", best.title, best.score.unwrap_or_default()));
    }
    match worst {
      Some(worst) if scored.len() > 1 => {
        out.push_str(&format!(" Worth revisiting: {} ({:.0}).", worst.title, worst.score.unwrap_or_default()))
      }
      _ => {}
    }
    Ok(out)
  }
}

pub struct FeedbackGenerator {
  repos: Repositories,
  backend: Arc<dyn FeedbackBackend>,
  limiter: Arc<RateLimiter>,
  in_flight: InFlightSet,
  timeout: Duration,
}

impl FeedbackGenerator {
  pub fn new(repos: Repositories, backend: Arc<dyn FeedbackBackend>, limiter: Arc<RateLimiter>, timeout: Duration) -> Self {
    Self { repos, backend, limiter, in_flight: InFlightSet::new(), timeout }
  }

  pub fn backend_name(&self) -> &'static str {
    self.backend.name()
  }

  pub fn in_flight(&self) -> &InFlightSet {
    &self.in_flight
  }

  pub fn is_pending(&self, program_id: &str, language: &str) -> bool {
    self.in_flight.is_held(&feedback_key(program_id, language))
  }

  /// Whether `caller` could start a generation now. Records nothing.
  pub fn generation_admission(&self, caller: &str) -> RateLimitDecision {
    self.limiter.peek(&generation_client(caller), RateLimitCategory::AiGeneration)
  }

  #[instrument(
    level = "info",
    skip(self, req),
    fields(program_id = %req.program_id, language = %req.language, force = req.force_regenerate, %caller)
  )]
  pub async fn generate_feedback(&self, req: &FeedbackRequest, caller: &str) -> Result<FeedbackOutcome, AppError> {
    validate_language(&req.language)?;
    let program = self.load_program(req, caller).await?;
    if !req.force_regenerate {
      if let Some(existing) = program.valid_feedback(&req.language) {
        return Ok(FeedbackOutcome::Existing(existing.clone()));
      }
    }

    let key = feedback_key(&req.program_id, &req.language);
    let Some(_guard) = self.in_flight.try_acquire(key.as_str()) else {
      debug!(target: "feedback", %key, "generation already in flight");
      return Ok(FeedbackOutcome::InProgress);
    };

    // Another caller may have finished between the first read and the claim.
    if !req.force_regenerate {
      let program = self.load_program(req, caller).await?;
      if let Some(existing) = program.valid_feedback(&req.language) {
        return Ok(FeedbackOutcome::Existing(existing.clone()));
      }
    }

    let decision = self.limiter.check(&generation_client(caller), RateLimitCategory::AiGeneration);
    if !decision.allowed {
      warn!(target: "feedback", %key, retry_after = ?decision.retry_after, "generation rate limited");
      return Err(AppError::rate_limited(&decision));
    }

    let ctx = self.context(&program, &req.language).await?;
    let started = std::time::Instant::now();
    let content = match tokio::time::timeout(self.timeout, self.backend.generate(&ctx)).await {
      Ok(Ok(content)) if !content.trim().is_empty() => content.trim().to_string(),
      Ok(Ok(_)) => return Err(self.failed(&key, GenerationError::Empty)),
      Ok(Err(e)) => return Err(self.failed(&key, e)),
      Err(_) => return Err(self.failed(&key, GenerationError::Timeout(self.timeout))),
    };

    let entry = FeedbackEntry::valid(content, Utc::now());
    self
      .repos
      .programs
      .update(&req.program_id, ProgramPatch { feedback: Some((req.language.clone(), entry.clone())), ..Default::default() })
      .await?;

    info!(
      target: "feedback",
      %key,
      backend = self.backend.name(),
      elapsed = ?started.elapsed(),
      chars = entry.content.chars().count(),
      "feedback generated"
    );
    Ok(FeedbackOutcome::Generated(entry))
  }

  fn failed(&self, key: &str, e: GenerationError) -> AppError {
    warn!(target: "feedback", %key, backend = self.backend.name(), error = %e, "feedback generation failed; nothing written");
    AppError::Upstream(e.to_string())
  }

  async fn load_program(&self, req: &FeedbackRequest, caller: &str) -> Result<Program, AppError> {
    let program = self
      .repos
      .programs
      .find_by_id(&req.program_id)
      .await?
      .ok_or_else(|| AppError::not_found("program", req.program_id.as_str()))?;
    if !program.is_owned_by(caller) {
      return Err(AppError::Forbidden { program_id: req.program_id.clone() });
    }
    if program.scenario_id != req.scenario_id {
      return Err(AppError::validation(format!(
        "program {} does not belong to scenario {}",
        req.program_id, req.scenario_id
      )));
    }
    if program.status != ProgramStatus::Completed {
      return Err(AppError::conflict(format!("program {} is {}, not completed", program.id, program.status)));
    }
    Ok(program)
  }

  async fn context(&self, program: &Program, language: &str) -> Result<FeedbackContext, AppError> {
    let scenario = self.repos.scenarios.find_by_id(&program.scenario_id).await?;
    let tasks = self.repos.tasks.find_by_program(&program.id).await?;
    let ids: Vec<String> = tasks.iter().filter_map(|t| t.evaluation_id.clone()).collect();
    let evaluations = if ids.is_empty() { Vec::new() } else { self.repos.evaluations.find_by_ids(&ids).await? };

    let summaries = tasks
      .iter()
      .map(|t| TaskSummary {
        index: t.index,
        title: t.title.clone(),
        kind: t.kind,
        score: t.score,
        evaluator_notes: t
          .evaluation_id
          .as_ref()
          .and_then(|id| evaluations.iter().find(|e| &e.id == id))
          .map(|e| e.feedback.clone()),
      })
      .collect();

    let completed = tasks.iter().filter(|t| t.is_completed()).count();
    Ok(FeedbackContext {
      program_id: program.id.clone(),
      language: language.to_string(),
      language_name: language_name(language).to_string(),
      scenario_title: scenario.map(|s| s.title).unwrap_or_else(|| program.scenario_id.clone()),
      mode: program.mode,
      total_score: mean_score(&tasks),
      completion_rate: completion_rate(completed, tasks.len()),
      tasks: summaries,
    })
  }
}

/// Generation windows are kept apart from the per-request HTTP windows.
fn generation_client(caller: &str) -> String {
  format!("generation:{caller}")
}

pub fn feedback_key(program_id: &str, language: &str) -> String {
  format!("{program_id}:{language}")
}

/// Language codes are 2 to 10 ASCII letters or `-`.
pub fn validate_language(code: &str) -> Result<(), AppError> {
  let ok = (2..=10).contains(&code.len()) && code.chars().all(|c| c.is_ascii_alphabetic() || c == '-');
  if ok {
    Ok(())
  } else {
    Err(AppError::validation(format!("unsupported language code '{code}'")))
  }
}

pub fn language_name(code: &str) -> &str {
  match code {
    "en" => "English",
    "zh" | "zhCN" | "zh-CN" => "Simplified Chinese",
    "zhTW" | "zh-TW" => "Traditional Chinese",
    "ja" => "Japanese",
    "ko" => "Korean",
    "es" => "Spanish",
    "fr" => "French",
    "de" => "German",
    "pt" => "Portuguese",
    "it" => "Italian",
    "ru" => "Russian",
    "ar" => "Arabic",
    "id" => "Indonesian",
    "th" => "Thai",
    other => other,
  }
}
