//! Model-backed feedback writer over the OpenAI chat.completions API.
//!
//! Only plain-text completions are requested. Calls are instrumented and log the
//! model, latency and token usage, never prompt or response contents.
//!
//! NOTE: The API key is never logged.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::config::FeedbackPrompts;
use crate::feedback::{FeedbackBackend, FeedbackContext, GenerationError};
use crate::util::{fill_template, trunc_for_log};

#[derive(Clone)]
pub struct OpenAiFeedback {
  client: reqwest::Client,
  api_key: String,
  pub base_url: String,
  pub model: String,
  prompts: FeedbackPrompts,
}

impl OpenAiFeedback {
  /// Construct the backend if we find OPENAI_API_KEY; otherwise return None.
  pub fn from_env(prompts: FeedbackPrompts, timeout: Duration) -> Option<Self> {
    let api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty())?;
    let base_url = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
    let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());

    let client = match reqwest::Client::builder().timeout(timeout).build() {
      Ok(c) => c,
      Err(e) => {
        error!(target: "feedback", error = %e, "Failed to build HTTP client; model backend disabled");
        return None;
      }
    };

    Some(Self { client, api_key, base_url, model, prompts })
  }

  /// System and user messages for one program.
  pub fn render_prompts(&self, ctx: &FeedbackContext) -> (String, String) {
    let total_score = format!("{:.0}", ctx.total_score);
    let task_summaries = ctx.task_summaries();
    let pairs = [
      ("language", ctx.language_name.as_str()),
      ("scenario_title", ctx.scenario_title.as_str()),
      ("task_summaries", task_summaries.as_str()),
      ("total_score", total_score.as_str()),
    ];
    (fill_template(&self.prompts.system, &pairs), fill_template(&self.prompts.user_template, &pairs))
  }

  #[instrument(level = "info", skip(self, system, user), fields(model = %self.model))]
  async fn chat_plain(&self, system: &str, user: &str, temperature: f32) -> Result<String, GenerationError> {
    let url = format!("{}/chat/completions", self.base_url);
    let req = ChatCompletionRequest {
      model: self.model.clone(),
      messages: vec![
        ChatMessageReq { role: "system".into(), content: system.into() },
        ChatMessageReq { role: "user".into(), content: user.into() },
      ],
      temperature,
      max_tokens: Some(600),
    };

    let start = std::time::Instant::now();
    let res = self
      .client
      .post(&url)
      .header(USER_AGENT, concat!("progress-engine/", env!("CARGO_PKG_VERSION")))
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(&req)
      .send()
      .await
      .map_err(|e| GenerationError::Request(e.to_string()))?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let msg = extract_openai_error(&body).unwrap_or_else(|| trunc_for_log(&body, 200));
      return Err(GenerationError::Request(format!("OpenAI HTTP {status}: {msg}")));
    }

    let body: ChatCompletionResponse = res.json().await.map_err(|e| GenerationError::Request(e.to_string()))?;
    if let Some(usage) = &body.usage {
      info!(
        target: "feedback",
        elapsed = ?start.elapsed(),
        prompt_tokens = ?usage.prompt_tokens,
        completion_tokens = ?usage.completion_tokens,
        total_tokens = ?usage.total_tokens,
        "OpenAI usage"
      );
    }
    let text = body
      .choices
      .first()
      .and_then(|c| c.message.content.clone())
      .unwrap_or_default()
      .trim()
      .to_string();

    if text.is_empty() {
      return Err(GenerationError::Empty);
    }
    Ok(text)
  }
}

#[async_trait]
impl FeedbackBackend for OpenAiFeedback {
  fn name(&self) -> &'static str {
    "openai"
  }

  #[instrument(level = "info", skip(self, ctx), fields(program_id = %ctx.program_id, language = %ctx.language, tasks = ctx.tasks.len()))]
  async fn generate(&self, ctx: &FeedbackContext) -> Result<String, GenerationError> {
    let (system, user) = self.render_prompts(ctx);
    self.chat_plain(&system, &user, 0.4).await
  }
}

// --- OpenAI DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
  model: String,
  messages: Vec<ChatMessageReq>,
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  max_tokens: Option<u32>,
}
#[derive(Serialize)]
struct ChatMessageReq { role: String, content: String }

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice { message: ChatMessageResp }
#[derive(Deserialize)]
struct ChatMessageResp { content: Option<String> }
#[derive(Deserialize)]
struct Usage {
  #[serde(default)] prompt_tokens: Option<u32>,
  #[serde(default)] completion_tokens: Option<u32>,
  #[serde(default)] total_tokens: Option<u32>,
}

/// Try to extract a clean error message from an OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  serde_json::from_str::<EWrap>(body).ok().map(|w| w.error.message)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{LearningMode, TaskType};
  use crate::feedback::TaskSummary;

  fn backend() -> OpenAiFeedback {
    OpenAiFeedback {
      client: reqwest::Client::new(),
      api_key: "sk-test".into(),
      base_url: "http://127.0.0.1:9".into(),
      model: "gpt-test".into(),
      prompts: FeedbackPrompts {
        system: "Reply in {language}.".into(),
        user_template: "{scenario_title} / {total_score}\n{task_summaries}".into(),
      },
    }
  }

  #[test]
  fn prompts_are_filled_from_context() {
    let ctx = FeedbackContext {
      program_id: "p1".into(),
      language: "zhTW".into(),
      language_name: "Traditional Chinese".into(),
      scenario_title: "Budget planning".into(),
      mode: LearningMode::Pbl,
      total_score: 72.4,
      completion_rate: 100.0,
      tasks: vec![TaskSummary { index: 0, title: "Plan".into(), kind: TaskType::Creation, score: Some(72.4), evaluator_notes: None }],
    };
    let (system, user) = backend().render_prompts(&ctx);
    assert_eq!(system, "Reply in Traditional Chinese.");
    assert_eq!(user, "Budget planning / 72\n1. Plan (72)");
  }

  #[test]
  fn error_bodies_are_unwrapped() {
    let body = r#"{"error":{"message":"Rate limit reached","type":"requests"}}"#;
    assert_eq!(extract_openai_error(body).as_deref(), Some("Rate limit reached"));
    assert_eq!(extract_openai_error("<html>bad gateway</html>"), None);
  }
}
