//! Loading engine configuration (cache windows, rate limits, feedback prompts and
//! an optional scenario bank) from TOML.
//!
//! Every section is optional; missing keys fall back to the defaults below.
//! See `EngineConfig` for the expected schema.

use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info};

use crate::cache::CacheStoreConfig;
use crate::domain::Scenario;
use crate::rate_limit::RateLimitSettings;

#[derive(Clone, Debug, Deserialize, Default)]
pub struct EngineConfig {
  #[serde(default)]
  pub cache: CacheSettings,
  #[serde(default)]
  pub rate_limits: RateLimitSettings,
  #[serde(default)]
  pub feedback: FeedbackSettings,
  /// Scenario bank; the built-in seeds are used when empty.
  #[serde(default)]
  pub scenarios: Vec<Scenario>,
}

/// Freshness windows for the HTTP read paths, in seconds.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
  pub program_status_ttl_secs: u64,
  pub program_status_swr_secs: u64,
  pub scenario_ttl_secs: u64,
  pub scenario_swr_secs: u64,
  pub fetch_timeout_ms: u64,
  pub cleanup_interval_secs: u64,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      program_status_ttl_secs: 30,
      program_status_swr_secs: 300,
      scenario_ttl_secs: 300,
      scenario_swr_secs: 3600,
      fetch_timeout_ms: 10_000,
      cleanup_interval_secs: 60,
    }
  }
}

impl CacheSettings {
  pub fn store_config(&self) -> CacheStoreConfig {
    CacheStoreConfig {
      fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
      cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
    }
  }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FeedbackSettings {
  /// Upper bound for one generation call.
  pub timeout_ms: u64,
  /// Start generation in the background when a completed program is read
  /// without feedback in the requested language.
  pub generate_on_read: bool,
  pub prompts: FeedbackPrompts,
}

impl Default for FeedbackSettings {
  fn default() -> Self {
    Self { timeout_ms: 30_000, generate_on_read: true, prompts: FeedbackPrompts::default() }
  }
}

impl FeedbackSettings {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

/// Prompts used by the model backend. Placeholders: `{language}`,
/// `{scenario_title}`, `{task_summaries}`, `{total_score}`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FeedbackPrompts {
  pub system: String,
  pub user_template: String,
}

impl Default for FeedbackPrompts {
  fn default() -> Self {
    Self {
      system: "You are an encouraging learning coach. Write concise, specific feedback for a learner who just finished a \
               learning program. Reply in {language} only. Plain text, no headings."
        .into(),
      user_template: "Program: {scenario_title}\nAverage score: {total_score}\nTasks (title, score, evaluator notes):\n\
                      {task_summaries}\n\nWrite 3 to 5 sentences: what went well, what to improve, and one next step."
        .into(),
    }
  }
}

/// Attempt to load `EngineConfig` from ENGINE_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_engine_config_from_env() -> Option<EngineConfig> {
  let path = std::env::var("ENGINE_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match toml::from_str::<EngineConfig>(&s) {
      Ok(cfg) => {
        info!(target: "progress_engine", %path, scenarios = cfg.scenarios.len(), "Loaded engine config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "progress_engine", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "progress_engine", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::LearningMode;

  #[test]
  fn empty_document_uses_defaults() {
    let cfg: EngineConfig = toml::from_str("").unwrap();
    assert_eq!(cfg.cache.program_status_ttl_secs, 30);
    assert_eq!(cfg.rate_limits.ai_generation.max_requests, 10);
    assert_eq!(cfg.rate_limits.standard.max_requests, 120);
    assert!(cfg.feedback.prompts.system.contains("{language}"));
    assert!(cfg.scenarios.is_empty());
  }

  #[test]
  fn sections_override_selectively() {
    let cfg: EngineConfig = toml::from_str(
      r#"
        [cache]
        program_status_ttl_secs = 5

        [rate_limits.ai_generation]
        max_requests = 2
        window_ms = 1000

        [feedback]
        timeout_ms = 1500
        generate_on_read = false

        [[scenarios]]
        id = "s-essay"
        title = "Essay writing"
        mode = "assessment"
        completionRewardXp = 40
        taskTemplates = [
          { id = "outline", title = "Outline", type = "creation" },
          { id = "draft", title = "Draft" },
        ]
      "#,
    )
    .unwrap();

    assert_eq!(cfg.cache.program_status_ttl_secs, 5);
    assert_eq!(cfg.cache.program_status_swr_secs, 300);
    assert_eq!(cfg.rate_limits.ai_generation.max_requests, 2);
    assert_eq!(cfg.rate_limits.auth.max_requests, 5);
    assert_eq!(cfg.feedback.timeout(), Duration::from_millis(1500));
    assert!(!cfg.feedback.generate_on_read);
    assert_eq!(cfg.scenarios[0].mode, LearningMode::Assessment);
    assert_eq!(cfg.scenarios[0].task_templates.len(), 2);
    assert_eq!(cfg.scenarios[0].completion_reward_xp, Some(40));
  }
}
