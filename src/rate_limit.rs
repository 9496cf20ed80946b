//! Sliding-window admission control keyed by client identity and endpoint category.
//!
//! Every (category, client) pair owns an ordered list of request instants. A check
//! prunes instants older than the window, compares the remainder to the limit and
//! records the request when admitted. Windows live only in this process; idle ones
//! are swept lazily once `cleanup_interval_ms` has passed since the last sweep.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitCategory {
  /// Expensive model calls (feedback generation). Strict.
  AiGeneration,
  Auth,
  Admin,
  Standard,
}

impl RateLimitCategory {
  pub const ALL: [RateLimitCategory; 4] = [Self::AiGeneration, Self::Auth, Self::Admin, Self::Standard];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::AiGeneration => "ai_generation",
      Self::Auth => "auth",
      Self::Admin => "admin",
      Self::Standard => "standard",
    }
  }
}

impl fmt::Display for RateLimitCategory {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RateLimitConfig {
  pub max_requests: u32,
  pub window_ms: u64,
}

impl RateLimitConfig {
  pub const fn new(max_requests: u32, window_ms: u64) -> Self {
    Self { max_requests, window_ms }
  }

  pub fn window(&self) -> Duration {
    Duration::from_millis(self.window_ms)
  }
}

/// Per-category limits, loaded from the `[rate_limits]` config section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
  pub ai_generation: RateLimitConfig,
  pub auth: RateLimitConfig,
  pub admin: RateLimitConfig,
  pub standard: RateLimitConfig,
  pub cleanup_interval_ms: u64,
}

impl Default for RateLimitSettings {
  fn default() -> Self {
    Self {
      ai_generation: RateLimitConfig::new(10, 60_000),
      auth: RateLimitConfig::new(5, 60_000),
      admin: RateLimitConfig::new(30, 60_000),
      standard: RateLimitConfig::new(120, 60_000),
      cleanup_interval_ms: 60_000,
    }
  }
}

impl RateLimitSettings {
  pub fn config_for(&self, category: RateLimitCategory) -> RateLimitConfig {
    match category {
      RateLimitCategory::AiGeneration => self.ai_generation,
      RateLimitCategory::Auth => self.auth,
      RateLimitCategory::Admin => self.admin,
      RateLimitCategory::Standard => self.standard,
    }
  }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
  pub allowed: bool,
  pub limit: u32,
  pub remaining: u32,
  /// When the oldest counted request leaves the window.
  pub reset_time: DateTime<Utc>,
  /// Whole seconds to wait, set only on rejection.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub retry_after: Option<u64>,
}

struct Window {
  span: Duration,
  hits: VecDeque<Instant>,
}

pub struct RateLimiter {
  settings: RateLimitSettings,
  windows: DashMap<String, Window>,
  epoch: Instant,
  last_sweep_ms: AtomicU64,
}

impl RateLimiter {
  pub fn new(settings: RateLimitSettings) -> Self {
    Self {
      settings,
      windows: DashMap::new(),
      epoch: Instant::now(),
      last_sweep_ms: AtomicU64::new(0),
    }
  }

  /// Check and record a request of `client_id` against its category limit.
  pub fn check(&self, client_id: &str, category: RateLimitCategory) -> RateLimitDecision {
    let config = self.settings.config_for(category);
    let key = window_key(category.as_str(), client_id);
    let decision = self.check_at(&key, config, Instant::now());
    if !decision.allowed {
      debug!(target: "rate_limit", client_id, %category, retry_after = ?decision.retry_after, "request denied");
    }
    decision
  }

  /// Check with an ad-hoc limit; `client_id` is the window key as given.
  pub fn check_with(&self, client_id: &str, config: RateLimitConfig) -> RateLimitDecision {
    self.check_at(client_id, config, Instant::now())
  }

  /// Decision the next request of `client_id` would get, without recording it.
  pub fn peek(&self, client_id: &str, category: RateLimitCategory) -> RateLimitDecision {
    let config = self.settings.config_for(category);
    self.peek_at(&window_key(category.as_str(), client_id), config, Instant::now())
  }

  pub(crate) fn peek_at(&self, key: &str, config: RateLimitConfig, now: Instant) -> RateLimitDecision {
    let span = config.window();
    let cutoff = now.checked_sub(span);
    let (count, oldest) = self.windows.get(key).map_or((0, None), |w| {
      let mut live = w.hits.iter().filter(|t| cutoff.map_or(true, |c| **t > c));
      let oldest = live.next().copied();
      (oldest.map_or(0, |_| 1 + live.count() as u32), oldest)
    });

    if count < config.max_requests {
      RateLimitDecision {
        allowed: true,
        limit: config.max_requests,
        remaining: config.max_requests - count,
        reset_time: wall_clock(oldest.unwrap_or(now) + span, now),
        retry_after: None,
      }
    } else {
      rejection(config, oldest.map_or(now + span, |t| t + span), now)
    }
  }

  pub(crate) fn check_at(&self, key: &str, config: RateLimitConfig, now: Instant) -> RateLimitDecision {
    self.maybe_sweep(now);

    let span = config.window();
    let mut window = self
      .windows
      .entry(key.to_string())
      .or_insert_with(|| Window { span, hits: VecDeque::new() });
    window.span = span;

    if let Some(cutoff) = now.checked_sub(span) {
      while window.hits.front().map_or(false, |t| *t <= cutoff) {
        window.hits.pop_front();
      }
    }

    let count = window.hits.len() as u32;
    if count < config.max_requests {
      window.hits.push_back(now);
      let oldest = window.hits.front().copied().unwrap_or(now);
      RateLimitDecision {
        allowed: true,
        limit: config.max_requests,
        remaining: config.max_requests - (count + 1),
        reset_time: wall_clock(oldest + span, now),
        retry_after: None,
      }
    } else {
      rejection(config, window.hits.front().map_or(now + span, |t| *t + span), now)
    }
  }

  /// Forget the per-category windows of exactly `client_id`.
  pub fn reset(&self, client_id: &str) -> usize {
    RateLimitCategory::ALL
      .iter()
      .filter(|c| self.windows.remove(&window_key(c.as_str(), client_id)).is_some())
      .count()
  }

  pub fn tracked_windows(&self) -> usize {
    self.windows.len()
  }

  /// Drop windows whose newest request already left the window.
  pub fn sweep(&self, now: Instant) -> usize {
    let before = self.windows.len();
    self.windows.retain(|_, w| {
      w.hits
        .back()
        .map_or(false, |last| now.saturating_duration_since(*last) < w.span)
    });
    let swept = before - self.windows.len();
    if swept > 0 {
      debug!(target: "rate_limit", swept, "idle windows removed");
    }
    swept
  }

  fn maybe_sweep(&self, now: Instant) {
    let elapsed = now.saturating_duration_since(self.epoch).as_millis() as u64;
    let last = self.last_sweep_ms.load(Ordering::Relaxed);
    if elapsed.saturating_sub(last) <= self.settings.cleanup_interval_ms {
      return;
    }
    if self
      .last_sweep_ms
      .compare_exchange(last, elapsed, Ordering::AcqRel, Ordering::Relaxed)
      .is_ok()
    {
      self.sweep(now);
    }
  }
}

fn window_key(category: &str, client_id: &str) -> String {
  format!("{category}:{client_id}")
}

fn rejection(config: RateLimitConfig, free_at: Instant, now: Instant) -> RateLimitDecision {
  RateLimitDecision {
    allowed: false,
    limit: config.max_requests,
    remaining: 0,
    reset_time: wall_clock(free_at, now),
    retry_after: Some(ceil_secs(free_at.saturating_duration_since(now))),
  }
}

fn ceil_secs(d: Duration) -> u64 {
  let ms = d.as_millis() as u64;
  ms.div_ceil(1000).max(1)
}

fn wall_clock(at: Instant, now: Instant) -> DateTime<Utc> {
  let ahead = at.saturating_duration_since(now);
  Utc::now() + chrono::Duration::milliseconds(ahead.as_millis() as i64)
}

/// Paths that are never limited.
const EXCLUDED_PATHS: &[&str] = &["/api/v1/health", "/api/v1/monitoring/**"];

/// First match wins; anything unmatched is `Standard`.
const CATEGORY_PATTERNS: &[(&str, RateLimitCategory)] = &[
  ("/api/v1/programs/*/feedback", RateLimitCategory::AiGeneration),
  ("/api/v1/ai/**", RateLimitCategory::AiGeneration),
  ("/api/v1/auth/**", RateLimitCategory::Auth),
  ("/api/v1/admin/**", RateLimitCategory::Admin),
];

/// Category for a request path, or `None` when the path is excluded.
pub fn category_for_path(path: &str) -> Option<RateLimitCategory> {
  if EXCLUDED_PATHS.iter().any(|p| path_matches(p, path)) {
    return None;
  }
  let category = CATEGORY_PATTERNS
    .iter()
    .find(|(pattern, _)| path_matches(pattern, path))
    .map(|(_, c)| *c)
    .unwrap_or(RateLimitCategory::Standard);
  Some(category)
}

/// Segment glob: `*` matches one segment, a trailing `**` matches the rest.
fn path_matches(pattern: &str, path: &str) -> bool {
  let path = path.trim_end_matches('/');
  let mut want = pattern.split('/');
  let mut have = path.split('/');
  loop {
    match (want.next(), have.next()) {
      (Some("**"), _) => return true,
      (Some("*"), Some(seg)) if !seg.is_empty() => continue,
      (Some(p), Some(seg)) if p == seg => continue,
      (None, None) => return true,
      _ => return false,
    }
  }
}
