//! Application state: repositories, engine components, read caches and the
//! feedback backend.
//!
//! This module owns:
//!   - the repository gateway (in-memory, seeded with the scenario catalog)
//!   - the program orchestrator and feedback generator
//!   - the request rate limiter
//!   - read-through caches for program status and scenarios
//!
//! Every write that can change a program's status view goes through a wrapper
//! here that invalidates the cached view afterwards.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheOptions, CacheStatus, CacheStore, Cached};
use crate::config::{load_engine_config_from_env, EngineConfig};
use crate::domain::{EvaluationData, Program, ProgramStatus, Scenario};
use crate::error::AppError;
use crate::feedback::{validate_language, FeedbackBackend, FeedbackGenerator, FeedbackOutcome, FeedbackRequest, TemplateFeedback};
use crate::openai::OpenAiFeedback;
use crate::orchestrator::{
    CompleteTask, ProgramCompletion, ProgramOrchestrator, ProgramStatusView, ReconcileReport, Reevaluation, TaskCompletion,
};
use crate::protocol::{MonitoringOut, ProgramStatusOut};
use crate::rate_limit::RateLimiter;
use crate::repository::{QueryCounter, Repositories};
use crate::seeds::seed_scenarios;

pub fn status_key(program_id: &str) -> String {
    format!("program-status:{program_id}")
}

pub fn scenario_key(scenario_id: &str) -> String {
    format!("scenario:{scenario_id}")
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub repos: Repositories,
    pub queries: QueryCounter,
    pub orchestrator: Arc<ProgramOrchestrator>,
    pub feedback: Arc<FeedbackGenerator>,
    pub limiter: Arc<RateLimiter>,
    pub status_cache: CacheStore<ProgramStatusView, AppError>,
    pub scenario_cache: CacheStore<Scenario, AppError>,
    status_opts: CacheOptions,
    scenario_opts: CacheOptions,
}

impl AppState {
    /// Build state from env: load config, seed scenarios, pick the feedback backend.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> Self {
        let config = load_engine_config_from_env().unwrap_or_default();

        let backend: Arc<dyn FeedbackBackend> =
            match OpenAiFeedback::from_env(config.feedback.prompts.clone(), config.feedback.timeout()) {
                Some(oa) => {
                    info!(target: "progress_engine", base_url = %oa.base_url, model = %oa.model, "OpenAI feedback enabled.");
                    Arc::new(oa)
                }
                None => {
                    info!(target: "progress_engine", "OpenAI disabled (no OPENAI_API_KEY). Using template feedback.");
                    Arc::new(TemplateFeedback)
                }
            };

        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: EngineConfig, backend: Arc<dyn FeedbackBackend>) -> Self {
        // Config scenarios first; seeds never overwrite a configured id.
        let mut scenarios = config.scenarios.clone();
        for seed in seed_scenarios() {
            if !scenarios.iter().any(|s| s.id == seed.id) {
                scenarios.push(seed);
            }
        }
        for s in &scenarios {
            info!(target: "progress_engine", id = %s.id, mode = s.mode.as_str(), tasks = s.task_templates.len(), "Scenario available");
        }

        let queries = QueryCounter::new();
        let repos = Repositories::in_memory(&queries, scenarios);
        let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
        let orchestrator = Arc::new(ProgramOrchestrator::new(repos.clone()));
        let feedback = Arc::new(FeedbackGenerator::new(repos.clone(), backend, limiter.clone(), config.feedback.timeout()));

        let c = &config.cache;
        let status_opts = CacheOptions::new(
            Duration::from_secs(c.program_status_ttl_secs),
            Duration::from_secs(c.program_status_swr_secs),
        );
        let scenario_opts = CacheOptions::new(Duration::from_secs(c.scenario_ttl_secs), Duration::from_secs(c.scenario_swr_secs));

        Self {
            status_cache: CacheStore::new(c.store_config()),
            scenario_cache: CacheStore::new(c.store_config()),
            config: Arc::new(config),
            repos,
            queries,
            orchestrator,
            feedback,
            limiter,
            status_opts,
            scenario_opts,
        }
    }

    #[instrument(level = "debug", skip(self), fields(%scenario_id))]
    pub async fn scenario(&self, scenario_id: &str) -> Result<Cached<Scenario>, AppError> {
        let repos = self.repos.clone();
        let id = scenario_id.to_string();
        let fetch = move || async move {
            repos
                .scenarios
                .find_by_id(&id)
                .await?
                .ok_or_else(|| AppError::not_found("scenario", id.as_str()))
        };
        Ok(self.scenario_cache.get_with_revalidation(&scenario_key(scenario_id), fetch, &self.scenario_opts).await?)
    }

    /// Cached status view for the owner. Reading a completed program in a
    /// language without feedback starts generation in the background.
    #[instrument(level = "info", skip(self), fields(%program_id, %caller, ?language))]
    pub async fn program_status(
        &self,
        program_id: &str,
        caller: &str,
        language: Option<&str>,
    ) -> Result<(ProgramStatusOut, CacheStatus), AppError> {
        if let Some(lang) = language {
            validate_language(lang)?;
        }

        let orchestrator = self.orchestrator.clone();
        let id = program_id.to_string();
        let fetch = move || async move { orchestrator.load_program_status(&id).await };
        let cached = self.status_cache.get_with_revalidation(&status_key(program_id), fetch, &self.status_opts).await?;

        let view = cached.value;
        if !view.program.is_owned_by(caller) {
            warn!(target: "progress", %program_id, %caller, "ownership mismatch on status read");
            return Err(AppError::Forbidden { program_id: program_id.to_string() });
        }

        let (feedback_pending, retry_after) = match language {
            Some(lang) => self.ensure_feedback(&view.program, lang, caller),
            None => (false, None),
        };
        Ok((ProgramStatusOut { view, feedback_pending, retry_after }, cached.status))
    }

    /// Whether feedback for `language` is being generated after this call, and
    /// the retry delay when the caller's generation window is exhausted.
    fn ensure_feedback(&self, program: &Program, language: &str, caller: &str) -> (bool, Option<u64>) {
        if program.status != ProgramStatus::Completed || program.valid_feedback(language).is_some() {
            return (false, None);
        }
        if self.feedback.is_pending(&program.id, language) {
            return (true, None);
        }
        if !self.config.feedback.generate_on_read {
            return (false, None);
        }
        let admission = self.feedback.generation_admission(caller);
        if !admission.allowed {
            debug!(target: "feedback", program_id = %program.id, retry_after = ?admission.retry_after, "background generation deferred");
            return (false, admission.retry_after);
        }

        let state = self.clone();
        let req = FeedbackRequest {
            program_id: program.id.clone(),
            scenario_id: program.scenario_id.clone(),
            language: language.to_string(),
            force_regenerate: false,
        };
        let caller = caller.to_string();
        tokio::spawn(async move {
            match state.generate_feedback(&req, &caller).await {
                Ok(outcome) => debug!(target: "feedback", program_id = %req.program_id, status = outcome.status(), "background generation finished"),
                Err(e) => warn!(target: "feedback", program_id = %req.program_id, error = %e, "background generation failed"),
            }
        });
        (true, None)
    }

    pub async fn generate_feedback(&self, req: &FeedbackRequest, caller: &str) -> Result<FeedbackOutcome, AppError> {
        let outcome = self.feedback.generate_feedback(req, caller).await?;
        if matches!(outcome, FeedbackOutcome::Generated(_)) {
            self.status_cache.invalidate(&status_key(&req.program_id));
        }
        Ok(outcome)
    }

    pub async fn start_program(&self, user_id: &str, scenario_id: &str) -> Result<ProgramStatusView, AppError> {
        self.orchestrator.start_program(user_id, scenario_id).await
    }

    pub async fn start_task(&self, task_id: &str, caller: &str) -> Result<crate::domain::Task, AppError> {
        let task = self.orchestrator.start_task(task_id, caller).await?;
        self.status_cache.invalidate(&status_key(&task.program_id));
        Ok(task)
    }

    pub async fn complete_task(&self, cmd: CompleteTask) -> Result<TaskCompletion, AppError> {
        let completion = self.orchestrator.complete_task(cmd).await?;
        self.status_cache.invalidate(&status_key(&completion.task.program_id));
        Ok(completion)
    }

    pub async fn reevaluate_task(&self, task_id: &str, caller: &str, data: EvaluationData) -> Result<Reevaluation, AppError> {
        let re = self.orchestrator.reevaluate_task(task_id, caller, data).await?;
        self.status_cache.invalidate(&status_key(&re.task.program_id));
        Ok(re)
    }

    pub async fn complete_program(&self, program_id: &str, caller: &str) -> Result<ProgramCompletion, AppError> {
        let completion = self.orchestrator.complete_program(program_id, caller).await?;
        self.status_cache.invalidate(&status_key(program_id));
        Ok(completion)
    }

    pub async fn abandon_program(&self, program_id: &str, caller: &str) -> Result<Program, AppError> {
        let program = self.orchestrator.abandon_program(program_id, caller).await?;
        self.status_cache.invalidate(&status_key(program_id));
        Ok(program)
    }

    pub async fn reconcile_program(&self, program_id: &str) -> Result<ReconcileReport, AppError> {
        let report = self.orchestrator.reconcile_program(program_id).await?;
        self.status_cache.invalidate(&status_key(program_id));
        Ok(report)
    }

    pub fn clear_caches(&self) -> usize {
        let cleared = self.status_cache.clear() + self.scenario_cache.clear();
        info!(target: "cache", cleared, "caches cleared");
        cleared
    }

    /// Periodic housekeeping for the background janitor.
    pub fn purge_expired(&self) -> usize {
        let purged = self.status_cache.purge_expired() + self.scenario_cache.purge_expired();
        self.limiter.sweep(std::time::Instant::now());
        purged
    }

    pub fn monitoring_snapshot(&self) -> MonitoringOut {
        MonitoringOut {
            status_cache: self.status_cache.stats(),
            scenario_cache: self.scenario_cache.stats(),
            rate_limit_windows: self.limiter.tracked_windows(),
            feedback_in_flight: self.feedback.in_flight().held_keys().into_iter().map(|(k, _)| k).collect(),
            feedback_backend: self.feedback.backend_name(),
            locked_programs: self.orchestrator.locked_programs(),
            repository_calls: self.queries.count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{eval, scenario};

    fn state() -> AppState {
        let config = EngineConfig { scenarios: vec![scenario("s1", 2, Some(10))], ..Default::default() };
        AppState::with_backend(config, Arc::new(TemplateFeedback))
    }

    async fn complete_all(state: &AppState, view: &ProgramStatusView, user: &str) {
        for task in &view.tasks {
            state
                .complete_task(CompleteTask {
                    task_id: task.id.clone(),
                    user_id: user.into(),
                    response: serde_json::json!("ok"),
                    evaluation: eval(75.0),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn status_reads_hit_the_cache_until_a_write_invalidates() {
        let state = state();
        let view = state.start_program("u1", "s1").await.unwrap();

        let (_, first) = state.program_status(&view.program.id, "u1", None).await.unwrap();
        let (_, second) = state.program_status(&view.program.id, "u1", None).await.unwrap();
        assert_eq!(first, CacheStatus::Miss);
        assert_eq!(second, CacheStatus::Hit);

        complete_all(&state, &view, "u1").await;
        let (out, third) = state.program_status(&view.program.id, "u1", None).await.unwrap();
        assert_eq!(third, CacheStatus::Miss);
        assert_eq!(out.view.completion_rate, 100.0);
    }

    #[tokio::test]
    async fn cached_views_still_enforce_ownership() {
        let state = state();
        let view = state.start_program("u1", "s1").await.unwrap();
        state.program_status(&view.program.id, "u1", None).await.unwrap();

        let err = state.program_status(&view.program.id, "u2", None).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden { .. }));
    }

    #[tokio::test]
    async fn reading_a_completed_program_starts_feedback_once() {
        let state = state();
        let view = state.start_program("u1", "s1").await.unwrap();
        complete_all(&state, &view, "u1").await;

        let (out, _) = state.program_status(&view.program.id, "u1", Some("en")).await.unwrap();
        assert!(out.feedback_pending);

        // Still reported pending; duplicate spawns resolve through the in-flight guard.
        let (again, _) = state.program_status(&view.program.id, "u1", Some("en")).await.unwrap();
        assert!(again.feedback_pending);

        for _ in 0..100 {
            let program = state.repos.programs.find_by_id(&view.program.id).await.unwrap().unwrap();
            if program.valid_feedback("en").is_some() && !state.feedback.is_pending(&view.program.id, "en") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (out, status) = state.program_status(&view.program.id, "u1", Some("en")).await.unwrap();
        assert_eq!(status, CacheStatus::Miss);
        assert!(!out.feedback_pending);
        assert!(out.view.program.valid_feedback("en").is_some());
    }

    #[tokio::test]
    async fn exhausted_generation_window_reports_retry_instead_of_pending() {
        use crate::rate_limit::{RateLimitConfig, RateLimitSettings};

        let config = EngineConfig {
            scenarios: vec![scenario("s1", 2, Some(10))],
            rate_limits: RateLimitSettings { ai_generation: RateLimitConfig::new(0, 60_000), ..Default::default() },
            ..Default::default()
        };
        let state = AppState::with_backend(config, Arc::new(TemplateFeedback));
        let view = state.start_program("u1", "s1").await.unwrap();
        complete_all(&state, &view, "u1").await;

        for _ in 0..3 {
            let (out, _) = state.program_status(&view.program.id, "u1", Some("en")).await.unwrap();
            assert!(!out.feedback_pending);
            assert_eq!(out.retry_after, Some(60));
            assert!(state.feedback.in_flight().is_empty());
        }
        let program = state.repos.programs.find_by_id(&view.program.id).await.unwrap().unwrap();
        assert!(program.valid_feedback("en").is_none());

        let (out, _) = state.program_status(&view.program.id, "u1", Some("en")).await.unwrap();
        let body = serde_json::to_value(&out).unwrap();
        assert_eq!(body["retryAfter"], 60);
        assert_eq!(body["feedbackPending"], false);
    }

    #[tokio::test]
    async fn invalid_language_is_rejected_before_lookup() {
        let state = state();
        let err = state.program_status("p1", "u1", Some("!!")).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(state.queries.count(), 0);
    }
}
