//! Public protocol structs for the HTTP endpoints (serde ready).
//! Keep this small and stable to evolve backend and frontend independently.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CacheStats;
use crate::domain::{EvaluationData, FeedbackEntry};
use crate::error::AppError;
use crate::feedback::FeedbackOutcome;
use crate::orchestrator::ProgramStatusView;

#[derive(Debug, Serialize)]
pub struct HealthOut {
    pub ok: bool,
    pub version: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProgramIn {
    pub scenario_id: String,
}

impl StartProgramIn {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.scenario_id.trim().is_empty() {
            return Err(AppError::validation("scenarioId must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ProgramQuery {
    pub lang: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramStatusOut {
    #[serde(flatten)]
    pub view: ProgramStatusView,
    pub feedback_pending: bool,
    /// Seconds until feedback generation is admitted again for this caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteTaskIn {
    #[serde(default)]
    pub response: Value,
    pub evaluation_data: EvaluationData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReevaluateIn {
    pub evaluation_data: EvaluationData,
}

/// `programId` is taken from the path; a body value must agree with it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackIn {
    #[serde(default)]
    pub program_id: Option<String>,
    pub scenario_id: String,
    pub language: String,
    #[serde(default)]
    pub force_regenerate: bool,
}

#[derive(Debug, Serialize)]
pub struct FeedbackOut {
    pub success: bool,
    pub feedback: Option<FeedbackEntry>,
    pub status: &'static str,
}

impl From<FeedbackOutcome> for FeedbackOut {
    fn from(outcome: FeedbackOutcome) -> Self {
        let status = outcome.status();
        let feedback = match outcome {
            FeedbackOutcome::Generated(f) | FeedbackOutcome::Existing(f) => Some(f),
            FeedbackOutcome::InProgress => None,
        };
        Self { success: true, feedback, status }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringOut {
    pub status_cache: CacheStats,
    pub scenario_cache: CacheStats,
    pub rate_limit_windows: usize,
    pub feedback_in_flight: Vec<String>,
    pub feedback_backend: &'static str,
    pub locked_programs: usize,
    pub repository_calls: usize,
}

#[derive(Debug, Serialize)]
pub struct ClearCacheOut {
    pub cleared: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn completion_body_uses_camel_case() {
        let body: CompleteTaskIn =
            serde_json::from_str(r#"{"response":{"text":"hi"},"evaluationData":{"score":88,"criteria":{"clarity":4}}}"#)
                .unwrap();
        assert_eq!(body.evaluation_data.score, 88.0);
        assert_eq!(body.evaluation_data.criteria["clarity"], 4.0);
    }

    #[test]
    fn in_progress_feedback_has_no_entry() {
        let out = serde_json::to_value(FeedbackOut::from(FeedbackOutcome::InProgress)).unwrap();
        assert_eq!(out, serde_json::json!({ "success": true, "feedback": null, "status": "in_progress" }));

        let entry = FeedbackEntry::valid("nice", Utc::now());
        let out = FeedbackOut::from(FeedbackOutcome::Existing(entry.clone()));
        assert_eq!(out.feedback, Some(entry));
        assert_eq!(out.status, "existing");
    }
}
