//! Domain models: scenarios, programs, tasks, evaluations and learners, plus the
//! typed patches the repository gateway applies to them.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::repository::{Entity, ProgramOwned};

/// Purpose tag for evaluations produced by task submission.
pub const TASK_COMPLETION: &str = "task_completion";

/// Closed set of learning modes a scenario can run in.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LearningMode {
  /// Problem-based learning: open tasks evaluated against criteria.
  #[default]
  Pbl,
  /// Exploration paths with lighter scoring.
  Discovery,
  /// Graded question sets.
  Assessment,
}

impl LearningMode {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pbl => "pbl",
      Self::Discovery => "discovery",
      Self::Assessment => "assessment",
    }
  }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
  #[default]
  Question,
  Chat,
  Creation,
  Analysis,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplate {
  pub id: String,
  pub title: String,
  #[serde(default, rename = "type")]
  pub kind: TaskType,
  #[serde(default)]
  pub instructions: String,
}

/// Immutable template a program is started from. Created by content ingestion.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
  pub id: String,
  pub title: String,
  #[serde(default)]
  pub mode: LearningMode,
  #[serde(default)]
  pub task_templates: Vec<TaskTemplate>,
  /// XP granted once when a program of this scenario completes.
  #[serde(default)]
  pub completion_reward_xp: Option<u32>,
  #[serde(default)]
  pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProgramStatus {
  Active,
  Completed,
  /// Soft terminal marker; a new attempt starts a new program.
  Abandoned,
}

impl ProgramStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Completed | Self::Abandoned)
  }
}

impl fmt::Display for ProgramStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Active => write!(f, "active"),
      Self::Completed => write!(f, "completed"),
      Self::Abandoned => write!(f, "abandoned"),
    }
  }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
  Pending,
  Active,
  Completed,
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Pending => write!(f, "pending"),
      Self::Active => write!(f, "active"),
      Self::Completed => write!(f, "completed"),
    }
  }
}

/// Qualitative feedback for one language.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEntry {
  pub content: String,
  pub is_valid: bool,
  pub generated_at: DateTime<Utc>,
}

impl FeedbackEntry {
  pub fn valid(content: impl Into<String>, generated_at: DateTime<Utc>) -> Self {
    Self { content: content.into(), is_valid: true, generated_at }
  }
}

/// Language code -> feedback. Always a map, even with a single language.
pub type QualitativeFeedback = BTreeMap<String, FeedbackEntry>;

/// One learner's attempt at a scenario.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Program {
  pub id: String,
  pub scenario_id: String,
  pub user_id: String,
  pub mode: LearningMode,
  pub status: ProgramStatus,
  pub current_task_index: usize,
  pub total_score: f64,
  pub completed_task_count: usize,
  pub total_task_count: usize,
  #[serde(default)]
  pub qualitative_feedback: QualitativeFeedback,
  pub started_at: DateTime<Utc>,
  #[serde(default)]
  pub completed_at: Option<DateTime<Utc>>,
  pub last_activity_at: DateTime<Utc>,
}

impl Program {
  pub fn start(user_id: &str, scenario: &Scenario, now: DateTime<Utc>) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      scenario_id: scenario.id.clone(),
      user_id: user_id.to_string(),
      mode: scenario.mode,
      status: ProgramStatus::Active,
      current_task_index: 0,
      total_score: 0.0,
      completed_task_count: 0,
      total_task_count: scenario.task_templates.len(),
      qualitative_feedback: QualitativeFeedback::new(),
      started_at: now,
      completed_at: None,
      last_activity_at: now,
    }
  }

  pub fn is_owned_by(&self, user_id: &str) -> bool {
    self.user_id == user_id
  }

  /// Feedback already generated and still valid for `language`, if any.
  pub fn valid_feedback(&self, language: &str) -> Option<&FeedbackEntry> {
    self.qualitative_feedback.get(language).filter(|f| f.is_valid)
  }
}

#[derive(Clone, Debug, Default)]
pub struct ProgramPatch {
  pub status: Option<ProgramStatus>,
  pub current_task_index: Option<usize>,
  pub total_score: Option<f64>,
  pub completed_task_count: Option<usize>,
  pub completed_at: Option<DateTime<Utc>>,
  /// Merged under its language key; other languages are kept.
  pub feedback: Option<(String, FeedbackEntry)>,
  pub touched_at: Option<DateTime<Utc>>,
}

impl Entity for Program {
  type Patch = ProgramPatch;
  const KIND: &'static str = "program";

  fn id(&self) -> &str {
    &self.id
  }

  fn apply(&mut self, patch: ProgramPatch) {
    if let Some(status) = patch.status {
      self.status = status;
    }
    if let Some(index) = patch.current_task_index {
      self.current_task_index = index;
    }
    if let Some(score) = patch.total_score {
      self.total_score = score;
    }
    if let Some(count) = patch.completed_task_count {
      self.completed_task_count = count.min(self.total_task_count);
    }
    if let Some(at) = patch.completed_at {
      self.completed_at = Some(at);
    }
    if let Some((language, entry)) = patch.feedback {
      self.qualitative_feedback.insert(language, entry);
    }
    if let Some(at) = patch.touched_at {
      self.last_activity_at = at;
    }
  }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
  pub at: DateTime<Utc>,
  pub role: String,
  pub content: serde_json::Value,
}

impl Interaction {
  pub fn learner(content: serde_json::Value, at: DateTime<Utc>) -> Self {
    Self { at, role: "learner".into(), content }
  }
}

/// Ordered unit of work inside a program.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
  pub id: String,
  pub program_id: String,
  pub template_id: String,
  /// Position in the scenario's template order.
  pub index: usize,
  pub title: String,
  #[serde(rename = "type")]
  pub kind: TaskType,
  pub status: TaskStatus,
  #[serde(default)]
  pub score: Option<f64>,
  #[serde(default)]
  pub interactions: Vec<Interaction>,
  #[serde(default)]
  pub evaluation_id: Option<String>,
  #[serde(default)]
  pub evaluation_revision: u32,
  #[serde(default)]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
  pub fn from_template(program_id: &str, index: usize, template: &TaskTemplate, now: DateTime<Utc>) -> Self {
    let first = index == 0;
    Self {
      id: Uuid::new_v4().to_string(),
      program_id: program_id.to_string(),
      template_id: template.id.clone(),
      index,
      title: template.title.clone(),
      kind: template.kind,
      status: if first { TaskStatus::Active } else { TaskStatus::Pending },
      score: None,
      interactions: Vec::new(),
      evaluation_id: None,
      evaluation_revision: 0,
      started_at: first.then_some(now),
      completed_at: None,
    }
  }

  pub fn is_completed(&self) -> bool {
    self.status == TaskStatus::Completed
  }
}

#[derive(Clone, Debug, Default)]
pub struct TaskPatch {
  pub status: Option<TaskStatus>,
  pub score: Option<f64>,
  pub evaluation_id: Option<String>,
  pub evaluation_revision: Option<u32>,
  pub append_interaction: Option<Interaction>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl Entity for Task {
  type Patch = TaskPatch;
  const KIND: &'static str = "task";

  fn id(&self) -> &str {
    &self.id
  }

  fn apply(&mut self, patch: TaskPatch) {
    if let Some(status) = patch.status {
      self.status = status;
    }
    if let Some(score) = patch.score {
      self.score = Some(score);
    }
    if let Some(id) = patch.evaluation_id {
      self.evaluation_id = Some(id);
    }
    if let Some(revision) = patch.evaluation_revision {
      self.evaluation_revision = revision;
    }
    if let Some(interaction) = patch.append_interaction {
      self.interactions.push(interaction);
    }
    if let Some(at) = patch.started_at {
      self.started_at.get_or_insert(at);
    }
    if let Some(at) = patch.completed_at {
      self.completed_at = Some(at);
    }
  }
}

impl ProgramOwned for Task {
  fn program_id(&self) -> &str {
    &self.program_id
  }

  fn position(&self) -> usize {
    self.index
  }
}

/// Scoring input submitted with a task.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationData {
  pub score: f64,
  #[serde(default)]
  pub feedback: String,
  #[serde(default)]
  pub criteria: BTreeMap<String, f64>,
}

impl EvaluationData {
  pub fn validate(&self) -> Result<(), String> {
    if !self.score.is_finite() || !(0.0..=100.0).contains(&self.score) {
      return Err(format!("score must be within 0..=100, got {}", self.score));
    }
    if let Some((name, _)) = self.criteria.iter().find(|(_, v)| !v.is_finite()) {
      return Err(format!("criterion '{name}' is not a finite number"));
    }
    Ok(())
  }
}

/// Result of scoring one task.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
  pub id: String,
  pub task_id: String,
  pub program_id: String,
  pub user_id: String,
  pub purpose: String,
  pub revision: u32,
  pub score: f64,
  pub feedback: String,
  #[serde(default)]
  pub criteria: BTreeMap<String, f64>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Evaluation {
  /// Deterministic id: one evaluation per (task, purpose, revision).
  pub fn id_for(task_id: &str, purpose: &str, revision: u32) -> String {
    format!("{task_id}:{purpose}:{revision}")
  }

  pub fn for_task(task: &Task, user_id: &str, revision: u32, data: &EvaluationData, now: DateTime<Utc>) -> Self {
    Self {
      id: Self::id_for(&task.id, TASK_COMPLETION, revision),
      task_id: task.id.clone(),
      program_id: task.program_id.clone(),
      user_id: user_id.to_string(),
      purpose: TASK_COMPLETION.to_string(),
      revision,
      score: data.score,
      feedback: data.feedback.clone(),
      criteria: data.criteria.clone(),
      created_at: now,
      updated_at: now,
    }
  }
}

#[derive(Clone, Debug, Default)]
pub struct EvaluationPatch {
  pub score: Option<f64>,
  pub feedback: Option<String>,
  pub criteria: Option<BTreeMap<String, f64>>,
  pub updated_at: Option<DateTime<Utc>>,
}

impl Entity for Evaluation {
  type Patch = EvaluationPatch;
  const KIND: &'static str = "evaluation";

  fn id(&self) -> &str {
    &self.id
  }

  fn apply(&mut self, patch: EvaluationPatch) {
    if let Some(score) = patch.score {
      self.score = score;
    }
    if let Some(feedback) = patch.feedback {
      self.feedback = feedback;
    }
    if let Some(criteria) = patch.criteria {
      self.criteria = criteria;
    }
    if let Some(at) = patch.updated_at {
      self.updated_at = at;
    }
  }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Learner {
  pub id: String,
  pub xp: u64,
}

#[derive(Clone, Copy, Debug)]
pub enum LearnerPatch {
  /// Additive; never overwrites accumulated XP.
  AddXp(u64),
}

impl Entity for Learner {
  type Patch = LearnerPatch;
  const KIND: &'static str = "learner";

  fn id(&self) -> &str {
    &self.id
  }

  fn apply(&mut self, patch: LearnerPatch) {
    match patch {
      LearnerPatch::AddXp(delta) => self.xp = self.xp.saturating_add(delta),
    }
  }
}

impl Entity for Scenario {
  type Patch = Infallible;
  const KIND: &'static str = "scenario";

  fn id(&self) -> &str {
    &self.id
  }

  fn apply(&mut self, patch: Infallible) {
    match patch {}
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn scenario() -> Scenario {
    Scenario {
      id: "s1".into(),
      title: "Intro".into(),
      mode: LearningMode::Pbl,
      task_templates: vec![
        TaskTemplate { id: "t1".into(), title: "One".into(), kind: TaskType::Question, instructions: String::new() },
        TaskTemplate { id: "t2".into(), title: "Two".into(), kind: TaskType::Chat, instructions: String::new() },
      ],
      completion_reward_xp: Some(50),
      metadata: BTreeMap::new(),
    }
  }

  #[test]
  fn feedback_patch_merges_by_language() {
    let now = Utc::now();
    let mut program = Program::start("u1", &scenario(), now);
    program.apply(ProgramPatch { feedback: Some(("en".into(), FeedbackEntry::valid("good", now))), ..Default::default() });
    program.apply(ProgramPatch { feedback: Some(("zhTW".into(), FeedbackEntry::valid("很好", now))), ..Default::default() });

    assert_eq!(program.qualitative_feedback.len(), 2);
    assert_eq!(program.valid_feedback("en").map(|f| f.content.as_str()), Some("good"));
  }

  #[test]
  fn completed_count_is_capped_at_total() {
    let mut program = Program::start("u1", &scenario(), Utc::now());
    program.apply(ProgramPatch { completed_task_count: Some(5), ..Default::default() });
    assert_eq!(program.completed_task_count, 2);
  }

  #[test]
  fn xp_patch_is_additive() {
    let mut learner = Learner { id: "u1".into(), xp: 120 };
    learner.apply(LearnerPatch::AddXp(30));
    learner.apply(LearnerPatch::AddXp(30));
    assert_eq!(learner.xp, 180);
  }

  #[test]
  fn first_task_starts_active() {
    let s = scenario();
    let now = Utc::now();
    let first = Task::from_template("p1", 0, &s.task_templates[0], now);
    let second = Task::from_template("p1", 1, &s.task_templates[1], now);
    assert_eq!(first.status, TaskStatus::Active);
    assert_eq!(first.started_at, Some(now));
    assert_eq!(second.status, TaskStatus::Pending);
  }

  #[test]
  fn evaluation_data_rejects_out_of_range_scores() {
    assert!(EvaluationData { score: 101.0, ..Default::default() }.validate().is_err());
    assert!(EvaluationData { score: f64::NAN, ..Default::default() }.validate().is_err());
    assert!(EvaluationData { score: 88.5, ..Default::default() }.validate().is_ok());
  }
}
