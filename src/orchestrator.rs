//! Program lifecycle: start, task completion, program completion, abandonment,
//! re-evaluation and repair.
//!
//! Writes to one program are serialized through a keyed async mutex, so two
//! submissions for the same program never interleave while different programs
//! proceed in parallel. Counters are always recomputed from the task rows rather
//! than incremented, which keeps retries and reloads convergent.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{
  Evaluation, EvaluationData, EvaluationPatch, Interaction, Learner, LearnerPatch, Program, ProgramPatch,
  ProgramStatus, Task, TaskPatch, TaskStatus,
};
use crate::error::AppError;
use crate::repository::{Repositories, RepositoryError};

/// Assembled view of one program.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramStatusView {
  pub program: Program,
  pub tasks: Vec<Task>,
  pub evaluations: Vec<Evaluation>,
  pub current_task: Option<Task>,
  pub completion_rate: f64,
}

impl ProgramStatusView {
  fn assemble(program: Program, tasks: Vec<Task>, evaluations: Vec<Evaluation>) -> Self {
    let completed = tasks.iter().filter(|t| t.is_completed()).count();
    let current_task = first_open(&tasks);
    Self { completion_rate: completion_rate(completed, tasks.len()), program, tasks, evaluations, current_task }
  }
}

#[derive(Clone, Debug)]
pub struct CompleteTask {
  pub task_id: String,
  pub user_id: String,
  pub response: Value,
  pub evaluation: EvaluationData,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletion {
  pub task: Task,
  pub evaluation: Evaluation,
  pub next_task: Option<Task>,
  pub program_completed: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramCompletion {
  pub program: Program,
  /// False when the program was already completed.
  pub newly_completed: bool,
  pub xp_awarded: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reevaluation {
  pub task: Task,
  pub evaluation: Evaluation,
  pub previous_revision: u32,
  pub total_score: f64,
}

/// What `reconcile_program` found and changed.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
  pub program_id: String,
  pub status_before: ProgramStatus,
  pub status_after: ProgramStatus,
  pub completed_before: usize,
  pub completed_after: usize,
  pub total_score_before: f64,
  pub total_score_after: f64,
  pub activated_task_id: Option<String>,
  pub xp_awarded: u64,
}

impl ReconcileReport {
  pub fn drifted(&self) -> bool {
    self.status_before != self.status_after
      || self.completed_before != self.completed_after
      || self.activated_task_id.is_some()
      || !same_score(self.total_score_before, self.total_score_after)
  }
}

/// Outcome of advancing a program after its task set changed.
struct Progress {
  program: Program,
  next_task: Option<Task>,
  activated: Option<String>,
  completed: bool,
  xp_awarded: u64,
}

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// Held for the duration of one program write. The table entry is dropped once
/// nobody else is waiting on it.
struct ProgramLock<'a> {
  table: &'a LockTable,
  program_id: String,
  guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ProgramLock<'_> {
  fn drop(&mut self) {
    self.guard.take();
    self.table.remove_if(&self.program_id, |_, m| Arc::strong_count(m) == 1);
  }
}

pub struct ProgramOrchestrator {
  repos: Repositories,
  locks: LockTable,
}

impl ProgramOrchestrator {
  pub fn new(repos: Repositories) -> Self {
    Self { repos, locks: DashMap::new() }
  }

  pub fn repos(&self) -> &Repositories {
    &self.repos
  }

  /// Programs with a write currently holding or awaiting their lock.
  pub fn locked_programs(&self) -> usize {
    self.locks.len()
  }

  #[instrument(level = "info", skip(self), fields(%user_id, %scenario_id))]
  pub async fn start_program(&self, user_id: &str, scenario_id: &str) -> Result<ProgramStatusView, AppError> {
    let scenario = self
      .repos
      .scenarios
      .find_by_id(scenario_id)
      .await?
      .ok_or_else(|| AppError::not_found("scenario", scenario_id))?;

    let now = Utc::now();
    let program = self.repos.programs.create(Program::start(user_id, &scenario, now)).await?;
    let tasks: Vec<Task> = scenario
      .task_templates
      .iter()
      .enumerate()
      .map(|(i, tpl)| Task::from_template(&program.id, i, tpl, now))
      .collect();
    let tasks = self.repos.tasks.create_many(tasks).await?;

    info!(target: "progress", program_id = %program.id, tasks = tasks.len(), mode = program.mode.as_str(), "program started");
    Ok(ProgramStatusView::assemble(program, tasks, Vec::new()))
  }

  /// Full status in at most three gateway calls, regardless of task count.
  #[instrument(level = "debug", skip(self), fields(%program_id, %caller))]
  pub async fn get_program_status(&self, program_id: &str, caller: &str) -> Result<ProgramStatusView, AppError> {
    let program = self.owned_program(program_id, caller).await?;
    self.assemble_status(program).await
  }

  /// Same as [`get_program_status`](Self::get_program_status) without the
  /// ownership check. Results may be shared between callers, who must check
  /// `program.user_id` themselves.
  #[instrument(level = "debug", skip(self), fields(%program_id))]
  pub async fn load_program_status(&self, program_id: &str) -> Result<ProgramStatusView, AppError> {
    let program = self
      .repos
      .programs
      .find_by_id(program_id)
      .await?
      .ok_or_else(|| AppError::not_found("program", program_id))?;
    self.assemble_status(program).await
  }

  async fn assemble_status(&self, program: Program) -> Result<ProgramStatusView, AppError> {
    let tasks = self.repos.tasks.find_by_program(&program.id).await?;
    let ids: Vec<String> = tasks.iter().filter_map(|t| t.evaluation_id.clone()).collect();
    let evaluations = if ids.is_empty() { Vec::new() } else { self.repos.evaluations.find_by_ids(&ids).await? };
    Ok(ProgramStatusView::assemble(program, tasks, evaluations))
  }

  #[instrument(level = "info", skip(self), fields(%task_id, %caller))]
  pub async fn start_task(&self, task_id: &str, caller: &str) -> Result<Task, AppError> {
    let program_id = self.task(task_id).await?.program_id;
    let _lock = self.lock(&program_id).await;

    let program = self.owned_program(&program_id, caller).await?;
    ensure_writable(&program)?;
    let task = self.task(task_id).await?;
    if task.status != TaskStatus::Pending {
      return Ok(task);
    }

    let now = Utc::now();
    let task = self
      .repos
      .tasks
      .update(task_id, TaskPatch { status: Some(TaskStatus::Active), started_at: Some(now), ..Default::default() })
      .await?;
    self.repos.programs.update(&program_id, ProgramPatch { touched_at: Some(now), ..Default::default() }).await?;
    debug!(target: "progress", %task_id, "task activated");
    Ok(task)
  }

  /// Submit a task. Retrying a completed task returns its evaluation unchanged.
  #[instrument(level = "info", skip(self, cmd), fields(task_id = %cmd.task_id, user_id = %cmd.user_id, score = cmd.evaluation.score))]
  pub async fn complete_task(&self, cmd: CompleteTask) -> Result<TaskCompletion, AppError> {
    cmd.evaluation.validate().map_err(AppError::Validation)?;
    let program_id = self.task(&cmd.task_id).await?.program_id;
    let _lock = self.lock(&program_id).await;

    let program = self.owned_program(&program_id, &cmd.user_id).await?;
    if program.status == ProgramStatus::Abandoned {
      return Err(AppError::conflict(format!("program {program_id} was abandoned")));
    }
    let task = self.task(&cmd.task_id).await?;
    let now = Utc::now();

    if task.is_completed() {
      let evaluation = self.current_evaluation(&task).await?;
      let tasks = self.repos.tasks.find_by_program(&program_id).await?;
      let progress = self.advance(program, tasks, now).await?;
      debug!(target: "progress", task_id = %task.id, "task already completed; returning stored evaluation");
      return Ok(TaskCompletion {
        task,
        evaluation,
        next_task: progress.next_task,
        program_completed: progress.program.status == ProgramStatus::Completed,
      });
    }
    if program.status == ProgramStatus::Completed {
      return Err(AppError::conflict(format!("program {program_id} is already completed")));
    }

    let evaluation = self.write_evaluation(Evaluation::for_task(&task, &cmd.user_id, 1, &cmd.evaluation, now)).await?;
    let task = self
      .repos
      .tasks
      .update(
        &task.id,
        TaskPatch {
          status: Some(TaskStatus::Completed),
          score: Some(evaluation.score),
          evaluation_id: Some(evaluation.id.clone()),
          evaluation_revision: Some(evaluation.revision),
          append_interaction: Some(Interaction::learner(cmd.response, now)),
          started_at: Some(now),
          completed_at: Some(now),
        },
      )
      .await?;

    let tasks = self.repos.tasks.find_by_program(&program_id).await?;
    let progress = self.advance(program, tasks, now).await?;
    info!(
      target: "progress",
      task_id = %task.id,
      %program_id,
      completed = progress.program.completed_task_count,
      total = progress.program.total_task_count,
      program_completed = progress.completed,
      "task completed"
    );

    Ok(TaskCompletion { task, evaluation, next_task: progress.next_task, program_completed: progress.completed })
  }

  /// Active -> completed. A second call is a no-op and grants nothing.
  #[instrument(level = "info", skip(self), fields(%program_id, %caller))]
  pub async fn complete_program(&self, program_id: &str, caller: &str) -> Result<ProgramCompletion, AppError> {
    let _lock = self.lock(program_id).await;
    let program = self.owned_program(program_id, caller).await?;
    match program.status {
      ProgramStatus::Completed => Ok(ProgramCompletion { program, newly_completed: false, xp_awarded: 0 }),
      ProgramStatus::Abandoned => Err(AppError::conflict(format!("program {program_id} was abandoned"))),
      ProgramStatus::Active => {
        let tasks = self.repos.tasks.find_by_program(program_id).await?;
        let open = tasks.iter().filter(|t| !t.is_completed()).count();
        if open > 0 {
          return Err(AppError::conflict(format!("{open} task(s) still open in program {program_id}")));
        }
        self.finish_program(program, &tasks, Utc::now()).await
      }
    }
  }

  #[instrument(level = "info", skip(self), fields(%program_id, %caller))]
  pub async fn abandon_program(&self, program_id: &str, caller: &str) -> Result<Program, AppError> {
    let _lock = self.lock(program_id).await;
    let program = self.owned_program(program_id, caller).await?;
    match program.status {
      ProgramStatus::Abandoned => Ok(program),
      ProgramStatus::Completed => Err(AppError::conflict(format!("program {program_id} is already completed"))),
      ProgramStatus::Active => {
        let now = Utc::now();
        let program = self
          .repos
          .programs
          .update(program_id, ProgramPatch { status: Some(ProgramStatus::Abandoned), touched_at: Some(now), ..Default::default() })
          .await?;
        info!(target: "progress", %program_id, "program abandoned");
        Ok(program)
      }
    }
  }

  /// Score a completed task again. The previous evaluation is kept; the task
  /// points at the new revision.
  #[instrument(level = "info", skip(self, data), fields(%task_id, %caller, score = data.score))]
  pub async fn reevaluate_task(&self, task_id: &str, caller: &str, data: EvaluationData) -> Result<Reevaluation, AppError> {
    data.validate().map_err(AppError::Validation)?;
    let program_id = self.task(task_id).await?.program_id;
    let _lock = self.lock(&program_id).await;

    let program = self.owned_program(&program_id, caller).await?;
    if program.status == ProgramStatus::Abandoned {
      return Err(AppError::conflict(format!("program {program_id} was abandoned")));
    }
    let task = self.task(task_id).await?;
    if !task.is_completed() {
      return Err(AppError::conflict(format!("task {task_id} has not been completed yet")));
    }

    let now = Utc::now();
    let previous_revision = task.evaluation_revision;
    let evaluation = self.write_evaluation(Evaluation::for_task(&task, caller, previous_revision + 1, &data, now)).await?;
    let task = self
      .repos
      .tasks
      .update(
        task_id,
        TaskPatch {
          score: Some(evaluation.score),
          evaluation_id: Some(evaluation.id.clone()),
          evaluation_revision: Some(evaluation.revision),
          ..Default::default()
        },
      )
      .await?;

    let tasks = self.repos.tasks.find_by_program(&program_id).await?;
    let total_score = mean_score(&tasks);
    self
      .repos
      .programs
      .update(&program_id, ProgramPatch { total_score: Some(total_score), touched_at: Some(now), ..Default::default() })
      .await?;

    info!(target: "progress", %task_id, revision = evaluation.revision, total_score, "task re-evaluated");
    Ok(Reevaluation { task, evaluation, previous_revision, total_score })
  }

  /// Recompute counters from task rows, activate a missing current task and
  /// complete a program whose tasks are all done.
  #[instrument(level = "info", skip(self), fields(%program_id))]
  pub async fn reconcile_program(&self, program_id: &str) -> Result<ReconcileReport, AppError> {
    let _lock = self.lock(program_id).await;
    let program = self
      .repos
      .programs
      .find_by_id(program_id)
      .await?
      .ok_or_else(|| AppError::not_found("program", program_id))?;
    let tasks = self.repos.tasks.find_by_program(program_id).await?;

    let status_before = program.status;
    let completed_before = program.completed_task_count;
    let total_score_before = program.total_score;

    let (program, activated, xp_awarded) = match program.status {
      ProgramStatus::Abandoned => (program, None, 0),
      ProgramStatus::Completed => {
        let index = tasks.len();
        (self.sync_counters(program, &tasks, index, Utc::now()).await?, None, 0)
      }
      ProgramStatus::Active => {
        let progress = self.advance(program, tasks, Utc::now()).await?;
        (progress.program, progress.activated, progress.xp_awarded)
      }
    };

    let report = ReconcileReport {
      program_id: program_id.to_string(),
      status_before,
      status_after: program.status,
      completed_before,
      completed_after: program.completed_task_count,
      total_score_before,
      total_score_after: program.total_score,
      activated_task_id: activated,
      xp_awarded,
    };
    if report.drifted() {
      warn!(target: "progress", %program_id, ?report, "program drift repaired");
    }
    Ok(report)
  }

  async fn lock(&self, program_id: &str) -> ProgramLock<'_> {
    let mutex = self.locks.entry(program_id.to_string()).or_default().value().clone();
    let guard = mutex.lock_owned().await;
    ProgramLock { table: &self.locks, program_id: program_id.to_string(), guard: Some(guard) }
  }

  async fn task(&self, task_id: &str) -> Result<Task, AppError> {
    self
      .repos
      .tasks
      .find_by_id(task_id)
      .await?
      .ok_or_else(|| AppError::not_found("task", task_id))
  }

  async fn owned_program(&self, program_id: &str, caller: &str) -> Result<Program, AppError> {
    let program = self
      .repos
      .programs
      .find_by_id(program_id)
      .await?
      .ok_or_else(|| AppError::not_found("program", program_id))?;
    if !program.is_owned_by(caller) {
      warn!(target: "progress", %program_id, %caller, "ownership mismatch");
      return Err(AppError::Forbidden { program_id: program_id.to_string() });
    }
    Ok(program)
  }

  async fn current_evaluation(&self, task: &Task) -> Result<Evaluation, AppError> {
    let id = task
      .evaluation_id
      .as_deref()
      .ok_or_else(|| AppError::not_found("evaluation", format!("task {}", task.id)))?;
    self
      .repos
      .evaluations
      .find_by_id(id)
      .await?
      .ok_or_else(|| AppError::not_found("evaluation", id))
  }

  /// Create, or overwrite the row a half-finished earlier attempt left behind.
  async fn write_evaluation(&self, evaluation: Evaluation) -> Result<Evaluation, AppError> {
    match self.repos.evaluations.create(evaluation.clone()).await {
      Ok(created) => Ok(created),
      Err(RepositoryError::Duplicate { .. }) => {
        let patch = EvaluationPatch {
          score: Some(evaluation.score),
          feedback: Some(evaluation.feedback),
          criteria: Some(evaluation.criteria),
          updated_at: Some(evaluation.updated_at),
        };
        Ok(self.repos.evaluations.update(&evaluation.id, patch).await?)
      }
      Err(e) => Err(e.into()),
    }
  }

  async fn advance(&self, program: Program, tasks: Vec<Task>, now: DateTime<Utc>) -> Result<Progress, AppError> {
    let (next_task, activated) = match tasks.iter().find(|t| !t.is_completed()) {
      Some(t) if t.status == TaskStatus::Pending && program.status == ProgramStatus::Active => {
        let activated = self
          .repos
          .tasks
          .update(&t.id, TaskPatch { status: Some(TaskStatus::Active), started_at: Some(now), ..Default::default() })
          .await?;
        let id = activated.id.clone();
        (Some(activated), Some(id))
      }
      Some(t) => (Some(t.clone()), None),
      None => (None, None),
    };

    if next_task.is_none() && !tasks.is_empty() && program.status == ProgramStatus::Active {
      let completion = self.finish_program(program, &tasks, now).await?;
      return Ok(Progress {
        program: completion.program,
        next_task: None,
        activated,
        completed: true,
        xp_awarded: completion.xp_awarded,
      });
    }

    let index = next_task.as_ref().map_or(tasks.len(), |t| t.index);
    let program = self.sync_counters(program, &tasks, index, now).await?;
    Ok(Progress { program, next_task, activated, completed: false, xp_awarded: 0 })
  }

  async fn sync_counters(&self, program: Program, tasks: &[Task], index: usize, now: DateTime<Utc>) -> Result<Program, AppError> {
    let completed = tasks.iter().filter(|t| t.is_completed()).count();
    let total_score = mean_score(tasks);
    if program.completed_task_count == completed
      && program.current_task_index == index
      && same_score(program.total_score, total_score)
    {
      return Ok(program);
    }
    let patch = ProgramPatch {
      completed_task_count: Some(completed),
      current_task_index: Some(index),
      total_score: Some(total_score),
      touched_at: Some(now),
      ..Default::default()
    };
    Ok(self.repos.programs.update(&program.id, patch).await?)
  }

  async fn finish_program(&self, program: Program, tasks: &[Task], now: DateTime<Utc>) -> Result<ProgramCompletion, AppError> {
    let completed = tasks.iter().filter(|t| t.is_completed()).count();
    let patch = ProgramPatch {
      status: Some(ProgramStatus::Completed),
      completed_at: Some(now),
      total_score: Some(mean_score(tasks)),
      completed_task_count: Some(completed),
      current_task_index: Some(tasks.len()),
      touched_at: Some(now),
      ..Default::default()
    };
    let program = self.repos.programs.update(&program.id, patch).await?;
    info!(target: "progress", program_id = %program.id, total_score = program.total_score, "program completed");

    // Status is committed first: a retry sees `completed` and never grants twice.
    let xp_awarded = self.award_xp(&program).await;
    Ok(ProgramCompletion { program, newly_completed: true, xp_awarded })
  }

  async fn award_xp(&self, program: &Program) -> u64 {
    let reward = match self.repos.scenarios.find_by_id(&program.scenario_id).await {
      Ok(scenario) => scenario.and_then(|s| s.completion_reward_xp).unwrap_or(0),
      Err(e) => {
        error!(target: "progress", program_id = %program.id, error = %e, "scenario lookup failed; XP not granted");
        return 0;
      }
    };
    if reward == 0 {
      return 0;
    }

    let xp = u64::from(reward);
    let learners = &self.repos.learners;
    let granted = match learners.update(&program.user_id, LearnerPatch::AddXp(xp)).await {
      Err(RepositoryError::Missing { .. }) => match learners.create(Learner { id: program.user_id.clone(), xp }).await {
        Err(RepositoryError::Duplicate { .. }) => learners.update(&program.user_id, LearnerPatch::AddXp(xp)).await,
        other => other,
      },
      other => other,
    };

    match granted {
      Ok(learner) => {
        info!(target: "progress", user_id = %learner.id, xp, total_xp = learner.xp, "completion XP granted");
        xp
      }
      Err(e) => {
        error!(target: "progress", program_id = %program.id, error = %e, "XP grant failed");
        0
      }
    }
  }
}

fn ensure_writable(program: &Program) -> Result<(), AppError> {
  if program.status.is_terminal() {
    return Err(AppError::conflict(format!("program {} is {}", program.id, program.status)));
  }
  Ok(())
}

fn first_open(tasks: &[Task]) -> Option<Task> {
  tasks.iter().find(|t| !t.is_completed()).cloned()
}

fn same_score(a: f64, b: f64) -> bool {
  (a - b).abs() < 1e-9
}

fn round2(x: f64) -> f64 {
  (x * 100.0).round() / 100.0
}

/// Percentage of completed tasks; 0 for a program without tasks.
pub fn completion_rate(completed: usize, total: usize) -> f64 {
  if total == 0 {
    return 0.0;
  }
  round2(completed.min(total) as f64 / total as f64 * 100.0)
}

/// Mean of the current scores of completed tasks.
pub fn mean_score(tasks: &[Task]) -> f64 {
  let scores: Vec<f64> = tasks.iter().filter(|t| t.is_completed()).filter_map(|t| t.score).collect();
  if scores.is_empty() {
    return 0.0;
  }
  round2(scores.iter().sum::<f64>() / scores.len() as f64)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::{eval, repos, scenario};
  use serde_json::json;

  fn orchestrator(tasks: usize, reward: Option<u32>) -> (Arc<ProgramOrchestrator>, crate::repository::QueryCounter) {
    let (repos, counter) = repos(vec![scenario("s1", tasks, reward)]);
    (Arc::new(ProgramOrchestrator::new(repos)), counter)
  }

  fn submit(task: &Task, user: &str, score: f64) -> CompleteTask {
    CompleteTask {
      task_id: task.id.clone(),
      user_id: user.to_string(),
      response: json!({ "answer": format!("answer for {}", task.title) }),
      evaluation: eval(score),
    }
  }

  #[test]
  fn completion_rate_handles_partial_and_empty() {
    assert_eq!(completion_rate(3, 4), 75.0);
    assert_eq!(completion_rate(0, 0), 0.0);
    assert_eq!(completion_rate(1, 3), 33.33);
    assert_eq!(completion_rate(9, 4), 100.0);
  }

  #[tokio::test]
  async fn start_program_materializes_tasks_in_one_batch() {
    let (orch, counter) = orchestrator(4, None);
    let view = orch.start_program("u1", "s1").await.unwrap();

    assert_eq!(view.tasks.len(), 4);
    assert_eq!(view.program.total_task_count, 4);
    assert_eq!(view.current_task.as_ref().map(|t| t.index), Some(0));
    assert_eq!(view.tasks[0].status, TaskStatus::Active);
    assert!(view.tasks[1..].iter().all(|t| t.status == TaskStatus::Pending));
    // scenario lookup, program create, task create_many
    assert_eq!(counter.count(), 3);
  }

  #[tokio::test]
  async fn unknown_scenario_is_not_found() {
    let (orch, _) = orchestrator(1, None);
    let err = orch.start_program("u1", "nope").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { entity: "scenario", .. }));
  }

  #[tokio::test]
  async fn status_assembly_uses_at_most_three_calls() {
    let (orch, counter) = orchestrator(15, None);
    let view = orch.start_program("u1", "s1").await.unwrap();
    for task in &view.tasks[..14] {
      orch.complete_task(submit(task, "u1", 80.0)).await.unwrap();
    }

    counter.reset();
    let status = orch.get_program_status(&view.program.id, "u1").await.unwrap();
    assert!(counter.count() <= 3, "took {} calls", counter.count());
    assert_eq!(status.evaluations.len(), 14);
    assert_eq!(status.current_task.map(|t| t.index), Some(14));
    assert_eq!(status.completion_rate, 93.33);
  }

  #[tokio::test]
  async fn completion_rate_reflects_completed_tasks() {
    let (orch, _) = orchestrator(4, None);
    let view = orch.start_program("u1", "s1").await.unwrap();
    let fresh = orch.get_program_status(&view.program.id, "u1").await.unwrap();
    assert_eq!(fresh.completion_rate, 0.0);

    for task in &view.tasks[..3] {
      orch.complete_task(submit(task, "u1", 70.0)).await.unwrap();
    }
    let status = orch.get_program_status(&view.program.id, "u1").await.unwrap();
    assert_eq!(status.completion_rate, 75.0);
    assert_eq!(status.program.completed_task_count, 3);
    assert_eq!(status.program.current_task_index, 3);
    assert_eq!(status.tasks[3].status, TaskStatus::Active);
  }

  #[tokio::test]
  async fn completing_a_task_twice_returns_the_same_evaluation() {
    let (orch, _) = orchestrator(3, None);
    let view = orch.start_program("u1", "s1").await.unwrap();
    let task = &view.tasks[0];

    let first = orch.complete_task(submit(task, "u1", 90.0)).await.unwrap();
    let second = orch.complete_task(submit(task, "u1", 10.0)).await.unwrap();

    assert_eq!(first.evaluation, second.evaluation);
    assert_eq!(second.evaluation.score, 90.0);
    assert_eq!(second.task.interactions.len(), 1);
    assert_eq!(first.next_task.as_ref().map(|t| t.index), Some(1));
    assert_eq!(second.next_task.as_ref().map(|t| t.index), Some(1));

    let status = orch.get_program_status(&view.program.id, "u1").await.unwrap();
    assert_eq!(status.program.completed_task_count, 1);
    assert_eq!(status.evaluations.len(), 1);
  }

  #[tokio::test]
  async fn concurrent_submissions_of_one_task_converge() {
    let (orch, counter) = orchestrator(2, None);
    let view = orch.start_program("u1", "s1").await.unwrap();
    let task = view.tasks[0].clone();

    let handles: Vec<_> = (0..8)
      .map(|i| {
        let orch = orch.clone();
        let cmd = submit(&task, "u1", 50.0 + i as f64);
        tokio::spawn(async move { orch.complete_task(cmd).await })
      })
      .collect();
    let mut scores = Vec::new();
    for h in handles {
      scores.push(h.await.unwrap().unwrap().evaluation.score);
    }
    scores.dedup();
    assert_eq!(scores.len(), 1);

    counter.reset();
    let status = orch.get_program_status(&view.program.id, "u1").await.unwrap();
    assert_eq!(status.program.completed_task_count, 1);
    assert_eq!(status.tasks[0].interactions.len(), 1);
    assert_eq!(orch.locked_programs(), 0);
  }

  #[tokio::test]
  async fn last_task_completes_the_program_and_grants_xp_once() {
    let (orch, _) = orchestrator(2, Some(50));
    let view = orch.start_program("u1", "s1").await.unwrap();

    let a = orch.complete_task(submit(&view.tasks[0], "u1", 80.0)).await.unwrap();
    assert!(!a.program_completed);
    let b = orch.complete_task(submit(&view.tasks[1], "u1", 90.0)).await.unwrap();
    assert!(b.program_completed);
    assert!(b.next_task.is_none());

    let again = orch.complete_program(&view.program.id, "u1").await.unwrap();
    assert!(!again.newly_completed);
    assert_eq!(again.xp_awarded, 0);
    assert_eq!(again.program.status, ProgramStatus::Completed);
    assert_eq!(again.program.total_score, 85.0);
    assert!(again.program.completed_at.is_some());

    let learner = orch.repos().learners.find_by_id("u1").await.unwrap().unwrap();
    assert_eq!(learner.xp, 50);
  }

  #[tokio::test]
  async fn xp_is_added_to_existing_learner_balance() {
    let (orch, _) = orchestrator(1, Some(30));
    orch.repos().learners.create(Learner { id: "u1".into(), xp: 100 }).await.unwrap();
    let view = orch.start_program("u1", "s1").await.unwrap();
    orch.complete_task(submit(&view.tasks[0], "u1", 60.0)).await.unwrap();

    let learner = orch.repos().learners.find_by_id("u1").await.unwrap().unwrap();
    assert_eq!(learner.xp, 130);
  }

  #[tokio::test]
  async fn complete_program_rejects_open_tasks() {
    let (orch, _) = orchestrator(2, None);
    let view = orch.start_program("u1", "s1").await.unwrap();
    let err = orch.complete_program(&view.program.id, "u1").await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
  }

  #[tokio::test]
  async fn ownership_mismatch_is_forbidden_and_missing_is_not_found() {
    let (orch, _) = orchestrator(2, None);
    let view = orch.start_program("u1", "s1").await.unwrap();

    let err = orch.get_program_status(&view.program.id, "intruder").await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden { .. }));
    let err = orch.complete_task(submit(&view.tasks[0], "intruder", 10.0)).await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden { .. }));
    let err = orch.get_program_status("missing", "u1").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { entity: "program", .. }));
  }

  #[tokio::test]
  async fn invalid_scores_are_rejected_before_any_write() {
    let (orch, counter) = orchestrator(1, None);
    let view = orch.start_program("u1", "s1").await.unwrap();
    counter.reset();
    let err = orch.complete_task(submit(&view.tasks[0], "u1", 140.0)).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(counter.count(), 0);
  }

  #[tokio::test]
  async fn abandoned_programs_reject_task_writes() {
    let (orch, _) = orchestrator(2, None);
    let view = orch.start_program("u1", "s1").await.unwrap();

    orch.abandon_program(&view.program.id, "u1").await.unwrap();
    let again = orch.abandon_program(&view.program.id, "u1").await.unwrap();
    assert_eq!(again.status, ProgramStatus::Abandoned);

    let err = orch.complete_task(submit(&view.tasks[0], "u1", 50.0)).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    let err = orch.start_task(&view.tasks[1].id, "u1").await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    let err = orch.complete_program(&view.program.id, "u1").await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
  }

  #[tokio::test]
  async fn completed_programs_cannot_be_abandoned() {
    let (orch, _) = orchestrator(1, None);
    let view = orch.start_program("u1", "s1").await.unwrap();
    orch.complete_task(submit(&view.tasks[0], "u1", 50.0)).await.unwrap();
    let err = orch.abandon_program(&view.program.id, "u1").await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
  }

  #[tokio::test]
  async fn start_task_activates_pending_and_is_idempotent() {
    let (orch, _) = orchestrator(3, None);
    let view = orch.start_program("u1", "s1").await.unwrap();

    let started = orch.start_task(&view.tasks[2].id, "u1").await.unwrap();
    assert_eq!(started.status, TaskStatus::Active);
    let stamp = started.started_at;
    let again = orch.start_task(&view.tasks[2].id, "u1").await.unwrap();
    assert_eq!(again.started_at, stamp);
  }

  #[tokio::test]
  async fn reevaluation_appends_a_revision_and_rescores() {
    let (orch, _) = orchestrator(2, None);
    let view = orch.start_program("u1", "s1").await.unwrap();
    let first = orch.complete_task(submit(&view.tasks[0], "u1", 40.0)).await.unwrap();
    orch.complete_task(submit(&view.tasks[1], "u1", 80.0)).await.unwrap();

    let re = orch.reevaluate_task(&view.tasks[0].id, "u1", eval(100.0)).await.unwrap();
    assert_eq!(re.previous_revision, 1);
    assert_eq!(re.evaluation.revision, 2);
    assert_ne!(re.evaluation.id, first.evaluation.id);
    assert_eq!(re.total_score, 90.0);

    let old = orch.repos().evaluations.find_by_id(&first.evaluation.id).await.unwrap().unwrap();
    assert_eq!(old.score, 40.0);
    let status = orch.get_program_status(&view.program.id, "u1").await.unwrap();
    assert_eq!(status.evaluations.iter().map(|e| e.revision).collect::<Vec<_>>(), vec![2, 1]);
    assert_eq!(status.program.total_score, 90.0);
  }

  #[tokio::test]
  async fn reevaluating_an_open_task_conflicts() {
    let (orch, _) = orchestrator(2, None);
    let view = orch.start_program("u1", "s1").await.unwrap();
    let err = orch.reevaluate_task(&view.tasks[0].id, "u1", eval(50.0)).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
  }

  #[tokio::test]
  async fn reconcile_completes_a_program_left_behind() {
    let (orch, _) = orchestrator(2, Some(20));
    let view = orch.start_program("u1", "s1").await.unwrap();
    let repos = orch.repos().clone();
    let now = Utc::now();
    // Simulate task writes that landed without the program bookkeeping.
    for (task, score) in view.tasks.iter().zip([60.0, 100.0]) {
      repos
        .tasks
        .update(
          &task.id,
          TaskPatch { status: Some(TaskStatus::Completed), score: Some(score), completed_at: Some(now), ..Default::default() },
        )
        .await
        .unwrap();
    }

    let report = orch.reconcile_program(&view.program.id).await.unwrap();
    assert!(report.drifted());
    assert_eq!(report.status_before, ProgramStatus::Active);
    assert_eq!(report.status_after, ProgramStatus::Completed);
    assert_eq!(report.completed_after, 2);
    assert_eq!(report.total_score_after, 80.0);
    assert_eq!(report.xp_awarded, 20);

    let clean = orch.reconcile_program(&view.program.id).await.unwrap();
    assert!(!clean.drifted());
    assert_eq!(clean.xp_awarded, 0);
  }

  #[tokio::test]
  async fn reconcile_activates_a_missing_current_task() {
    let (orch, _) = orchestrator(3, None);
    let view = orch.start_program("u1", "s1").await.unwrap();
    orch
      .repos()
      .tasks
      .update(&view.tasks[0].id, TaskPatch { status: Some(TaskStatus::Completed), score: Some(50.0), ..Default::default() })
      .await
      .unwrap();

    let report = orch.reconcile_program(&view.program.id).await.unwrap();
    assert_eq!(report.activated_task_id.as_deref(), Some(view.tasks[1].id.as_str()));
    assert_eq!(report.completed_after, 1);
    assert_eq!(report.status_after, ProgramStatus::Active);
  }
}
