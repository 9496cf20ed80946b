//! Fixtures shared by unit tests across modules.

use std::collections::BTreeMap;

use crate::domain::{EvaluationData, LearningMode, Scenario, TaskTemplate, TaskType};
use crate::repository::{QueryCounter, Repositories};

pub fn scenario(id: &str, tasks: usize, reward: Option<u32>) -> Scenario {
  Scenario {
    id: id.to_string(),
    title: format!("Scenario {id}"),
    mode: LearningMode::Pbl,
    task_templates: (0..tasks)
      .map(|i| TaskTemplate {
        id: format!("{id}-t{i}"),
        title: format!("Task {i}"),
        kind: if i % 2 == 0 { TaskType::Question } else { TaskType::Analysis },
        instructions: format!("Do step {i}"),
      })
      .collect(),
    completion_reward_xp: reward,
    metadata: BTreeMap::new(),
  }
}

pub fn repos(scenarios: Vec<Scenario>) -> (Repositories, QueryCounter) {
  let counter = QueryCounter::new();
  (Repositories::in_memory(&counter, scenarios), counter)
}

pub fn eval(score: f64) -> EvaluationData {
  EvaluationData { score, feedback: format!("scored {score}"), criteria: BTreeMap::new() }
}
