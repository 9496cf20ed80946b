//! Built-in scenario catalog so the engine is usable without external config.

use std::collections::BTreeMap;

use crate::domain::{LearningMode, Scenario, TaskTemplate, TaskType};

fn template(id: &str, title: &str, kind: TaskType, instructions: &str) -> TaskTemplate {
  TaskTemplate { id: id.into(), title: title.into(), kind, instructions: instructions.into() }
}

pub fn seed_scenarios() -> Vec<Scenario> {
  vec![
    Scenario {
      id: "pbl-budget-planning".into(),
      title: "Plan a community event budget".into(),
      mode: LearningMode::Pbl,
      task_templates: vec![
        template("research", "Research costs", TaskType::Analysis, "List the main cost items and estimate each one."),
        template("draft", "Draft the budget", TaskType::Creation, "Build a budget table with a 10% contingency."),
        template("review", "Defend your choices", TaskType::Chat, "Explain two trade-offs you made to the organizer."),
      ],
      completion_reward_xp: Some(100),
      metadata: BTreeMap::from([("difficulty".to_string(), "intermediate".to_string())]),
    },
    Scenario {
      id: "discovery-data-literacy".into(),
      title: "Explore everyday data".into(),
      mode: LearningMode::Discovery,
      task_templates: vec![
        template("observe", "Spot a chart", TaskType::Question, "Find a chart in the news and describe what it shows."),
        template("question", "Ask better questions", TaskType::Analysis, "Write three questions the chart cannot answer."),
      ],
      completion_reward_xp: Some(40),
      metadata: BTreeMap::new(),
    },
    Scenario {
      id: "assessment-fundamentals".into(),
      title: "Fundamentals check".into(),
      mode: LearningMode::Assessment,
      task_templates: (1..=4)
        .map(|i| template(&format!("q{i}"), &format!("Question {i}"), TaskType::Question, ""))
        .collect(),
      completion_reward_xp: None,
      metadata: BTreeMap::new(),
    },
  ]
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn seed_ids_are_unique_and_non_empty() {
    let seeds = seed_scenarios();
    let ids: HashSet<&str> = seeds.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids.len(), seeds.len());
    assert!(seeds.iter().all(|s| !s.task_templates.is_empty()));
  }
}
