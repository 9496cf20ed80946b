//! Repository gateway: the persistence contract the orchestrator runs on.
//!
//! Batched lookups (`find_by_ids`, `find_by_program`) are part of the contract so
//! assembling a program's full task/evaluation set costs a constant number of
//! calls regardless of how many tasks it has. The in-memory implementation
//! counts every call through a shared [`QueryCounter`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::trace;

use crate::domain::{Evaluation, Learner, Program, Scenario, Task};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
  #[error("{entity} not found: {id}")]
  Missing { entity: &'static str, id: String },

  #[error("{entity} already exists: {id}")]
  Duplicate { entity: &'static str, id: String },
}

/// A persisted record with a typed patch.
pub trait Entity: Clone + Send + Sync + 'static {
  type Patch: Send + 'static;
  const KIND: &'static str;

  fn id(&self) -> &str;
  fn apply(&mut self, patch: Self::Patch);
}

/// Records that belong to a program and have a stable order inside it.
pub trait ProgramOwned: Entity {
  fn program_id(&self) -> &str;
  fn position(&self) -> usize;
}

#[async_trait]
pub trait Repository<E: Entity>: Send + Sync {
  async fn find_by_id(&self, id: &str) -> Result<Option<E>, RepositoryError>;

  /// Rows for `ids` in request order; unknown ids are skipped.
  async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<E>, RepositoryError>;

  async fn create(&self, entity: E) -> Result<E, RepositoryError>;

  async fn create_many(&self, entities: Vec<E>) -> Result<Vec<E>, RepositoryError>;

  async fn update(&self, id: &str, patch: E::Patch) -> Result<E, RepositoryError>;
}

#[async_trait]
pub trait ProgramScoped<E: ProgramOwned>: Repository<E> {
  /// All rows of a program ordered by position.
  async fn find_by_program(&self, program_id: &str) -> Result<Vec<E>, RepositoryError>;
}

/// Shared call counter across repositories.
#[derive(Clone, Debug, Default)]
pub struct QueryCounter(Arc<AtomicUsize>);

impl QueryCounter {
  pub fn new() -> Self {
    Self::default()
  }

  fn record(&self, kind: &'static str, op: &'static str) {
    let n = self.0.fetch_add(1, Ordering::Relaxed) + 1;
    trace!(target: "progress", kind, op, total = n, "repository call");
  }

  pub fn count(&self) -> usize {
    self.0.load(Ordering::Relaxed)
  }

  pub fn reset(&self) {
    self.0.store(0, Ordering::Relaxed);
  }
}

pub struct InMemoryRepository<E> {
  rows: RwLock<HashMap<String, E>>,
  counter: QueryCounter,
}

impl<E: Entity> InMemoryRepository<E> {
  pub fn new(counter: QueryCounter) -> Self {
    Self { rows: RwLock::new(HashMap::new()), counter }
  }

  pub fn with_rows(counter: QueryCounter, rows: impl IntoIterator<Item = E>) -> Self {
    let rows = rows.into_iter().map(|e| (e.id().to_string(), e)).collect();
    Self { rows: RwLock::new(rows), counter }
  }
}

#[async_trait]
impl<E: Entity> Repository<E> for InMemoryRepository<E> {
  async fn find_by_id(&self, id: &str) -> Result<Option<E>, RepositoryError> {
    self.counter.record(E::KIND, "find_by_id");
    Ok(self.rows.read().await.get(id).cloned())
  }

  async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<E>, RepositoryError> {
    self.counter.record(E::KIND, "find_by_ids");
    let rows = self.rows.read().await;
    Ok(ids.iter().filter_map(|id| rows.get(id).cloned()).collect())
  }

  async fn create(&self, entity: E) -> Result<E, RepositoryError> {
    self.counter.record(E::KIND, "create");
    let mut rows = self.rows.write().await;
    if rows.contains_key(entity.id()) {
      return Err(RepositoryError::Duplicate { entity: E::KIND, id: entity.id().to_string() });
    }
    rows.insert(entity.id().to_string(), entity.clone());
    Ok(entity)
  }

  async fn create_many(&self, entities: Vec<E>) -> Result<Vec<E>, RepositoryError> {
    self.counter.record(E::KIND, "create_many");
    let mut rows = self.rows.write().await;
    // all-or-nothing
    if let Some(dup) = entities.iter().find(|e| rows.contains_key(e.id())) {
      return Err(RepositoryError::Duplicate { entity: E::KIND, id: dup.id().to_string() });
    }
    for e in &entities {
      rows.insert(e.id().to_string(), e.clone());
    }
    Ok(entities)
  }

  async fn update(&self, id: &str, patch: E::Patch) -> Result<E, RepositoryError> {
    self.counter.record(E::KIND, "update");
    let mut rows = self.rows.write().await;
    let row = rows
      .get_mut(id)
      .ok_or_else(|| RepositoryError::Missing { entity: E::KIND, id: id.to_string() })?;
    row.apply(patch);
    Ok(row.clone())
  }
}

#[async_trait]
impl<E: ProgramOwned> ProgramScoped<E> for InMemoryRepository<E> {
  async fn find_by_program(&self, program_id: &str) -> Result<Vec<E>, RepositoryError> {
    self.counter.record(E::KIND, "find_by_program");
    let rows = self.rows.read().await;
    let mut owned: Vec<E> = rows.values().filter(|e| e.program_id() == program_id).cloned().collect();
    owned.sort_by_key(|e| e.position());
    Ok(owned)
  }
}

/// The gateway handles the engine depends on.
#[derive(Clone)]
pub struct Repositories {
  pub scenarios: Arc<dyn Repository<Scenario>>,
  pub programs: Arc<dyn Repository<Program>>,
  pub tasks: Arc<dyn ProgramScoped<Task>>,
  pub evaluations: Arc<dyn Repository<Evaluation>>,
  pub learners: Arc<dyn Repository<Learner>>,
}

impl Repositories {
  /// Process-local backing store, seeded with the scenario catalog.
  pub fn in_memory(counter: &QueryCounter, scenarios: Vec<Scenario>) -> Self {
    Self {
      scenarios: Arc::new(InMemoryRepository::with_rows(counter.clone(), scenarios)),
      programs: Arc::new(InMemoryRepository::new(counter.clone())),
      tasks: Arc::new(InMemoryRepository::new(counter.clone())),
      evaluations: Arc::new(InMemoryRepository::new(counter.clone())),
      learners: Arc::new(InMemoryRepository::new(counter.clone())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{LearnerPatch, TaskTemplate};
  use chrono::Utc;

  fn task(program: &str, index: usize) -> Task {
    let tpl = TaskTemplate { id: format!("tpl{index}"), title: format!("Task {index}"), kind: Default::default(), instructions: String::new() };
    Task::from_template(program, index, &tpl, Utc::now())
  }

  #[tokio::test]
  async fn find_by_program_orders_by_position() {
    let counter = QueryCounter::new();
    let repo = InMemoryRepository::<Task>::new(counter.clone());
    repo.create_many(vec![task("p1", 2), task("p1", 0), task("p2", 0), task("p1", 1)]).await.unwrap();

    let tasks = repo.find_by_program("p1").await.unwrap();
    assert_eq!(tasks.iter().map(|t| t.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(counter.count(), 2);
  }

  #[tokio::test]
  async fn find_by_ids_keeps_request_order_and_skips_unknown() {
    let repo = InMemoryRepository::<Task>::new(QueryCounter::new());
    let a = repo.create(task("p1", 0)).await.unwrap();
    let b = repo.create(task("p1", 1)).await.unwrap();

    let found = repo.find_by_ids(&[b.id.clone(), "nope".into(), a.id.clone()]).await.unwrap();
    assert_eq!(found.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), vec![b.id.as_str(), a.id.as_str()]);
  }

  #[tokio::test]
  async fn create_rejects_duplicates() {
    let repo = InMemoryRepository::<Learner>::new(QueryCounter::new());
    repo.create(Learner { id: "u1".into(), xp: 0 }).await.unwrap();
    let err = repo.create(Learner { id: "u1".into(), xp: 5 }).await.unwrap_err();
    assert_eq!(err, RepositoryError::Duplicate { entity: "learner", id: "u1".into() });
  }

  #[tokio::test]
  async fn update_missing_row_is_an_error() {
    let repo = InMemoryRepository::<Learner>::new(QueryCounter::new());
    let err = repo.update("ghost", LearnerPatch::AddXp(10)).await.unwrap_err();
    assert!(matches!(err, RepositoryError::Missing { entity: "learner", .. }));
  }
}
