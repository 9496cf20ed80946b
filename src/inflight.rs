//! Process-local in-flight registry with RAII release.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Clone, Default)]
pub struct InFlightSet {
  held: Arc<DashMap<String, DateTime<Utc>>>,
}

impl InFlightSet {
  pub fn new() -> Self {
    Self::default()
  }

  /// Claim `key`, or `None` when someone already holds it.
  pub fn try_acquire(&self, key: impl Into<String>) -> Option<InFlightGuard> {
    let key = key.into();
    match self.held.entry(key.clone()) {
      Entry::Occupied(_) => None,
      Entry::Vacant(slot) => {
        slot.insert(Utc::now());
        Some(InFlightGuard { held: self.held.clone(), key })
      }
    }
  }

  pub fn is_held(&self, key: &str) -> bool {
    self.held.contains_key(key)
  }

  pub fn is_empty(&self) -> bool {
    self.held.is_empty()
  }

  /// Keys with the instant they were claimed, oldest first.
  pub fn held_keys(&self) -> Vec<(String, DateTime<Utc>)> {
    let mut keys: Vec<_> = self.held.iter().map(|e| (e.key().clone(), *e.value())).collect();
    keys.sort_by_key(|(_, at)| *at);
    keys
  }
}

/// Releases its key when dropped, on every exit path.
pub struct InFlightGuard {
  held: Arc<DashMap<String, DateTime<Utc>>>,
  key: String,
}

impl Drop for InFlightGuard {
  fn drop(&mut self) {
    self.held.remove(&self.key);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn second_acquire_fails_until_release() {
    let set = InFlightSet::new();
    let guard = set.try_acquire("p1:en").expect("first claim");
    assert!(set.try_acquire("p1:en").is_none());
    assert!(set.try_acquire("p1:fr").is_some());
    assert!(set.is_held("p1:en"));

    drop(guard);
    assert!(!set.is_held("p1:en"));
    assert!(set.try_acquire("p1:en").is_some());
  }

  #[test]
  fn guard_is_released_on_panic() {
    let set = InFlightSet::new();
    let cloned = set.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
      let _guard = cloned.try_acquire("k").expect("claim");
      panic!("boom");
    }));
    assert!(result.is_err());
    assert!(set.is_empty());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn exactly_one_concurrent_claimer_wins() {
    let set = InFlightSet::new();
    let barrier = Arc::new(tokio::sync::Barrier::new(16));
    let handles: Vec<_> = (0..16)
      .map(|_| {
        let set = set.clone();
        let barrier = barrier.clone();
        tokio::spawn(async move {
          barrier.wait().await;
          let guard = set.try_acquire("p1:en");
          let won = guard.is_some();
          tokio::time::sleep(std::time::Duration::from_millis(20)).await;
          drop(guard);
          won
        })
      })
      .collect();

    let mut winners = 0;
    for h in handles {
      if h.await.unwrap() {
        winners += 1;
      }
    }
    assert_eq!(winners, 1);
    assert!(set.is_empty());
  }
}
