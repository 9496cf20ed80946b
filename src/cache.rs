//! Key/value cache with TTL, stale-while-revalidate and single-flight fetches.
//!
//! Lookup outcome per key:
//! - fresh entry → `HIT`, returned immediately
//! - entry inside its stale window → `STALE`, returned immediately while one
//!   background refresh runs for the key
//! - missing or fully expired → `MISS`, every concurrent caller awaits the same fetch
//!
//! Fetches run in their own tokio task so a caller dropping out never cancels the
//! fetch for the others. Each fetch takes a sequence number when it starts and a
//! result is only written if nothing newer (a later fetch, a `set`, an
//! invalidation) has touched the key since.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError<E> {
  #[error("{0}")]
  Fetch(E),

  #[error("fetch for {key} timed out after {timeout_ms}ms")]
  Timeout { key: String, timeout_ms: u64 },

  #[error("fetch for {key} was aborted")]
  Aborted { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
  Hit,
  Miss,
  Stale,
}

impl CacheStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Hit => "HIT",
      Self::Miss => "MISS",
      Self::Stale => "STALE",
    }
  }
}

pub type StatusObserver = Arc<dyn Fn(&str, CacheStatus) + Send + Sync>;

#[derive(Clone)]
pub struct CacheOptions {
  pub ttl: Duration,
  pub stale_while_revalidate: Duration,
  /// Called once per lookup with the resulting status.
  pub on_status: Option<StatusObserver>,
}

impl CacheOptions {
  pub fn new(ttl: Duration, stale_while_revalidate: Duration) -> Self {
    Self { ttl, stale_while_revalidate, on_status: None }
  }

  pub fn with_observer(mut self, observer: StatusObserver) -> Self {
    self.on_status = Some(observer);
    self
  }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
  pub value: V,
  pub fresh_until: Instant,
  pub stale_until: Instant,
  pub seq: u64,
}

enum Freshness {
  Fresh,
  Stale,
  Expired,
}

impl<V> CacheEntry<V> {
  fn freshness(&self, now: Instant) -> Freshness {
    if now < self.fresh_until {
      Freshness::Fresh
    } else if now < self.stale_until {
      Freshness::Stale
    } else {
      Freshness::Expired
    }
  }
}

/// A value together with how it was served.
#[derive(Debug, Clone)]
pub struct Cached<V> {
  pub value: V,
  pub status: CacheStatus,
}

#[derive(Debug, Clone)]
pub struct CacheStoreConfig {
  /// Upper bound for a single fetcher call.
  pub fetch_timeout: Duration,
  /// Minimum spacing between lazy purges of expired entries.
  pub cleanup_interval: Duration,
}

impl Default for CacheStoreConfig {
  fn default() -> Self {
    Self {
      fetch_timeout: Duration::from_secs(10),
      cleanup_interval: Duration::from_secs(60),
    }
  }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  pub stale: u64,
  pub refreshes: u64,
  pub fetch_failures: u64,
  pub entries: usize,
  pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
  hits: AtomicU64,
  misses: AtomicU64,
  stale: AtomicU64,
  refreshes: AtomicU64,
  fetch_failures: AtomicU64,
}

type FlightFuture<V, E> = Shared<BoxFuture<'static, Result<V, CacheError<E>>>>;

struct Flight<V, E>
where
  V: Clone,
  E: Clone,
{
  seq: u64,
  result: FlightFuture<V, E>,
}

struct Inner<V, E>
where
  V: Clone,
  E: Clone,
{
  entries: DashMap<String, CacheEntry<V>>,
  flights: DashMap<String, Flight<V, E>>,
  /// Invalidation watermarks: writes with a sequence at or below are dropped.
  floors: DashMap<String, (u64, Instant)>,
  seq: AtomicU64,
  epoch: Instant,
  last_sweep_ms: AtomicU64,
  counters: Counters,
  config: CacheStoreConfig,
}

/// Cheap to clone; clones share the same entries.
pub struct CacheStore<V, E>
where
  V: Clone,
  E: Clone,
{
  inner: Arc<Inner<V, E>>,
}

impl<V: Clone, E: Clone> Clone for CacheStore<V, E> {
  fn clone(&self) -> Self {
    Self { inner: Arc::clone(&self.inner) }
  }
}

impl<V, E> CacheStore<V, E>
where
  V: Clone + Send + Sync + 'static,
  E: Clone + Display + Send + Sync + 'static,
{
  pub fn new(config: CacheStoreConfig) -> Self {
    Self {
      inner: Arc::new(Inner {
        entries: DashMap::new(),
        flights: DashMap::new(),
        floors: DashMap::new(),
        seq: AtomicU64::new(0),
        epoch: Instant::now(),
        last_sweep_ms: AtomicU64::new(0),
        counters: Counters::default(),
        config,
      }),
    }
  }

  /// Fresh value for `key`, if any. Stale values are only served through
  /// [`get_with_revalidation`](Self::get_with_revalidation).
  pub fn get(&self, key: &str) -> Option<V> {
    let now = Instant::now();
    self.inner.entries.get(key).and_then(|e| match e.freshness(now) {
      Freshness::Fresh => Some(e.value.clone()),
      _ => None,
    })
  }

  pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
    self.maybe_sweep();
    let seq = self.inner.next_seq();
    self.inner.store(&key.into(), value, ttl, Duration::ZERO, seq);
  }

  pub async fn get_with_revalidation<F, Fut>(
    &self,
    key: &str,
    fetcher: F,
    opts: &CacheOptions,
  ) -> Result<Cached<V>, CacheError<E>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
  {
    self.maybe_sweep();
    let now = Instant::now();
    let snapshot = self.inner.entries.get(key).map(|e| (e.value.clone(), e.freshness(now)));

    match snapshot {
      Some((value, Freshness::Fresh)) => {
        self.report(key, CacheStatus::Hit, opts);
        return Ok(Cached { value, status: CacheStatus::Hit });
      }
      Some((value, Freshness::Stale)) => {
        self.revalidate_in_background(key, fetcher, opts);
        self.report(key, CacheStatus::Stale, opts);
        return Ok(Cached { value, status: CacheStatus::Stale });
      }
      _ => {}
    }

    let flight = match self.inner.flights.entry(key.to_string()) {
      Entry::Occupied(o) => o.get().result.clone(),
      Entry::Vacant(slot) => {
        // a fetch may have landed between the lookup above and taking the slot
        if let Some(value) = self.get(key) {
          self.report(key, CacheStatus::Hit, opts);
          return Ok(Cached { value, status: CacheStatus::Hit });
        }
        let flight = self.launch(key, fetcher, opts);
        let result = flight.result.clone();
        slot.insert(flight);
        result
      }
    };

    self.report(key, CacheStatus::Miss, opts);
    let value = flight.await?;
    Ok(Cached { value, status: CacheStatus::Miss })
  }

  /// Drop the entry and any in-flight registration. Fetches already running for
  /// the key can no longer write their result.
  pub fn invalidate(&self, key: &str) -> bool {
    let floor = self.inner.next_seq();
    self.inner.floors.insert(key.to_string(), (floor, Instant::now()));
    self.inner.flights.remove(key);
    let removed = self.inner.entries.remove(key).is_some();
    debug!(target: "cache", key, removed, "invalidated");
    removed
  }

  pub fn invalidate_prefix(&self, prefix: &str) -> usize {
    let keys: Vec<String> = self
      .inner
      .entries
      .iter()
      .map(|e| e.key().clone())
      .chain(self.inner.flights.iter().map(|f| f.key().clone()))
      .filter(|k| k.starts_with(prefix))
      .collect();
    keys.iter().filter(|k| self.invalidate(k)).count()
  }

  pub fn clear(&self) -> usize {
    self.invalidate_prefix("")
  }

  /// Remove entries past their stale window and watermarks no fetch can race anymore.
  pub fn purge_expired(&self) -> usize {
    let now = Instant::now();
    let before = self.inner.entries.len();
    self.inner.entries.retain(|_, e| now < e.stale_until);
    let horizon = self.inner.config.fetch_timeout;
    self.inner.floors.retain(|_, (_, at)| now.duration_since(*at) <= horizon);
    let purged = before.saturating_sub(self.inner.entries.len());
    if purged > 0 {
      debug!(target: "cache", purged, "expired entries purged");
    }
    purged
  }

  pub fn stats(&self) -> CacheStats {
    let c = &self.inner.counters;
    CacheStats {
      hits: c.hits.load(Ordering::Relaxed),
      misses: c.misses.load(Ordering::Relaxed),
      stale: c.stale.load(Ordering::Relaxed),
      refreshes: c.refreshes.load(Ordering::Relaxed),
      fetch_failures: c.fetch_failures.load(Ordering::Relaxed),
      entries: self.inner.entries.len(),
      in_flight: self.inner.flights.len(),
    }
  }

  fn revalidate_in_background<F, Fut>(&self, key: &str, fetcher: F, opts: &CacheOptions)
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
  {
    if let Entry::Vacant(slot) = self.inner.flights.entry(key.to_string()) {
      self.inner.counters.refreshes.fetch_add(1, Ordering::Relaxed);
      let flight = self.launch(key, fetcher, opts);
      slot.insert(flight);
    }
  }

  fn launch<F, Fut>(&self, key: &str, fetcher: F, opts: &CacheOptions) -> Flight<V, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
  {
    let seq = self.inner.next_seq();
    let inner = Arc::clone(&self.inner);
    let owned_key = key.to_string();
    let (ttl, swr) = (opts.ttl, opts.stale_while_revalidate);
    let timeout = inner.config.fetch_timeout;
    let fetch = fetcher();

    let handle = tokio::spawn(async move {
      let outcome = match tokio::time::timeout(timeout, fetch).await {
        Ok(Ok(value)) => {
          inner.store(&owned_key, value.clone(), ttl, swr, seq);
          Ok(value)
        }
        Ok(Err(e)) => {
          inner.counters.fetch_failures.fetch_add(1, Ordering::Relaxed);
          warn!(target: "cache", key = %owned_key, error = %e, "fetch failed; existing entry left untouched");
          Err(CacheError::Fetch(e))
        }
        Err(_) => {
          inner.counters.fetch_failures.fetch_add(1, Ordering::Relaxed);
          warn!(target: "cache", key = %owned_key, timeout_ms = timeout.as_millis() as u64, "fetch timed out");
          Err(CacheError::Timeout { key: owned_key.clone(), timeout_ms: timeout.as_millis() as u64 })
        }
      };
      inner.flights.remove_if(&owned_key, |_, f| f.seq == seq);
      outcome
    });

    let join_key = key.to_string();
    let result = async move {
      match handle.await {
        Ok(outcome) => outcome,
        Err(_) => Err(CacheError::Aborted { key: join_key }),
      }
    }
    .boxed()
    .shared();

    Flight { seq, result }
  }

  fn report(&self, key: &str, status: CacheStatus, opts: &CacheOptions) {
    let c = &self.inner.counters;
    match status {
      CacheStatus::Hit => c.hits.fetch_add(1, Ordering::Relaxed),
      CacheStatus::Miss => c.misses.fetch_add(1, Ordering::Relaxed),
      CacheStatus::Stale => c.stale.fetch_add(1, Ordering::Relaxed),
    };
    debug!(target: "cache", key, status = status.as_str(), "lookup");
    if let Some(observer) = &opts.on_status {
      observer(key, status);
    }
  }

  fn maybe_sweep(&self) {
    let elapsed = Instant::now().duration_since(self.inner.epoch).as_millis() as u64;
    let last = self.inner.last_sweep_ms.load(Ordering::Relaxed);
    let interval = self.inner.config.cleanup_interval.as_millis() as u64;
    if elapsed.saturating_sub(last) < interval {
      return;
    }
    if self
      .inner
      .last_sweep_ms
      .compare_exchange(last, elapsed, Ordering::AcqRel, Ordering::Relaxed)
      .is_ok()
    {
      self.purge_expired();
    }
  }
}

impl<V, E> Inner<V, E>
where
  V: Clone,
  E: Clone,
{
  fn next_seq(&self) -> u64 {
    self.seq.fetch_add(1, Ordering::AcqRel) + 1
  }

  /// Write `value` unless a newer write or an invalidation already happened.
  fn store(&self, key: &str, value: V, ttl: Duration, swr: Duration, seq: u64) -> bool {
    let now = Instant::now();
    let entry = CacheEntry { value, fresh_until: now + ttl, stale_until: now + ttl + swr, seq };

    let written = match self.entries.entry(key.to_string()) {
      Entry::Occupied(mut o) => {
        if o.get().seq > seq || self.below_floor(key, seq) {
          false
        } else {
          o.insert(entry);
          true
        }
      }
      Entry::Vacant(v) => {
        if self.below_floor(key, seq) {
          false
        } else {
          v.insert(entry);
          true
        }
      }
    };

    if written {
      self.floors.remove_if(key, |_, (floor, _)| *floor < seq);
    } else {
      debug!(target: "cache", key, seq, "discarded out-of-order write");
    }
    written
  }

  fn below_floor(&self, key: &str, seq: u64) -> bool {
    self.floors.get(key).map_or(false, |f| seq <= f.0)
  }
}
