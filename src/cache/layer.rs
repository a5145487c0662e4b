//! TTL request cache with in-flight de-duplication.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::traits::{CacheResult, CacheSource, CacheStats, QueryKey, TtlPolicy};
use crate::error::{Result, SyncError};

type SharedFetch = Shared<BoxFuture<'static, Result<Value>>>;

struct CacheEntry {
  value: Value,
  stored_at: Instant,
  ttl: Duration,
}

impl CacheEntry {
  fn is_fresh(&self, now: Instant) -> bool {
    now < self.stored_at + self.ttl
  }
}

struct InFlight {
  generation: u64,
  future: SharedFetch,
}

#[derive(Default)]
struct CacheState {
  entries: HashMap<String, CacheEntry>,
  in_flight: HashMap<String, InFlight>,
  next_generation: u64,
  stats: CacheStats,
}

impl CacheState {
  /// Record the outcome of the request tagged `generation`.
  ///
  /// A request that was detached by an invalidation neither stores its
  /// value nor clears the marker of a newer request for the same key.
  fn complete(&mut self, key: &str, generation: u64, ttl: Duration, result: &Result<Value>) {
    let current = self.in_flight.get(key).map(|f| f.generation) == Some(generation);
    if !current {
      debug!(key, "dropping result of invalidated request");
      return;
    }
    self.in_flight.remove(key);

    match result {
      Ok(value) => {
        self.entries.insert(
          key.to_string(),
          CacheEntry {
            value: value.clone(),
            stored_at: Instant::now(),
            ttl,
          },
        );
      }
      Err(e) => debug!(key, error = %e, "fetch failed, not caching"),
    }
  }

  fn lookup(&mut self, key: &str, now: Instant) -> Option<(Value, Instant)> {
    match self.entries.get(key) {
      Some(entry) if entry.is_fresh(now) => Some((entry.value.clone(), entry.stored_at)),
      Some(_) => {
        self.entries.remove(key);
        None
      }
      None => None,
    }
  }
}

/// In-memory cache of keyed async fetches.
///
/// - A fresh entry is returned without calling the fetcher.
/// - Concurrent misses for one key share a single request.
/// - Failed fetches are never cached and reach every waiter.
///
/// Values are kept as JSON so one cache holds every resource a dashboard
/// reads. Clones share the same underlying maps.
#[derive(Clone)]
pub struct TtlCache {
  state: Arc<Mutex<CacheState>>,
  policy: TtlPolicy,
}

impl TtlCache {
  pub fn new(policy: TtlPolicy) -> Self {
    Self {
      state: Arc::new(Mutex::new(CacheState::default())),
      policy,
    }
  }

  pub fn policy(&self) -> &TtlPolicy {
    &self.policy
  }

  fn lock(&self) -> MutexGuard<'_, CacheState> {
    lock_state(&self.state)
  }

  /// Fetch `key` through the cache using its tier's TTL.
  pub async fn fetch<K, T, F, Fut>(&self, key: &K, fetcher: F) -> Result<T>
  where
    K: QueryKey,
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let ttl = self.policy.ttl(key.tier());
    debug!(resource = %key.description(), "fetching through cache");
    self.get(&key.cache_key(), ttl, fetcher).await
  }

  /// Return the value for `key`, calling `fetcher` only on a miss with no
  /// request already pending.
  pub async fn get<T, F, Fut>(&self, key: &str, ttl: Duration, fetcher: F) -> Result<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    Ok(self.get_with_source(key, ttl, fetcher).await?.data)
  }

  /// Like [`TtlCache::get`], reporting whether the value came from the
  /// cache, a shared request or this call's own request.
  pub async fn get_with_source<T, F, Fut>(
    &self,
    key: &str,
    ttl: Duration,
    fetcher: F,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    if let Some((value, stored_at)) = self.fresh_value(key) {
      return Ok(CacheResult::from_cache(serde_json::from_value(value)?, stored_at));
    }

    let (future, source) = {
      let mut guard = self.lock();
      let state = &mut *guard;

      if let Some((value, stored_at)) = state.lookup(key, Instant::now()) {
        state.stats.hits += 1;
        drop(guard);
        return Ok(CacheResult::from_cache(serde_json::from_value(value)?, stored_at));
      }

      if let Some(pending) = state.in_flight.get(key) {
        state.stats.joined += 1;
        debug!(key, "joining pending request");
        (pending.future.clone(), CacheSource::InFlight)
      } else {
        state.stats.misses += 1;
        let generation = state.next_generation;
        state.next_generation += 1;

        // Only builds the future; nothing runs until it is polled below.
        let future = self.start_request(key, ttl, generation, fetcher());
        state.in_flight.insert(
          key.to_string(),
          InFlight {
            generation,
            future: future.clone(),
          },
        );
        debug!(key, "cache miss, requesting");
        (future, CacheSource::Network)
      }
    };

    let value = future.await?;
    let data = serde_json::from_value(value)?;
    Ok(match source {
      CacheSource::InFlight => CacheResult::from_in_flight(data),
      _ => CacheResult::from_network(data),
    })
  }

  fn fresh_value(&self, key: &str) -> Option<(Value, Instant)> {
    let mut state = self.lock();
    let found = state.lookup(key, Instant::now());
    if found.is_some() {
      state.stats.hits += 1;
      debug!(key, "cache hit");
    }
    found
  }

  fn start_request<T, Fut>(
    &self,
    key: &str,
    ttl: Duration,
    generation: u64,
    fetch: Fut,
  ) -> SharedFetch
  where
    T: Serialize + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let state: Weak<Mutex<CacheState>> = Arc::downgrade(&self.state);
    let key = key.to_string();

    async move {
      let result = fetch
        .await
        .and_then(|data| serde_json::to_value(data).map_err(SyncError::from));

      if let Some(state) = state.upgrade() {
        lock_state(&state).complete(&key, generation, ttl, &result);
      }
      result
    }
    .boxed()
    .shared()
  }

  /// Read a fresh entry without fetching.
  pub fn peek<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let value = self.lock().lookup(key, Instant::now())?.0;
    serde_json::from_value(value).ok()
  }

  /// Whether a fresh entry exists for `key`.
  pub fn contains(&self, key: &str) -> bool {
    self.lock().lookup(key, Instant::now()).is_some()
  }

  /// Drop the entry for `key` and detach any pending request for it.
  ///
  /// A detached request keeps running and still answers the callers already
  /// waiting on it, but its result is not stored. A `get` issued after this
  /// call starts a new request, so two calls for the same key can be
  /// outstanding at once until the detached one finishes.
  ///
  /// Returns true if an entry or a pending request was removed.
  pub fn invalidate(&self, key: &str) -> bool {
    let mut state = self.lock();
    let had_entry = state.entries.remove(key).is_some();
    let had_request = state.in_flight.remove(key).is_some();
    state.stats.invalidations += 1;
    debug!(key, had_entry, had_request, "invalidated");
    had_entry || had_request
  }

  /// Drop every entry (and pending request) whose key starts with `prefix`.
  /// Pending requests are detached as in [`TtlCache::invalidate`].
  ///
  /// Returns the number of cached entries removed.
  pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
    let mut state = self.lock();
    let before = state.entries.len();
    state.entries.retain(|key, _| !key.starts_with(prefix));
    state.in_flight.retain(|key, _| !key.starts_with(prefix));
    let removed = before - state.entries.len();
    state.stats.invalidations += 1;
    debug!(prefix, removed, "invalidated by prefix");
    removed
  }

  pub fn clear(&self) {
    let mut state = self.lock();
    state.entries.clear();
    state.in_flight.clear();
    state.stats.invalidations += 1;
  }

  /// Remove expired entries. Returns how many were dropped.
  pub fn purge_expired(&self) -> usize {
    let now = Instant::now();
    let mut state = self.lock();
    let before = state.entries.len();
    state.entries.retain(|_, entry| entry.is_fresh(now));
    before - state.entries.len()
  }

  /// Number of stored entries, including expired ones not yet purged.
  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn stats(&self) -> CacheStats {
    self.lock().stats
  }
}

impl Default for TtlCache {
  fn default() -> Self {
    Self::new(TtlPolicy::default())
  }
}

fn lock_state(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::TtlTier;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn counting_fetch(
    counter: &Arc<AtomicU32>,
    value: u32,
    delay: Duration,
  ) -> impl Future<Output = Result<u32>> + Send + 'static {
    let counter = counter.clone();
    async move {
      counter.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(delay).await;
      Ok(value)
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetcher_not_invoked_while_request_pending() {
    let cache = TtlCache::default();
    let invoked = Arc::new(AtomicU32::new(0));
    let ttl = Duration::from_secs(30);

    let fetcher = |value: u32| {
      let invoked = invoked.clone();
      move || {
        invoked.fetch_add(1, Ordering::SeqCst);
        async move {
          tokio::time::sleep(Duration::from_millis(50)).await;
          Ok(value)
        }
      }
    };

    let (a, b) = tokio::join!(
      cache.get::<u32, _, _>("user-tasks:alice", ttl, fetcher(1)),
      cache.get::<u32, _, _>("user-tasks:alice", ttl, fetcher(2)),
    );
    assert_eq!((a, b), (Ok(1), Ok(1)));
    assert_eq!(invoked.load(Ordering::SeqCst), 1);

    let c = cache.get::<u32, _, _>("user-tasks:alice", ttl, fetcher(3)).await;
    assert_eq!(c, Ok(1));
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_gets_share_one_request() {
    let cache = TtlCache::default();
    let calls = Arc::new(AtomicU32::new(0));
    let ttl = Duration::from_secs(30);

    let (a, b) = tokio::join!(
      cache.get_with_source("user-tasks:alice", ttl, || counting_fetch(
        &calls,
        7,
        Duration::from_millis(50)
      )),
      cache.get_with_source("user-tasks:alice", ttl, || counting_fetch(
        &calls,
        8,
        Duration::from_millis(50)
      )),
    );

    let (a, b): (CacheResult<u32>, CacheResult<u32>) = (a.unwrap(), b.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.data, 7);
    assert_eq!(b.data, 7);
    assert_eq!(a.source, CacheSource::Network);
    assert_eq!(b.source, CacheSource::InFlight);
    assert_eq!(cache.stats().joined, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_entry_skips_fetcher() {
    let cache = TtlCache::default();
    let calls = Arc::new(AtomicU32::new(0));
    let ttl = Duration::from_secs(30);

    let first: u32 = cache
      .get("leaderboard:global", ttl, || counting_fetch(&calls, 1, Duration::ZERO))
      .await
      .unwrap();
    let second = cache
      .get_with_source::<u32, _, _>("leaderboard:global", ttl, || {
        counting_fetch(&calls, 2, Duration::ZERO)
      })
      .await
      .unwrap();

    assert_eq!(first, 1);
    assert_eq!(second.data, 1);
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_entry_expires_after_ttl() {
    let cache = TtlCache::default();
    let calls = Arc::new(AtomicU32::new(0));
    let ttl = Duration::from_millis(100);

    let _: u32 = cache
      .get("k", ttl, || counting_fetch(&calls, 1, Duration::ZERO))
      .await
      .unwrap();

    tokio::time::advance(Duration::from_millis(99)).await;
    assert!(cache.contains("k"));

    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(!cache.contains("k"));

    let value: u32 = cache
      .get("k", ttl, || counting_fetch(&calls, 2, Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(value, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_invalidate_forces_refetch() {
    let cache = TtlCache::default();
    let calls = Arc::new(AtomicU32::new(0));
    let ttl = Duration::from_secs(600);

    let _: u32 = cache
      .get("user-tasks:bob", ttl, || counting_fetch(&calls, 1, Duration::ZERO))
      .await
      .unwrap();
    assert!(cache.invalidate("user-tasks:bob"));
    assert!(!cache.invalidate("user-tasks:bob"));

    let value: u32 = cache
      .get("user-tasks:bob", ttl, || counting_fetch(&calls, 2, Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(value, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_invalidate_by_prefix() {
    let cache = TtlCache::default();
    let ttl = Duration::from_secs(600);
    for key in ["user-tasks:alice", "user-tasks:bob", "leaderboard:global"] {
      let _: u32 = cache.get(key, ttl, || async { Ok(1) }).await.unwrap();
    }

    assert_eq!(cache.invalidate_by_prefix("user-tasks:"), 2);
    assert!(!cache.contains("user-tasks:alice"));
    assert!(!cache.contains("user-tasks:bob"));
    assert!(cache.contains("leaderboard:global"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_reaches_all_waiters_and_is_not_cached() {
    let cache = TtlCache::default();
    let calls = Arc::new(AtomicU32::new(0));
    let ttl = Duration::from_secs(30);

    let failing = |calls: &Arc<AtomicU32>| {
      let calls = calls.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err::<u32, _>(SyncError::Network("connection refused".into()))
      }
    };

    let (a, b) = tokio::join!(
      cache.get::<u32, _, _>("k", ttl, || failing(&calls)),
      cache.get::<u32, _, _>("k", ttl, || failing(&calls)),
    );
    assert_eq!(a, Err(SyncError::Network("connection refused".into())));
    assert_eq!(b, Err(SyncError::Network("connection refused".into())));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cache.is_empty());

    let value: u32 = cache
      .get("k", ttl, || counting_fetch(&calls, 5, Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(value, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_detaches_pending_request() {
    let cache = TtlCache::default();
    let calls = Arc::new(AtomicU32::new(0));
    let ttl = Duration::from_secs(30);

    let slow = {
      let cache = cache.clone();
      let calls = calls.clone();
      tokio::spawn(async move {
        cache
          .get::<u32, _, _>("k", ttl, || counting_fetch(&calls, 1, Duration::from_secs(1)))
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;

    cache.invalidate("k");
    let fresh: u32 = cache
      .get("k", ttl, || counting_fetch(&calls, 2, Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(fresh, 2);

    // The detached request still answers its own caller but must not
    // overwrite the newer entry.
    assert_eq!(slow.await.unwrap(), Ok(1));
    assert_eq!(cache.peek::<u32>("k"), Some(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_uses_key_tier() {
    struct Board;
    impl QueryKey for Board {
      fn cache_key(&self) -> String {
        "leaderboard:global".into()
      }
      fn description(&self) -> String {
        "global leaderboard".into()
      }
      fn tier(&self) -> TtlTier {
        TtlTier::Short
      }
    }

    let cache = TtlCache::new(TtlPolicy {
      short: Duration::from_secs(1),
      ..TtlPolicy::default()
    });
    let _: u32 = cache.fetch(&Board, || async { Ok(3) }).await.unwrap();
    assert!(cache.contains("leaderboard:global"));

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(!cache.contains("leaderboard:global"));
    assert_eq!(cache.purge_expired(), 0);
  }
}
