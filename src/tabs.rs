//! Per-tab data controller for dashboards.
//!
//! A dashboard registers each of its tabs with a fetch function that reads
//! through the shared [`TtlCache`]. The controller tracks loading, error and
//! data state per tab, loads a tab the first time it becomes active, and can
//! preload tabs in the background before the user navigates to them.
//!
//! # Example
//!
//! ```ignore
//! let mut tabs = ViewDataController::new("tasks", cache.clone(), TabOptions::default());
//! tabs.register("tasks", TabSource::new(move || fetch_tasks(client.clone())).cached_as(key));
//!
//! tabs.switch_tab("tasks").await?;
//! tabs.preload_tab("leaderboard")?;
//!
//! match tabs.state("tasks") {
//!     Some(TabState { loading: true, .. }) => render_spinner(),
//!     Some(TabState { data: Some(d), .. }) => render(d),
//!     _ => {}
//! }
//! ```
//!
//! Every fetch gets a per-tab sequence number when it starts. A result is
//! only applied if no later-started fetch for the same tab has already been
//! applied, so a slow preload can never overwrite a newer refresh.

use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::error::{Result, SyncError};

/// A factory function that creates futures for fetching a tab's data
type FetcherFn<D> = Arc<dyn Fn() -> BoxFuture<'static, Result<D>> + Send + Sync>;

/// How a tab gets its data.
pub struct TabSource<D> {
  fetcher: FetcherFn<D>,
  cache_key: Option<String>,
}

impl<D: Send + 'static> TabSource<D> {
  /// The fetcher is called each time the tab loads. It is expected to route
  /// through the cache itself.
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<D>> + Send + 'static,
  {
    Self {
      fetcher: Arc::new(move || fetcher().boxed()),
      cache_key: None,
    }
  }

  /// Name the cache key the fetcher reads, so `refresh` can drop it first.
  pub fn cached_as(mut self, key: impl Into<String>) -> Self {
    self.cache_key = Some(key.into());
    self
  }
}

impl<D> Clone for TabSource<D> {
  fn clone(&self) -> Self {
    Self {
      fetcher: Arc::clone(&self.fetcher),
      cache_key: self.cache_key.clone(),
    }
  }
}

/// Observable state of one tab.
#[derive(Debug, Clone)]
pub struct TabState<D> {
  pub id: String,
  pub data: Option<D>,
  pub loading: bool,
  pub error: Option<SyncError>,
  pub last_fetched_at: Option<Instant>,
}

impl<D> TabState<D> {
  fn new(id: &str) -> Self {
    Self {
      id: id.to_string(),
      data: None,
      loading: false,
      error: None,
      last_fetched_at: None,
    }
  }

  /// Whether the tab has data fetched less than `stale_after` ago.
  pub fn is_fresh(&self, stale_after: Duration) -> bool {
    self.data.is_some()
      && self
        .last_fetched_at
        .map(|t| t.elapsed() < stale_after)
        .unwrap_or(false)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabOptions {
  /// Load a tab the first time it is switched to
  pub auto_load: bool,
  /// Refresh a tab every time it is switched to
  pub refresh_on_tab_switch: bool,
  /// How long fetched data counts as fresh for `preload_tab`
  pub stale_after: Duration,
}

impl Default for TabOptions {
  fn default() -> Self {
    Self {
      auto_load: true,
      refresh_on_tab_switch: false,
      stale_after: Duration::from_secs(5 * 60),
    }
  }
}

/// Whether a finished fetch changed the tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
  Applied,
  /// A newer fetch had already been applied
  Discarded,
}

struct TabSlot<D> {
  state: TabState<D>,
  source: TabSource<D>,
  /// Sequence number of the most recently started fetch
  started: u64,
  /// Sequence number of the most recently applied result
  applied: u64,
}

struct ControllerState<D> {
  active: String,
  order: Vec<String>,
  tabs: HashMap<String, TabSlot<D>>,
}

/// Owns the tab registry of one dashboard.
///
/// Clones share state, which is how background preloads report back.
pub struct ViewDataController<D> {
  state: Arc<Mutex<ControllerState<D>>>,
  cache: TtlCache,
  options: TabOptions,
}

impl<D> Clone for ViewDataController<D> {
  fn clone(&self) -> Self {
    Self {
      state: Arc::clone(&self.state),
      cache: self.cache.clone(),
      options: self.options,
    }
  }
}

impl<D: Clone + Send + 'static> ViewDataController<D> {
  pub fn new(initial_tab: impl Into<String>, cache: TtlCache, options: TabOptions) -> Self {
    Self {
      state: Arc::new(Mutex::new(ControllerState {
        active: initial_tab.into(),
        order: Vec::new(),
        tabs: HashMap::new(),
      })),
      cache,
      options,
    }
  }

  /// Builder-style [`ViewDataController::register`].
  pub fn with_tab(self, id: impl Into<String>, source: TabSource<D>) -> Self {
    self.register(id, source);
    self
  }

  /// Register a tab. Registering an existing id replaces its source and
  /// keeps its current state.
  pub fn register(&self, id: impl Into<String>, source: TabSource<D>) {
    let id = id.into();
    let mut state = self.lock();
    if let Some(slot) = state.tabs.get_mut(&id) {
      slot.source = source;
      return;
    }
    state.order.push(id.clone());
    state.tabs.insert(
      id.clone(),
      TabSlot {
        state: TabState::new(&id),
        source,
        started: 0,
        applied: 0,
      },
    );
  }

  pub fn options(&self) -> &TabOptions {
    &self.options
  }

  pub fn cache(&self) -> &TtlCache {
    &self.cache
  }

  pub fn active_tab(&self) -> String {
    self.lock().active.clone()
  }

  /// Registered tab ids in registration order.
  pub fn tab_ids(&self) -> Vec<String> {
    self.lock().order.clone()
  }

  /// Cache key a tab reads, if it declared one.
  pub fn cache_key(&self, id: &str) -> Option<String> {
    self.lock().tabs.get(id)?.source.cache_key.clone()
  }

  /// Make `id` the active tab, loading it if no fetch was ever started for
  /// it.
  ///
  /// Fetch failures are recorded on the tab, not returned. Switching back to
  /// a tab whose fetch failed does not retry it.
  pub async fn switch_tab(&self, id: &str) -> Result<()> {
    enum Next {
      Nothing,
      Load,
      Refresh,
    }

    let next = {
      let mut state = self.lock();
      let slot = state
        .tabs
        .get(id)
        .ok_or_else(|| SyncError::UnknownTab(id.to_string()))?;
      // A failed first fetch still counts; only `refresh` tries again.
      let never_fetched = slot.started == 0;
      let next = if self.options.refresh_on_tab_switch {
        Next::Refresh
      } else if self.options.auto_load && never_fetched {
        Next::Load
      } else {
        Next::Nothing
      };
      state.active = id.to_string();
      next
    };
    debug!(tab = id, "switched tab");

    let result = match next {
      Next::Nothing => return Ok(()),
      Next::Load => self.load(id).await,
      Next::Refresh => self.refresh(id).await,
    };
    if let Err(e) = result {
      warn!(tab = id, error = %e, "tab load failed");
    }
    Ok(())
  }

  /// Fetch a tab through the cache and wait for the result.
  pub async fn load(&self, id: &str) -> Result<FetchOutcome> {
    self.spawn_fetch(id)?.await.map_err(|_| SyncError::Cancelled)?
  }

  /// Drop the tab's cache entry, then fetch it.
  pub async fn refresh(&self, id: &str) -> Result<FetchOutcome> {
    if let Some(key) = self.cache_key(id) {
      self.cache.invalidate(&key);
    } else if !self.lock().tabs.contains_key(id) {
      return Err(SyncError::UnknownTab(id.to_string()));
    }
    self.load(id).await
  }

  /// Refresh every registered tab concurrently.
  pub async fn refresh_all(&self) -> Vec<(String, Result<FetchOutcome>)> {
    let ids = self.tab_ids();
    let results = futures::future::join_all(ids.iter().map(|id| self.refresh(id))).await;
    ids.into_iter().zip(results).collect()
  }

  /// Start fetching a tab in the background without switching to it.
  ///
  /// Returns `None` if the tab is already loading or has fresh data.
  pub fn preload_tab(&self, id: &str) -> Result<Option<JoinHandle<Result<FetchOutcome>>>> {
    {
      let state = self.lock();
      let slot = state
        .tabs
        .get(id)
        .ok_or_else(|| SyncError::UnknownTab(id.to_string()))?;
      if slot.state.loading || slot.state.is_fresh(self.options.stale_after) {
        debug!(tab = id, "preload skipped");
        return Ok(None);
      }
    }
    debug!(tab = id, "preloading");
    self.spawn_fetch(id).map(Some)
  }

  /// Mark the fetch as started synchronously, then run it on its own task
  /// so the tab always leaves the loading state, even if the caller stops
  /// waiting.
  fn spawn_fetch(&self, id: &str) -> Result<JoinHandle<Result<FetchOutcome>>> {
    let (seq, fetcher) = {
      let mut state = self.lock();
      let slot = state
        .tabs
        .get_mut(id)
        .ok_or_else(|| SyncError::UnknownTab(id.to_string()))?;
      slot.started += 1;
      slot.state.loading = true;
      (slot.started, Arc::clone(&slot.source.fetcher))
    };
    let fetch = fetcher();

    let controller = self.clone();
    let id = id.to_string();
    Ok(tokio::spawn(async move {
      let result = fetch.await;
      let failure = result.as_ref().err().cloned();
      let outcome = controller.finish_fetch(&id, seq, result);
      match failure {
        Some(e) if outcome == FetchOutcome::Applied => Err(e),
        _ => Ok(outcome),
      }
    }))
  }

  fn finish_fetch(&self, id: &str, seq: u64, result: Result<D>) -> FetchOutcome {
    let mut state = self.lock();
    let Some(slot) = state.tabs.get_mut(id) else {
      return FetchOutcome::Discarded;
    };

    if seq == slot.started {
      slot.state.loading = false;
    }
    if seq <= slot.applied {
      debug!(tab = id, seq, applied = slot.applied, "discarding stale result");
      return FetchOutcome::Discarded;
    }
    slot.applied = seq;

    match result {
      Ok(data) => {
        slot.state.data = Some(data);
        slot.state.error = None;
        slot.state.last_fetched_at = Some(Instant::now());
      }
      Err(e) => {
        // Keep whatever data we had; stale beats blank.
        warn!(tab = id, error = %e, "fetch failed");
        slot.state.error = Some(e);
      }
    }
    FetchOutcome::Applied
  }

  pub fn state(&self, id: &str) -> Option<TabState<D>> {
    self.lock().tabs.get(id).map(|slot| slot.state.clone())
  }

  pub fn data(&self, id: &str) -> Option<D> {
    self.lock().tabs.get(id)?.state.data.clone()
  }

  pub fn is_loading(&self, id: &str) -> bool {
    self
      .lock()
      .tabs
      .get(id)
      .map(|slot| slot.state.loading)
      .unwrap_or(false)
  }

  pub fn error(&self, id: &str) -> Option<SyncError> {
    self.lock().tabs.get(id)?.state.error.clone()
  }

  fn lock(&self) -> MutexGuard<'_, ControllerState<D>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl<D> std::fmt::Debug for ViewDataController<D> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    f.debug_struct("ViewDataController")
      .field("active", &state.active)
      .field("tabs", &state.order)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn counting_source(calls: &Arc<AtomicU32>, value: &'static str) -> TabSource<String> {
    let calls = calls.clone();
    TabSource::new(move || {
      calls.fetch_add(1, Ordering::SeqCst);
      async move { Ok(value.to_string()) }
    })
  }

  fn cached_source(
    cache: &TtlCache,
    key: &'static str,
    calls: &Arc<AtomicU32>,
  ) -> TabSource<String> {
    let cache = cache.clone();
    let calls = calls.clone();
    TabSource::new(move || {
      let cache = cache.clone();
      let calls = calls.clone();
      async move {
        cache
          .get(key, Duration::from_secs(60), move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("fetch #{}", n))
          })
          .await
      }
    })
    .cached_as(key)
  }

  #[tokio::test]
  async fn test_switch_loads_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let tabs = ViewDataController::new("tasks", TtlCache::default(), TabOptions::default())
      .with_tab("tasks", counting_source(&calls, "t"))
      .with_tab("performance", counting_source(&calls, "p"));

    tabs.switch_tab("tasks").await.unwrap();
    tabs.switch_tab("performance").await.unwrap();
    tabs.switch_tab("tasks").await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(tabs.active_tab(), "tasks");
    assert_eq!(tabs.data("tasks").as_deref(), Some("t"));
    assert_eq!(tabs.data("performance").as_deref(), Some("p"));
    assert!(!tabs.is_loading("tasks"));
  }

  #[tokio::test]
  async fn test_new_tab_state_is_empty() {
    let calls = Arc::new(AtomicU32::new(0));
    let tabs = ViewDataController::new("tasks", TtlCache::default(), TabOptions::default())
      .with_tab("tasks", counting_source(&calls, "t"));

    let state = tabs.state("tasks").unwrap();
    assert!(state.data.is_none());
    assert!(!state.loading);
    assert!(state.error.is_none());
    assert!(state.last_fetched_at.is_none());
    assert!(tabs.state("missing").is_none());
  }

  #[tokio::test]
  async fn test_without_auto_load_switch_does_not_fetch() {
    let calls = Arc::new(AtomicU32::new(0));
    let options = TabOptions {
      auto_load: false,
      ..TabOptions::default()
    };
    let tabs = ViewDataController::new("tasks", TtlCache::default(), options)
      .with_tab("tasks", counting_source(&calls, "t"));

    tabs.switch_tab("tasks").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(tabs.data("tasks").is_none());
  }

  #[tokio::test]
  async fn test_refresh_on_switch_bypasses_cache() {
    let cache = TtlCache::default();
    let calls = Arc::new(AtomicU32::new(0));
    let options = TabOptions {
      refresh_on_tab_switch: true,
      ..TabOptions::default()
    };
    let tabs = ViewDataController::new("tasks", cache.clone(), options)
      .with_tab("tasks", cached_source(&cache, "user-tasks:alice", &calls));

    tabs.switch_tab("tasks").await.unwrap();
    tabs.switch_tab("tasks").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(tabs.data("tasks").as_deref(), Some("fetch #2"));
  }

  #[tokio::test]
  async fn test_load_hits_cache_but_refresh_does_not() {
    let cache = TtlCache::default();
    let calls = Arc::new(AtomicU32::new(0));
    let tabs = ViewDataController::new("tasks", cache.clone(), TabOptions::default())
      .with_tab("tasks", cached_source(&cache, "user-tasks:alice", &calls));

    tabs.load("tasks").await.unwrap();
    tabs.load("tasks").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(tabs.refresh("tasks").await.unwrap(), FetchOutcome::Applied);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(tabs.data("tasks").as_deref(), Some("fetch #2"));
  }

  #[tokio::test]
  async fn test_unknown_tab() {
    let tabs: ViewDataController<String> =
      ViewDataController::new("tasks", TtlCache::default(), TabOptions::default());
    assert_eq!(
      tabs.switch_tab("nope").await,
      Err(SyncError::UnknownTab("nope".into()))
    );
    assert_eq!(tabs.active_tab(), "tasks");
    assert!(tabs.preload_tab("nope").is_err());
    assert!(tabs.refresh("nope").await.is_err());
  }

  #[tokio::test]
  async fn test_preload_does_not_switch_and_skips_fresh_tabs() {
    let calls = Arc::new(AtomicU32::new(0));
    let tabs = ViewDataController::new("tasks", TtlCache::default(), TabOptions::default())
      .with_tab("tasks", counting_source(&calls, "t"))
      .with_tab("leaderboard", counting_source(&calls, "l"));

    let handle = tabs.preload_tab("leaderboard").unwrap().unwrap();
    assert!(tabs.is_loading("leaderboard"));
    assert!(tabs.preload_tab("leaderboard").unwrap().is_none());
    handle.await.unwrap().unwrap();

    assert_eq!(tabs.active_tab(), "tasks");
    assert_eq!(tabs.data("leaderboard").as_deref(), Some("l"));
    assert!(tabs.preload_tab("leaderboard").unwrap().is_none());

    // Already fetched, so switching does not fetch again.
    tabs.switch_tab("leaderboard").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_preload_refetches_once_stale() {
    let calls = Arc::new(AtomicU32::new(0));
    let options = TabOptions {
      stale_after: Duration::from_secs(10),
      ..TabOptions::default()
    };
    let tabs = ViewDataController::new("tasks", TtlCache::default(), options)
      .with_tab("leaderboard", counting_source(&calls, "l"));

    tabs.load("leaderboard").await.unwrap();
    tokio::time::advance(Duration::from_secs(10)).await;

    let handle = tabs.preload_tab("leaderboard").unwrap();
    assert!(handle.is_some());
    handle.unwrap().await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_older_fetch_cannot_overwrite_newer() {
    let calls = Arc::new(AtomicU32::new(0));
    let source = {
      let calls = calls.clone();
      TabSource::new(move || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if n == 0 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("A".to_string())
          } else {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok("B".to_string())
          }
        }
      })
    };
    let tabs = ViewDataController::new("tasks", TtlCache::default(), TabOptions::default())
      .with_tab("tasks", source);

    let first = tabs.preload_tab("tasks").unwrap().unwrap();
    let second = tabs.refresh("tasks").await.unwrap();
    assert_eq!(second, FetchOutcome::Applied);
    assert_eq!(tabs.data("tasks").as_deref(), Some("B"));
    assert!(!tabs.is_loading("tasks"));

    assert_eq!(first.await.unwrap(), Ok(FetchOutcome::Discarded));
    assert_eq!(tabs.data("tasks").as_deref(), Some("B"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_older_fetch_may_fill_in_until_newer_arrives() {
    let calls = Arc::new(AtomicU32::new(0));
    let source = {
      let calls = calls.clone();
      TabSource::new(move || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          let (delay, value) = if n == 0 { (1, "A") } else { (5, "B") };
          tokio::time::sleep(Duration::from_secs(delay)).await;
          Ok(value.to_string())
        }
      })
    };
    let tabs = ViewDataController::new("tasks", TtlCache::default(), TabOptions::default())
      .with_tab("tasks", source);

    let first = tabs.preload_tab("tasks").unwrap().unwrap();
    let second = {
      let tabs = tabs.clone();
      tokio::spawn(async move { tabs.refresh("tasks").await })
    };

    assert_eq!(first.await.unwrap(), Ok(FetchOutcome::Applied));
    assert_eq!(tabs.data("tasks").as_deref(), Some("A"));
    assert!(tabs.is_loading("tasks"));

    assert_eq!(second.await.unwrap(), Ok(FetchOutcome::Applied));
    assert_eq!(tabs.data("tasks").as_deref(), Some("B"));
    assert!(!tabs.is_loading("tasks"));
  }

  #[tokio::test]
  async fn test_failure_keeps_previous_data() {
    let calls = Arc::new(AtomicU32::new(0));
    let source = {
      let calls = calls.clone();
      TabSource::new(move || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if n == 0 {
            Ok("tasks v1".to_string())
          } else {
            Err(SyncError::rejected(500, "database unavailable"))
          }
        }
      })
    };
    let tabs = ViewDataController::new("tasks", TtlCache::default(), TabOptions::default())
      .with_tab("tasks", source);

    tabs.switch_tab("tasks").await.unwrap();
    let err = tabs.refresh("tasks").await.unwrap_err();
    assert_eq!(err.to_string(), "database unavailable");

    let state = tabs.state("tasks").unwrap();
    assert_eq!(state.data.as_deref(), Some("tasks v1"));
    assert_eq!(state.error, Some(err));
    assert!(!state.loading);
    // No automatic retry.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_switch_records_error_without_returning_it() {
    let tabs = ViewDataController::new("tasks", TtlCache::default(), TabOptions::default())
      .with_tab(
        "tasks",
        TabSource::new(|| async { Err::<String, _>(SyncError::Network("offline".into())) }),
      );

    tabs.switch_tab("tasks").await.unwrap();
    assert_eq!(tabs.error("tasks"), Some(SyncError::Network("offline".into())));
    assert!(!tabs.is_loading("tasks"));
  }

  #[tokio::test]
  async fn test_failed_tab_is_not_refetched_on_switch() {
    let calls = Arc::new(AtomicU32::new(0));
    let failing = {
      let calls = calls.clone();
      TabSource::new(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err::<String, _>(SyncError::rejected(503, "performance service down")) }
      })
    };
    let tabs = ViewDataController::new("tasks", TtlCache::default(), TabOptions::default())
      .with_tab("tasks", counting_source(&Arc::new(AtomicU32::new(0)), "t"))
      .with_tab("performance", failing);

    tabs.switch_tab("performance").await.unwrap();
    tabs.switch_tab("tasks").await.unwrap();
    tabs.switch_tab("performance").await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(tabs.error("performance").is_some());

    // An explicit refresh is the way to try again.
    assert!(tabs.refresh("performance").await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_refresh_all() {
    let calls = Arc::new(AtomicU32::new(0));
    let tabs = ViewDataController::new("tasks", TtlCache::default(), TabOptions::default())
      .with_tab("tasks", counting_source(&calls, "t"))
      .with_tab("performance", counting_source(&calls, "p"));

    let results = tabs.refresh_all().await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }
}
