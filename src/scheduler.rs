//! Scheduled background tasks with explicit cancellation handles.
//!
//! Optimistic patch expiry and sync-status polling both run as timers on the
//! tokio runtime. Every start returns a [`ScheduledTask`]; the caller keeps it
//! for as long as the work should continue and cancels (or drops) it on
//! teardown.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Handle to a task started by [`schedule_once`] or [`schedule_every`].
///
/// Dropping the handle cancels the task.
#[must_use = "dropping a ScheduledTask cancels it"]
#[derive(Debug)]
pub struct ScheduledTask {
  handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
  fn new(handle: JoinHandle<()>) -> Self {
    Self {
      handle: Some(handle),
    }
  }

  /// Stop the task. Cancelling an already finished task is a no-op.
  pub fn cancel(mut self) {
    if let Some(handle) = self.handle.take() {
      handle.abort();
    }
  }

  /// Let the task run to completion without keeping a handle to it.
  pub fn detach(mut self) {
    self.handle.take();
  }

  pub fn is_finished(&self) -> bool {
    self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
  }
}

impl Drop for ScheduledTask {
  fn drop(&mut self) {
    if let Some(handle) = self.handle.take() {
      handle.abort();
    }
  }
}

/// Run `task` once after `delay`.
pub fn schedule_once<F>(delay: Duration, task: F) -> ScheduledTask
where
  F: Future<Output = ()> + Send + 'static,
{
  ScheduledTask::new(tokio::spawn(async move {
    time::sleep(delay).await;
    task.await;
  }))
}

/// Run the future produced by `task` every `interval`, first tick after one
/// full interval. A tick is skipped rather than queued if the previous run
/// overran.
pub fn schedule_every<F, Fut>(interval: Duration, task: F) -> ScheduledTask
where
  F: Fn() -> Fut + Send + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  ScheduledTask::new(tokio::spawn(async move {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
      ticker.tick().await;
      task().await;
    }
  }))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  #[tokio::test(start_paused = true)]
  async fn test_once_fires_after_delay() {
    let fired = Arc::new(AtomicU32::new(0));
    let f = fired.clone();
    let task = schedule_once(Duration::from_secs(10), async move {
      f.fetch_add(1, Ordering::SeqCst);
    });

    time::sleep(Duration::from_secs(9)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(task.is_finished());
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_prevents_once() {
    let fired = Arc::new(AtomicU32::new(0));
    let f = fired.clone();
    let task = schedule_once(Duration::from_secs(1), async move {
      f.fetch_add(1, Ordering::SeqCst);
    });
    task.cancel();

    time::sleep(Duration::from_secs(5)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_detach_keeps_running() {
    let fired = Arc::new(AtomicU32::new(0));
    let f = fired.clone();
    schedule_once(Duration::from_secs(1), async move {
      f.fetch_add(1, Ordering::SeqCst);
    })
    .detach();

    time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_every_ticks_until_dropped() {
    let ticks = Arc::new(AtomicU32::new(0));
    let t = ticks.clone();
    let task = schedule_every(Duration::from_secs(1), move || {
      let t = t.clone();
      async move {
        t.fetch_add(1, Ordering::SeqCst);
      }
    });

    time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 3);

    drop(task);
    time::sleep(Duration::from_secs(5)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
  }
}
