//! Named refresh timers with a local-edit debounce guard.
//!
//! Each polled key gets its own task that ticks every `interval`. A tick is
//! skipped while the key was edited locally within the debounce window, so a
//! background refresh never overwrites an optimistic change the user just made.
//!
//! # Example
//!
//! ```ignore
//! let poller = PollingCoordinator::new(Duration::from_secs(3));
//! let client = remote.clone();
//! poller.start_polling(
//!   "quests:today",
//!   move || {
//!     let client = client.clone();
//!     async move { client.fetch_json::<Vec<Quest>>("rest/v1/quests").await }
//!   },
//!   PollConfig::every(Duration::from_secs(30)).on_success(|quests| render(quests)),
//! );
//!
//! // After an optimistic local edit
//! poller.set_last_edit_time("quests:today");
//! ```

use color_eyre::{Report, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::cache::{FetchOptions, RequestCache};

type SuccessFn<T> = Box<dyn Fn(T) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&Report) + Send + Sync>;

/// Default window after a local edit during which ticks are skipped.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(3_000);

/// How and whether a key is polled.
pub struct PollConfig<T> {
  pub interval: Duration,
  pub enabled: bool,
  pub on_success: Option<SuccessFn<T>>,
  pub on_error: Option<ErrorFn>,
}

impl<T> PollConfig<T> {
  /// Poll every `interval`, enabled, with no callbacks.
  pub fn every(interval: Duration) -> Self {
    Self {
      interval,
      enabled: true,
      on_success: None,
      on_error: None,
    }
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn on_success(mut self, f: impl Fn(T) + Send + Sync + 'static) -> Self {
    self.on_success = Some(Box::new(f));
    self
  }

  pub fn on_error(mut self, f: impl Fn(&Report) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Box::new(f));
    self
  }
}

struct PollHandle {
  // Dropping the sender stops the task after its current tick
  _stop: oneshot::Sender<()>,
  nudge: Arc<Notify>,
}

type EditLog = Arc<Mutex<HashMap<String, Instant>>>;

struct Inner {
  handles: Mutex<HashMap<String, PollHandle>>,
  last_edits: EditLog,
  debounce: Duration,
}

/// Registry of polling timers, at most one per key.
#[derive(Clone)]
pub struct PollingCoordinator {
  inner: Arc<Inner>,
}

impl PollingCoordinator {
  pub fn new(debounce: Duration) -> Self {
    Self {
      inner: Arc::new(Inner {
        handles: Mutex::new(HashMap::new()),
        last_edits: Arc::new(Mutex::new(HashMap::new())),
        debounce,
      }),
    }
  }

  /// Start polling `key`, replacing any timer already registered for it.
  ///
  /// The first tick fires one `interval` after this call. A failed fetch is
  /// reported to `on_error` and polling carries on. With `enabled: false` the
  /// existing timer is cancelled and nothing new is started.
  pub fn start_polling<T, F, Fut>(&self, key: impl Into<String>, fetch_fn: F, config: PollConfig<T>)
  where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let key = key.into();
    // An edit recorded before the start still debounces the new timer
    self.cancel(&key);

    if !config.enabled {
      debug!(key = %key, "polling disabled");
      return;
    }
    if config.interval.is_zero() {
      warn!(key = %key, "refusing to poll with a zero interval");
      return;
    }

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let nudge = Arc::new(Notify::new());
    let task_nudge = Arc::clone(&nudge);
    let last_edits = Arc::clone(&self.inner.last_edits);
    let debounce = self.inner.debounce;
    let task_key = key.clone();
    let interval = config.interval;

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          biased;
          _ = &mut stop_rx => break,
          _ = ticker.tick() => {}
          _ = task_nudge.notified() => trace!(key = %task_key, "refresh requested"),
        }

        if recently_edited(&last_edits, &task_key, debounce) {
          trace!(key = %task_key, "skipping tick after local edit");
          continue;
        }

        match fetch_fn().await {
          Ok(data) => {
            if let Some(on_success) = &config.on_success {
              on_success(data);
            }
          }
          Err(e) => {
            debug!(key = %task_key, error = %e, "poll failed");
            if let Some(on_error) = &config.on_error {
              on_error(&e);
            }
          }
        }
      }
      debug!(key = %task_key, "polling stopped");
    });

    debug!(key = %key, interval_ms = interval.as_millis() as u64, "polling started");
    self.inner.handles.lock().insert(
      key,
      PollHandle {
        _stop: stop_tx,
        nudge,
      },
    );
  }

  /// Poll `key` through `cache`, forcing a refresh on every tick so readers
  /// of the cache see the polled value.
  pub fn start_cached_polling<T, F, Fut>(
    &self,
    key: impl Into<String>,
    cache: RequestCache,
    fetch_fn: F,
    config: PollConfig<T>,
  ) where
    T: Clone + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let key = key.into();
    let cache_key = key.clone();
    self.start_polling(
      key,
      move || {
        let cache = cache.clone();
        let cache_key = cache_key.clone();
        let fetch = fetch_fn();
        async move {
          let value = cache
            .cached_fetch(&cache_key, move || fetch, FetchOptions::force_refresh())
            .await?;
          Ok::<T, Report>(value)
        }
      },
      config,
    );
  }

  /// Cancel future ticks for `key` and forget its last edit. A tick
  /// already running completes.
  pub fn stop_polling(&self, key: &str) {
    self.cancel(key);
    self.inner.last_edits.lock().remove(key);
  }

  fn cancel(&self, key: &str) {
    if self.inner.handles.lock().remove(key).is_some() {
      debug!(key, "polling cancelled");
    }
  }

  /// Record a local edit to `key` happening now.
  pub fn set_last_edit_time(&self, key: &str) {
    self
      .inner
      .last_edits
      .lock()
      .insert(key.to_string(), Instant::now());
  }

  /// Run a tick for `key` right away, subject to the debounce guard.
  ///
  /// Returns `false` if `key` is not being polled.
  pub fn refresh_now(&self, key: &str) -> bool {
    match self.inner.handles.lock().get(key) {
      Some(handle) => {
        handle.nudge.notify_one();
        true
      }
      None => false,
    }
  }

  /// Cancel every timer and forget every recorded edit.
  pub fn stop_all(&self) {
    self.inner.last_edits.lock().clear();
    let mut handles = self.inner.handles.lock();
    let count = handles.len();
    handles.clear();
    if count > 0 {
      debug!(count, "all polling cancelled");
    }
  }

  /// Keys with an active timer, sorted.
  pub fn active_keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.inner.handles.lock().keys().cloned().collect();
    keys.sort();
    keys
  }
}

impl Default for PollingCoordinator {
  fn default() -> Self {
    Self::new(DEFAULT_DEBOUNCE)
  }
}

impl std::fmt::Debug for PollingCoordinator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PollingCoordinator")
      .field("active_keys", &self.active_keys())
      .field("debounce", &self.inner.debounce)
      .finish()
  }
}

fn recently_edited(last_edits: &EditLog, key: &str, debounce: Duration) -> bool {
  last_edits
    .lock()
    .get(key)
    .is_some_and(|edited| edited.elapsed() < debounce)
}
