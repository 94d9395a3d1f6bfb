//! Request cache that deduplicates concurrent fetches and serves fresh values.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::types::{CacheStats, FetchError, FetchOptions};
use crate::clock::{Clock, SystemClock};

type AnyValue = Arc<dyn Any + Send + Sync>;

type FetchResult = std::result::Result<AnyValue, FetchError>;

/// A fetch that any number of callers can await.
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

struct InFlight {
  id: u64,
  fetch: SharedFetch,
}

struct CacheEntry {
  value: Option<AnyValue>,
  fetched_at: DateTime<Utc>,
  ttl: Option<Duration>,
  in_flight: Option<InFlight>,
}

impl CacheEntry {
  fn empty(now: DateTime<Utc>) -> Self {
    Self {
      value: None,
      fetched_at: now,
      ttl: None,
      in_flight: None,
    }
  }

  fn fresh_value(&self, now: DateTime<Utc>) -> Option<AnyValue> {
    let value = self.value.as_ref()?;
    match self.ttl {
      Some(ttl) if now - self.fetched_at > ttl => None,
      _ => Some(Arc::clone(value)),
    }
  }

  fn is_live(&self) -> bool {
    self.value.is_some() || self.in_flight.is_some()
  }
}

struct Inner {
  entries: Mutex<HashMap<String, CacheEntry>>,
  clock: Arc<dyn Clock>,
  default_ttl: Option<Duration>,
  next_fetch_id: AtomicU64,
}

enum Slot {
  Ready(AnyValue),
  Pending(SharedFetch),
  /// Placeholder stored for this caller, who must start the fetch
  Reserved {
    id: u64,
    fetch: SharedFetch,
    settled: oneshot::Sender<FetchResult>,
  },
}

/// In-memory cache over asynchronous fetches.
///
/// Values of any `Clone + Send + Sync` type can live side by side; each call
/// to [`cached_fetch`](Self::cached_fetch) names the type it expects back.
/// Cloning the cache is cheap and every clone shares the same entries.
#[derive(Clone)]
pub struct RequestCache {
  inner: Arc<Inner>,
}

impl RequestCache {
  /// Create a cache on the system clock whose values never go stale on their own.
  pub fn new() -> Self {
    Self::with_clock(Arc::new(SystemClock), None)
  }

  /// Create a cache with an explicit clock and default freshness window.
  pub fn with_clock(clock: Arc<dyn Clock>, default_ttl: Option<Duration>) -> Self {
    Self {
      inner: Arc::new(Inner {
        entries: Mutex::new(HashMap::new()),
        clock,
        default_ttl,
        next_fetch_id: AtomicU64::new(0),
      }),
    }
  }

  /// Fetch `key`, serving from the cache when possible.
  ///
  /// 1. With `force_refresh`, always call `fetcher` and replace the entry
  /// 2. If a fetch for `key` is in flight, wait for it instead of fetching again
  /// 3. If a value within its TTL exists, return it
  /// 4. Otherwise reserve the slot, then fetch and fill it
  ///
  /// The fetch runs on its own task, so it completes even if every caller stops
  /// waiting. A failed fetch leaves no entry behind and the error goes to every
  /// caller that joined it.
  pub async fn cached_fetch<T, F, Fut>(
    &self,
    key: &str,
    fetcher: F,
    options: FetchOptions,
  ) -> std::result::Result<T, FetchError>
  where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let slot = {
      let mut entries = self.inner.entries.lock();
      let now = self.inner.clock.now();

      let existing = if options.force_refresh {
        None
      } else {
        entries.get(key).and_then(|entry| {
          if let Some(in_flight) = &entry.in_flight {
            debug!(key, "joining in-flight fetch");
            Some(Slot::Pending(in_flight.fetch.clone()))
          } else {
            entry.fresh_value(now).map(|value| {
              debug!(key, "cache hit");
              Slot::Ready(value)
            })
          }
        })
      };

      match existing {
        Some(slot) => slot,
        None => {
          debug!(key, force = options.force_refresh, "cache miss, fetching");
          let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
          let (settled, rx) = oneshot::channel();
          let fetch = await_settled(key, rx);

          let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry::empty(now));
          entry.in_flight = Some(InFlight {
            id,
            fetch: fetch.clone(),
          });
          Slot::Reserved { id, fetch, settled }
        }
      }
    };

    // The map lock is released here, so the fetcher may use this cache freely
    let value = match slot {
      Slot::Ready(value) => value,
      Slot::Pending(fetch) => fetch.await?,
      Slot::Reserved { id, fetch, settled } => {
        let ttl = options.ttl.or(self.inner.default_ttl);
        self.fill(key, id, ttl, fetcher, settled);
        fetch.await?
      }
    };
    downcast(key, value)
  }

  /// Start the fetch for a reserved slot on its own task.
  fn fill<T, F, Fut>(
    &self,
    key: &str,
    id: u64,
    ttl: Option<Duration>,
    fetcher: F,
    settled: oneshot::Sender<FetchResult>,
  ) where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(fetcher)) {
      Ok(fut) => fut,
      Err(_) => {
        warn!(key, "fetcher panicked");
        // Dropping `settled` reports the abort to every waiter
        self.inner.abandon(key, id);
        return;
      }
    };

    let inner = Arc::clone(&self.inner);
    let key = key.to_string();
    tokio::spawn(async move {
      match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => {
          let _ = settled.send(inner.settle(&key, id, ttl, result));
        }
        Err(_) => {
          warn!(key = %key, "fetch panicked");
          inner.abandon(&key, id);
        }
      }
    });
  }

  /// Drop the value and in-flight marker for `key`. No-op for unknown keys.
  pub fn invalidate(&self, key: &str) {
    if self.inner.entries.lock().remove(key).is_some() {
      debug!(key, "invalidated");
    }
  }

  /// Drop every key starting with `prefix`. Returns how many were removed.
  pub fn invalidate_prefix(&self, prefix: &str) -> usize {
    let mut entries = self.inner.entries.lock();
    let before = entries.len();
    entries.retain(|key, _| !key.starts_with(prefix));
    let removed = before - entries.len();
    if removed > 0 {
      debug!(prefix, removed, "invalidated by prefix");
    }
    removed
  }

  /// Drop every entry.
  pub fn clear(&self) {
    self.inner.entries.lock().clear();
  }

  /// Keys currently holding a value or an in-flight request.
  pub fn stats(&self) -> CacheStats {
    let entries = self.inner.entries.lock();
    let keys: Vec<String> = entries
      .iter()
      .filter(|(_, entry)| entry.is_live())
      .map(|(key, _)| key.clone())
      .collect();
    CacheStats {
      size: keys.len(),
      keys,
    }
  }

  /// Read the cached value for `key` without fetching, stale or not.
  pub fn peek<T: Clone + 'static>(&self, key: &str) -> Option<T> {
    let entries = self.inner.entries.lock();
    let value = entries.get(key)?.value.as_ref()?;
    value.downcast_ref::<T>().cloned()
  }

  /// Store `value` under `key` as if it had just been fetched.
  ///
  /// Used for optimistic updates. An in-flight fetch for the key keeps running
  /// but its result no longer lands in the cache.
  pub fn prime<T: Clone + Send + Sync + 'static>(&self, key: &str, value: T) {
    let now = self.inner.clock.now();
    let mut entries = self.inner.entries.lock();
    let entry = entries
      .entry(key.to_string())
      .or_insert_with(|| CacheEntry::empty(now));
    entry.value = Some(Arc::new(value));
    entry.fetched_at = now;
    entry.ttl = self.inner.default_ttl;
    entry.in_flight = None;
  }
}

impl Default for RequestCache {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for RequestCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RequestCache")
      .field("size", &self.stats().size)
      .field("default_ttl", &self.inner.default_ttl)
      .finish_non_exhaustive()
  }
}

impl Inner {
  /// Forget the in-flight fetch `id` for `key` without a result.
  fn abandon(&self, key: &str, id: u64) {
    let mut entries = self.entries.lock();
    let owned = entries
      .get(key)
      .and_then(|entry| entry.in_flight.as_ref())
      .is_some_and(|in_flight| in_flight.id == id);
    if owned {
      entries.remove(key);
    }
  }

  /// Record the outcome of fetch `id`, if it still owns the entry for `key`.
  fn settle<T>(
    &self,
    key: &str,
    id: u64,
    ttl: Option<Duration>,
    result: Result<T>,
  ) -> std::result::Result<AnyValue, FetchError>
  where
    T: Send + Sync + 'static,
  {
    let now = self.clock.now();
    let mut entries = self.entries.lock();
    let owned = entries
      .get(key)
      .and_then(|entry| entry.in_flight.as_ref())
      .is_some_and(|in_flight| in_flight.id == id);

    match result {
      Ok(value) => {
        let value: AnyValue = Arc::new(value);
        match entries.get_mut(key) {
          Some(entry) if owned => {
            entry.value = Some(Arc::clone(&value));
            entry.fetched_at = now;
            entry.ttl = ttl;
            entry.in_flight = None;
          }
          _ => debug!(key, "fetch superseded or invalidated, result not cached"),
        }
        Ok(value)
      }
      Err(report) => {
        warn!(key, error = %report, "fetch failed");
        if owned {
          entries.remove(key);
        }
        Err(FetchError::Fetch(Arc::new(report)))
      }
    }
  }
}

/// Shared future resolving once the reserved fetch settles.
fn await_settled(key: &str, rx: oneshot::Receiver<FetchResult>) -> SharedFetch {
  let key = key.to_string();
  async move {
    rx.await.unwrap_or_else(|_| {
      Err(FetchError::Aborted {
        key,
        reason: "fetch ended without a result".to_string(),
      })
    })
  }
  .boxed()
  .shared()
}

fn downcast<T: Clone + 'static>(
  key: &str,
  value: AnyValue,
) -> std::result::Result<T, FetchError> {
  value
    .downcast_ref::<T>()
    .cloned()
    .ok_or_else(|| FetchError::TypeMismatch {
      key: key.to_string(),
      expected: std::any::type_name::<T>(),
    })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use color_eyre::eyre::eyre;
  use serde_json::{json, Value};
  use std::sync::atomic::AtomicUsize;
  use tokio::sync::Notify;

  fn counting_fetcher(
    calls: &Arc<AtomicUsize>,
    value: Value,
  ) -> impl FnOnce() -> BoxFuture<'static, Result<Value>> {
    let calls = Arc::clone(calls);
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      async move { Ok(value) }.boxed()
    }
  }

  #[tokio::test]
  async fn test_second_fetch_served_from_cache() {
    let cache = RequestCache::new();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let a: Value = cache
      .cached_fetch(
        "test-key",
        counting_fetcher(&first, json!({ "data": "test" })),
        FetchOptions::default(),
      )
      .await
      .unwrap();
    let b: Value = cache
      .cached_fetch(
        "test-key",
        counting_fetcher(&second, json!({ "data": "other" })),
        FetchOptions::default(),
      )
      .await
      .unwrap();

    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 0);
    assert_eq!(a, json!({ "data": "test" }));
    assert_eq!(b, json!({ "data": "test" }));
  }

  #[tokio::test]
  async fn test_force_refresh_always_fetches() {
    let cache = RequestCache::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let make_fetcher = |calls: Arc<AtomicUsize>| {
      move || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if n == 0 {
            Ok(json!({ "data": "old" }))
          } else {
            Ok(json!({ "data": "new" }))
          }
        }
      }
    };

    let _: Value = cache
      .cached_fetch("test-key", make_fetcher(calls.clone()), FetchOptions::default())
      .await
      .unwrap();
    let refreshed: Value = cache
      .cached_fetch(
        "test-key",
        make_fetcher(calls.clone()),
        FetchOptions::force_refresh(),
      )
      .await
      .unwrap();

    assert_eq!(refreshed, json!({ "data": "new" }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_concurrent_fetches_share_one_request() {
    let cache = RequestCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());

    let slow_fetcher = || {
      let calls = calls.clone();
      let gate = gate.clone();
      move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
          gate.notified().await;
          Ok(json!({ "data": "test" }))
        }
      }
    };

    let (a, b, _) = tokio::join!(
      cache.cached_fetch::<Value, _, _>("test-key", slow_fetcher(), FetchOptions::default()),
      cache.cached_fetch::<Value, _, _>("test-key", slow_fetcher(), FetchOptions::default()),
      async {
        tokio::task::yield_now().await;
        gate.notify_one();
      }
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap(), json!({ "data": "test" }));
    assert_eq!(b.unwrap(), json!({ "data": "test" }));
  }

  #[tokio::test]
  async fn test_invalidate_forces_refetch() {
    let cache = RequestCache::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let _: Value = cache
      .cached_fetch("test-key", counting_fetcher(&calls, json!(1)), FetchOptions::default())
      .await
      .unwrap();
    cache.invalidate("test-key");
    let _: Value = cache
      .cached_fetch("test-key", counting_fetcher(&calls, json!(2)), FetchOptions::default())
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_stats_lists_fetched_keys() {
    let cache = RequestCache::new();
    let calls = Arc::new(AtomicUsize::new(0));

    for key in ["key1", "key2"] {
      let _: Value = cache
        .cached_fetch(key, counting_fetcher(&calls, json!(key)), FetchOptions::default())
        .await
        .unwrap();
    }

    let stats = cache.stats();
    assert_eq!(stats.size, 2);
    assert!(stats.keys.contains(&"key1".to_string()));
    assert!(stats.keys.contains(&"key2".to_string()));

    cache.clear();
    assert_eq!(cache.stats(), CacheStats::default());
  }

  #[tokio::test]
  async fn test_failure_reaches_every_waiter_and_is_not_cached() {
    let cache = RequestCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());

    let failing = || {
      let calls = calls.clone();
      let gate = gate.clone();
      move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
          gate.notified().await;
          Err::<Value, _>(eyre!("network down"))
        }
      }
    };

    let (a, b, _) = tokio::join!(
      cache.cached_fetch::<Value, _, _>("quests:1", failing(), FetchOptions::default()),
      cache.cached_fetch::<Value, _, _>("quests:1", failing(), FetchOptions::default()),
      async {
        tokio::task::yield_now().await;
        gate.notify_one();
      }
    );

    assert!(a.unwrap_err().to_string().contains("network down"));
    assert!(b.unwrap_err().to_string().contains("network down"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().size, 0);

    let value: Value = cache
      .cached_fetch("quests:1", counting_fetcher(&calls, json!("ok")), FetchOptions::default())
      .await
      .unwrap();
    assert_eq!(value, json!("ok"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_ttl_expiry_refetches() {
    let clock = ManualClock::default();
    let cache = RequestCache::with_clock(Arc::new(clock.clone()), Some(Duration::seconds(60)));
    let calls = Arc::new(AtomicUsize::new(0));

    let _: Value = cache
      .cached_fetch("profile:7", counting_fetcher(&calls, json!(1)), FetchOptions::default())
      .await
      .unwrap();

    clock.advance(Duration::seconds(30));
    let _: Value = cache
      .cached_fetch("profile:7", counting_fetcher(&calls, json!(2)), FetchOptions::default())
      .await
      .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(Duration::seconds(31));
    let refreshed: Value = cache
      .cached_fetch("profile:7", counting_fetcher(&calls, json!(3)), FetchOptions::default())
      .await
      .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(refreshed, json!(3));
  }

  #[tokio::test]
  async fn test_type_mismatch_is_reported() {
    let cache = RequestCache::new();
    cache.prime("gold:1", 250_u64);

    let err = cache
      .cached_fetch::<String, _, _>(
        "gold:1",
        || async { Ok("unused".to_string()) },
        FetchOptions::default(),
      )
      .await
      .unwrap_err();

    assert!(matches!(err, FetchError::TypeMismatch { .. }));
  }

  #[tokio::test]
  async fn test_invalidate_prefix_and_peek() {
    let cache = RequestCache::new();
    cache.prime("quests:1", 1_u32);
    cache.prime("quests:2", 2_u32);
    cache.prime("kingdom:1", 3_u32);

    assert_eq!(cache.invalidate_prefix("quests:"), 2);
    assert_eq!(cache.peek::<u32>("quests:1"), None);
    assert_eq!(cache.peek::<u32>("kingdom:1"), Some(3));
    cache.invalidate("missing");
  }

  #[tokio::test]
  async fn test_result_of_invalidated_fetch_is_not_cached() {
    let cache = RequestCache::new();
    let gate = Arc::new(Notify::new());
    let fetch_gate = gate.clone();

    let (value, _) = tokio::join!(
      cache.cached_fetch::<Value, _, _>(
        "quests:9",
        move || async move {
          fetch_gate.notified().await;
          Ok(json!("late"))
        },
        FetchOptions::default(),
      ),
      async {
        tokio::task::yield_now().await;
        cache.invalidate("quests:9");
        gate.notify_one();
      }
    );

    assert_eq!(value.unwrap(), json!("late"));
    assert_eq!(cache.peek::<Value>("quests:9"), None);
  }

  #[tokio::test]
  async fn test_fetcher_may_use_the_cache_it_fills() {
    let cache = RequestCache::new();
    cache.prime("profile:1", 10_u32);
    let inner = cache.clone();

    let fetched = tokio::time::timeout(
      std::time::Duration::from_secs(2),
      cache.cached_fetch::<u32, _, _>(
        "quests:1",
        move || {
          // Runs synchronously inside cached_fetch
          let stats = inner.stats();
          let profile = inner.peek::<u32>("profile:1").unwrap_or_default();
          inner.invalidate("unrelated");
          async move { Ok(stats.size as u32 + profile) }
        },
        FetchOptions::default(),
      ),
    )
    .await
    .expect("fetcher touching the cache must not block");

    // The reserved slot for quests:1 is already visible to the fetcher
    assert_eq!(fetched.unwrap(), 12);
    assert_eq!(cache.peek::<u32>("quests:1"), Some(12));
  }

  #[tokio::test]
  async fn test_force_refresh_while_in_flight_supersedes_first_fetch() {
    let cache = RequestCache::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let slow_gate = Arc::new(Notify::new());
    let fast_gate = Arc::new(Notify::new());

    let gated = |gate: Arc<Notify>, value: &'static str| {
      let calls = calls.clone();
      move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
          gate.notified().await;
          Ok(json!(value))
        }
      }
    };

    let (old, new, joined, _) = tokio::join!(
      cache.cached_fetch::<Value, _, _>(
        "quests:1",
        gated(slow_gate.clone(), "old"),
        FetchOptions::default(),
      ),
      cache.cached_fetch::<Value, _, _>(
        "quests:1",
        gated(fast_gate.clone(), "new"),
        FetchOptions::force_refresh(),
      ),
      cache.cached_fetch::<Value, _, _>(
        "quests:1",
        gated(Arc::new(Notify::new()), "never"),
        FetchOptions::default(),
      ),
      async {
        fast_gate.notify_one();
        while cache.peek::<Value>("quests:1").is_none() {
          tokio::task::yield_now().await;
        }
        slow_gate.notify_one();
      }
    );

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(old.unwrap(), json!("old"));
    assert_eq!(new.unwrap(), json!("new"));
    assert_eq!(joined.unwrap(), json!("new"));
    assert_eq!(cache.peek::<Value>("quests:1"), Some(json!("new")));
  }

  #[tokio::test]
  async fn test_panicking_fetcher_aborts_and_frees_the_slot() {
    let cache = RequestCache::new();

    let err = cache
      .cached_fetch::<Value, _, _>(
        "quests:1",
        || -> futures::future::Ready<Result<Value>> { panic!("fetcher bug") },
        FetchOptions::default(),
      )
      .await
      .unwrap_err();

    assert!(matches!(err, FetchError::Aborted { .. }));
    assert_eq!(cache.stats().size, 0);

    let value: Value = cache
      .cached_fetch("quests:1", || async { Ok(json!(1)) }, FetchOptions::default())
      .await
      .unwrap();
    assert_eq!(value, json!(1));
  }
}
