//! Bridges server-pushed row changes into cache invalidation and refreshes.

use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::transport::{ChannelMessage, ChannelTopic, PushTransport};
use crate::cache::RequestCache;
use crate::polling::PollingCoordinator;

type ChangeFn = Arc<dyn Fn() + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks attached to a subscription.
#[derive(Clone)]
pub struct RealtimeHandlers {
  on_change: ChangeFn,
  on_error: Option<ErrorFn>,
}

impl RealtimeHandlers {
  pub fn new(on_change: impl Fn() + Send + Sync + 'static) -> Self {
    Self {
      on_change: Arc::new(on_change),
      on_error: None,
    }
  }

  /// Called when setup fails or the transport reports an error on the channel.
  pub fn on_error(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(f));
    self
  }

  fn notify_change(&self, channel: &str) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| (self.on_change)())).is_err() {
      warn!(channel, "realtime change handler panicked");
    }
  }

  fn report_error(&self, channel: &str, message: &str) {
    if let Some(on_error) = &self.on_error {
      if std::panic::catch_unwind(AssertUnwindSafe(|| on_error(message))).is_err() {
        warn!(channel, "realtime error handler panicked");
      }
    }
  }
}

/// What to refresh when a watched table changes.
#[derive(Debug, Clone, Default)]
pub struct Invalidation {
  pub keys: Vec<String>,
  pub prefixes: Vec<String>,
  /// Polling keys to refresh immediately
  pub refresh: Vec<String>,
}

impl Invalidation {
  pub fn key(mut self, key: impl Into<String>) -> Self {
    self.keys.push(key.into());
    self
  }

  pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
    self.prefixes.push(prefix.into());
    self
  }

  pub fn refresh(mut self, key: impl Into<String>) -> Self {
    self.refresh.push(key.into());
    self
  }
}

type Teardown = Box<dyn FnOnce() -> color_eyre::Result<()> + Send>;

struct SubscriptionState {
  torn_down: AtomicBool,
  teardown: Mutex<Option<Teardown>>,
  listener: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a realtime subscription.
///
/// Tearing down is idempotent and also happens on drop. A subscription whose
/// setup failed is still a valid handle; it just never delivers changes.
pub struct Subscription {
  id: u64,
  topic: ChannelTopic,
  live: bool,
  state: SubscriptionState,
}

impl Subscription {
  fn degraded(id: u64, topic: ChannelTopic) -> Self {
    Self {
      id,
      topic,
      live: false,
      state: SubscriptionState {
        torn_down: AtomicBool::new(false),
        teardown: Mutex::new(None),
        listener: Mutex::new(None),
      },
    }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn topic(&self) -> &ChannelTopic {
    &self.topic
  }

  /// Whether the channel was opened and has not been torn down.
  pub fn is_live(&self) -> bool {
    self.live && !self.state.torn_down.load(Ordering::SeqCst)
  }

  /// Close the channel. Safe to call any number of times.
  pub fn unsubscribe(&self) {
    if self.state.torn_down.swap(true, Ordering::SeqCst) {
      return;
    }

    if let Some(listener) = self.state.listener.lock().take() {
      listener.abort();
    }

    let Some(teardown) = self.state.teardown.lock().take() else {
      return;
    };
    let channel = self.topic.name();
    match std::panic::catch_unwind(AssertUnwindSafe(teardown)) {
      Ok(Ok(())) => debug!(channel = %channel, "realtime unsubscribed"),
      Ok(Err(e)) => warn!(channel = %channel, error = %e, "realtime teardown failed"),
      Err(_) => warn!(channel = %channel, "realtime teardown panicked"),
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.unsubscribe();
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("id", &self.id)
      .field("topic", &self.topic)
      .field("live", &self.is_live())
      .finish()
  }
}

/// Subscribes to row changes and turns them into cache and polling effects.
///
/// Transport failures never reach the caller: they are logged and the
/// subscription degrades to "no live updates", leaving polling as the fallback.
#[derive(Clone)]
pub struct RealtimeBridge {
  transport: Arc<dyn PushTransport>,
  cache: Option<RequestCache>,
  poller: Option<PollingCoordinator>,
  next_id: Arc<AtomicU64>,
}

impl RealtimeBridge {
  pub fn new(transport: Arc<dyn PushTransport>) -> Self {
    Self {
      transport,
      cache: None,
      poller: None,
      next_id: Arc::new(AtomicU64::new(1)),
    }
  }

  pub fn with_cache(mut self, cache: RequestCache) -> Self {
    self.cache = Some(cache);
    self
  }

  pub fn with_poller(mut self, poller: PollingCoordinator) -> Self {
    self.poller = Some(poller);
    self
  }

  /// Call `on_change` for every change to `table` rows matching `filter`.
  pub async fn subscribe(
    &self,
    table: &str,
    filter: &str,
    on_change: impl Fn() + Send + Sync + 'static,
  ) -> Subscription {
    self
      .subscribe_with(table, filter, RealtimeHandlers::new(on_change))
      .await
  }

  /// Like [`subscribe`](Self::subscribe), with an error callback as well.
  pub async fn subscribe_with(
    &self,
    table: &str,
    filter: &str,
    handlers: RealtimeHandlers,
  ) -> Subscription {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let topic = ChannelTopic::new(table, filter);
    let channel = topic.name();

    // A transport may panic while building the future or while polling it
    let opened = match std::panic::catch_unwind(AssertUnwindSafe(|| self.transport.open(&topic))) {
      Ok(opening) => AssertUnwindSafe(opening).catch_unwind().await,
      Err(payload) => Err(payload),
    };
    let push_channel = match opened {
      Ok(Ok(push_channel)) => push_channel,
      Ok(Err(e)) => {
        warn!(channel = %channel, error = %e, "realtime subscription failed, continuing without live updates");
        handlers.report_error(&channel, &format!("{e:#}"));
        return Subscription::degraded(id, topic);
      }
      Err(_) => {
        warn!(channel = %channel, "realtime transport panicked during setup, continuing without live updates");
        handlers.report_error(&channel, "realtime transport panicked during setup");
        return Subscription::degraded(id, topic);
      }
    };

    let (mut events, teardown) = push_channel.into_parts();
    let listener_channel = channel.clone();
    let listener = tokio::spawn(async move {
      while let Some(message) = events.recv().await {
        match message {
          ChannelMessage::Change(event) => {
            trace!(channel = %listener_channel, kind = ?event.kind, "row change");
            handlers.notify_change(&listener_channel);
          }
          ChannelMessage::Error(message) => {
            warn!(channel = %listener_channel, error = %message, "realtime channel error");
            handlers.report_error(&listener_channel, &message);
          }
        }
      }
      debug!(channel = %listener_channel, "realtime channel closed by transport");
    });

    debug!(channel = %channel, id, "realtime subscribed");
    Subscription {
      id,
      topic,
      live: true,
      state: SubscriptionState {
        torn_down: AtomicBool::new(false),
        teardown: Mutex::new(Some(teardown)),
        listener: Mutex::new(Some(listener)),
      },
    }
  }

  /// Invalidate cache entries and nudge polling keys whenever `table` changes.
  pub async fn watch(&self, table: &str, filter: &str, invalidation: Invalidation) -> Subscription {
    if self.cache.is_none() && !(invalidation.keys.is_empty() && invalidation.prefixes.is_empty()) {
      warn!(table, "watch asks for cache invalidation but the bridge has no cache");
    }
    if self.poller.is_none() && !invalidation.refresh.is_empty() {
      warn!(table, "watch asks for refreshes but the bridge has no poller");
    }

    let cache = self.cache.clone();
    let poller = self.poller.clone();
    self
      .subscribe(table, filter, move || {
        if let Some(cache) = &cache {
          for key in &invalidation.keys {
            cache.invalidate(key);
          }
          for prefix in &invalidation.prefixes {
            cache.invalidate_prefix(prefix);
          }
        }
        if let Some(poller) = &poller {
          for key in &invalidation.refresh {
            poller.refresh_now(key);
          }
        }
      })
      .await
  }

  /// Tear down `subscription`. Idempotent; fine after a failed setup.
  pub fn unsubscribe(&self, subscription: &Subscription) {
    subscription.unsubscribe();
  }
}

impl std::fmt::Debug for RealtimeBridge {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RealtimeBridge")
      .field("cache", &self.cache.is_some())
      .field("poller", &self.poller.is_some())
      .finish_non_exhaustive()
  }
}
