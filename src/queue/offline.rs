//! Durable FIFO queue of writes made while offline.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::backoff::BackoffPolicy;
use super::connectivity::Connectivity;
use super::item::{Operation, ProcessReport, QueueItem, QueueStats, QueueStatus};
use crate::cache::RequestCache;
use crate::clock::{Clock, SystemClock};
use crate::store::{KeyValueStore, KeyValueStoreExt};

/// Store key holding the serialized queue.
pub const QUEUE_KEY: &str = "offline_mutation_queue";

/// Sends a queued operation to the remote store.
pub trait MutationSender: Send + Sync {
  fn send<'a>(&'a self, operation: &'a Operation) -> BoxFuture<'a, Result<()>>;
}

/// Retry and drain settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
  /// Failures allowed before an item is marked failed
  pub max_attempts: u32,
  pub backoff: BackoffPolicy,
  /// How often the auto-drain task retries while online
  pub drain_interval: StdDuration,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      backoff: BackoffPolicy::default(),
      drain_interval: StdDuration::from_secs(30),
    }
  }
}

/// Persisted queue of pending writes, replayed in order with bounded retry.
///
/// Items move `pending -> removed` on success, `pending -> retrying` on a
/// failure with attempts left, and `-> failed` once `max_attempts` is reached.
/// Failed items stay until the user clears or re-queues them.
pub struct OfflineMutationQueue {
  items: Mutex<Vec<QueueItem>>,
  store: Arc<dyn KeyValueStore>,
  sender: Arc<dyn MutationSender>,
  connectivity: Connectivity,
  cache: Option<RequestCache>,
  clock: Arc<dyn Clock>,
  config: QueueConfig,
  draining: tokio::sync::Mutex<()>,
  next_seq: AtomicU64,
}

impl OfflineMutationQueue {
  /// Open the queue, restoring any items persisted by a previous run.
  ///
  /// Unreadable persisted data is logged and treated as an empty queue.
  pub fn open(
    store: Arc<dyn KeyValueStore>,
    sender: Arc<dyn MutationSender>,
    connectivity: Connectivity,
    config: QueueConfig,
  ) -> Self {
    let items = match store.get_json::<Vec<QueueItem>>(QUEUE_KEY) {
      Ok(Some(items)) => {
        debug!(count = items.len(), "restored offline queue");
        items
      }
      Ok(None) => Vec::new(),
      Err(e) => {
        error!(error = %e, "discarding unreadable offline queue");
        Vec::new()
      }
    };
    // Ids end in a sequence number; resume past the highest one kept
    let resume_at = items
      .iter()
      .filter_map(|item| item.id.rsplit_once('-'))
      .filter_map(|(_, seq)| seq.parse::<u64>().ok())
      .map(|seq| seq.saturating_add(1))
      .max()
      .unwrap_or(0);
    let next_seq = AtomicU64::new(resume_at.max(items.len() as u64));

    Self {
      items: Mutex::new(items),
      store,
      sender,
      connectivity,
      cache: None,
      clock: Arc::new(SystemClock),
      config,
      draining: tokio::sync::Mutex::new(()),
      next_seq,
    }
  }

  /// Invalidate keys in `cache` whenever a write lands.
  pub fn with_cache(mut self, cache: RequestCache) -> Self {
    self.cache = Some(cache);
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Append a write to the end of the queue and persist it.
  pub fn enqueue(&self, operation: Operation) -> Result<QueueItem> {
    let now = self.clock.now();
    let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
    let item = QueueItem {
      id: format!("{}-{}", now.timestamp_millis(), seq),
      operation,
      created_at: now,
      attempts: 0,
      next_retry_at: now,
      status: QueueStatus::Pending,
      last_error: None,
    };

    let mut items = self.items.lock();
    items.push(item.clone());
    if let Err(e) = self.persist(&items) {
      items.pop();
      return Err(e);
    }

    info!(id = %item.id, resource = %item.operation.resource, "queued mutation");
    Ok(item)
  }

  /// Send every eligible item, oldest first, while online.
  ///
  /// Each item is attempted at most once per pass. Failures are recorded on
  /// the item rather than returned. Calling this while a pass is already
  /// running returns immediately with an empty report.
  pub async fn process(&self) -> ProcessReport {
    let Ok(_guard) = self.draining.try_lock() else {
      debug!("drain already in progress");
      return ProcessReport::default();
    };

    let mut report = ProcessReport::default();
    self.promote_due();

    let mut attempted = HashSet::new();
    loop {
      let Some(item) = self.next_eligible(&attempted) else {
        break;
      };
      if !self.connectivity.is_online() {
        debug!("offline, leaving queue untouched");
        report.skipped_offline = true;
        break;
      }

      attempted.insert(item.id.clone());
      let result = self.sender.send(&item.operation).await;
      self.record(&item, result, &mut report);
    }

    if report.sent + report.retried + report.failed > 0 {
      info!(
        sent = report.sent,
        retried = report.retried,
        failed = report.failed,
        "drained offline queue"
      );
    }
    report
  }

  /// Move retrying items whose wait has elapsed back to pending.
  fn promote_due(&self) {
    let now = self.clock.now();
    let mut items = self.items.lock();
    let mut promoted = 0;
    for item in items.iter_mut() {
      if item.status == QueueStatus::Retrying && item.next_retry_at <= now {
        item.status = QueueStatus::Pending;
        promoted += 1;
      }
    }
    if promoted > 0 {
      debug!(promoted, "retry window elapsed");
      self.persist_logged(&items);
    }
  }

  fn next_eligible(&self, attempted: &HashSet<String>) -> Option<QueueItem> {
    let now = self.clock.now();
    self
      .items
      .lock()
      .iter()
      .find(|item| item.is_eligible(now) && !attempted.contains(&item.id))
      .cloned()
  }

  fn record(&self, sent: &QueueItem, result: Result<()>, report: &mut ProcessReport) {
    let now = self.clock.now();
    let mut items = self.items.lock();
    let position = items.iter().position(|item| item.id == sent.id);

    match (result, position) {
      (Ok(()), position) => {
        if let Some(pos) = position {
          items.remove(pos);
        }
        report.sent += 1;
        debug!(id = %sent.id, resource = %sent.operation.resource, "mutation sent");
        self.invalidate(&sent.operation);
      }
      (Err(e), Some(pos)) => {
        let item = &mut items[pos];
        item.attempts += 1;
        item.last_error = Some(format!("{e:#}"));

        if item.attempts < self.config.max_attempts {
          item.status = QueueStatus::Retrying;
          item.next_retry_at = now
            .checked_add_signed(self.config.backoff.delay(item.attempts))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
          report.retried += 1;
          warn!(
            id = %item.id,
            attempts = item.attempts,
            retry_at = %item.next_retry_at,
            error = %e,
            "mutation failed, will retry"
          );
        } else {
          item.status = QueueStatus::Failed;
          report.failed += 1;
          warn!(id = %item.id, attempts = item.attempts, error = %e, "mutation failed permanently");
        }
      }
      (Err(e), None) => {
        debug!(id = %sent.id, error = %e, "mutation failed after being removed from the queue");
      }
    }

    self.persist_logged(&items);
  }

  fn invalidate(&self, operation: &Operation) {
    let Some(cache) = &self.cache else {
      return;
    };
    for key in &operation.invalidates {
      if key.ends_with(':') {
        cache.invalidate_prefix(key);
      } else {
        cache.invalidate(key);
      }
    }
  }

  /// Counts by status, plus the age of the oldest item.
  pub fn stats(&self) -> QueueStats {
    let items = self.items.lock();
    let mut stats = QueueStats {
      total: items.len(),
      oldest_item: items.iter().map(|item| item.created_at).min(),
      ..QueueStats::default()
    };
    for item in items.iter() {
      match item.status {
        QueueStatus::Pending => stats.pending += 1,
        QueueStatus::Retrying => stats.retrying += 1,
        QueueStatus::Failed => stats.failed += 1,
      }
    }
    stats
  }

  /// Snapshot of every item in queue order.
  pub fn items(&self) -> Vec<QueueItem> {
    self.items.lock().clone()
  }

  /// Drop every item regardless of status.
  pub fn clear(&self) -> Result<()> {
    let mut items = self.items.lock();
    items.clear();
    self.persist(&items)?;
    info!("offline queue cleared");
    Ok(())
  }

  /// Drop a single item. Returns whether it existed.
  pub fn remove(&self, id: &str) -> Result<bool> {
    let mut items = self.items.lock();
    let before = items.len();
    items.retain(|item| item.id != id);
    if items.len() == before {
      return Ok(false);
    }
    self.persist(&items)?;
    Ok(true)
  }

  /// Replace every failed item with a fresh pending copy at the end of the queue.
  ///
  /// This is the explicit retry action offered to the user. Returns how many
  /// items were re-queued.
  pub fn requeue_failed(&self) -> Result<usize> {
    let now = self.clock.now();
    let mut items = self.items.lock();
    let (failed, mut kept): (Vec<_>, Vec<_>) = items
      .drain(..)
      .partition(|item| item.status == QueueStatus::Failed);

    let count = failed.len();
    for old in failed {
      let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
      kept.push(QueueItem {
        id: format!("{}-{}", now.timestamp_millis(), seq),
        operation: old.operation,
        created_at: now,
        attempts: 0,
        next_retry_at: now,
        status: QueueStatus::Pending,
        last_error: None,
      });
    }
    *items = kept;
    self.persist(&items)?;

    if count > 0 {
      info!(count, "re-queued failed mutations");
    }
    Ok(count)
  }

  /// Drain whenever connectivity comes back, and periodically while online.
  pub fn spawn_auto_drain(self: Arc<Self>) -> JoinHandle<()> {
    let mut connectivity = self.connectivity.clone();
    let mut ticker = tokio::time::interval(self.config.drain_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::spawn(async move {
      loop {
        tokio::select! {
          changed = connectivity.changed() => match changed {
            Some(true) => {
              info!("connectivity restored, draining offline queue");
              self.process().await;
            }
            Some(false) => debug!("connectivity lost"),
            None => break,
          },
          _ = ticker.tick() => {
            if connectivity.is_online() && !self.items.lock().is_empty() {
              self.process().await;
            }
          }
        }
      }
      debug!("auto-drain stopped");
    })
  }

  fn persist(&self, items: &[QueueItem]) -> Result<()> {
    self.store.set_json(QUEUE_KEY, items)
  }

  fn persist_logged(&self, items: &[QueueItem]) {
    if let Err(e) = self.persist(items) {
      error!(error = %e, "failed to persist offline queue");
    }
  }
}

impl std::fmt::Debug for OfflineMutationQueue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OfflineMutationQueue")
      .field("stats", &self.stats())
      .field("config", &self.config)
      .finish_non_exhaustive()
  }
}
