//! Options, statistics and errors for the request cache.

use chrono::Duration;
use color_eyre::Report;
use std::sync::Arc;

/// Per-call options for [`RequestCache::cached_fetch`](super::RequestCache::cached_fetch).
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
  /// Always call the fetcher, even if a fresh value or an in-flight request exists.
  pub force_refresh: bool,
  /// Freshness window for the stored value. `None` falls back to the cache default.
  pub ttl: Option<Duration>,
}

impl FetchOptions {
  pub fn force_refresh() -> Self {
    Self {
      force_refresh: true,
      ttl: None,
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }
}

/// Snapshot of the keys currently held by the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
  /// Number of keys holding a value or an in-flight request
  pub size: usize,
  /// The keys themselves, in no particular order
  pub keys: Vec<String>,
}

/// Error returned by a cached fetch.
///
/// Cloneable so a single failed request can be handed to every caller that
/// was waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
  /// The fetcher itself failed
  #[error("{0}")]
  Fetch(Arc<Report>),
  /// The cached value has a different type than the caller asked for
  #[error("cached value for '{key}' is not a {expected}")]
  TypeMismatch { key: String, expected: &'static str },
  /// The task driving the fetch panicked or was cancelled
  #[error("fetch for '{key}' was aborted: {reason}")]
  Aborted { key: String, reason: String },
}

impl FetchError {
  /// The underlying fetcher error, if this failure came from the fetcher.
  pub fn report(&self) -> Option<&Report> {
    match self {
      FetchError::Fetch(report) => Some(report),
      _ => None,
    }
  }
}
