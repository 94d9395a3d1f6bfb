//! Request cache with in-flight deduplication.
//!
//! Callers name a key and supply a fetcher; the cache:
//! - Serves values still inside their freshness window without fetching
//! - Hands every concurrent caller for a key the same in-flight request
//! - Forgets failed fetches so the next call retries from scratch
//! - Supports explicit invalidation by key or key prefix

mod layer;
mod types;

pub use layer::RequestCache;
pub use types::{CacheStats, FetchError, FetchOptions};
