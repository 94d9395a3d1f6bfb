//! Client-side data sync core.
//!
//! [`RequestCache`] deduplicates and caches fetches, [`OfflineMutationQueue`]
//! persists writes made offline and replays them with bounded retry,
//! [`PollingCoordinator`] runs per-key refresh timers that back off around
//! local edits, and [`RealtimeBridge`] turns server-pushed row changes into
//! cache invalidations and polling nudges.

pub mod app;
pub mod cache;
pub mod clock;
pub mod config;
pub mod event;
pub mod logging;
pub mod polling;
pub mod queue;
pub mod realtime;
pub mod remote;
pub mod store;
mod ui;

pub use cache::{CacheStats, FetchError, FetchOptions, RequestCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use polling::{PollConfig, PollingCoordinator};
pub use queue::{
  Connectivity, ConnectivityHandle, MutationSender, OfflineMutationQueue, Operation, QueueConfig,
  QueueItem, QueueStats, QueueStatus,
};
pub use realtime::{Invalidation, PushTransport, RealtimeBridge, RealtimeHandlers, Subscription};
pub use remote::RemoteClient;
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
