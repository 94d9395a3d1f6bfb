//! Offline mutation queue.
//!
//! Writes issued while disconnected are persisted to a [`KeyValueStore`](crate::store::KeyValueStore)
//! and replayed in creation order once the client is back online:
//! - Successful sends are removed and invalidate the cache keys they affect
//! - Failed sends are retried with capped exponential backoff
//! - Items out of attempts are kept as `failed` until the user acts on them

mod backoff;
mod connectivity;
mod item;
mod offline;

pub use backoff::{backoff, BackoffPolicy};
pub use connectivity::{Connectivity, ConnectivityHandle};
pub use item::{Method, Operation, ProcessReport, QueueItem, QueueStats, QueueStatus};
pub use offline::{MutationSender, OfflineMutationQueue, QueueConfig, QUEUE_KEY};
