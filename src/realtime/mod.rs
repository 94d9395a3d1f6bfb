//! Realtime change notifications.
//!
//! A [`PushTransport`] opens channels scoped by table and row filter. The
//! [`RealtimeBridge`] listens on them and, on any change, runs the caller's
//! handler or invalidates cache keys and nudges polling directly.

mod bridge;
mod transport;

pub use bridge::{Invalidation, RealtimeBridge, RealtimeHandlers, Subscription};
pub use transport::{
  ChangeEvent, ChangeKind, ChannelMessage, ChannelTopic, LoopbackTransport, PushChannel,
  PushTransport, RowFilter,
};
