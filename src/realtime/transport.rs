//! Push-channel boundary and an in-process loopback implementation.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// Kind of row change pushed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
  Insert,
  Update,
  Delete,
}

/// A row-level change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
  pub table: String,
  pub kind: ChangeKind,
  /// Row after the change (empty for deletes)
  #[serde(default)]
  pub record: Value,
  /// Row before the change, when the server sends it
  #[serde(default)]
  pub old_record: Value,
}

impl ChangeEvent {
  pub fn new(table: impl Into<String>, kind: ChangeKind, record: Value) -> Self {
    Self {
      table: table.into(),
      kind,
      record,
      old_record: Value::Null,
    }
  }
}

/// What a channel delivers to its listener.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
  Change(ChangeEvent),
  /// Transport-level problem reported on an open channel
  Error(String),
}

/// Table plus opaque row predicate identifying a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelTopic {
  pub table: String,
  pub filter: String,
}

impl ChannelTopic {
  pub fn new(table: impl Into<String>, filter: impl Into<String>) -> Self {
    Self {
      table: table.into(),
      filter: filter.into(),
    }
  }

  /// Stable channel name: `realtime:<table>:<first 12 hex chars of sha256(filter)>`.
  pub fn name(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.filter.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("realtime:{}:{}", self.table, &digest[..12])
  }
}

type Teardown = Box<dyn FnOnce() -> Result<()> + Send>;

/// An open channel: a stream of messages plus the means to close it.
pub struct PushChannel {
  events: mpsc::UnboundedReceiver<ChannelMessage>,
  teardown: Teardown,
}

impl PushChannel {
  pub fn new(
    events: mpsc::UnboundedReceiver<ChannelMessage>,
    teardown: impl FnOnce() -> Result<()> + Send + 'static,
  ) -> Self {
    Self {
      events,
      teardown: Box::new(teardown),
    }
  }

  pub(crate) fn into_parts(self) -> (mpsc::UnboundedReceiver<ChannelMessage>, Teardown) {
    (self.events, self.teardown)
  }
}

/// Opens push channels on the realtime backend.
pub trait PushTransport: Send + Sync {
  fn open<'a>(&'a self, topic: &'a ChannelTopic) -> BoxFuture<'a, Result<PushChannel>>;
}

/// Equality predicate on a single column.
///
/// Accepts `column=eq.value` and `column = value`. An empty filter matches
/// every row; anything else unparseable does too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
  column: Option<(String, String)>,
}

impl RowFilter {
  pub fn parse(filter: &str) -> Self {
    let column = filter.split_once('=').and_then(|(column, value)| {
      let column = column.trim();
      let value = value.trim();
      let value = value.strip_prefix("eq.").unwrap_or(value);
      (!column.is_empty()).then(|| (column.to_string(), value.to_string()))
    });
    Self { column }
  }

  pub fn matches(&self, event: &ChangeEvent) -> bool {
    let Some((column, expected)) = &self.column else {
      return true;
    };
    let row = match event.kind {
      ChangeKind::Delete => &event.old_record,
      _ => &event.record,
    };
    match row.get(column) {
      Some(Value::String(actual)) => actual == expected,
      Some(Value::Null) | None => false,
      Some(other) => other.to_string() == *expected,
    }
  }
}

/// In-process transport: changes published here are delivered to every open
/// channel whose table and filter match.
#[derive(Clone)]
pub struct LoopbackTransport {
  tx: broadcast::Sender<ChangeEvent>,
  open_channels: Arc<AtomicUsize>,
  failing: Arc<AtomicBool>,
}

impl LoopbackTransport {
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(256);
    Self {
      tx,
      open_channels: Arc::new(AtomicUsize::new(0)),
      failing: Arc::new(AtomicBool::new(false)),
    }
  }

  /// Deliver `event` to matching channels. Returns how many channels saw it.
  pub fn publish(&self, event: ChangeEvent) -> usize {
    self.tx.send(event).unwrap_or(0)
  }

  /// Number of channels opened and not yet torn down.
  pub fn open_channels(&self) -> usize {
    self.open_channels.load(Ordering::SeqCst)
  }

  /// Make subsequent `open` calls fail, as a restricted environment would.
  pub fn set_failing(&self, failing: bool) {
    self.failing.store(failing, Ordering::SeqCst);
  }
}

impl Default for LoopbackTransport {
  fn default() -> Self {
    Self::new()
  }
}

impl PushTransport for LoopbackTransport {
  fn open<'a>(&'a self, topic: &'a ChannelTopic) -> BoxFuture<'a, Result<PushChannel>> {
    async move {
      if self.failing.load(Ordering::SeqCst) {
        return Err(eyre!("realtime unavailable for {}", topic.name()));
      }

      let mut rx = self.tx.subscribe();
      let (tx, events) = mpsc::unbounded_channel();
      let table = topic.table.clone();
      let filter = RowFilter::parse(&topic.filter);
      let name = topic.name();

      let forward = tokio::spawn(async move {
        loop {
          let message = match rx.recv().await {
            Ok(event) if event.table == table && filter.matches(&event) => {
              ChannelMessage::Change(event)
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
              ChannelMessage::Error(format!("missed {} events", missed))
            }
            Err(broadcast::error::RecvError::Closed) => break,
          };
          if tx.send(message).is_err() {
            break;
          }
        }
      });

      self.open_channels.fetch_add(1, Ordering::SeqCst);
      debug!(channel = %name, "loopback channel opened");

      let open_channels = Arc::clone(&self.open_channels);
      Ok(PushChannel::new(events, move || {
        forward.abort();
        open_channels.fetch_sub(1, Ordering::SeqCst);
        debug!(channel = %name, "loopback channel closed");
        Ok(())
      }))
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_topic_name_is_stable_and_filter_specific() {
    let a = ChannelTopic::new("quests", "user_id=eq.1");
    let b = ChannelTopic::new("quests", "user_id=eq.2");

    assert_eq!(a.name(), ChannelTopic::new("quests", "user_id=eq.1").name());
    assert_ne!(a.name(), b.name());
    assert!(a.name().starts_with("realtime:quests:"));
    assert_eq!(a.name().len(), "realtime:quests:".len() + 12);
  }

  #[test]
  fn test_row_filter_forms() {
    let event = ChangeEvent::new("quests", ChangeKind::Insert, json!({ "user_id": 7, "owner": "ana" }));

    assert!(RowFilter::parse("user_id=eq.7").matches(&event));
    assert!(RowFilter::parse("owner = ana").matches(&event));
    assert!(!RowFilter::parse("owner=eq.bo").matches(&event));
    assert!(!RowFilter::parse("missing=eq.1").matches(&event));
    assert!(RowFilter::parse("").matches(&event));
  }

  #[test]
  fn test_row_filter_uses_old_record_for_deletes() {
    let mut event = ChangeEvent::new("quests", ChangeKind::Delete, Value::Null);
    event.old_record = json!({ "user_id": "u1" });

    assert!(RowFilter::parse("user_id=eq.u1").matches(&event));
  }
}
