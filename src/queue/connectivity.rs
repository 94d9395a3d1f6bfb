//! Network-availability signal.

use std::sync::Arc;
use tokio::sync::watch;

/// Read side of the online/offline signal.
#[derive(Debug, Clone)]
pub struct Connectivity {
  rx: watch::Receiver<bool>,
  pinned: Option<Arc<watch::Sender<bool>>>,
}

/// Write side, held by whatever observes the network (OS events, health checks, the UI).
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  /// Create a signal starting in the given state.
  pub fn new(online: bool) -> (ConnectivityHandle, Connectivity) {
    let (tx, rx) = watch::channel(online);
    (
      ConnectivityHandle { tx: Arc::new(tx) },
      Connectivity { rx, pinned: None },
    )
  }

  /// A signal that is always online. Useful for CLI one-shots.
  pub fn always_online() -> Connectivity {
    let (handle, mut connectivity) = Self::new(true);
    // Holding our own sender means `changed()` never resolves
    connectivity.pinned = Some(handle.tx);
    connectivity
  }

  pub fn is_online(&self) -> bool {
    *self.rx.borrow()
  }

  /// Wait for the next state change and return the new state.
  ///
  /// Returns `None` once every handle has been dropped.
  pub async fn changed(&mut self) -> Option<bool> {
    self.rx.changed().await.ok()?;
    Some(*self.rx.borrow_and_update())
  }
}

impl ConnectivityHandle {
  pub fn set_online(&self, online: bool) {
    self.tx.send_if_modified(|current| {
      let modified = *current != online;
      *current = online;
      modified
    });
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_changes_are_observed() {
    let (handle, mut connectivity) = Connectivity::new(false);
    assert!(!connectivity.is_online());

    handle.set_online(true);
    assert_eq!(connectivity.changed().await, Some(true));
    assert!(connectivity.is_online());
  }

  #[tokio::test]
  async fn test_changed_ends_when_handle_dropped() {
    let (handle, mut connectivity) = Connectivity::new(true);
    drop(handle);
    assert_eq!(connectivity.changed().await, None);
  }
}
