//! Durable key-value storage for queue items and one-time flags.
//!
//! Keys are plain strings and values are JSON documents. Each logical key is
//! written by a single owning component, so last-writer-wins is sufficient.

mod sqlite;

use color_eyre::{eyre::eyre, Result};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub use sqlite::SqliteStore;

/// Trait for key-value storage backends.
pub trait KeyValueStore: Send + Sync {
  /// Read the value stored under `key`.
  fn get(&self, key: &str) -> Result<Option<Value>>;

  /// Store `value` under `key`, replacing any previous value.
  fn set(&self, key: &str, value: &Value) -> Result<()>;

  /// Remove `key`. Removing a missing key is not an error.
  fn remove(&self, key: &str) -> Result<()>;

  /// All stored keys, sorted.
  fn keys(&self) -> Result<Vec<String>>;
}

/// Typed helpers on top of any [`KeyValueStore`].
pub trait KeyValueStoreExt: KeyValueStore {
  fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    match self.get(key)? {
      Some(value) => serde_json::from_value(value)
        .map(Some)
        .map_err(|e| eyre!("Failed to decode stored value for {}: {}", key, e)),
      None => Ok(None),
    }
  }

  fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
    let value = serde_json::to_value(value)
      .map_err(|e| eyre!("Failed to encode value for {}: {}", key, e))?;
    self.set(key, &value)
  }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

/// Store that keeps everything in memory. Used in tests and when persistence is disabled.
#[derive(Debug, Default)]
pub struct MemoryStore {
  values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<Value>> {
    Ok(self.values.lock().get(key).cloned())
  }

  fn set(&self, key: &str, value: &Value) -> Result<()> {
    self.values.lock().insert(key.to_string(), value.clone());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.values.lock().remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(self.values.lock().keys().cloned().collect())
  }
}

const MIGRATION_PREFIX: &str = "migration_complete:";

/// Whether the one-time migration `name` has already run on this device.
pub fn is_migration_complete(store: &dyn KeyValueStore, name: &str) -> Result<bool> {
  Ok(
    store
      .get_json::<bool>(&format!("{MIGRATION_PREFIX}{name}"))?
      .unwrap_or(false),
  )
}

/// Record that the one-time migration `name` finished.
pub fn mark_migration_complete(store: &dyn KeyValueStore, name: &str) -> Result<()> {
  store.set_json(&format!("{MIGRATION_PREFIX}{name}"), &true)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_memory_store_roundtrip_and_remove() {
    let store = MemoryStore::new();
    store.set("a", &json!({ "streak": 3 })).unwrap();

    assert_eq!(store.get("a").unwrap(), Some(json!({ "streak": 3 })));
    assert_eq!(store.keys().unwrap(), vec!["a".to_string()]);

    store.remove("a").unwrap();
    store.remove("a").unwrap();
    assert_eq!(store.get("a").unwrap(), None);
  }

  #[test]
  fn test_migration_flag() {
    let store = MemoryStore::new();
    assert!(!is_migration_complete(&store, "legacy_quests").unwrap());

    mark_migration_complete(&store, "legacy_quests").unwrap();

    assert!(is_migration_complete(&store, "legacy_quests").unwrap());
    assert!(!is_migration_complete(&store, "legacy_kingdom").unwrap());
  }

  #[test]
  fn test_get_json_reports_decode_errors() {
    let store = MemoryStore::new();
    store.set("count", &json!("not a number")).unwrap();

    assert!(store.get_json::<u32>("count").is_err());
  }
}
