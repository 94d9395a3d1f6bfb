//! SQLite-backed key-value store.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::KeyValueStore;

/// Schema for the key-value table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite-based key-value store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway store that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("questsync").join("sync.db"))
  }

  fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    f(&conn)
  }
}

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<Value>> {
    self.with_conn(|conn| {
      let raw: Option<String> = conn
        .query_row(
          "SELECT value FROM kv_store WHERE key = ?",
          params![key],
          |row| row.get(0),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read {}: {}", key, e))?;

      raw
        .map(|text| {
          serde_json::from_str(&text).map_err(|e| eyre!("Corrupt value stored for {}: {}", key, e))
        })
        .transpose()
    })
  }

  fn set(&self, key: &str, value: &Value) -> Result<()> {
    let text =
      serde_json::to_string(value).map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;

    self.with_conn(|conn| {
      conn
        .execute(
          "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
           VALUES (?, ?, datetime('now'))",
          params![key, text],
        )
        .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;
      Ok(())
    })
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.with_conn(|conn| {
      conn
        .execute("DELETE FROM kv_store WHERE key = ?", params![key])
        .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;
      Ok(())
    })
  }

  fn keys(&self) -> Result<Vec<String>> {
    self.with_conn(|conn| {
      let mut stmt = conn
        .prepare("SELECT key FROM kv_store ORDER BY key")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let keys = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| eyre!("Failed to list keys: {}", e))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| eyre!("Failed to read key: {}", e))?;

      Ok(keys)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_set_get_overwrite() {
    let store = SqliteStore::open_in_memory().unwrap();

    store.set("queue", &json!([1, 2])).unwrap();
    store.set("queue", &json!([3])).unwrap();

    assert_eq!(store.get("queue").unwrap(), Some(json!([3])));
    assert_eq!(store.get("missing").unwrap(), None);
  }

  #[test]
  fn test_keys_sorted_and_remove() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.set("b", &json!(true)).unwrap();
    store.set("a", &json!(false)).unwrap();

    assert_eq!(store.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);

    store.remove("a").unwrap();
    store.remove("a").unwrap();
    assert_eq!(store.keys().unwrap(), vec!["b".to_string()]);
  }

  #[test]
  fn test_persists_across_reopen() {
    let dir = std::env::temp_dir().join(format!("questsync-store-{}", std::process::id()));
    let path = dir.join("sync.db");
    let _ = std::fs::remove_file(&path);

    {
      let store = SqliteStore::open_at(&path).unwrap();
      store.set("migration_complete:legacy", &json!(true)).unwrap();
    }

    let reopened = SqliteStore::open_at(&path).unwrap();
    assert_eq!(
      reopened.get("migration_complete:legacy").unwrap(),
      Some(json!(true))
    );

    drop(reopened);
    let _ = std::fs::remove_dir_all(&dir);
  }
}
