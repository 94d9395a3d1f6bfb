//! Queued write operations and their bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// HTTP verb used to replay a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Post,
  Put,
  Patch,
  Delete,
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(match self {
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    })
  }
}

impl std::str::FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(format!("unsupported method '{}'", other)),
    }
  }
}

/// A write the client wants the remote store to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
  /// Logical resource the write targets (e.g. "quests:42")
  pub resource: String,
  pub method: Method,
  /// Path relative to the remote base URL
  pub path: String,
  #[serde(default)]
  pub payload: Value,
  /// Cache keys to drop once the write lands. Entries ending in ':' are prefixes.
  #[serde(default)]
  pub invalidates: Vec<String>,
}

impl Operation {
  pub fn new(resource: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
    Self {
      resource: resource.into(),
      method,
      path: path.into(),
      payload: Value::Null,
      invalidates: Vec::new(),
    }
  }

  pub fn with_payload(mut self, payload: Value) -> Self {
    self.payload = payload;
    self
  }

  pub fn invalidating(mut self, key: impl Into<String>) -> Self {
    self.invalidates.push(key.into());
    self
  }
}

/// Where an item is in its retry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
  /// Waiting for its first attempt, or due for a retry
  Pending,
  /// Failed at least once, waiting for `next_retry_at`
  Retrying,
  /// Out of attempts. Never retried automatically
  Failed,
}

/// A persisted write waiting to be sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
  pub id: String,
  pub operation: Operation,
  pub created_at: DateTime<Utc>,
  pub attempts: u32,
  pub next_retry_at: DateTime<Utc>,
  pub status: QueueStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

impl QueueItem {
  /// Whether the drain loop may send this item at `now`.
  pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
    self.status != QueueStatus::Failed && self.next_retry_at <= now
  }
}

/// Counts shown by the sync status indicator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
  pub total: usize,
  pub pending: usize,
  pub retrying: usize,
  pub failed: usize,
  /// Creation time of the oldest item, whatever its status
  pub oldest_item: Option<DateTime<Utc>>,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
  pub sent: usize,
  pub retried: usize,
  pub failed: usize,
  /// Eligible items left untouched because the client went offline
  pub skipped_offline: bool,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_item_serializes_with_camel_case_fields() {
    let now = Utc::now();
    let item = QueueItem {
      id: "1-0".to_string(),
      operation: Operation::new("quests:1", Method::Patch, "rest/v1/quests?id=eq.1")
        .with_payload(json!({ "completed": true })),
      created_at: now,
      attempts: 0,
      next_retry_at: now,
      status: QueueStatus::Pending,
      last_error: None,
    };

    let value = serde_json::to_value(&item).unwrap();
    assert_eq!(value["status"], json!("pending"));
    assert_eq!(value["operation"]["method"], json!("PATCH"));
    assert!(value.get("nextRetryAt").is_some());
    assert!(value.get("lastError").is_none());
  }

  #[test]
  fn test_method_parse() {
    assert_eq!("patch".parse::<Method>(), Ok(Method::Patch));
    assert!("GET".parse::<Method>().is_err());
  }
}
