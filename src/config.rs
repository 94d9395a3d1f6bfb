use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::RequestCache;
use crate::clock::Clock;
use crate::polling::PollingCoordinator;
use crate::queue::{BackoffPolicy, QueueConfig};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub remote: RemoteConfig,
  pub cache: CacheConfig,
  pub queue: QueueSettings,
  pub polling: PollingConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  /// Base URL of the remote store's REST endpoint
  pub url: String,
  pub timeout_secs: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:54321/".to_string(),
      timeout_secs: 15,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Freshness window for cached values. Unset means values never go stale on their own
  pub ttl_secs: Option<u64>,
}

impl CacheConfig {
  /// Default freshness window for a [`RequestCache`](crate::RequestCache).
  ///
  /// A window too large to represent is treated as no expiry.
  pub fn default_ttl(&self) -> Option<chrono::Duration> {
    self
      .ttl_secs
      .and_then(|secs| i64::try_from(secs).ok())
      .and_then(chrono::Duration::try_seconds)
  }

  pub fn request_cache(&self, clock: Arc<dyn Clock>) -> RequestCache {
    RequestCache::with_clock(clock, self.default_ttl())
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub drain_interval_secs: u64,
  /// Where the durable store lives (default: $XDG_DATA_HOME/questsync/sync.db)
  pub db_path: Option<PathBuf>,
}

impl Default for QueueSettings {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      base_delay_ms: 1_000,
      max_delay_ms: 60_000,
      drain_interval_secs: 30,
      db_path: None,
    }
  }
}

/// Longest allowed pause between periodic drains (one day).
const MAX_DRAIN_INTERVAL_SECS: u64 = 86_400;

impl QueueSettings {
  pub fn queue_config(&self) -> QueueConfig {
    let millis = |ms: u64| chrono::Duration::milliseconds(ms.min(i64::MAX as u64) as i64);
    QueueConfig {
      max_attempts: self.max_attempts.max(1),
      backoff: BackoffPolicy {
        base: millis(self.base_delay_ms),
        max_delay: millis(self.max_delay_ms),
      },
      drain_interval: Duration::from_secs(self.drain_interval_secs.clamp(1, MAX_DRAIN_INTERVAL_SECS)),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
  /// Ticks within this window after a local edit are skipped
  pub debounce_ms: u64,
}

impl Default for PollingConfig {
  fn default() -> Self {
    Self { debounce_ms: 3_000 }
  }
}

impl PollingConfig {
  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.debounce_ms)
  }

  /// Coordinator using the configured debounce window.
  ///
  /// The CLI does not poll; this is for applications embedding the library.
  pub fn coordinator(&self) -> PollingCoordinator {
    PollingCoordinator::new(self.debounce())
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter directive used when QUESTSYNC_LOG is unset
  pub level: String,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./questsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/questsync/config.yaml
  ///
  /// With no file found, the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("questsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("questsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    // An empty file deserializes to unit, not to a map
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Get the API token for the remote store from the environment.
  ///
  /// Checks QUESTSYNC_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("QUESTSYNC_API_TOKEN")
      .ok()
      .filter(|token| !token.is_empty())
  }
}
