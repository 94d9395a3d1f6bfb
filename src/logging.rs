use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Environment variable overriding the configured log level.
pub const LOG_ENV: &str = "QUESTSYNC_LOG";

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
  Stderr,
  /// Daily-rolling files in this directory
  Directory(PathBuf),
}

impl LogTarget {
  /// Default log directory: $XDG_DATA_HOME/questsync/logs
  pub fn default_directory() -> Result<Self> {
    let data_dir = dirs::data_dir().ok_or_else(|| eyre!("Could not determine data directory"))?;
    Ok(Self::Directory(data_dir.join("questsync").join("logs")))
  }
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV)
    .or_else(|_| EnvFilter::try_new(&config.level))
    .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// The returned guard flushes buffered lines when dropped, so keep it alive
/// for the life of the process.
pub fn init(config: &LoggingConfig, target: LogTarget) -> Result<WorkerGuard> {
  let (writer, guard) = match target {
    LogTarget::Stderr => tracing_appender::non_blocking(std::io::stderr()),
    LogTarget::Directory(dir) => {
      std::fs::create_dir_all(&dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "questsync.log"))
    }
  };

  tracing_subscriber::fmt()
    .with_env_filter(build_filter(config))
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_invalid_level_falls_back() {
    let config = LoggingConfig {
      level: "not[a valid{directive".to_string(),
    };
    // Only checks that building never panics on bad input
    let _ = build_filter(&config);
  }

  #[test]
  fn test_default_directory_is_under_questsync() {
    if let Ok(LogTarget::Directory(dir)) = LogTarget::default_directory() {
      assert!(dir.ends_with("questsync/logs"));
    }
  }
}
