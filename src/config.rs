use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::db::Database;
use crate::error::{Result, SyncError};
use crate::queue::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database file (defaults to $XDG_DATA_HOME/driftq/store.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
  /// How often expired cache entries are swept
  pub eviction_interval_seconds: u64,
  /// Delivery attempts before a mutation is dead-lettered
  pub max_attempts: u32,
  pub base_backoff_ms: u64,
  pub backoff_cap_ms: u64,
  /// Bound on a single delivery attempt
  pub send_timeout_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      eviction_interval_seconds: 3600,
      max_attempts: 5,
      base_backoff_ms: 1_000,
      backoff_cap_ms: 300_000,
      send_timeout_ms: 10_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  /// Base URL mutations are posted to
  pub endpoint: Option<Url>,
  pub probe_interval_seconds: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      endpoint: None,
      probe_interval_seconds: 15,
    }
  }
}

/// Validated runtime form of [`SyncConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
  pub eviction_interval: Duration,
  pub retry: RetryPolicy,
  pub send_timeout: Duration,
}

impl Default for SyncSettings {
  fn default() -> Self {
    // The defaults are known to be valid.
    SyncConfig::default().settings().unwrap_or(Self {
      eviction_interval: Duration::from_secs(3600),
      retry: RetryPolicy::default(),
      send_timeout: Duration::from_secs(10),
    })
  }
}

impl SyncConfig {
  pub fn settings(&self) -> Result<SyncSettings> {
    if self.eviction_interval_seconds == 0 {
      return Err(SyncError::Config(
        "eviction_interval_seconds must be at least 1".into(),
      ));
    }
    if self.max_attempts == 0 {
      return Err(SyncError::Config("max_attempts must be at least 1".into()));
    }
    if self.base_backoff_ms > self.backoff_cap_ms {
      return Err(SyncError::Config(format!(
        "base_backoff_ms ({}) exceeds backoff_cap_ms ({})",
        self.base_backoff_ms, self.backoff_cap_ms
      )));
    }
    if self.send_timeout_ms == 0 {
      return Err(SyncError::Config("send_timeout_ms must be at least 1".into()));
    }

    Ok(SyncSettings {
      eviction_interval: Duration::from_secs(self.eviction_interval_seconds),
      retry: RetryPolicy {
        max_attempts: self.max_attempts,
        base_backoff: Duration::from_millis(self.base_backoff_ms),
        backoff_cap: Duration::from_millis(self.backoff_cap_ms),
      },
      send_timeout: Duration::from_millis(self.send_timeout_ms),
    })
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./driftq.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/driftq/config.yaml
  ///
  /// Without any file the defaults apply. `DRIFTQ_ENDPOINT` overrides the endpoint.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(SyncError::Config(format!(
          "Config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(endpoint) = std::env::var("DRIFTQ_ENDPOINT") {
      config.remote.endpoint = Some(
        Url::parse(&endpoint)
          .map_err(|e| SyncError::Config(format!("Invalid DRIFTQ_ENDPOINT '{}': {}", endpoint, e)))?,
      );
    }

    // Fail early rather than at the first drain.
    config.sync.settings()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("driftq.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("driftq").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      SyncError::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    Self::parse(&contents)
      .map_err(|e| SyncError::Config(format!("Failed to parse config file {}: {}", path.display(), e)))
  }

  pub fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// The substrate described by `storage.path`, or the default location.
  pub fn database(&self) -> Result<Database> {
    let path = match &self.storage.path {
      Some(path) => path.clone(),
      None => Database::default_path()?,
    };
    Ok(Database::at_path(path))
  }
}
