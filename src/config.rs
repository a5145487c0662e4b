use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::TtlPolicy;
use crate::sync::SyncOptions;
use crate::tabs::TabOptions;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub tabs: TabsConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Write logs to a daily file in this directory instead of stderr
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  pub request_timeout_ms: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:3000".to_string(),
      request_timeout_ms: 10_000,
    }
  }
}

/// Durations of the named TTL tiers, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub short_secs: u64,
  pub medium_secs: u64,
  pub long_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let policy = TtlPolicy::default();
    Self {
      short_secs: policy.short.as_secs(),
      medium_secs: policy.medium.as_secs(),
      long_secs: policy.long.as_secs(),
    }
  }
}

impl CacheConfig {
  pub fn policy(&self) -> TtlPolicy {
    TtlPolicy {
      short: Duration::from_secs(self.short_secs),
      medium: Duration::from_secs(self.medium_secs),
      long: Duration::from_secs(self.long_secs),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TabsConfig {
  pub auto_load: bool,
  pub refresh_on_tab_switch: bool,
  /// Defaults to the medium cache tier
  pub stale_after_secs: Option<u64>,
}

impl Default for TabsConfig {
  fn default() -> Self {
    let options = TabOptions::default();
    Self {
      auto_load: options.auto_load,
      refresh_on_tab_switch: options.refresh_on_tab_switch,
      stale_after_secs: None,
    }
  }
}

impl TabsConfig {
  pub fn options(&self, policy: &TtlPolicy) -> TabOptions {
    TabOptions {
      auto_load: self.auto_load,
      refresh_on_tab_switch: self.refresh_on_tab_switch,
      stale_after: self
        .stale_after_secs
        .map(Duration::from_secs)
        .unwrap_or(policy.medium),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Apply optimistic patches unless an operation opts out
  pub optimistic: bool,
  pub patch_expiry_secs: u64,
  pub status_poll_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    let options = SyncOptions::default();
    Self {
      optimistic: options.optimistic,
      patch_expiry_secs: options.patch_expiry.as_secs(),
      status_poll_secs: 30,
    }
  }
}

impl SyncConfig {
  pub fn options(&self) -> SyncOptions {
    SyncOptions {
      optimistic: self.optimistic,
      patch_expiry: Duration::from_secs(self.patch_expiry_secs),
    }
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.status_poll_secs.max(1))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./internsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/internsync/config.yaml
  ///
  /// With no explicit path and no file found, defaults are used.
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
    let local = PathBuf::from("internsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("internsync").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Get the API token from the environment.
  ///
  /// Checks INTERNSYNC_API_TOKEN. Requests go out unauthenticated without it.
  pub fn get_api_token() -> Option<String> {
    std::env::var("INTERNSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
