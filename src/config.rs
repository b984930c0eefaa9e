use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL of the ERP server (e.g., "https://erp.example.com")
  pub origin: String,
  /// Default notification title
  #[serde(default = "default_app_name")]
  pub app_name: String,
  #[serde(default)]
  pub caches: CachesConfig,
  #[serde(default)]
  pub routes: RoutesConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
  #[serde(default)]
  pub database: DatabaseConfig,
}

fn default_app_name() -> String {
  "ERP".to_string()
}

/// Cache name prefix and the current version of each cache category.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CachesConfig {
  pub prefix: String,
  pub static_assets: u32,
  pub runtime: u32,
  pub data: u32,
}

impl Default for CachesConfig {
  fn default() -> Self {
    Self {
      prefix: "erp".to_string(),
      static_assets: 1,
      runtime: 1,
      data: 1,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Path prefixes that always go to the network (auth, sync)
  pub network_only: Vec<String>,
  /// Path prefixes served cache-first (static assets, icons, images)
  pub cache_first: Vec<String>,
  /// Path prefix of the JSON API (network-first)
  pub api_prefix: String,
  /// Page served to navigations when neither network nor cache can answer
  pub offline_page: String,
  /// Assets stored in the static cache on install
  pub precache: Vec<String>,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      network_only: vec!["/api/auth".to_string(), "/api/sync".to_string()],
      cache_first: vec![
        "/_next/static".to_string(),
        "/icons".to_string(),
        "/images".to_string(),
        "/static".to_string(),
        "/manifest.json".to_string(),
        "/favicon.ico".to_string(),
      ],
      api_prefix: "/api/".to_string(),
      offline_page: "/offline".to_string(),
      precache: vec![
        "/".to_string(),
        "/offline".to_string(),
        "/manifest.json".to_string(),
      ],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Endpoint offline sales are replayed against
  pub sales_endpoint: String,
  /// Server-side failures before an operation is given up as failed;
  /// network errors don't count
  pub max_attempts: u32,
  pub base_delay_secs: u64,
  pub max_delay_secs: u64,
  /// Period of the background sweep while online
  pub interval_secs: u64,
  /// How long a sweep's claim on an operation holds before another
  /// process may take it over
  pub claim_lease_secs: i64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      sales_endpoint: "/api/pos/sales".to_string(),
      max_attempts: 10,
      base_delay_secs: 5,
      max_delay_secs: 300,
      interval_secs: 60,
      claim_lease_secs: crate::store::DEFAULT_CLAIM_LEASE_SECS,
    }
  }
}

impl SyncConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs.max(1))
  }

  pub fn claim_lease(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.claim_lease_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_path: String,
  pub interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_path: "/api/health".to_string(),
      interval_secs: 15,
    }
  }
}

impl ConnectivityConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter when RUST_LOG is not set
  pub level: String,
  /// Directory for daily log files (stderr only when unset)
  pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "warn".to_string(),
      dir: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./erp-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/erp-offline/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/erp-offline/config.yaml\n\
                 with at least an `origin:` entry."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("erp-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("erp-offline").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    url::Url::parse(&config.origin)
      .map_err(|e| eyre!("Invalid origin '{}': {}", config.origin, e))?;
    Ok(config)
  }

  /// Configuration with defaults for everything but the origin.
  pub fn with_origin(origin: &str) -> Self {
    Self {
      origin: origin.to_string(),
      app_name: default_app_name(),
      caches: CachesConfig::default(),
      routes: RoutesConfig::default(),
      sync: SyncConfig::default(),
      connectivity: ConnectivityConfig::default(),
      logging: LoggingConfig::default(),
      database: DatabaseConfig::default(),
    }
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database.path {
      Some(path) => Ok(path.clone()),
      None => crate::db::Database::default_path(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("origin: https://erp.local\n").unwrap();
    assert_eq!(config.app_name, "ERP");
    assert_eq!(config.caches.prefix, "erp");
    assert_eq!(config.routes.api_prefix, "/api/");
    assert_eq!(config.routes.precache, vec!["/", "/offline", "/manifest.json"]);
    assert_eq!(config.sync.sales_endpoint, "/api/pos/sales");
    assert_eq!(config.sync.max_attempts, 10);
  }

  #[test]
  fn test_partial_section_keeps_other_defaults() {
    let yaml = "origin: https://erp.local\ncaches:\n  data: 4\nsync:\n  max_attempts: 3\n";
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.caches.data, 4);
    assert_eq!(config.caches.static_assets, 1);
    assert_eq!(config.sync.max_attempts, 3);
    assert_eq!(config.sync.base_delay_secs, 5);
    assert_eq!(config.sync.claim_lease(), chrono::Duration::seconds(600));
  }

  #[test]
  fn test_invalid_origin_rejected() {
    assert!(Config::from_yaml("origin: not a url\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/nonexistent/erp-offline.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
