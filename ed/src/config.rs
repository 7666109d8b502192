//! Encore configuration types and loading

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::scheduler::SchedulerConfig;
use crate::server::ServerConfig;
use crate::stats::StatsConfig;

const LOCAL_CONFIG: &str = ".encore.yml";

/// Main Encore configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration
    pub storage: StorageConfig,

    /// Promotion and dispatch
    pub scheduling: SchedulerConfig,

    /// Summary aggregation
    pub stats: StatsConfig,

    /// Task serving
    pub server: ServerConfig,

    /// Static geolocation table
    pub geolocation: GeolocationConfig,
}

impl Config {
    /// Reject settings the loops cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.scheduling.interval_secs == 0 {
            return Err(eyre!("scheduling.interval-secs must be greater than zero"));
        }
        if self.scheduling.selection_timeout_ms == 0 {
            return Err(eyre!("scheduling.selection-timeout-ms must be greater than zero"));
        }
        if self.stats.rebuild_interval_secs == 0 {
            return Err(eyre!("stats.rebuild-interval-secs must be greater than zero"));
        }
        Ok(())
    }

    /// Load `config_path` if given, otherwise the first file found by
    /// [`Config::search_paths`], otherwise defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        match config_path {
            Some(path) => Self::read(path),
            None => Self::discover(&Self::search_paths()),
        }
    }

    /// `.encore.yml` in the working directory, then `encore/encore.yml` in the
    /// user config directory
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(LOCAL_CONFIG)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("encore").join("encore.yml"));
        }
        paths
    }

    /// Read the first of `paths` that exists
    ///
    /// A file that exists but fails to parse is an error, not skipped.
    pub fn discover(paths: &[PathBuf]) -> Result<Self> {
        match paths.iter().find(|path| path.is_file()) {
            Some(path) => Self::read(path),
            None => {
                info!(searched = ?paths, "No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).wrap_err_with(|| format!("Failed to read config from {}", path.display()))?;
        let config =
            serde_yaml::from_str(&content).wrap_err_with(|| format!("Failed to parse config from {}", path.display()))?;
        info!(path = %path.display(), "Config loaded");
        Ok(config)
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // XDG data directory (~/.local/share/encore on Linux)
        let database = dirs::data_dir()
            .map(|d| d.join("encore"))
            .unwrap_or_else(|| PathBuf::from(".encore"))
            .join("encore.db");
        Self { database }
    }
}

/// Geolocation configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeolocationConfig {
    /// Address to country code
    pub countries: HashMap<IpAddr, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.scheduling.interval_secs, 60);
        assert_eq!(config.scheduling.concurrent_groups, 10);
        assert_eq!(config.stats.rebuild_interval_secs, 300);
        assert_eq!(config.server.server_url, "http://localhost:8080");
        assert!(config.storage.database.ends_with("encore/encore.db"));
        config.validate().unwrap();
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
storage:
  database: /var/lib/encore/encore.db

scheduling:
  interval-secs: 30
  concurrent-groups: 4
  selection-timeout-ms: 500

stats:
  rebuild-interval-secs: 120

server:
  server-url: https://encore.example
  templates-path: /etc/encore/templates
  debug: true

geolocation:
  countries:
    198.51.100.4: BR
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.storage.database, PathBuf::from("/var/lib/encore/encore.db"));
        assert_eq!(config.scheduling.concurrent_groups, 4);
        assert_eq!(config.scheduling.selection_timeout_ms, 500);
        assert_eq!(config.stats.rebuild_interval_secs, 120);
        assert!(config.server.debug);
        assert_eq!(
            config.geolocation.countries.get(&"198.51.100.4".parse().unwrap()),
            Some(&"BR".to_string())
        );
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = Config::default();
        config.scheduling.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scheduling.selection_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.stats.rebuild_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("encore.yml");
        fs::write(&path, "scheduling:\n  concurrent-groups: 2\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.scheduling.concurrent_groups, 2);
        assert_eq!(config.scheduling.interval_secs, 60);

        assert!(Config::load(Some(&temp.path().join("missing.yml"))).is_err());
    }

    #[test]
    fn test_discover_takes_first_existing_file() {
        let temp = tempdir().unwrap();
        let local = temp.path().join(".encore.yml");
        let user = temp.path().join("user.yml");
        fs::write(&user, "scheduling:\n  concurrent-groups: 7\n").unwrap();

        let config = Config::discover(&[local.clone(), user.clone()]).unwrap();
        assert_eq!(config.scheduling.concurrent_groups, 7);

        fs::write(&local, "scheduling:\n  concurrent-groups: 3\n").unwrap();
        let config = Config::discover(&[local, user]).unwrap();
        assert_eq!(config.scheduling.concurrent_groups, 3);
    }

    #[test]
    fn test_discover_rejects_invalid_file() {
        let temp = tempdir().unwrap();
        let local = temp.path().join(".encore.yml");
        let user = temp.path().join("user.yml");
        fs::write(&local, "scheduling: [not, a, map]\n").unwrap();
        fs::write(&user, "scheduling:\n  concurrent-groups: 7\n").unwrap();

        let err = Config::discover(&[local, user]).unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse config from"));
    }

    #[test]
    fn test_discover_defaults_without_files() {
        let temp = tempdir().unwrap();
        let config = Config::discover(&[temp.path().join("none.yml")]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(Config::search_paths()[0], PathBuf::from(".encore.yml"));
    }
}
