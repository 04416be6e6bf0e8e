use color_eyre::{eyre::eyre, Result};
use rescache::{CacheOptions, DatabaseRegistry};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub database: DatabaseConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
  /// Database name; the file is `<dir>/<name>.db`
  #[serde(default = "default_database_name")]
  pub name: String,
  /// Directory for database files (defaults to $XDG_DATA_HOME/rescache)
  pub dir: Option<PathBuf>,
}

impl Default for DatabaseConfig {
  fn default() -> Self {
    Self {
      name: default_database_name(),
      dir: None,
    }
  }
}

fn default_database_name() -> String {
  "rescache".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Keep server baselines for pending changes
  #[serde(default = "default_true")]
  pub track_baselines: bool,
  /// Record mutations in the delta journal
  #[serde(default)]
  pub journal: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      track_baselines: true,
      journal: false,
    }
  }
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Filter used when RESCACHE_LOG is not set
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      file: None,
    }
  }
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rescache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rescache/config.yaml
  ///
  /// Without any file the defaults are used.
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
    let local = PathBuf::from("rescache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rescache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty file deserializes as null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Registry rooted at the configured (or default) data directory.
  pub fn registry(&self) -> Result<DatabaseRegistry> {
    let dir = match &self.database.dir {
      Some(dir) => dir.clone(),
      None => DatabaseRegistry::default_dir()?,
    };
    Ok(DatabaseRegistry::new(dir))
  }

  pub fn cache_options(&self) -> CacheOptions {
    CacheOptions::default()
      .with_track_baselines(self.cache.track_baselines)
      .with_journal(self.cache.journal)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_config_uses_defaults() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.database.name, "rescache");
    assert!(config.cache.track_baselines);
    assert!(!config.cache.journal);
    assert_eq!(config.log.level, "info");
  }

  #[test]
  fn test_partial_config() {
    let config = Config::parse(
      r#"
database:
  name: app
  dir: /tmp/rescache-test
cache:
  journal: true
log:
  level: debug
  file: /tmp/rescache.log
"#,
    )
    .unwrap();

    assert_eq!(config.database.name, "app");
    assert_eq!(config.database.dir, Some(PathBuf::from("/tmp/rescache-test")));
    assert!(config.cache.track_baselines);
    assert!(config.cache.journal);
    assert_eq!(config.log.file, Some(PathBuf::from("/tmp/rescache.log")));

    let options = config.cache_options();
    assert!(options.journal);
  }

  #[test]
  fn test_missing_explicit_path_fails() {
    assert!(Config::load(Some(Path::new("/nonexistent/rescache.yaml"))).is_err());
  }
}
