use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::DEFAULT_MAX_SIZE;

/// Top-level configuration file.
///
/// Unknown keys are rejected in every section so a misspelled option fails
/// loudly instead of silently falling back to its default.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
  pub cache: CacheConfig,
  pub query: QueryConfig,
  pub mutation: MutationConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
  /// Maximum number of entries in the shared store
  pub max_size: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_size: DEFAULT_MAX_SIZE,
    }
  }
}

/// Default options for every query built by a [`QueryClient`](crate::QueryClient).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct QueryConfig {
  pub enabled: bool,
  #[serde(rename = "stale_time_ms", deserialize_with = "deserialize_millis")]
  pub stale_time: Duration,
  #[serde(rename = "cache_time_ms", deserialize_with = "deserialize_millis")]
  pub cache_time: Duration,
  pub retry: u32,
  #[serde(rename = "retry_delay_ms", deserialize_with = "deserialize_millis")]
  pub retry_delay: Duration,
  pub refetch_on_mount: bool,
  pub refetch_on_window_focus: bool,
  #[serde(
    rename = "refetch_interval_ms",
    deserialize_with = "deserialize_optional_millis"
  )]
  pub refetch_interval: Option<Duration>,
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      stale_time: Duration::from_secs(5 * 60),
      cache_time: Duration::from_secs(10 * 60),
      retry: 3,
      retry_delay: Duration::from_millis(1000),
      refetch_on_mount: true,
      refetch_on_window_focus: true,
      refetch_interval: None,
    }
  }
}

/// Default options for every mutation.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MutationConfig {
  pub retry: u32,
  #[serde(rename = "retry_delay_ms", deserialize_with = "deserialize_millis")]
  pub retry_delay: Duration,
}

impl Default for MutationConfig {
  fn default() -> Self {
    Self {
      retry: 0,
      retry_delay: Duration::from_millis(1000),
    }
  }
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
  D: Deserializer<'de>,
{
  let ms = u64::deserialize(deserializer)?;
  Ok(Duration::from_millis(ms))
}

fn deserialize_optional_millis<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
  D: Deserializer<'de>,
{
  let ms: Option<u64> = Option::deserialize(deserializer)?;
  Ok(ms.map(Duration::from_millis))
}

impl Config {
  /// Load configuration from file, falling back to defaults.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./querysync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/querysync/config.yaml
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
    let local = PathBuf::from("querysync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("querysync").join("config.yaml");
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
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  /// Parse and validate a YAML document.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if self.query.cache_time < self.query.stale_time {
      return Err(eyre!(
        "query.cache_time_ms ({}) must not be shorter than query.stale_time_ms ({})",
        self.query.cache_time.as_millis(),
        self.query.stale_time.as_millis()
      ));
    }
    if self.query.refetch_interval == Some(Duration::ZERO) {
      return Err(eyre!("query.refetch_interval_ms must be greater than zero"));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_document_uses_defaults() {
    let config = Config::from_yaml("{}").unwrap();
    assert_eq!(config, Config::default());
    assert_eq!(config.cache.max_size, 100);
  }

  #[test]
  fn test_partial_sections() {
    let yaml = r#"
cache:
  max_size: 20
query:
  stale_time_ms: 1000
  cache_time_ms: 5000
  refetch_interval_ms: 30000
mutation:
  retry: 2
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.cache.max_size, 20);
    assert_eq!(config.query.stale_time, Duration::from_secs(1));
    assert_eq!(config.query.cache_time, Duration::from_secs(5));
    assert_eq!(config.query.refetch_interval, Some(Duration::from_secs(30)));
    assert_eq!(config.query.retry, 3);
    assert_eq!(config.mutation.retry, 2);
    assert_eq!(config.mutation.retry_delay, Duration::from_millis(1000));
  }

  #[test]
  fn test_unknown_option_is_rejected() {
    let yaml = "query:\n  stale_tiem_ms: 10\n";
    assert!(Config::from_yaml(yaml).is_err());

    let yaml = "caching:\n  max_size: 10\n";
    assert!(Config::from_yaml(yaml).is_err());
  }

  #[test]
  fn test_cache_time_below_stale_time_is_rejected() {
    let yaml = "query:\n  stale_time_ms: 10000\n  cache_time_ms: 5000\n";
    let err = Config::from_yaml(yaml).unwrap_err();
    assert!(err.to_string().contains("cache_time_ms"));
  }

  #[test]
  fn test_null_interval_disables_polling() {
    let yaml = "query:\n  refetch_interval_ms: null\n";
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.query.refetch_interval, None);
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/querysync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("not found"));
  }
}
