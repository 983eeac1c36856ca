//! Engine settings
//!
//! Loaded from YAML. Every section and field has a default, so a partial file
//! (or none at all) is valid.

use crate::backend::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use visitlens_cache::{CacheConfig, DEFAULT_KEY_PREFIX};
use visitlens_query::DEFAULT_GROUP_THRESHOLD;

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Backend used when a request does not pick one
    pub backend: BackendKind,
    pub fetch: FetchSettings,
    pub cache: CacheSettings,
    pub pushdown: PushdownSettings,
    pub parallel: ParallelSettings,
    pub logging: LoggingSettings,
}

/// Record source settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    /// Fetch timeout in seconds
    pub timeout_secs: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

/// Result cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Prefix of every cache key
    pub key_prefix: String,
    /// Store expiry in seconds (0 = never expire)
    pub ttl_secs: u64,
    /// Accept count mismatches for entries younger than this
    pub tolerance_minutes: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl_secs: 24 * 60 * 60,
            tolerance_minutes: None,
        }
    }
}

/// Query pushdown settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushdownSettings {
    /// Visits table name, optionally schema-qualified
    pub table: String,
    /// Parse every generated statement before running it
    pub verify_sql: bool,
}

impl Default for PushdownSettings {
    fn default() -> Self {
        Self {
            table: "visits".to_string(),
            verify_sql: false,
        }
    }
}

/// In-process parallelism
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelSettings {
    /// Minimum number of groups to aggregate in parallel
    pub group_threshold: usize,
}

impl Default for ParallelSettings {
    fn default() -> Self {
        Self {
            group_threshold: DEFAULT_GROUP_THRESHOLD,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level or filter directive, e.g. "info" or "visitlens_engine=debug"
    pub level: String,
    pub show_target: bool,
    pub show_thread_ids: bool,
    /// Include file and line numbers
    pub show_location: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_target: true,
            show_thread_ids: false,
            show_location: false,
        }
    }
}

impl EngineSettings {
    /// Load settings from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Write the default settings to a file
    pub fn write_default(path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(&Self::default())?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch.timeout_secs)
    }

    pub fn tolerance(&self) -> Option<chrono::Duration> {
        self.cache
            .tolerance_minutes
            .and_then(|m| chrono::Duration::try_minutes(m as i64))
    }

    /// Convert to the cache manager's configuration
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            key_prefix: self.cache.key_prefix.clone(),
            ttl: (self.cache.ttl_secs > 0).then(|| Duration::from_secs(self.cache.ttl_secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let settings = EngineSettings::from_yaml_str(
            r#"
backend: pushdown
cache:
  tolerance_minutes: 15
pushdown:
  verify_sql: true
"#,
        )
        .unwrap();
        assert_eq!(settings.backend, BackendKind::Pushdown);
        assert_eq!(settings.cache.key_prefix, "visitlens");
        assert_eq!(settings.tolerance(), Some(chrono::Duration::minutes(15)));
        assert_eq!(settings.pushdown.table, "visits");
        assert!(settings.pushdown.verify_sql);
        assert_eq!(settings.fetch_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(EngineSettings::from_yaml_str("{}").unwrap(), EngineSettings::default());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(EngineSettings::from_yaml_str("backend: spark").is_err());
    }

    #[test]
    fn test_cache_config_ttl() {
        let mut settings = EngineSettings::default();
        assert_eq!(settings.to_cache_config().ttl, Some(Duration::from_secs(86_400)));
        settings.cache.ttl_secs = 0;
        assert_eq!(settings.to_cache_config().ttl, None);
    }

    #[test]
    fn test_write_and_read_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("visitlens.yml");
        EngineSettings::write_default(&path).unwrap();
        let loaded = EngineSettings::from_file(&path).unwrap();
        assert_eq!(loaded, EngineSettings::default());
    }
}
