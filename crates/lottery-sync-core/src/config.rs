//! Static client configuration
//!
//! Loaded once at startup from a JSON file (or built from defaults). The
//! remote connection parameters are carried verbatim for whichever
//! [`RemoteStore`](crate::remote::RemoteStore) backend the embedder builds;
//! the core never interprets them.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};
use crate::types::paths;

/// Connection parameters for the remote store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Store endpoint, e.g. a database URL
    #[serde(default)]
    pub url: String,
    /// Namespace / database name inside the store
    #[serde(default)]
    pub namespace: String,
    /// Backend-specific parameters (API keys, project ids, ...)
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Local-cache polling interval used while disconnected
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Events older than this are ignored by subscribers
    #[serde(default = "default_freshness_window_ms")]
    pub freshness_window_ms: u64,
    /// Command bridge poll-and-diff interval
    #[serde(default = "default_command_poll_interval_ms")]
    pub command_poll_interval_ms: u64,
    /// Cached paths pushed to the remote store after a reconnect
    #[serde(default = "default_resync_paths")]
    pub resync_paths: Vec<String>,
    /// Drop stale `events/<id>` entries after each publish
    #[serde(default = "default_true")]
    pub prune_stale_events: bool,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_freshness_window_ms() -> u64 {
    5000
}

fn default_command_poll_interval_ms() -> u64 {
    3000
}

fn default_resync_paths() -> Vec<String> {
    [
        paths::STATE,
        paths::PRIZES,
        paths::EMPLOYEES,
        paths::WINNERS,
        paths::BONUS_SETTINGS,
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            poll_interval_ms: default_poll_interval_ms(),
            freshness_window_ms: default_freshness_window_ms(),
            command_poll_interval_ms: default_command_poll_interval_ms(),
            resync_paths: default_resync_paths(),
            prune_stale_events: default_true(),
        }
    }
}

impl SyncConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let config: SyncConfig = serde_json::from_slice(&data)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> SyncResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(SyncError::Config("poll_interval_ms must be > 0".into()));
        }
        if self.command_poll_interval_ms == 0 {
            return Err(SyncError::Config(
                "command_poll_interval_ms must be > 0".into(),
            ));
        }
        if self.freshness_window_ms == 0 {
            return Err(SyncError::Config("freshness_window_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_poll_interval(&self) -> Duration {
        Duration::from_millis(self.command_poll_interval_ms)
    }

    pub fn freshness_window_ms(&self) -> i64 {
        i64::try_from(self.freshness_window_ms).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(1000));
        assert_eq!(config.freshness_window_ms(), 5000);
        assert_eq!(config.command_poll_interval(), Duration::from_millis(3000));
        assert!(config.resync_paths.contains(&"lotteryState".to_string()));
        assert!(config.prune_stale_events);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"remote": {"url": "https://example.test", "namespace": "gala"}, "poll_interval_ms": 250}"#,
        )
        .unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.remote.url, "https://example.test");
        assert_eq!(config.remote.namespace, "gala");
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.freshness_window_ms, 5000);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"poll_interval_ms": 0}"#).unwrap();

        let err = SyncConfig::load(&path).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            SyncConfig::load(&path),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = SyncConfig::load_or_default(dir.path().join("absent.json")).unwrap();
        assert_eq!(config, SyncConfig::default());
    }
}
