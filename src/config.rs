//! Tracker configuration
//!
//! One TOML file covers every subsystem; each section falls back to the
//! subsystem's defaults, so an empty file is a valid configuration.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::metrics::MetricsConfig;
use crate::recovery::RecoveryConfig;
use crate::session::SessionConfig;
use crate::sync::{PlatformId, SyncConfig};
use crate::triggers::TriggerConfig;

/// Where durable records live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for session and recovery records.
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
        }
    }
}

/// Credentials and endpoint for one platform connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformEndpoint {
    pub id: PlatformId,
    pub base_url: String,
    pub access_token: String,
}

/// Aggregate configuration for the whole tracker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
    pub session: SessionConfig,
    pub recovery: RecoveryConfig,
    pub triggers: TriggerConfig,
    pub sync: SyncConfig,
    /// Connectors to stand up at startup; may be empty for offline use.
    pub platforms: Vec<PlatformEndpoint>,
}

impl TrackerConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("failed to parse tracker configuration")
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content =
            toml::to_string_pretty(self).context("failed to serialize tracker configuration")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn an_empty_file_is_all_defaults() {
        let config = TrackerConfig::from_toml_str("").unwrap();
        assert_eq!(config.metrics.accuracy_ceiling_m, 20.0);
        assert_eq!(config.triggers.cooldown_ms, 45_000);
        assert_eq!(config.sync.max_attempts, 4);
        assert!(config.platforms.is_empty());
    }

    #[test]
    fn sections_override_independently() {
        let config = TrackerConfig::from_toml_str(
            r#"
            [metrics]
            accuracy_ceiling_m = 35.0

            [sync]
            max_attempts = 2

            [[platforms]]
            id = "health-connect"
            base_url = "https://hc.example.com"
            access_token = "token-1"
            "#,
        )
        .unwrap();

        assert_eq!(config.metrics.accuracy_ceiling_m, 35.0);
        assert_eq!(config.metrics.signal_loss_timeout_ms, 15_000);
        assert_eq!(config.sync.max_attempts, 2);
        assert_eq!(config.platforms.len(), 1);
        assert_eq!(config.platforms[0].id, PlatformId::health_connect());
    }

    #[test]
    fn round_trips_through_a_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tracker.toml");

        let mut config = TrackerConfig::default();
        config.storage.root = PathBuf::from("/var/lib/tracker");
        config.session.tick_interval_ms = 500;
        config.to_toml_file(&path).unwrap();

        let loaded = TrackerConfig::from_toml_file(&path).unwrap();
        assert_eq!(loaded.storage.root, PathBuf::from("/var/lib/tracker"));
        assert_eq!(loaded.session.tick_interval_ms, 500);
    }

    #[test]
    fn a_broken_file_names_the_problem() {
        let error = TrackerConfig::from_toml_str("metrics = 3").unwrap_err();
        assert!(error.to_string().contains("configuration"));
    }
}
