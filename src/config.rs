//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `host.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ServerConfig: Listen address of the HTTP API.
//!     - IngestConfig: Signature scheme, freshness / replay / idle windows,
//!       aggregation threshold.
//!     - StorageConfig: Backend selection (sqlite or memory) and db path.
//!     - AiConfig: Chat-completion endpoint used for analysis reports.
//!     - RangesConfig: Optional override file for the range table.
//!     - DeviceEntry: Devices provisioned at startup (id + shared secret).
//!
//! environment:
//!     - ENVMON_CONFIG: explicit path to host.toml
//!     - AI_API_KEY:    overrides ai.api_key
//!
//! ==============================================================================

use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::signature::SignatureScheme;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HostConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub ranges: RangesConfig,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    pub signature_scheme: SignatureScheme,
    /// max distance between a claimed timestamp and the hub clock
    pub freshness_seconds: u64,
    /// how long an accepted signature is remembered
    pub replay_ttl_seconds: u64,
    pub replay_sweep_seconds: u64,
    /// unprocessed readings per device that trigger a roll-up
    pub aggregation_threshold: u64,
    /// silence after which an active device turns idle
    pub idle_after_seconds: u64,
    /// delete buffered rows once they are rolled up
    pub purge_after_aggregation: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            signature_scheme: SignatureScheme::Md5,
            freshness_seconds: 60,
            replay_ttl_seconds: 120,
            replay_sweep_seconds: 30,
            aggregation_threshold: 10,
            idle_after_seconds: 60,
            purge_after_aggregation: false,
        }
    }
}

impl IngestConfig {
    pub fn replay_ttl(&self) -> Duration {
        Duration::from_secs(self.replay_ttl_seconds)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_after_seconds)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub sqlite_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            sqlite_path: PathBuf::from("data").join("envmon.sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AiConfig {
    pub api_url: String,
    pub api_key: String,
    pub default_model: String,
    pub timeout_seconds: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.deepseek.com/chat/completions".to_string(),
            api_key: String::new(),
            default_model: "deepseek-chat".to_string(),
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RangesConfig {
    /// toml file replacing the built-in range table
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeviceEntry {
    pub device_id: String,
    pub secret: String,
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let mut config: HostConfig = toml::from_str(content).context("Failed to parse config")?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback
    ///
    /// runs before the tracing subscriber exists, so progress goes to stdout.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let explicit = std::env::var_os("ENVMON_CONFIG").map(PathBuf::from);
        let paths = [
            PathBuf::from("config").join("host.toml"),
            PathBuf::from("..").join("config").join("host.toml"),
        ];
        Self::load_first(explicit.as_deref(), &paths)
    }

    /// explicit path if given, else the first search path that exists, else
    /// defaults. a file that exists but fails to load is an error.
    fn load_first(explicit: Option<&Path>, paths: &[PathBuf]) -> anyhow::Result<Self> {
        let found = match explicit {
            Some(path) => Some(path),
            None => paths.iter().map(PathBuf::as_path).find(|p| p.exists()),
        };

        if let Some(path) = found {
            let config = Self::load(path)?;
            println!("[CONFIG] Loaded from {}", path.display());
            return Ok(config);
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("AI_API_KEY") {
            if !key.is_empty() {
                self.ai.api_key = key;
            }
        }
    }

    /// Reject settings the pipeline cannot honour
    pub fn validate(&self) -> anyhow::Result<()> {
        let ingest = &self.ingest;
        if ingest.aggregation_threshold == 0 {
            bail!("ingest.aggregation_threshold must be at least 1");
        }
        if ingest.replay_ttl_seconds <= ingest.freshness_seconds {
            bail!(
                "ingest.replay_ttl_seconds ({}) must exceed ingest.freshness_seconds ({})",
                ingest.replay_ttl_seconds,
                ingest.freshness_seconds
            );
        }
        if ingest.replay_sweep_seconds == 0 {
            bail!("ingest.replay_sweep_seconds must be at least 1");
        }
        for (i, device) in self.devices.iter().enumerate() {
            if device.device_id.is_empty() || device.secret.is_empty() {
                bail!("devices[{}]: device_id and secret are required", i);
            }
        }
        Ok(())
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│           HUB CONFIGURATION             │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Bind: {}", self.server.bind);
        println!("│ Storage: {:?} ({})", self.storage.backend, self.storage.sqlite_path.display());
        println!(
            "│ Signature: {:?}, freshness {}s, replay ttl {}s",
            self.ingest.signature_scheme,
            self.ingest.freshness_seconds,
            self.ingest.replay_ttl_seconds
        );
        println!(
            "│ Roll-up every {} readings, idle after {}s",
            self.ingest.aggregation_threshold, self.ingest.idle_after_seconds
        );
        println!("│ Devices provisioned: {}", self.devices.len());
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = HostConfig::from_toml("").unwrap();
        assert_eq!(config.ingest.freshness_seconds, 60);
        assert_eq!(config.ingest.replay_ttl_seconds, 120);
        assert_eq!(config.ingest.aggregation_threshold, 10);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert!(config.devices.is_empty());
    }

    #[test]
    fn parses_full_file() {
        let config = HostConfig::from_toml(
            r#"
            [server]
            bind = "127.0.0.1:9000"

            [ingest]
            signature_scheme = "sha256"
            aggregation_threshold = 5
            purge_after_aggregation = true

            [storage]
            backend = "memory"

            [[devices]]
            device_id = "a1b2c3d4e5f60718"
            secret = "0123456789abcdef"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:9000");
        assert_eq!(config.ingest.signature_scheme, SignatureScheme::Sha256);
        assert_eq!(config.ingest.aggregation_threshold, 5);
        assert!(config.ingest.purge_after_aggregation);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.devices[0].device_id, "a1b2c3d4e5f60718");
    }

    #[test]
    fn replay_ttl_must_outlive_freshness() {
        let err = HostConfig::from_toml(
            "[ingest]\nfreshness_seconds = 60\nreplay_ttl_seconds = 60\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("replay_ttl_seconds"));
    }

    #[test]
    fn zero_threshold_is_rejected() {
        assert!(HostConfig::from_toml("[ingest]\naggregation_threshold = 0\n").is_err());
    }

    #[test]
    fn invalid_file_on_search_path_stops_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");
        let content = "[ingest]\n\
                       freshness_seconds = 60\n\
                       replay_ttl_seconds = 60\n\
                       aggregation_threshold = 3\n";
        std::fs::write(&path, content).unwrap();

        let paths = [dir.path().join("missing.toml"), path];
        let err = HostConfig::load_first(None, &paths).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("host.toml"), "{}", message);
        assert!(message.contains("replay_ttl_seconds"), "{}", message);
    }

    #[test]
    fn unparsable_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");
        std::fs::write(&path, "[ingest\n").unwrap();
        assert!(HostConfig::load_first(Some(&path), &[]).is_err());
        assert!(HostConfig::load_first(Some(&dir.path().join("absent.toml")), &[]).is_err());
    }

    #[test]
    fn first_existing_search_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");
        std::fs::write(&path, "[ingest]\naggregation_threshold = 3\n").unwrap();

        let paths = [dir.path().join("missing.toml"), path];
        let config = HostConfig::load_first(None, &paths).unwrap();
        assert_eq!(config.ingest.aggregation_threshold, 3);
    }

    #[test]
    fn no_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::load_first(None, &[dir.path().join("missing.toml")]).unwrap();
        assert_eq!(config.ingest.aggregation_threshold, 10);
    }
}
