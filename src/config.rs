//! Agent configuration
//!
//! Loaded from a TOML file, overridden by `SHADOWVAULT_*` environment
//! variables, then validated. Missing values fall back to defaults that
//! match a small single-node deployment.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub avg_chunk_size: usize,
    pub compression: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: 2048,
            max_chunk_size: 65536,
            avg_chunk_size: 8192,
            compression: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    pub max_concurrent_fetch: usize,
    pub chunk_fetch_timeout_secs: u64,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetch: 10,
            chunk_fetch_timeout_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub gc_interval_secs: u64,
    /// 0 retains snapshots forever
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            gc_interval_secs: 24 * 3600,
            retention_days: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    /// "text" or "json"
    pub log_format: String,
    pub metrics_port: u16,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            metrics_port: 9090,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AclConfig {
    /// Base64 Ed25519 public keys allowed to manage peers
    pub admins: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub repository_path: PathBuf,
    pub listen_port: u16,
    pub bootstrap_peers: Vec<String>,
    pub snapshot: SnapshotConfig,
    pub p2p: P2pConfig,
    pub storage: StorageConfig,
    pub monitoring: MonitoringConfig,
    pub acl: AclConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repository_path: PathBuf::from("./shadowvault-repo"),
            listen_port: 4001,
            bootstrap_peers: Vec::new(),
            snapshot: SnapshotConfig::default(),
            p2p: P2pConfig::default(),
            storage: StorageConfig::default(),
            monitoring: MonitoringConfig::default(),
            acl: AclConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file, apply environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Default configuration with environment overrides, for running
    /// without a config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("SHADOWVAULT_REPO_PATH") {
            self.repository_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("SHADOWVAULT_LISTEN_PORT") {
            if let Ok(port) = val.parse() {
                self.listen_port = port;
            }
        }
        if let Ok(val) = env::var("SHADOWVAULT_LOG_LEVEL") {
            self.monitoring.log_level = val;
        }
        if let Ok(val) = env::var("SHADOWVAULT_METRICS_PORT") {
            if let Ok(port) = val.parse() {
                self.monitoring.metrics_port = port;
            }
        }
        if let Ok(val) = env::var("SHADOWVAULT_BOOTSTRAP_PEERS") {
            self.bootstrap_peers = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(val) = env::var("SHADOWVAULT_COMPRESSION") {
            self.snapshot.compression = val == "true" || val == "1";
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let snap = &self.snapshot;
        if snap.min_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "min_chunk_size must be > 0".to_string(),
            ));
        }
        if snap.max_chunk_size <= snap.min_chunk_size {
            return Err(ConfigError::Invalid(format!(
                "max_chunk_size {} must be > min_chunk_size {}",
                snap.max_chunk_size, snap.min_chunk_size
            )));
        }
        if snap.avg_chunk_size < snap.min_chunk_size || snap.avg_chunk_size > snap.max_chunk_size {
            return Err(ConfigError::Invalid(format!(
                "avg_chunk_size {} must be within [{}, {}]",
                snap.avg_chunk_size, snap.min_chunk_size, snap.max_chunk_size
            )));
        }
        if self.p2p.max_concurrent_fetch == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_fetch must be >= 1".to_string(),
            ));
        }
        if self.p2p.chunk_fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "chunk_fetch_timeout_secs must be >= 1".to_string(),
            ));
        }
        if self.storage.gc_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "gc_interval_secs must be >= 1".to_string(),
            ));
        }
        match self.monitoring.log_format.as_str() {
            "text" | "json" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "log_format must be \"text\" or \"json\", got {other:?}"
                )))
            }
        }
        Ok(())
    }

    pub fn chunk_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.p2p.chunk_fetch_timeout_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.storage.gc_interval_secs)
    }
}
