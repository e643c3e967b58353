//! Node configuration
//!
//! Loaded from an optional TOML file, then overridden by `AOS_*` environment
//! variables. Every field has a default, so an empty file (or no file) gives a
//! runnable node with all state under relative paths.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mesh::{RetryPolicy, SignatureScheme};
use crate::sync::{ConflictResolutionStrategy, LastWriteWins, ManualResolution, SyncTable};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NodeConfig {
    /// Identifier announced to peers
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Base directory for relative paths below
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// SQLite database holding events, schedules, mesh and sync state
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,

    /// Directory containing `node_id.seed` / `node_id.pub`
    #[serde(default = "default_keys_dir")]
    pub keys_dir: PathBuf,

    /// Seconds a completed event row is kept
    #[serde(default = "default_event_ttl")]
    pub event_ttl: u64,

    #[serde(default)]
    pub mesh: MeshConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MeshConfig {
    /// Address the mesh HTTP server binds to
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Seconds between heartbeat/drain cycles
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,

    #[serde(default)]
    pub signature_scheme: SignatureScheme,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Seconds before the first retry; doubles per failure
    #[serde(default = "default_base_backoff")]
    pub base_backoff: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff: u64,

    /// Queue items older than this are dropped by maintenance
    #[serde(default = "default_prune_max_age_days")]
    pub prune_max_age_days: u32,

    /// Seconds a signed heartbeat or delta timestamp may differ from local time
    #[serde(default = "default_max_clock_skew")]
    pub max_clock_skew: u64,

    /// Peers registered at boot
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PeerConfig {
    pub node_id: String,
    pub base_url: String,
    /// Hex public key; empty means pin on first heartbeat
    #[serde(default)]
    pub public_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Seconds between `kernel.maintenance` runs
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    LastWriteWins,
    Manual,
}

impl StrategyKind {
    pub fn build(&self) -> Box<dyn ConflictResolutionStrategy> {
        match self {
            StrategyKind::LastWriteWins => Box::new(LastWriteWins),
            StrategyKind::Manual => Box::new(ManualResolution),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub tables: Vec<SyncTable>,

    #[serde(default)]
    pub strategy: StrategyKind,
}

fn default_node_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("aos-{}", host)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("aos.db")
}

fn default_keys_dir() -> PathBuf {
    PathBuf::from("keys")
}

fn default_event_ttl() -> u64 {
    86_400
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_sync_interval() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_backoff() -> u64 {
    30
}

fn default_max_backoff() -> u64 {
    3600
}

fn default_prune_max_age_days() -> u32 {
    7
}

fn default_max_clock_skew() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_maintenance_interval() -> u64 {
    3600
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            data_dir: default_data_dir(),
            sqlite_path: default_sqlite_path(),
            keys_dir: default_keys_dir(),
            event_ttl: default_event_ttl(),
            mesh: MeshConfig::default(),
            scheduler: SchedulerConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            sync_interval: default_sync_interval(),
            signature_scheme: SignatureScheme::default(),
            max_attempts: default_max_attempts(),
            base_backoff: default_base_backoff(),
            max_backoff: default_max_backoff(),
            prune_max_age_days: default_prune_max_age_days(),
            max_clock_skew: default_max_clock_skew(),
            peers: Vec::new(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            maintenance_interval: default_maintenance_interval(),
        }
    }
}

impl MeshConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_backoff: Duration::from_secs(self.base_backoff),
            max_backoff: Duration::from_secs(self.max_backoff),
        }
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_secs(self.max_clock_skew)
    }
}

impl NodeConfig {
    /// Read `path` if given, then apply `AOS_*` overrides from the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply overrides, reading variables through `lookup`.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup("AOS_NODE_ID") {
            self.node_id = value;
        }
        if let Some(value) = lookup("AOS_DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("AOS_SQLITE_PATH") {
            self.sqlite_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("AOS_KEYS_DIR") {
            self.keys_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("AOS_MESH_LISTEN") {
            self.mesh.listen = parse_var("AOS_MESH_LISTEN", &value)?;
        }
        if let Some(value) = lookup("AOS_MESH_SYNC_INTERVAL") {
            self.mesh.sync_interval = parse_var("AOS_MESH_SYNC_INTERVAL", &value)?;
        }
        if let Some(value) = lookup("AOS_EVENT_TTL") {
            self.event_ttl = parse_var("AOS_EVENT_TTL", &value)?;
        }
        Ok(())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    /// Database path, relative paths resolved against `data_dir`.
    pub fn database_path(&self) -> PathBuf {
        self.resolve(&self.sqlite_path)
    }

    pub fn keys_path(&self) -> PathBuf {
        self.resolve(&self.keys_dir)
    }

    pub fn event_ttl(&self) -> Duration {
        Duration::from_secs(self.event_ttl)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.mesh.sync_interval.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler.poll_interval_ms.max(1))
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.maintenance_interval.max(1))
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert!(config.node_id.starts_with("aos-"));
        assert_eq!(config.database_path(), PathBuf::from("data/aos.db"));
        assert_eq!(config.keys_path(), PathBuf::from("data/keys"));
        assert_eq!(config.event_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.mesh.signature_scheme, SignatureScheme::EnvelopeDigest);
        assert_eq!(config.mesh.retry_policy(), RetryPolicy::default());
        assert_eq!(config.mesh.max_clock_skew(), Duration::from_secs(300));
        assert_eq!(config.sync.strategy, StrategyKind::LastWriteWins);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = NodeConfig::from_toml(
            r#"
            node_id = "farm-hub"
            sqlite_path = "/var/lib/aos/aos.db"

            [mesh]
            listen = "127.0.0.1:9100"
            signature_scheme = "legacy"

            [[mesh.peers]]
            node_id = "field-1"
            base_url = "http://10.0.0.5:8000"

            [[sync.tables]]
            table = "harvests"
            entity_type = "harvest"
            "#,
        )
        .unwrap();

        assert_eq!(config.node_id, "farm-hub");
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/aos/aos.db"));
        assert_eq!(config.mesh.listen.port(), 9100);
        assert_eq!(config.mesh.signature_scheme, SignatureScheme::Legacy);
        assert_eq!(config.mesh.sync_interval, 30);
        assert_eq!(config.mesh.peers[0].public_key, "");
        assert_eq!(config.sync.tables, vec![SyncTable::new("harvests", "harvest")]);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("AOS_NODE_ID", "node-7"),
            ("AOS_KEYS_DIR", "/etc/aos/keys"),
            ("AOS_MESH_LISTEN", "127.0.0.1:0"),
            ("AOS_MESH_SYNC_INTERVAL", "5"),
            ("AOS_EVENT_TTL", "60"),
        ]
        .into_iter()
        .collect();

        let mut config = NodeConfig::default();
        config
            .apply_env_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.node_id, "node-7");
        assert_eq!(config.keys_path(), PathBuf::from("/etc/aos/keys"));
        assert_eq!(config.mesh.listen.port(), 0);
        assert_eq!(config.sync_interval(), Duration::from_secs(5));
        assert_eq!(config.event_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let mut config = NodeConfig::default();
        let err = config
            .apply_env_overrides(|key| (key == "AOS_EVENT_TTL").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "AOS_EVENT_TTL"));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = NodeConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
