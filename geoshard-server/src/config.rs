use geoshard_core::{DirectoryBuilder, GeoShardError, HeartbeatSettings, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address other nodes and shards use to reach this node.
    pub base_addr: String,
    pub bind_addr: String,
    /// Any node of an existing network. Absent for the first node.
    #[serde(default)]
    pub seed_peer: Option<String>,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Shard directory backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub sqlite: Option<SqliteConfig>,
    pub redis: Option<RedisConfig>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            namespace: None,
            sqlite: None,
            redis: None,
        }
    }
}

impl DirectoryConfig {
    pub fn namespace_or_default(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or("default")
    }

    pub fn builder(&self) -> DirectoryBuilder {
        let mut builder = DirectoryBuilder::new()
            .backend(self.backend.clone())
            .namespace(self.namespace_or_default());
        if let Some(sqlite) = &self.sqlite {
            builder = builder.sqlite_path(sqlite.path.clone());
        }
        if let Some(redis) = &self.redis {
            builder = builder.redis_url(redis.url.clone());
        }
        builder
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_shard_interval_secs")]
    pub shard_interval_secs: u64,
    #[serde(default = "default_shard_timeout_ms")]
    pub shard_timeout_ms: u64,
    #[serde(default = "default_shard_miss_threshold")]
    pub shard_miss_threshold: u32,
    #[serde(default = "default_peer_interval_secs")]
    pub peer_interval_secs: u64,
    #[serde(default = "default_peer_miss_threshold")]
    pub peer_miss_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            shard_interval_secs: default_shard_interval_secs(),
            shard_timeout_ms: default_shard_timeout_ms(),
            shard_miss_threshold: default_shard_miss_threshold(),
            peer_interval_secs: default_peer_interval_secs(),
            peer_miss_threshold: default_peer_miss_threshold(),
        }
    }
}

impl HeartbeatConfig {
    pub fn shard_settings(&self) -> HeartbeatSettings {
        HeartbeatSettings {
            interval: Duration::from_secs(self.shard_interval_secs.max(1)),
            timeout: Some(Duration::from_millis(self.shard_timeout_ms)),
            miss_threshold: self.shard_miss_threshold.max(1),
        }
    }

    pub fn peer_settings(&self) -> HeartbeatSettings {
        HeartbeatSettings {
            interval: Duration::from_secs(self.peer_interval_secs.max(1)),
            timeout: None,
            miss_threshold: self.peer_miss_threshold.max(1),
        }
    }
}

fn default_shard_interval_secs() -> u64 {
    5
}

fn default_shard_timeout_ms() -> u64 {
    8000
}

fn default_shard_miss_threshold() -> u32 {
    2
}

fn default_peer_interval_secs() -> u64 {
    5
}

fn default_peer_miss_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_recalculate_interval_secs")]
    pub recalculate_interval_secs: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_reconcile_sample_size")]
    pub reconcile_sample_size: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            recalculate_interval_secs: default_recalculate_interval_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            reconcile_sample_size: default_reconcile_sample_size(),
        }
    }
}

fn default_recalculate_interval_secs() -> u64 {
    60
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_reconcile_sample_size() -> usize {
    5
}

/// Outbound calls to shards and peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix("GEOSHARD")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| GeoShardError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| GeoShardError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.base_addr.trim().is_empty() {
            return Err(GeoShardError::Config("base_addr cannot be empty".to_string()));
        }
        if self.bind_addr.trim().is_empty() {
            return Err(GeoShardError::Config("bind_addr cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn seed_peer(&self) -> Option<&str> {
        self.seed_peer
            .as_deref()
            .map(str::trim)
            .filter(|seed| !seed.is_empty() && *seed != self.base_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let file = write_config("base_addr: \"10.0.0.1:8080\"\nbind_addr: \"0.0.0.0:8080\"\n");
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.directory.backend, "memory");
        assert_eq!(config.directory.namespace_or_default(), "default");
        assert_eq!(config.heartbeat.shard_miss_threshold, 2);
        assert_eq!(config.heartbeat.peer_miss_threshold, 3);
        assert_eq!(
            config.heartbeat.shard_settings().timeout,
            Some(Duration::from_millis(8000))
        );
        assert_eq!(config.heartbeat.peer_settings().timeout, None);
        assert_eq!(config.maintenance.reconcile_sample_size, 5);
        assert_eq!(config.transport.request_timeout(), Duration::from_secs(30));
        assert!(config.seed_peer().is_none());
    }

    #[test]
    fn test_directory_section_is_read() {
        let file = write_config(
            r#"
base_addr: "10.0.0.2:8080"
bind_addr: "0.0.0.0:8080"
seed_peer: "10.0.0.1:8080"
directory:
  backend: sqlite
  namespace: europe
  sqlite:
    path: /var/lib/geoshard/directory.db
heartbeat:
  shard_interval_secs: 2
maintenance:
  reconcile_interval_secs: 10
"#,
        );
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.seed_peer(), Some("10.0.0.1:8080"));
        assert_eq!(config.directory.backend, "sqlite");
        assert_eq!(config.directory.namespace_or_default(), "europe");
        assert_eq!(
            config.directory.sqlite.unwrap().path,
            PathBuf::from("/var/lib/geoshard/directory.db")
        );
        assert_eq!(config.heartbeat.shard_interval_secs, 2);
        assert_eq!(config.heartbeat.shard_timeout_ms, 8000);
        assert_eq!(config.maintenance.reconcile_interval_secs, 10);
        assert_eq!(config.maintenance.recalculate_interval_secs, 60);
    }

    #[test]
    fn test_blank_base_addr_is_rejected() {
        let file = write_config("base_addr: \"\"\nbind_addr: \"0.0.0.0:8080\"\n");
        assert!(matches!(
            Config::from_file(file.path().to_str().unwrap()),
            Err(GeoShardError::Config(_))
        ));
    }
}
