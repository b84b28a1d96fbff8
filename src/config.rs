//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::mesh::ClusterConfig;
use crate::ratelimit::LimiterOptions;

/// Prefix of environment variables overriding file settings.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Token bucket parameters
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Where bucket state is stored
    #[serde(default)]
    pub cache: CacheConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Decision service address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Token bucket parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Sustained permits per second
    #[serde(default = "default_max_rate_per_second")]
    pub max_rate_per_second: f64,

    /// Bucket capacity
    #[serde(default = "default_max_burst")]
    pub max_burst: u64,

    /// Expiration of idle bucket state in milliseconds
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_rate_per_second: default_max_rate_per_second(),
            max_burst: default_max_burst(),
            cache_ttl_ms: default_cache_ttl_ms(),
        }
    }
}

fn default_max_rate_per_second() -> f64 {
    10.0
}

fn default_max_burst() -> u64 {
    20
}

fn default_cache_ttl_ms() -> u64 {
    10_000
}

impl LimiterConfig {
    /// Limiter options for these settings, cache and clock left to defaults.
    pub fn options(&self) -> LimiterOptions {
        LimiterOptions::new(self.max_rate_per_second, self.max_burst)
            .with_cache_ttl(Duration::from_millis(self.cache_ttl_ms))
    }
}

/// Cache backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// State private to this process
    #[default]
    Memory,
    /// State gossiped across the peer mesh
    Mesh,
}

/// Cache configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,

    /// Only read when `backend` is `mesh`
    #[serde(default)]
    pub mesh: MeshConfig,
}

/// Peer mesh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Node identifier, random when unset
    #[serde(default)]
    pub node_id: Option<String>,

    /// Gossip listen address
    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers, `listen_addr` when unset
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Peers contacted on startup
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    #[serde(default = "default_dead_node_grace_period_secs")]
    pub dead_node_grace_period_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: default_gossip_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval_ms(),
            dead_node_grace_period_secs: default_dead_node_grace_period_secs(),
        }
    }
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "tollgate".to_string()
}

fn default_gossip_interval_ms() -> u64 {
    100
}

fn default_dead_node_grace_period_secs() -> u64 {
    3600
}

impl MeshConfig {
    /// Cluster settings for these options.
    pub fn cluster_config(&self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: Duration::from_secs(self.dead_node_grace_period_secs),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, then apply environment
    /// overrides such as `TOLLGATE__LIMITER__MAX_BURST=50`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: TollgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("cache.mesh.seed_nodes"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rate = self.limiter.max_rate_per_second;
        if !rate.is_finite() || rate < 0.0 {
            return Err(TollgateError::Config(format!(
                "limiter.max_rate_per_second must be a non-negative number, got {}",
                rate
            )));
        }

        if self.cache.backend == CacheBackend::Mesh && self.cache.mesh.gossip_interval_ms == 0 {
            return Err(TollgateError::Config(
                "cache.mesh.gossip_interval_ms must be positive".to_string(),
            ));
        }

        if self.logging.level.trim().is_empty() {
            return Err(TollgateError::Config("logging.level must not be empty".to_string()));
        }

        Ok(())
    }
}
