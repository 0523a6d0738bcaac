//! Configuration management for the DEFS storage node
//!
//! Loaded from TOML, then environment variables, then CLI arguments.

use defs_core::{
    PipelineConfig, DEFAULT_MAX_RETRIES, DEFAULT_PARITY_RATIO, DEFAULT_RETRY_INTERVAL_SECS,
    DEFAULT_SHARD_SIZE, MAX_SLICE_SIZE, MIN_SLICE_SIZE,
};
use defs_network::{DispatchConfig, NetworkConfig, StreamPolicy};
use defs_storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for defs_core::DefsError {
    fn from(err: ConfigError) -> Self {
        defs_core::DefsError::Configuration(err.to_string())
    }
}

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity
    #[serde(default)]
    pub node: NodeSettings,

    /// Shard storage
    #[serde(default)]
    pub storage: StorageSettings,

    /// Host, handshake and gossip
    #[serde(default)]
    pub network: NetworkConfig,

    /// Shard pipeline and dispatcher
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Delete dispatch
    #[serde(default)]
    pub delete: DeleteSettings,

    /// Prometheus exporter
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl NodeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Self::default();
        }
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Apply `DEFS_*` environment overrides
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides looked up through `lookup`; unparsable values are
    /// logged and ignored
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(root) = lookup("DEFS_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(addr) = lookup("DEFS_LISTEN_ADDR") {
            self.network.listen_addr = addr;
        }
        if let Some(value) = lookup("DEFS_SHARD_SIZE") {
            match value.parse::<usize>() {
                Ok(size) => self.pipeline.shard_size = size,
                Err(e) => tracing::warn!(value = %value, error = %e, "Ignoring DEFS_SHARD_SIZE"),
            }
        }
        if let Some(value) = lookup("DEFS_PARITY_RATIO") {
            match value.parse::<f64>() {
                Ok(ratio) => self.pipeline.parity_ratio = ratio,
                Err(e) => tracing::warn!(value = %value, error = %e, "Ignoring DEFS_PARITY_RATIO"),
            }
        }
        self
    }

    /// Override config with CLI arguments
    pub fn with_overrides(
        mut self,
        root: Option<PathBuf>,
        listen_addr: Option<String>,
        bootstrap_peers: Vec<String>,
    ) -> Self {
        if let Some(root) = root {
            self.storage.root = root;
        }
        if let Some(addr) = listen_addr {
            self.network.listen_addr = addr;
        }
        self.network.bootstrap_peers.extend(bootstrap_peers);
        self
    }

    /// Validate the configuration and create the storage root
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.pipeline;
        if p.min_slice_size == 0 || p.min_slice_size > p.max_slice_size {
            return Err(ConfigError::ValidationError(format!(
                "slice size bounds [{}, {}] are invalid",
                p.min_slice_size, p.max_slice_size
            )));
        }
        if p.shard_size < p.min_slice_size || p.shard_size > p.max_slice_size {
            return Err(ConfigError::ValidationError(format!(
                "shard_size {} outside [{}, {}]",
                p.shard_size, p.min_slice_size, p.max_slice_size
            )));
        }
        if !(0.0..=1.0).contains(&p.parity_ratio) {
            return Err(ConfigError::ValidationError(format!(
                "parity_ratio {} outside [0, 1]",
                p.parity_ratio
            )));
        }
        if p.workers == 0 {
            return Err(ConfigError::ValidationError(
                "workers must be at least 1".to_string(),
            ));
        }
        if p.max_retries == 0 {
            return Err(ConfigError::ValidationError(
                "max_retries must be at least 1".to_string(),
            ));
        }

        defs_network::tcp::parse_addr(&self.network.listen_addr)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        self.network
            .bootstrap_addrs()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        if self.metrics.enabled {
            self.metrics.socket_addr()?;
        }

        if !self.storage.root.exists() {
            std::fs::create_dir_all(&self.storage.root).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "Cannot create storage root {:?}: {}",
                    self.storage.root, e
                ))
            })?;
        }

        Ok(())
    }

    /// Path of the node key file
    pub fn key_path(&self) -> PathBuf {
        match &self.node.key_file {
            Some(path) => path.clone(),
            None => self.storage.root.join("node.key"),
        }
    }
}

/// Node identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Hex secret key file (defaults to `<root>/node.key`, created if missing)
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Version string written into shard objects and handshakes
    #[serde(default = "default_version")]
    pub version: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            key_file: None,
            version: default_version(),
        }
    }
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Node root directory
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Keep a staging copy of uploaded files
    #[serde(default)]
    pub local_storage: bool,

    /// Maximum storage capacity in GB (0 = unlimited)
    #[serde(default)]
    pub max_capacity_gb: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: default_root(),
            local_storage: false,
            max_capacity_gb: 0,
        }
    }
}

impl StorageSettings {
    /// Convert to defs_storage::StorageConfig
    pub fn to_storage_config(&self) -> StorageConfig {
        StorageConfig::new(&self.root)
            .with_local_storage(self.local_storage)
            .with_max_capacity(self.max_capacity_gb * 1024 * 1024 * 1024)
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("./defs_data")
}

/// Pipeline and dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub shard_size: usize,
    pub parity_ratio: f64,
    pub min_slice_size: usize,
    pub max_slice_size: usize,
    pub workers: usize,
    /// Sends per shard before it is parked as pending
    pub max_retries: u32,
    /// Seconds between sends of the same shard
    pub retry_interval_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            shard_size: DEFAULT_SHARD_SIZE,
            parity_ratio: DEFAULT_PARITY_RATIO,
            min_slice_size: MIN_SLICE_SIZE,
            max_slice_size: MAX_SLICE_SIZE,
            workers: PipelineConfig::default().workers,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
        }
    }
}

impl PipelineSettings {
    /// Convert to defs_core::PipelineConfig
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            shard_size: self.shard_size,
            parity_ratio: self.parity_ratio,
            min_slice_size: self.min_slice_size,
            max_slice_size: self.max_slice_size,
            workers: self.workers,
        }
    }

    pub fn to_dispatch_config(&self, policy: StreamPolicy) -> DispatchConfig {
        DispatchConfig::default()
            .with_max_retries(self.max_retries)
            .with_retry_interval(Duration::from_secs(self.retry_interval_secs))
            .with_policy(policy)
    }
}

/// Delete dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteSettings {
    /// Drop delete requests without a valid owner signature
    #[serde(default = "default_true")]
    pub require_signed: bool,
}

impl Default for DeleteSettings {
    fn default() -> Self {
        Self {
            require_signed: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Enable the Prometheus endpoint
    #[serde(default)]
    pub enabled: bool,

    /// Listen address of the endpoint
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_metrics_addr(),
        }
    }
}

impl MetricsSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.addr.parse().map_err(|e| {
            ConfigError::ValidationError(format!("metrics addr {:?}: {}", self.addr, e))
        })
    }
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9464".to_string()
}
