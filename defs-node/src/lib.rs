//! DEFS Storage Node Library
//!
//! Provides components for running a DEFS storage node:
//! - Configuration management (TOML, environment, CLI overrides)
//! - Node context wiring storage, pipeline, protocols and pubsub
//! - Prometheus metrics fed from the node's event bus

pub mod config;
pub mod context;
pub mod metrics;

pub use config::{
    ConfigError, DeleteSettings, MetricsSettings, NodeConfig, NodeSettings, PipelineSettings,
    StorageSettings,
};
pub use context::{load_or_create_key, AppContext};
pub use metrics::{init_metrics, install_exporter, NodeMetrics};
