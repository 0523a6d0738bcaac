//! DEFS Storage
//!
//! Filesystem layout and the local shard store:
//! - `FileRoots` for the directory tree under a node root
//! - `LocalShardStore` for persisted shard objects

pub mod layout;
pub mod store;

pub use layout::FileRoots;
pub use store::{LocalShardStore, StorageStats};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Node root directory
    pub root: PathBuf,

    /// Keep a staging copy of uploaded files under `files/uploads/<file_id>/`
    pub local_storage: bool,

    /// Maximum bytes of shard objects (0 = unlimited)
    pub max_capacity: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./defs_data"),
            local_storage: false,
            max_capacity: 0, // Unlimited
        }
    }
}

impl StorageConfig {
    /// Create a new storage config with the given root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Set maximum capacity
    pub fn with_max_capacity(mut self, bytes: u64) -> Self {
        self.max_capacity = bytes;
        self
    }

    /// Enable/disable upload staging
    pub fn with_local_storage(mut self, enabled: bool) -> Self {
        self.local_storage = enabled;
        self
    }

    pub fn roots(&self) -> FileRoots {
        FileRoots::new(&self.root)
    }
}
